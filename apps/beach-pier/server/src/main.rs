use anyhow::Result;
use beach_pier_server::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        path = %config.path,
        "starting beach-pier server"
    );

    beach_pier_server::run(config, Some(telemetry.metrics_handle())).await
}
