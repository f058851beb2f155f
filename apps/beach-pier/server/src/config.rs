use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

pub const DEFAULT_KEY: &str = "peerjs";
pub const DEFAULT_CONCURRENT_LIMIT: usize = 5000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Shared secret every client presents as the `key` parameter.
    pub key: String,
    /// Mount point for every route, normalised to `/` or `/segment...`.
    pub path: String,
    pub concurrent_limit: usize,
    pub allow_discovery: bool,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            key: DEFAULT_KEY.to_string(),
            path: "/".to_string(),
            concurrent_limit: DEFAULT_CONCURRENT_LIMIT,
            allow_discovery: false,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier-server",
    author,
    version,
    about = "Beach Pier WebRTC signaling relay"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "127.0.0.1:9000")]
    pub listen_addr: String,

    /// Shared key clients must present when connecting.
    #[arg(long, env = "BEACH_PIER_KEY", default_value = DEFAULT_KEY)]
    pub key: String,

    /// Path prefix all routes are mounted under.
    #[arg(long, env = "BEACH_PIER_PATH", default_value = "/")]
    pub path: String,

    /// Maximum number of registered clients.
    #[arg(long, env = "BEACH_PIER_CONCURRENT_LIMIT", default_value_t = DEFAULT_CONCURRENT_LIMIT)]
    pub concurrent_limit: usize,

    /// Expose the list of connected peer ids.
    #[arg(long, env = "BEACH_PIER_ALLOW_DISCOVERY", default_value_t = false)]
    pub allow_discovery: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.key.trim().is_empty() {
            bail!("shared key must not be empty");
        }
        Ok(ServerConfig {
            listen_addr,
            key: cli.key,
            path: normalize_path(&cli.path),
            concurrent_limit: cli.concurrent_limit,
            allow_discovery: cli.allow_discovery,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

/// `""`, `"/"` and `"//"` all mean the root; anything else gets exactly one
/// leading slash and no trailing slash.
pub fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}
