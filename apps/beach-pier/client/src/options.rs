use std::time::Duration;

use beach_pier_core::SOCKET_PATH;
use url::Url;

use crate::ClientError;

/// Where and how to reach the relay.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    /// Mount path of the relay. `/` means the root.
    pub path: String,
    /// Shared key sent as the `key` handshake parameter.
    pub key: String,
    /// Dial `wss` instead of `ws`.
    pub secure: bool,
    pub ping_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            path: "/".to_string(),
            key: "peerjs".to_string(),
            secure: false,
            ping_interval: Duration::from_secs(5),
        }
    }
}

impl ClientOptions {
    /// Socket endpoint without credentials, e.g. `ws://host:9000/app/peerjs?key=k`.
    pub fn base_url(&self) -> Result<Url, ClientError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mount = self.path.trim().trim_matches('/');
        let mount = if mount.is_empty() {
            String::new()
        } else {
            format!("/{mount}")
        };

        let mut url = Url::parse(&format!(
            "{scheme}://{}:{}{mount}/{SOCKET_PATH}",
            self.host, self.port
        ))?;
        url.query_pairs_mut().append_pair("key", &self.key);
        Ok(url)
    }

    /// Full handshake URL for one identity.
    pub fn socket_url(&self, id: &str, token: &str) -> Result<Url, ClientError> {
        let mut url = self.base_url()?;
        url.query_pairs_mut()
            .append_pair("id", id)
            .append_pair("token", token);
        Ok(url)
    }
}
