use thiserror::Error;

/// Failures the relay distinguishes between. Only `Protocol` errors seen
/// after the handshake leave the connection open.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed: {0}")]
    Auth(&'static str),
    #[error("connection limit of {0} clients reached")]
    Capacity(usize),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("destination {0} is not registered")]
    Routing(String),
}

impl RelayError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::Protocol(_) => "protocol",
            RelayError::Auth(_) => "auth",
            RelayError::Capacity(_) => "capacity",
            RelayError::Transport(_) => "transport",
            RelayError::Routing(_) => "routing",
        }
    }
}
