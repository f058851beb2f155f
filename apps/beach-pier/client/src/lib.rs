//! Client side of the Beach Pier relay: dials the signaling server, keeps the
//! socket alive with heartbeats and surfaces inbound frames as events.

mod options;
mod socket;

pub use beach_pier_core::{Message, MessageType};
pub use options::ClientOptions;
pub use socket::{DecodeFailure, DisconnectReason, PeerConnection, SocketEvents};

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to dial relay: {0}")]
    Dial(#[source] WsError),
    #[error("failed to send frame: {0}")]
    Send(#[source] WsError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}
