//! Shared primitives for the Beach Pier signaling relay. The server and the
//! client crate both speak the JSON frames defined here so the two ends
//! never drift apart.

pub mod events;
pub mod message;

pub use events::Handlers;
pub use message::{ErrorCode, Message, MessageType, ID_TAKEN_TEXT};

/// Path segment the relay mounts its WebSocket endpoint on.
pub const SOCKET_PATH: &str = "peerjs";
