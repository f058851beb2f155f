use std::sync::Arc;

use beach_pier_core::{Handlers, Message};

use crate::{client::Client, connection::ConnectionId};

/// A decoded frame from an authenticated client. `message.src` has already
/// been overwritten with `client.id()`.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub client: Arc<Client>,
    pub message: Message,
}

/// A frame that could not be decoded. The connection stays up.
#[derive(Debug, Clone)]
pub struct FrameError {
    pub client_id: String,
    pub connection: ConnectionId,
    pub reason: String,
}

/// Emitted when a read loop ends.
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub client: Arc<Client>,
    pub connection: ConnectionId,
    /// False when a newer connection had already taken over the identity
    /// and the registry entry was left in place.
    pub evicted: bool,
}

/// Connection lifecycle events, one typed handler list per kind.
#[derive(Debug, Default)]
pub struct EventBus {
    pub connected: Handlers<Arc<Client>>,
    pub message: Handlers<ClientMessage>,
    pub error: Handlers<FrameError>,
    pub disconnected: Handlers<Disconnect>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
}
