use std::{fmt, sync::Arc};

use beach_pier_core::Message;
use parking_lot::RwLock;

use crate::{
    connection::{Connection, ConnectionId},
    error::RelayError,
};

/// An authenticated peer identity.
///
/// The token is fixed at first registration. The connection slot is
/// swapped, never shared, when the same identity reconnects.
pub struct Client {
    id: String,
    token: String,
    connection: RwLock<Option<Arc<Connection>>>,
}

impl Client {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            connection: RwLock::new(None),
        }
    }

    pub fn with_connection(
        id: impl Into<String>,
        token: impl Into<String>,
        connection: Arc<Connection>,
    ) -> Self {
        let client = Self::new(id, token);
        client.bind(connection);
        client
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_matches(&self, token: &str) -> bool {
        self.token == token
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().clone()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.read().as_ref().map(|conn| conn.id())
    }

    /// Makes `connection` the live transport and returns the one it replaced.
    pub fn bind(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connection.write().replace(connection)
    }

    pub fn is_bound_to(&self, connection: ConnectionId) -> bool {
        self.connection_id() == Some(connection)
    }

    /// Queues a frame on the current connection.
    pub fn send(&self, message: &Message) -> Result<(), RelayError> {
        match self.connection() {
            Some(connection) => connection.send(message),
            None => Err(RelayError::Transport(format!(
                "client {} has no live connection",
                self.id
            ))),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("connection", &self.connection_id())
            .finish()
    }
}
