use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    client::Client,
    connection::{Connection, ConnectionId},
};

/// Result of presenting an `(id, token)` pair with a fresh connection.
#[derive(Debug)]
pub enum Admission {
    /// Unknown id, inserted with the new connection bound.
    Registered(Arc<Client>),
    /// Known id with a matching token; the connection was swapped in.
    Rebound {
        client: Arc<Client>,
        previous: Option<Arc<Connection>>,
    },
    /// Known id, different token. Nothing changed.
    IdTaken,
    /// Unknown id but the registry is full. Nothing changed.
    LimitReached,
}

/// Directory of connected clients keyed by id; the only record of who is
/// connected. The lock is never held across an await or a socket write.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, Arc<Client>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.read().get(id).cloned()
    }

    /// Registered ids in sorted order.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces the entry for `id`, returning what was there.
    pub fn set(&self, client: Arc<Client>, id: &str) -> Option<Arc<Client>> {
        self.clients.write().insert(id.to_string(), client)
    }

    /// Removing an unknown id is a no-op.
    pub fn remove_by_id(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.write().remove(id)
    }

    /// Removes `id` only while `connection` is still the one bound to it, so
    /// a read loop that was superseded by a reconnect cannot evict the newer
    /// session.
    pub fn remove_if_bound(&self, id: &str, connection: ConnectionId) -> Option<Arc<Client>> {
        let mut clients = self.clients.write();
        let bound = clients
            .get(id)
            .is_some_and(|client| client.is_bound_to(connection));
        if bound {
            clients.remove(id)
        } else {
            None
        }
    }

    /// Lookup, capacity check and insert/rebind as one atomic step. Two
    /// handshakes racing for the same new id cannot both create an entry.
    pub fn admit(
        &self,
        id: &str,
        token: &str,
        connection: Arc<Connection>,
        limit: usize,
    ) -> Admission {
        let mut clients = self.clients.write();
        if let Some(client) = clients.get(id) {
            if !client.token_matches(token) {
                return Admission::IdTaken;
            }
            let previous = client.bind(connection);
            return Admission::Rebound {
                client: Arc::clone(client),
                previous,
            };
        }

        if clients.len() >= limit {
            return Admission::LimitReached;
        }

        let client = Arc::new(Client::with_connection(id, token, connection));
        clients.insert(id.to_string(), Arc::clone(&client));
        Admission::Registered(client)
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.len())
            .finish()
    }
}
