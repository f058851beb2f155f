//! Typed publish/subscribe lists.
//!
//! Each event kind gets its own `Handlers<T>`, so subscribers are checked
//! against the payload type at compile time instead of matching on a
//! string topic.

use std::sync::Arc;

use parking_lot::RwLock;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Handlers<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> Handlers<T> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a handler. Handlers run synchronously on the emitting task,
    /// so they must not block.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Invokes every registered handler in registration order.
    pub fn emit(&self, event: &T) {
        // Snapshot so a handler may subscribe without deadlocking.
        let snapshot: Vec<Handler<T>> = self.handlers.read().clone();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Handlers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("subscribers", &self.len())
            .finish()
    }
}
