use beach_pier_core::{Message, MessageType};
use metrics::counter;
use tracing::{debug, warn};

use crate::{
    error::RelayError,
    events::{ClientMessage, EventBus},
    registry::ClientRegistry,
};

/// Forwards negotiation frames to the client named in `dst`.
///
/// Delivery is best effort: once the destination is found, a failed write
/// is logged and swallowed. Retrying is up to the peers' own negotiation.
#[derive(Clone, Debug)]
pub struct MessageRouter {
    registry: ClientRegistry,
}

impl MessageRouter {
    pub fn new(registry: ClientRegistry) -> Self {
        Self { registry }
    }

    /// Subscribes the router to frames read off client connections.
    pub fn attach(&self, events: &EventBus) {
        let router = self.clone();
        events
            .message
            .subscribe(move |event: &ClientMessage| router.relay_from_client(event));
    }

    /// Looks up `dst` and queues the frame on its current connection.
    ///
    /// Returns `Routing` when the destination is unknown and `Protocol`
    /// when the frame names no destination. Any other outcome is `Ok`.
    pub fn route(&self, message: &Message) -> Result<(), RelayError> {
        let Some(dst) = message.destination() else {
            return Err(RelayError::Protocol("message has no destination".into()));
        };

        // Registry guard is released before anything touches the socket.
        let Some(client) = self.registry.get_by_id(dst) else {
            return Err(RelayError::Routing(dst.to_string()));
        };

        match client.send(message) {
            Ok(()) => {
                counter!("beach_pier_messages_relayed_total", 1, "type" => message.kind.to_string());
                debug!(
                    src = message.src.as_deref().unwrap_or_default(),
                    dst,
                    kind = %message.kind,
                    "relayed message"
                );
            }
            Err(err) => {
                counter!("beach_pier_messages_dropped_total", 1, "reason" => "write_failed");
                warn!(dst, kind = %message.kind, error = %err, "failed to deliver message");
            }
        }
        Ok(())
    }

    fn relay_from_client(&self, event: &ClientMessage) {
        let message = &event.message;
        match message.kind {
            MessageType::Heartbeat => {
                debug!(client_id = event.client.id(), "heartbeat");
                return;
            }
            ref kind if kind.is_server_reserved() => {
                counter!("beach_pier_messages_dropped_total", 1, "reason" => "reserved_type");
                warn!(client_id = event.client.id(), kind = %kind, "dropping server-reserved message type");
                return;
            }
            _ => {}
        }

        if let Err(err) = self.route(message) {
            counter!("beach_pier_messages_dropped_total", 1, "reason" => err.metric_label());
            warn!(client_id = event.client.id(), kind = %message.kind, error = %err, "dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::Client,
        connection::{Connection, Outbound},
    };
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc::Receiver;

    fn register(registry: &ClientRegistry, id: &str) -> Receiver<Outbound> {
        let (connection, rx) = Connection::channel(None);
        registry.set(Arc::new(Client::with_connection(id, "token", connection)), id);
        rx
    }

    fn next_message(rx: &mut Receiver<Outbound>) -> Option<Message> {
        match rx.try_recv().ok()? {
            Outbound::Text(text) => Message::from_json(&text).ok(),
            Outbound::Close { .. } => None,
        }
    }

    #[test]
    fn route_delivers_to_destination() {
        let registry = ClientRegistry::new();
        let mut rx_b = register(&registry, "b");
        let router = MessageRouter::new(registry);

        let message = Message::new(MessageType::Offer)
            .with_src("a")
            .with_dst("b")
            .with_payload(json!({"sdp": "x"}));
        router.route(&message).expect("routed");

        assert_eq!(next_message(&mut rx_b), Some(message));
    }

    #[test]
    fn route_reports_unknown_destination() {
        let registry = ClientRegistry::new();
        let router = MessageRouter::new(registry.clone());

        let err = router
            .route(&Message::new(MessageType::Answer).with_dst("ghost"))
            .unwrap_err();
        assert!(matches!(err, RelayError::Routing(ref id) if id == "ghost"));
        assert!(registry.is_empty());

        let err = router.route(&Message::new(MessageType::Answer)).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn write_failures_are_absorbed() {
        let registry = ClientRegistry::new();
        let rx = register(&registry, "b");
        drop(rx);
        registry.set(Arc::new(Client::new("c", "tc")), "c");
        let router = MessageRouter::new(registry);

        assert!(router
            .route(&Message::new(MessageType::Candidate).with_dst("b"))
            .is_ok());
        assert!(router
            .route(&Message::new(MessageType::Candidate).with_dst("c"))
            .is_ok());
    }

    #[test]
    fn attached_router_skips_heartbeats_and_reserved_types() {
        let registry = ClientRegistry::new();
        let mut rx_b = register(&registry, "b");
        let events = EventBus::new();
        MessageRouter::new(registry.clone()).attach(&events);

        let sender = registry.get_by_id("b").unwrap();
        for kind in [MessageType::Heartbeat, MessageType::Open, MessageType::IdTaken] {
            events.message.emit(&ClientMessage {
                client: Arc::clone(&sender),
                message: Message::new(kind).with_dst("b"),
            });
        }
        assert!(rx_b.try_recv().is_err());

        events.message.emit(&ClientMessage {
            client: sender,
            message: Message::new(MessageType::Leave).with_src("b").with_dst("b"),
        });
        assert_eq!(
            next_message(&mut rx_b).map(|m| m.kind),
            Some(MessageType::Leave)
        );
    }
}
