use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    config::ServerConfig, events::EventBus, registry::ClientRegistry, router::MessageRouter,
};

/// Shared by every route and connection task.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<ServerConfig>,
    pub registry: ClientRegistry,
    pub events: Arc<EventBus>,
    pub router: MessageRouter,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    /// Builds the registry and event bus and subscribes the router to
    /// inbound client frames.
    pub fn new(config: ServerConfig) -> Self {
        let registry = ClientRegistry::new();
        let events = Arc::new(EventBus::new());
        let router = MessageRouter::new(registry.clone());
        router.attach(&events);

        Self {
            config: Arc::new(config),
            registry,
            events,
            router,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }

    pub fn key_matches(&self, key: &str) -> bool {
        self.config.key == key
    }
}
