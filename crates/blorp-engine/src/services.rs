use std::sync::Arc;
use std::time::Duration;

use blorp_core::KeySpace;
use blorp_store::{Broker, SessionStore};
use blorp_telemetry::MetricsRecorder;

use crate::outbox::Outbox;
use crate::registry::EventRegistry;

/// Everything an instance's actors share.
#[derive(Clone)]
pub struct Services {
    pub broker: Arc<dyn Broker>,
    pub keys: KeySpace,
    pub sessions: SessionStore,
    pub outbox: Outbox,
    pub registry: Arc<EventRegistry>,
    pub metrics: Arc<MetricsRecorder>,
}

impl Services {
    pub fn new(
        broker: Arc<dyn Broker>,
        keys: KeySpace,
        session_ttl: Duration,
        registry: Arc<EventRegistry>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(Arc::clone(&broker), keys.clone(), session_ttl),
            outbox: Outbox::new(Arc::clone(&broker), &keys),
            broker,
            keys,
            registry,
            metrics,
        }
    }
}
