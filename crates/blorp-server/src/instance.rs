//! Membership of running instances in the application's shared set.

use std::fmt;
use std::sync::Arc;

use blorp_core::{InstanceId, KeySpace};
use blorp_store::SyncBroker;
use tracing::{debug, info, warn};

use crate::error::ServerError;

type IdSource = Arc<dyn Fn() -> InstanceId + Send + Sync>;

/// Acquires and releases this process's instance ID.
#[derive(Clone)]
pub struct InstanceRegistry {
    broker: Arc<dyn SyncBroker>,
    key: String,
    max_attempts: u32,
    id_source: IdSource,
}

impl InstanceRegistry {
    pub fn new(broker: Arc<dyn SyncBroker>, keys: &KeySpace, max_attempts: u32) -> Self {
        Self {
            broker,
            key: keys.instances(),
            max_attempts: max_attempts.max(1),
            id_source: Arc::new(InstanceId::generate),
        }
    }

    /// Replace the random candidate generator.
    pub fn with_id_source(mut self, source: impl Fn() -> InstanceId + Send + Sync + 'static) -> Self {
        self.id_source = Arc::new(source);
        self
    }

    /// Add a fresh candidate ID to the membership set, retrying on collision.
    pub fn register(&self) -> Result<InstanceId, ServerError> {
        for attempt in 1..=self.max_attempts {
            let candidate = (self.id_source)();
            if self.broker.set_add_sync(&self.key, candidate.as_str())? {
                info!(instance_id = %candidate, attempt, "instance registered");
                return Ok(candidate);
            }
            warn!(instance_id = %candidate, attempt, "instance ID already taken");
        }
        Err(ServerError::RegistrationFailed {
            attempts: self.max_attempts,
        })
    }

    /// Remove `id` from the set. Returns `false` if it was not a member.
    pub fn deregister(&self, id: &InstanceId) -> Result<bool, ServerError> {
        let removed = self.broker.set_remove_sync(&self.key, id.as_str())?;
        debug!(instance_id = %id, removed, "instance deregistered");
        Ok(removed)
    }
}

impl fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("key", &self.key)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
