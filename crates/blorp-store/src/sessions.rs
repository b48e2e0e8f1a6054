use std::sync::Arc;
use std::time::Duration;

use blorp_core::{ConnectionId, KeySpace};
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::broker::Broker;
use crate::error::StoreError;

/// Per-connection session state: arbitrary JSON values by key.
pub type Session = Map<String, Value>;

/// Field written into every freshly created session.
pub const CREATED_AT: &str = "createdAt";

/// Session persistence keyed by connection ID, held in the broker under a TTL
/// that every read refreshes.
#[derive(Clone)]
pub struct SessionStore {
    broker: Arc<dyn Broker>,
    keys: KeySpace,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(broker: Arc<dyn Broker>, keys: KeySpace, ttl: Duration) -> Self {
        Self { broker, keys, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch a session, refreshing its TTL. When absent, a default session is
    /// created and persisted if `create_if_missing`, otherwise `None`.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn get(
        &self,
        id: &ConnectionId,
        create_if_missing: bool,
    ) -> Result<Option<Session>, StoreError> {
        match self.fetch(id).await? {
            Some(session) => Ok(Some(session)),
            None if create_if_missing => Ok(Some(self.create(id).await?)),
            None => Ok(None),
        }
    }

    /// `get` with creation on miss.
    pub async fn get_or_create(&self, id: &ConnectionId) -> Result<Session, StoreError> {
        match self.fetch(id).await? {
            Some(session) => Ok(session),
            None => self.create(id).await,
        }
    }

    async fn fetch(&self, id: &ConnectionId) -> Result<Option<Session>, StoreError> {
        let key = self.keys.session(id);
        let Some(raw) = self.broker.get(&key).await? else {
            return Ok(None);
        };
        self.broker.expire(&key, self.ttl).await?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Persist a new default session, replacing whatever was stored.
    pub async fn create(&self, id: &ConnectionId) -> Result<Session, StoreError> {
        let session = default_session();
        self.save(id, &session).await?;
        debug!(connection_id = %id, "created session");
        Ok(session)
    }

    /// Overwrite the stored session and reset its TTL.
    pub async fn save(&self, id: &ConnectionId, session: &Session) -> Result<(), StoreError> {
        let raw = serde_json::to_string(session)?;
        self.broker
            .set_with_ttl(&self.keys.session(id), &raw, self.ttl)
            .await
    }

    /// Reset the TTL without reading or writing the value. Returns `false`
    /// when there is no session; nothing is recreated.
    pub async fn touch(&self, id: &ConnectionId) -> Result<bool, StoreError> {
        self.broker.expire(&self.keys.session(id), self.ttl).await
    }

    pub async fn delete(&self, id: &ConnectionId) -> Result<(), StoreError> {
        self.broker.delete(&self.keys.session(id)).await?;
        Ok(())
    }
}

fn default_session() -> Session {
    let mut session = Session::new();
    session.insert(CREATED_AT.to_owned(), Value::String(Utc::now().to_rfc3339()));
    session
}
