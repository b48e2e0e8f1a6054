//! Handle given to handlers: the connection they serve, its session and a
//! way to send messages.

use std::sync::Arc;

use blorp_core::{ConnectionId, OutgoingMessage, Target};
use blorp_store::{Session, SessionStore};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::EngineError;
use crate::outbox::Outbox;

#[derive(Clone)]
pub struct ConnectionContext {
    connection_id: ConnectionId,
    sessions: SessionStore,
    outbox: Outbox,
    cache: Arc<Mutex<Option<Session>>>,
}

impl ConnectionContext {
    pub fn new(connection_id: ConnectionId, sessions: SessionStore, outbox: Outbox) -> Self {
        Self {
            connection_id,
            sessions,
            outbox,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Last session seen by this context, without a broker round trip.
    pub fn session(&self) -> Option<Session> {
        self.cache.lock().clone()
    }

    /// Fetch the session (creating it if missing) and refresh its TTL.
    pub async fn get_session(&self) -> Result<Session, EngineError> {
        let session = self.sessions.get_or_create(&self.connection_id).await?;
        *self.cache.lock() = Some(session.clone());
        Ok(session)
    }

    pub async fn save_session(&self, session: Session) -> Result<(), EngineError> {
        self.sessions.save(&self.connection_id, &session).await?;
        *self.cache.lock() = Some(session);
        Ok(())
    }

    /// Apply `f` to the current session and persist the result.
    pub async fn update_session<F>(&self, f: F) -> Result<Session, EngineError>
    where
        F: FnOnce(&mut Session),
    {
        let mut session = match self.session() {
            Some(session) => session,
            None => self.get_session().await?,
        };
        f(&mut session);
        self.save_session(session.clone()).await?;
        Ok(session)
    }

    /// Replace the stored session with a fresh default one.
    pub async fn create_session(&self) -> Result<Session, EngineError> {
        let session = self.sessions.create(&self.connection_id).await?;
        *self.cache.lock() = Some(session.clone());
        Ok(session)
    }

    /// Reset the session TTL. `false` if there is no session.
    pub async fn touch_session(&self) -> Result<bool, EngineError> {
        Ok(self.sessions.touch(&self.connection_id).await?)
    }

    pub async fn delete_session(&self) -> Result<(), EngineError> {
        self.sessions.delete(&self.connection_id).await?;
        *self.cache.lock() = None;
        Ok(())
    }

    pub async fn send(
        &self,
        target: impl Into<Target>,
        event: impl Into<String>,
        data: Value,
    ) -> Result<(), EngineError> {
        self.outbox
            .send(&OutgoingMessage::new(target, event, data))
            .await
    }

    /// Send to the connection this context serves.
    pub async fn send_back(&self, event: impl Into<String>, data: Value) -> Result<(), EngineError> {
        self.send(self.connection_id.clone(), event, data).await
    }

    pub async fn send_to_all(&self, event: impl Into<String>, data: Value) -> Result<(), EngineError> {
        self.send(Target::All, event, data).await
    }

    /// Run blocking work on the blocking pool without stalling the actor loop.
    pub async fn call_blocking<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| EngineError::Internal(format!("blocking task failed: {e}")))
    }
}
