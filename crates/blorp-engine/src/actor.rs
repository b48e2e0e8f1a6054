//! Per-connection actor: consumes one connection's private queue and
//! dispatches each message through the event registry.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use blorp_core::{ConnectionId, ConnectionMessage, EventPayload, MessageError};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::context::ConnectionContext;
use crate::error::EngineError;
use crate::registry::{HandlerEntry, OrderingMode};
use crate::services::Services;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Listening,
    Handling,
    Stopping,
    Stopped,
}

/// Why an actor stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The connection closed and its session was removed.
    Disconnected,
    /// Stopped while the connection was still live; another instance must
    /// take it over.
    StoppedForHandoff,
}

impl Termination {
    pub fn needs_handoff(&self) -> bool {
        matches!(self, Self::StoppedForHandoff)
    }
}

struct Status {
    state: ActorState,
    termination: Option<Termination>,
}

enum Flow {
    Continue,
    Disconnected,
    Fatal,
}

pub struct ConnectionActor {
    connection_id: ConnectionId,
    services: Services,
    context: ConnectionContext,
    cancel: CancellationToken,
    status: Mutex<Status>,
}

impl ConnectionActor {
    pub fn new(connection_id: ConnectionId, services: Services) -> Self {
        let context = ConnectionContext::new(
            connection_id.clone(),
            services.sessions.clone(),
            services.outbox.clone(),
        );
        Self {
            connection_id,
            services,
            context,
            cancel: CancellationToken::new(),
            status: Mutex::new(Status {
                state: ActorState::Starting,
                termination: None,
            }),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn state(&self) -> ActorState {
        self.status.lock().state
    }

    /// Set once `listen` has returned.
    pub fn termination(&self) -> Option<Termination> {
        self.status.lock().termination
    }

    /// Request the listen loop to end. A dispatch in progress finishes; no
    /// further message is popped. Safe to call any number of times.
    pub fn stop(&self) {
        self.cancel.cancel();
        let mut status = self.status.lock();
        if status.state != ActorState::Stopped {
            status.state = ActorState::Stopping;
        }
    }

    /// Consume the connection queue until disconnection, `stop`, or a broker
    /// failure.
    #[instrument(skip(self), fields(connection_id = %self.connection_id))]
    pub async fn listen(&self) -> Termination {
        let termination = self.run().await;
        {
            let mut status = self.status.lock();
            status.state = ActorState::Stopped;
            status.termination = Some(termination);
        }
        info!(?termination, "connection actor stopped");
        termination
    }

    fn transition(&self, next: ActorState) {
        let mut status = self.status.lock();
        // A pending stop wins over loop progress.
        if matches!(status.state, ActorState::Stopping | ActorState::Stopped) {
            return;
        }
        status.state = next;
    }

    async fn run(&self) -> Termination {
        let key = self.services.keys.messages(&self.connection_id);
        let mut reader = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Termination::StoppedForHandoff,
            opened = self.services.broker.queue_reader(&key) => match opened {
                Ok(reader) => reader,
                Err(e) => {
                    error!(error = %e, "could not open connection queue");
                    return Termination::StoppedForHandoff;
                }
            },
        };
        self.transition(ActorState::Listening);
        debug!(key = %key, "listening");

        let mut inflight = JoinSet::new();
        let termination = loop {
            let popped = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Termination::StoppedForHandoff,
                popped = reader.pop() => popped,
            };
            let raw = match popped {
                Ok(raw) => raw,
                Err(e) => {
                    error!(error = %e, "broker failure on connection queue");
                    break Termination::StoppedForHandoff;
                }
            };

            self.transition(ActorState::Handling);
            let flow = self.process(&raw, &mut inflight).await;
            while let Some(joined) = inflight.try_join_next() {
                log_join_error(joined);
            }
            match flow {
                Flow::Continue => self.transition(ActorState::Listening),
                Flow::Disconnected => break Termination::Disconnected,
                Flow::Fatal => break Termination::StoppedForHandoff,
            }
        };

        self.transition(ActorState::Stopping);
        while let Some(joined) = inflight.join_next().await {
            log_join_error(joined);
        }
        // Unordered handlers may still have written the session.
        if termination == Termination::Disconnected {
            if let Err(e) = self.context.delete_session().await {
                warn!(error = %e, "could not delete session on disconnection");
            }
        }
        termination
    }

    async fn process(&self, raw: &str, inflight: &mut JoinSet<()>) -> Flow {
        match ConnectionMessage::decode(raw) {
            Ok(ConnectionMessage::Message { message }) => self.on_message(message, inflight).await,
            Ok(ConnectionMessage::Disconnection {}) => {
                info!("connection closed");
                Flow::Disconnected
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "dropping connection message");
                self.services
                    .metrics
                    .counter_inc("blorp.messages.malformed", &[], 1);
                Flow::Continue
            }
        }
    }

    async fn on_message(&self, payload: EventPayload, inflight: &mut JoinSet<()>) -> Flow {
        if let Err(e) = self.context.get_session().await {
            if e.is_fatal_to_actor() {
                error!(error = %e, "session lookup failed");
                return Flow::Fatal;
            }
            warn!(error = %e, "session lookup failed, dispatching without cache");
        }

        let event = payload.event_name().to_owned();
        let Some(entry) = self.services.registry.route(&event) else {
            let unrouted = EngineError::NoMatchingHandler(event);
            debug!(error = %unrouted, "dropping event");
            self.services
                .metrics
                .counter_inc("blorp.messages.unrouted", &[], 1);
            return Flow::Continue;
        };

        let dispatch = Dispatch {
            entry: entry.clone(),
            context: self.context.clone(),
            services: self.services.clone(),
            event,
            data: payload.data,
        };
        match entry.ordering() {
            OrderingMode::Ordered => match dispatch.run().await {
                Err(e) if e.is_fatal_to_actor() => {
                    error!(error = %e, "could not publish reply");
                    Flow::Fatal
                }
                Err(e) => {
                    warn!(error = %e, "dispatch failed");
                    Flow::Continue
                }
                Ok(()) => Flow::Continue,
            },
            OrderingMode::Unordered => {
                let cancel = self.cancel.clone();
                inflight.spawn(async move {
                    match dispatch.run().await {
                        Err(e) if e.is_fatal_to_actor() => {
                            error!(error = %e, "could not publish reply");
                            cancel.cancel();
                        }
                        Err(e) => warn!(error = %e, "unordered dispatch failed"),
                        Ok(()) => {}
                    }
                });
                Flow::Continue
            }
        }
    }
}

/// One handler invocation, detached from the actor so unordered handlers can
/// run as their own task.
struct Dispatch {
    entry: HandlerEntry,
    context: ConnectionContext,
    services: Services,
    event: String,
    data: Value,
}

impl Dispatch {
    async fn run(self) -> Result<(), EngineError> {
        let metrics = &self.services.metrics;
        let data = match self.decode_data() {
            Ok(data) => data,
            Err(e) => {
                warn!(event = %self.event, error = %e, "dropping event payload");
                metrics.counter_inc("blorp.messages.malformed", &[], 1);
                return Ok(());
            }
        };

        let started = Instant::now();
        let handler = Arc::clone(self.entry.handler());
        let outcome = AssertUnwindSafe(handler.handle(self.context.clone(), data))
            .catch_unwind()
            .await;
        metrics.histogram_observe(
            "blorp.handler.duration_ms",
            &[],
            started.elapsed().as_secs_f64() * 1000.0,
        );

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.failed(format!("{e:#}"));
                return Ok(());
            }
            Err(_) => {
                self.failed("handler panicked".into());
                return Ok(());
            }
        };
        metrics.counter_inc(
            "blorp.messages.dispatched",
            &[("ordering", self.entry.ordering().as_str())],
            1,
        );

        let default_event = self.entry.return_event().unwrap_or(&self.event);
        if let Some(out) = reply.into_outgoing(self.context.connection_id(), default_event) {
            self.context.outbox().send(&out).await?;
        }
        Ok(())
    }

    fn decode_data(&self) -> Result<Value, MessageError> {
        match &self.data {
            Value::String(raw) if self.entry.parse_json() => serde_json::from_str(raw)
                .map_err(|e| MessageError::Malformed(format!("data is not JSON: {e}"))),
            other => Ok(other.clone()),
        }
    }

    fn failed(&self, reason: String) {
        let failure = EngineError::HandlerFailure {
            event: self.event.clone(),
            reason,
        };
        warn!(pattern = self.entry.pattern(), error = %failure, "handler failed");
        self.services
            .metrics
            .counter_inc("blorp.handler.failures", &[], 1);
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "unordered handler task aborted");
    }
}
