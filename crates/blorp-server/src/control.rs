//! Instance control plane.
//!
//! The control actor consumes the shared control queue and spawns one
//! [`ConnectionActor`] per `connection`/`switch` message. On shutdown it stops
//! every actor and pushes a `switch` message for each connection that was
//! still live, so whichever instance pops it next resumes ownership.

use std::sync::Arc;

use blorp_core::{ConnectionId, ControlAction, ControlMessage, InstanceId};
use blorp_engine::{ConnectionActor, Services, Termination};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ServerError;

/// Outcome of a shutdown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections re-announced with a `switch` message.
    pub handed_off: Vec<ConnectionId>,
    /// Tracked connections found closed when shutdown began.
    pub disconnected: Vec<ConnectionId>,
}

struct TrackedActor {
    actor: Arc<ConnectionActor>,
    task: JoinHandle<Termination>,
}

pub struct ControlActor {
    services: Services,
    instance_id: InstanceId,
    cancel: CancellationToken,
    actors: Arc<DashMap<ConnectionId, TrackedActor>>,
}

impl ControlActor {
    pub fn new(services: Services, instance_id: InstanceId, cancel: CancellationToken) -> Self {
        Self {
            services,
            instance_id,
            cancel,
            actors: Arc::new(DashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Stop consuming control messages and begin the shutdown sequence.
    /// Non-blocking; repeated calls have no further effect.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Connections whose actor is still running.
    pub fn live_connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .actors
            .iter()
            .filter(|entry| !entry.task.is_finished())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Start an actor for `connection_id` unless one is already running.
    /// Must be called from within the runtime. Returns whether an actor was
    /// spawned.
    pub fn adopt(&self, connection_id: ConnectionId) -> bool {
        let entry = self.actors.entry(connection_id.clone());
        // Checked under the shard lock: shutdown cancels before it snapshots
        // the map, so an entry inserted here is always in that snapshot.
        if self.cancel.is_cancelled() {
            warn!(connection_id = %connection_id, "shutting down, not adopting connection");
            return false;
        }
        match entry {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().task.is_finished() {
                    debug!(connection_id = %connection_id, "connection already has a live actor");
                    return false;
                }
                occupied.insert(self.spawn(connection_id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.spawn(connection_id));
            }
        }
        true
    }

    fn spawn(&self, connection_id: ConnectionId) -> TrackedActor {
        let actor = Arc::new(ConnectionActor::new(
            connection_id.clone(),
            self.services.clone(),
        ));
        let metrics = Arc::clone(&self.services.metrics);
        metrics.gauge_inc("blorp.connections.active", &[], 1.0);

        let task = tokio::spawn({
            let actor = Arc::clone(&actor);
            let actors = Arc::clone(&self.actors);
            async move {
                let termination = actor.listen().await;
                metrics.gauge_inc("blorp.connections.active", &[], -1.0);
                // Actors stopped for hand-off stay tracked until shutdown
                // collects them.
                if termination == Termination::Disconnected {
                    actors.remove_if(&connection_id, |_, tracked| {
                        Arc::ptr_eq(&tracked.actor, &actor)
                    });
                }
                termination
            }
        });
        info!(connection_id = %actor.connection_id(), "connection actor spawned");
        TrackedActor { actor, task }
    }

    /// Consume control messages until stopped, then shut down. A failure of
    /// the control queue itself is returned after the shutdown sequence ran.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn listen(&self) -> Result<ShutdownReport, ServerError> {
        let consumed = self.consume().await;
        if let Err(e) = &consumed {
            error!(error = %e, "control queue failed, shutting down instance");
        }
        let report = self.shutdown().await;
        consumed?;
        report
    }

    async fn consume(&self) -> Result<(), ServerError> {
        let key = self.services.keys.control();
        let mut reader = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            opened = self.services.broker.queue_reader(&key) => opened?,
        };
        info!("control actor listening");

        loop {
            let raw = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                popped = reader.pop() => popped?,
            };
            match ControlMessage::decode(&raw) {
                Ok(message) => self.handle(message),
                Err(e) => {
                    warn!(error = %e, kind = e.error_kind(), "dropping control message");
                    self.services
                        .metrics
                        .counter_inc("blorp.messages.malformed", &[], 1);
                }
            }
            self.sweep();
        }
    }

    fn handle(&self, message: ControlMessage) {
        match message.action {
            ControlAction::Connection => {
                info!(connection_id = %message.connection_id, "connection opened");
            }
            ControlAction::Switch => {
                info!(
                    connection_id = %message.connection_id,
                    from_instance = ?message.from_instance,
                    "taking over connection"
                );
            }
        }
        self.adopt(message.connection_id);
    }

    /// Drop entries of actors that ended by disconnection but were tracked
    /// after their completion ran.
    fn sweep(&self) {
        self.actors.retain(|_, tracked| {
            !(tracked.task.is_finished()
                && tracked.actor.termination() == Some(Termination::Disconnected))
        });
    }

    async fn shutdown(&self) -> Result<ShutdownReport, ServerError> {
        self.cancel.cancel();

        let ids: Vec<ConnectionId> = self.actors.iter().map(|e| e.key().clone()).collect();
        let tracked: Vec<(ConnectionId, TrackedActor)> = ids
            .into_iter()
            .filter_map(|id| self.actors.remove(&id))
            .collect();
        for (_, t) in &tracked {
            t.actor.stop();
        }

        let mut report = ShutdownReport::default();
        for (id, t) in tracked {
            let termination = match t.task.await {
                Ok(termination) => termination,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "connection actor task failed");
                    Termination::StoppedForHandoff
                }
            };
            match termination {
                Termination::Disconnected => report.disconnected.push(id),
                Termination::StoppedForHandoff => report.handed_off.push(id),
            }
        }
        report.handed_off.sort();
        report.disconnected.sort();

        if !report.handed_off.is_empty() {
            let switches = report
                .handed_off
                .iter()
                .map(|id| ControlMessage::switch(id.clone(), self.instance_id.clone()).encode())
                .collect::<Result<Vec<_>, _>>()?;
            self.services
                .broker
                .push(&self.services.keys.control(), &switches)
                .await?;
            self.services
                .metrics
                .counter_inc("blorp.handoffs", &[], switches.len() as u64);
            info!(count = switches.len(), "handed off live connections");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use blorp_core::{ConnectionMessage, KeySpace};
    use blorp_engine::{ConnectionContext, EventRegistry, HandlerResult, Reply};
    use blorp_store::{Broker, MemoryBroker};
    use blorp_telemetry::MetricsRecorder;
    use serde_json::{json, Value};

    async fn nothing(_ctx: ConnectionContext, _data: Value) -> HandlerResult {
        Ok(Reply::Nothing)
    }

    struct Harness {
        broker: MemoryBroker,
        keys: KeySpace,
        control: Arc<ControlActor>,
    }

    impl Harness {
        fn new() -> Self {
            let broker = MemoryBroker::new();
            let keys = KeySpace::new("test");
            let services = Services::new(
                Arc::new(broker.clone()),
                keys.clone(),
                Duration::from_secs(60),
                Arc::new(EventRegistry::builder().on(".*", nothing).build().unwrap()),
                Arc::new(MetricsRecorder::new()),
            );
            let control = Arc::new(ControlActor::new(
                services,
                InstanceId::from_raw("instance-a"),
                CancellationToken::new(),
            ));
            Self {
                broker,
                keys,
                control,
            }
        }

        fn listen(&self) -> JoinHandle<Result<ShutdownReport, ServerError>> {
            let control = Arc::clone(&self.control);
            tokio::spawn(async move { control.listen().await })
        }

        async fn control(&self, message: ControlMessage) {
            self.broker
                .push(&self.keys.control(), &[message.encode().unwrap()])
                .await
                .unwrap();
        }

        async fn connection(&self, id: &str, message: ConnectionMessage) {
            self.broker
                .push(
                    &self.keys.messages(&ConnectionId::from(id)),
                    &[message.encode().unwrap()],
                )
                .await
                .unwrap();
        }

        async fn wait_until(&self, f: impl Fn(&ControlActor) -> bool) {
            for _ in 0..200 {
                if f(&self.control) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("condition not reached");
        }

        fn control_queue(&self) -> Vec<ControlMessage> {
            self.broker
                .list(&self.keys.control())
                .iter()
                .map(|raw| ControlMessage::decode(raw).unwrap())
                .collect()
        }
    }

    fn ids(names: &[&str]) -> Vec<ConnectionId> {
        names.iter().map(|n| ConnectionId::from(*n)).collect()
    }

    #[tokio::test]
    async fn shutdown_hands_off_only_live_connections() {
        let h = Harness::new();
        let task = h.listen();
        for id in ["c1", "c2", "c3", "c4"] {
            h.control(ControlMessage::connection(ConnectionId::from(id))).await;
        }
        h.wait_until(|c| c.live_connections().len() == 4).await;

        h.connection("c4", ConnectionMessage::disconnection()).await;
        h.wait_until(|c| c.live_connections() == ids(&["c1", "c2", "c3"]))
            .await;

        h.control.stop();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.handed_off, ids(&["c1", "c2", "c3"]));
        assert!(!report.handed_off.contains(&ConnectionId::from("c4")));

        let queued = h.control_queue();
        assert_eq!(queued.len(), 3);
        for (message, id) in queued.iter().zip(ids(&["c1", "c2", "c3"])) {
            assert_eq!(message.action, ControlAction::Switch);
            assert_eq!(message.connection_id, id);
            assert_eq!(
                message.from_instance,
                Some(InstanceId::from_raw("instance-a"))
            );
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = Harness::new();
        let task = h.listen();
        h.control(ControlMessage::connection(ConnectionId::from("c1"))).await;
        h.wait_until(|c| c.live_connections().len() == 1).await;

        h.control.stop();
        h.control.stop();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.handed_off, ids(&["c1"]));

        h.control.stop();
        assert_eq!(h.control_queue().len(), 1);
        assert!(!h.control.adopt(ConnectionId::from("c2")));
    }

    #[tokio::test]
    async fn switch_is_handled_like_connection() {
        let h = Harness::new();
        let task = h.listen();
        h.control(ControlMessage::switch(
            ConnectionId::from("c9"),
            InstanceId::from_raw("instance-b"),
        ))
        .await;
        h.wait_until(|c| c.live_connections() == ids(&["c9"])).await;

        h.control.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn duplicate_connection_keeps_single_actor() {
        let h = Harness::new();
        let task = h.listen();
        h.control(ControlMessage::connection(ConnectionId::from("c1"))).await;
        h.control(ControlMessage::connection(ConnectionId::from("c1"))).await;
        h.wait_until(|c| c.live_connections().len() == 1).await;
        assert!(!h.control.adopt(ConnectionId::from("c1")));

        h.control.stop();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.handed_off, ids(&["c1"]));
    }

    #[tokio::test]
    async fn reconnect_after_disconnection_spawns_new_actor() {
        let h = Harness::new();
        let task = h.listen();
        h.control(ControlMessage::connection(ConnectionId::from("c1"))).await;
        h.wait_until(|c| c.live_connections().len() == 1).await;
        h.connection("c1", ConnectionMessage::disconnection()).await;
        h.wait_until(|c| c.live_connections().is_empty()).await;

        h.control(ControlMessage::connection(ConnectionId::from("c1"))).await;
        h.wait_until(|c| c.live_connections().len() == 1).await;
        h.control.stop();
        assert_eq!(task.await.unwrap().unwrap().handed_off, ids(&["c1"]));
    }

    #[tokio::test]
    async fn malformed_control_message_is_skipped() {
        let h = Harness::new();
        let task = h.listen();
        h.broker
            .push(&h.keys.control(), &[r#"{"action":"explode"}"#.to_string()])
            .await
            .unwrap();
        h.control(ControlMessage::connection(ConnectionId::from("c1"))).await;
        h.wait_until(|c| c.live_connections().len() == 1).await;

        h.control.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn adopt_without_control_message() {
        let h = Harness::new();
        let task = h.listen();
        assert!(h.control.adopt(ConnectionId::from("boot")));
        h.connection("boot", ConnectionMessage::event("hi", json!(1))).await;

        h.control.stop();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.handed_off, ids(&["boot"]));
    }

    #[tokio::test]
    async fn actor_ended_by_outage_is_handed_off() {
        let h = Harness::new();
        assert!(h.control.adopt(ConnectionId::from("c1")));
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.broker.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.broker.set_unavailable(false);
        assert!(h.control.live_connections().is_empty());

        h.control.stop();
        let report = h.control.listen().await.unwrap();
        assert_eq!(report.handed_off, ids(&["c1"]));

        let queued = h.control_queue();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, ControlAction::Switch);
        assert_eq!(queued[0].connection_id, ConnectionId::from("c1"));
        assert_eq!(
            queued[0].from_instance,
            Some(InstanceId::from_raw("instance-a"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn adopt_racing_shutdown_never_loses_an_actor() {
        let h = Harness::new();
        let adopters: Vec<_> = (0..4)
            .map(|worker| {
                let control = Arc::clone(&h.control);
                tokio::spawn(async move {
                    let mut adopted = Vec::new();
                    for n in 0..50 {
                        let id = ConnectionId::from(format!("w{worker}-{n}").as_str());
                        if control.adopt(id.clone()) {
                            adopted.push(id);
                        }
                        tokio::task::yield_now().await;
                    }
                    adopted
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(1)).await;

        h.control.stop();
        let report = h.control.listen().await.unwrap();
        let mut adopted = Vec::new();
        for adopter in adopters {
            adopted.extend(adopter.await.unwrap());
        }
        adopted.sort();

        assert_eq!(report.handed_off, adopted);
        assert_eq!(h.control_queue().len(), adopted.len());
        assert!(h.control.live_connections().is_empty());
    }

    #[tokio::test]
    async fn control_queue_failure_is_fatal_to_instance() {
        let h = Harness::new();
        let task = h.listen();
        h.control(ControlMessage::connection(ConnectionId::from("c1"))).await;
        h.wait_until(|c| c.live_connections().len() == 1).await;

        h.broker.set_unavailable(true);
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ServerError::Store(_))));
    }
}
