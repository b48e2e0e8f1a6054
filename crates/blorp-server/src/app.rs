//! Composition root: wires the broker, registries and control actor together
//! and exposes the send and session API to application code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use blorp_core::{ConnectionId, InstanceId, KeySpace, OutgoingMessage, Target};
use blorp_engine::{EventRegistry, Services};
use blorp_store::{Broker, MemoryBroker, RedisBroker, RedisSyncBroker, Session, SyncBroker};
use blorp_telemetry::MetricsRecorder;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::control::{ControlActor, ShutdownReport};
use crate::error::ServerError;
use crate::instance::InstanceRegistry;

/// Where broker traffic goes.
#[derive(Clone)]
pub enum Backend {
    /// Redis at `AppConfig::redis_url()`.
    Redis,
    /// A process-local broker shared by every clone.
    Memory(MemoryBroker),
}

struct Running {
    services: Services,
    sync: Arc<dyn SyncBroker>,
    instance_id: InstanceId,
}

struct Inner {
    config: AppConfig,
    keys: KeySpace,
    backend: Backend,
    registry: Arc<EventRegistry>,
    metrics: Arc<MetricsRecorder>,
    stop: CancellationToken,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
    thread: Mutex<Option<thread::JoinHandle<Result<ShutdownReport, ServerError>>>>,
}

/// One instance of a blorp application. Cheap to clone; every clone drives the
/// same instance. An `App` runs at most once.
#[derive(Clone)]
pub struct App {
    inner: Arc<Inner>,
}

impl App {
    pub fn new(config: AppConfig, registry: EventRegistry) -> Self {
        Self::with_backend(config, registry, Backend::Redis, Arc::default())
    }

    /// `metrics` receives every actor's counters and timings.
    pub fn with_backend(
        config: AppConfig,
        registry: EventRegistry,
        backend: Backend,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                keys: KeySpace::new(&config.name),
                config,
                backend,
                registry: Arc::new(registry),
                metrics,
                stop: CancellationToken::new(),
                started: AtomicBool::new(false),
                running: Mutex::new(None),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.inner.keys
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.inner.metrics
    }

    /// This instance's ID while it is running.
    pub fn instance_id(&self) -> Option<InstanceId> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|r| r.instance_id.clone())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Run the instance on the calling thread until `stop` is called.
    pub fn start(&self) -> Result<ShutdownReport, ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name(format!("blorp-{}", self.inner.config.name))
            .build()
            .map_err(|e| ServerError::Runtime(e.to_string()))?;
        runtime.block_on(self.run())
    }

    /// Run the instance on a dedicated thread. Use `join` to wait for it.
    pub fn start_in_new_thread(&self) -> Result<(), ServerError> {
        let app = self.clone();
        let handle = thread::Builder::new()
            .name(format!("blorp-{}", self.inner.config.name))
            .spawn(move || app.start())
            .map_err(|e| ServerError::Runtime(e.to_string()))?;
        *self.inner.thread.lock() = Some(handle);
        Ok(())
    }

    /// Wait for the thread started by `start_in_new_thread`.
    pub fn join(&self) -> Result<ShutdownReport, ServerError> {
        let handle = self.inner.thread.lock().take().ok_or(ServerError::NotRunning)?;
        handle
            .join()
            .map_err(|_| ServerError::Runtime("app thread panicked".into()))?
    }

    /// Ask the instance to shut down. Returns immediately; safe from any
    /// thread and safe to repeat.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Run the instance on the current runtime until `stop` is called:
    /// register, consume the control queue, hand off live connections,
    /// deregister.
    pub async fn run(&self) -> Result<ShutdownReport, ServerError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        let (broker, sync) = self.connect().await?;

        let instances = InstanceRegistry::new(
            Arc::clone(&sync),
            &self.inner.keys,
            self.inner.config.registration_attempts,
        );
        let instance_id = {
            let instances = instances.clone();
            tokio::task::spawn_blocking(move || instances.register()).await??
        };
        info!(app = %self.inner.config.name, instance_id = %instance_id, "instance started");

        let services = Services::new(
            broker,
            self.inner.keys.clone(),
            self.inner.config.session_ttl,
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.metrics),
        );
        let control = ControlActor::new(
            services.clone(),
            instance_id.clone(),
            self.inner.stop.clone(),
        );
        *self.inner.running.lock() = Some(Running {
            services,
            sync,
            instance_id: instance_id.clone(),
        });

        let outcome = control.listen().await;
        *self.inner.running.lock() = None;

        match tokio::task::spawn_blocking(move || instances.deregister(&instance_id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "could not deregister instance"),
            Err(e) => warn!(error = %e, "could not deregister instance"),
        }
        if let Ok(report) = &outcome {
            info!(
                handed_off = report.handed_off.len(),
                disconnected = report.disconnected.len(),
                "instance stopped"
            );
        }
        outcome
    }

    async fn connect(&self) -> Result<(Arc<dyn Broker>, Arc<dyn SyncBroker>), ServerError> {
        match &self.inner.backend {
            Backend::Memory(broker) => Ok((Arc::new(broker.clone()), Arc::new(broker.clone()))),
            Backend::Redis => {
                let url = self.inner.config.redis_url();
                let broker = RedisBroker::connect(&url, self.inner.config.pool_size).await?;
                let sync = tokio::task::spawn_blocking(move || RedisSyncBroker::connect(&url)).await??;
                Ok((Arc::new(broker), Arc::new(sync)))
            }
        }
    }

    fn services(&self) -> Result<Services, ServerError> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|r| r.services.clone())
            .ok_or(ServerError::NotRunning)
    }

    fn sync_broker(&self) -> Result<Arc<dyn SyncBroker>, ServerError> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|r| Arc::clone(&r.sync))
            .ok_or(ServerError::NotRunning)
    }

    /// Queue an outgoing message from outside the runtime.
    pub fn send_sync(
        &self,
        to: impl Into<Target>,
        event: impl Into<String>,
        data: Value,
    ) -> Result<(), ServerError> {
        let message = OutgoingMessage::new(to, event, data).encode()?;
        self.sync_broker()?
            .push_sync(&self.inner.keys.out(), &[message])?;
        Ok(())
    }

    pub fn send_sync_to_all(&self, event: impl Into<String>, data: Value) -> Result<(), ServerError> {
        self.send_sync(Target::All, event, data)
    }

    pub async fn send(
        &self,
        to: impl Into<Target>,
        event: impl Into<String>,
        data: Value,
    ) -> Result<(), ServerError> {
        let services = self.services()?;
        services
            .outbox
            .send(&OutgoingMessage::new(to, event, data))
            .await?;
        Ok(())
    }

    pub async fn send_to_all(&self, event: impl Into<String>, data: Value) -> Result<(), ServerError> {
        self.send(Target::All, event, data).await
    }

    pub async fn get_session(
        &self,
        id: &ConnectionId,
        create_if_missing: bool,
    ) -> Result<Option<Session>, ServerError> {
        Ok(self.services()?.sessions.get(id, create_if_missing).await?)
    }

    pub async fn create_session(&self, id: &ConnectionId) -> Result<Session, ServerError> {
        Ok(self.services()?.sessions.create(id).await?)
    }

    pub async fn save_session(&self, id: &ConnectionId, session: &Session) -> Result<(), ServerError> {
        Ok(self.services()?.sessions.save(id, session).await?)
    }

    pub async fn touch_session(&self, id: &ConnectionId) -> Result<bool, ServerError> {
        Ok(self.services()?.sessions.touch(id).await?)
    }

    pub async fn delete_session(&self, id: &ConnectionId) -> Result<(), ServerError> {
        Ok(self.services()?.sessions.delete(id).await?)
    }

    /// Run blocking work off the event loop and await its result.
    pub async fn call_blocking<F, R>(&self, f: F) -> Result<R, ServerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(tokio::task::spawn_blocking(f).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use blorp_core::{ConnectionMessage, ControlAction, ControlMessage};
    use blorp_engine::{ConnectionContext, HandlerResult, Registration, Reply};
    use serde_json::json;

    async fn string(ctx: ConnectionContext, data: Value) -> HandlerResult {
        ctx.update_session(|s| {
            s.insert("string_message_sent".into(), json!(true));
        })
        .await?;
        Ok(Reply::payload(format!("Got {data} from you!")))
    }

    fn app(broker: &MemoryBroker) -> App {
        app_with_metrics(broker, Arc::default())
    }

    fn app_with_metrics(broker: &MemoryBroker, metrics: Arc<MetricsRecorder>) -> App {
        let registry = EventRegistry::builder()
            .register(Registration::new("string", string).return_event("something"))
            .build()
            .unwrap();
        App::with_backend(
            AppConfig::new("test"),
            registry,
            Backend::Memory(broker.clone()),
            metrics,
        )
    }

    async fn wait_running(app: &App) {
        for _ in 0..200 {
            if app.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("app did not start");
    }

    async fn wait_len(broker: &MemoryBroker, key: &str, len: usize) {
        for _ in 0..200 {
            if broker.list_len(key) >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn end_to_end_reply_and_handoff() {
        let broker = MemoryBroker::new();
        let app = app(&broker);
        let keys = app.keys().clone();
        let task = tokio::spawn({
            let app = app.clone();
            async move { app.run().await }
        });
        wait_running(&app).await;
        let instance_id = app.instance_id().unwrap();
        assert!(broker.members(&keys.instances()).contains(instance_id.as_str()));

        let c1 = ConnectionId::from("c1");
        broker
            .push(&keys.control(), &[ControlMessage::connection(c1.clone()).encode().unwrap()])
            .await
            .unwrap();
        broker
            .push(
                &keys.messages(&c1),
                &[ConnectionMessage::event("string", json!("hi")).encode().unwrap()],
            )
            .await
            .unwrap();

        wait_len(&broker, &keys.out(), 1).await;
        let out: Vec<OutgoingMessage> = broker
            .list(&keys.out())
            .iter()
            .map(|raw| OutgoingMessage::decode(raw).unwrap())
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Target::Connection(c1.clone()));
        assert_eq!(out[0].event, "something");
        assert_eq!(out[0].data, json!("Got \"hi\" from you!"));

        let session = app.get_session(&c1, false).await.unwrap().unwrap();
        assert_eq!(session.get("string_message_sent"), Some(&json!(true)));

        app.stop();
        app.stop();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.handed_off, vec![c1.clone()]);

        let switches: Vec<ControlMessage> = broker
            .list(&keys.control())
            .iter()
            .map(|raw| ControlMessage::decode(raw).unwrap())
            .collect();
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].action, ControlAction::Switch);
        assert_eq!(switches[0].from_instance, Some(instance_id));
        assert!(broker.members(&keys.instances()).is_empty());
        assert!(!app.is_running());
    }

    #[tokio::test]
    async fn switched_connection_resumes_on_another_instance() {
        let broker = MemoryBroker::new();
        let first = app(&broker);
        let task = tokio::spawn({
            let app = first.clone();
            async move { app.run().await }
        });
        wait_running(&first).await;
        let keys = first.keys().clone();
        let c1 = ConnectionId::from("c1");
        broker
            .push(&keys.control(), &[ControlMessage::connection(c1.clone()).encode().unwrap()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.stop();
        assert_eq!(task.await.unwrap().unwrap().handed_off, vec![c1.clone()]);

        // The second instance picks the switch off the shared control queue.
        let second = app(&broker);
        let task = tokio::spawn({
            let app = second.clone();
            async move { app.run().await }
        });
        wait_running(&second).await;
        broker
            .push(
                &keys.messages(&c1),
                &[ConnectionMessage::event("string", json!("again")).encode().unwrap()],
            )
            .await
            .unwrap();
        wait_len(&broker, &keys.out(), 1).await;
        assert_eq!(broker.list_len(&keys.out()), 1);

        second.stop();
        assert_eq!(task.await.unwrap().unwrap().handed_off, vec![c1]);
    }

    #[tokio::test]
    async fn api_requires_running_instance() {
        let broker = MemoryBroker::new();
        let app = app(&broker);
        assert!(matches!(
            app.send_sync_to_all("x", json!(1)),
            Err(ServerError::NotRunning)
        ));
        assert!(matches!(
            app.get_session(&ConnectionId::from("c1"), true).await,
            Err(ServerError::NotRunning)
        ));
        assert!(app.instance_id().is_none());
    }

    #[tokio::test]
    async fn app_runs_once() {
        let broker = MemoryBroker::new();
        let app = app(&broker);
        app.stop();
        assert!(app.run().await.unwrap().handed_off.is_empty());
        assert!(matches!(app.run().await, Err(ServerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn caller_supplied_recorder_sees_instance_metrics() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRecorder::new());
        let app = app_with_metrics(&broker, Arc::clone(&metrics));
        let shared = app.clone();
        assert!(Arc::ptr_eq(shared.metrics(), &metrics));

        let task = tokio::spawn(async move { shared.run().await });
        wait_running(&app).await;
        broker
            .push(
                &app.keys().control(),
                &[ControlMessage::connection(ConnectionId::from("c1")).encode().unwrap()],
            )
            .await
            .unwrap();
        for _ in 0..200 {
            if metrics.gauge_get("blorp.connections.active", &[]) == 1.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        app.stop();
        assert_eq!(task.await.unwrap().unwrap().handed_off.len(), 1);
        assert_eq!(metrics.counter_get("blorp.handoffs", &[]), 1);
    }

    #[tokio::test]
    async fn session_and_send_api() {
        let broker = MemoryBroker::new();
        let app = app(&broker);
        let task = tokio::spawn({
            let app = app.clone();
            async move { app.run().await }
        });
        wait_running(&app).await;

        let id = ConnectionId::from("c7");
        assert!(app.get_session(&id, false).await.unwrap().is_none());
        let mut session = app.create_session(&id).await.unwrap();
        session.insert("k".into(), json!("v"));
        app.save_session(&id, &session).await.unwrap();
        assert!(app.touch_session(&id).await.unwrap());
        assert_eq!(app.get_session(&id, false).await.unwrap(), Some(session));
        app.delete_session(&id).await.unwrap();
        assert!(!app.touch_session(&id).await.unwrap());

        app.send(id.clone(), "direct", json!(1)).await.unwrap();
        app.send_to_all("news", json!(2)).await.unwrap();
        assert_eq!(app.call_blocking(|| 6 * 7).await.unwrap(), 42);
        assert_eq!(broker.list_len(&app.keys().out()), 2);

        app.stop();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn start_in_new_thread_and_send_sync() {
        let broker = MemoryBroker::new();
        let app = app(&broker);
        app.start_in_new_thread().unwrap();
        for _ in 0..200 {
            if app.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(app.is_running());

        app.send_sync_to_all("something", json!("hello")).unwrap();
        let out = broker.list(&app.keys().out());
        let message = OutgoingMessage::decode(&out[0]).unwrap();
        assert_eq!(message.target, Target::All);

        app.stop();
        let report = app.join().unwrap();
        assert!(report.handed_off.is_empty());
        assert!(matches!(app.join(), Err(ServerError::NotRunning)));
    }
}
