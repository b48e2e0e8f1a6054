//! Process-local broker with the same semantics as the Redis one.
//!
//! Clones share state, so one `MemoryBroker` can stand in for the broker of
//! several instances in tests or in the demo's `--in-memory` mode.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broker::{Broker, QueueReader, SyncBroker};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
}

impl State {
    fn purge_expired(&mut self, key: &str) {
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.strings.remove(key);
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    pushed: Notify,
    unavailable: AtomicBool,
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::BrokerUnavailable("memory broker offline".into()));
        }
        Ok(())
    }

    fn push(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        self.check_available()?;
        if values.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            state
                .lists
                .entry(key.to_owned())
                .or_default()
                .extend(values.iter().cloned());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let popped = state.lists.get_mut(key).and_then(VecDeque::pop_front);
        if state.lists.get(key).is_some_and(VecDeque::is_empty) {
            state.lists.remove(key);
        }
        Ok(popped)
    }

    fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        Ok(state
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned()))
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        Ok(state
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation (including pending pops) fail with
    /// `BrokerUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Relaxed);
        self.inner.pushed.notify_waiters();
    }

    /// Snapshot of the list at `key`, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.inner.state.lock().lists.get(key).map_or(0, VecDeque::len)
    }

    /// Remaining TTL of a string key, `None` if absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.inner.state.lock();
        state.purge_expired(key);
        state
            .strings
            .get(key)
            .and_then(|(_, deadline)| *deadline)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn members(&self, key: &str) -> HashSet<String> {
        self.inner
            .state
            .lock()
            .sets
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn queue_reader(&self, key: &str) -> Result<Box<dyn QueueReader>, StoreError> {
        self.inner.check_available()?;
        Ok(Box::new(MemoryQueueReader {
            inner: Arc::clone(&self.inner),
            key: key.to_owned(),
        }))
    }

    async fn push(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        self.inner.push(key, values)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        state.purge_expired(key);
        Ok(state.strings.get(key).map(|(value, _)| value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner.check_available()?;
        let deadline = Instant::now() + ttl;
        self.inner
            .state
            .lock()
            .strings
            .insert(key.to_owned(), (value.to_owned(), Some(deadline)));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        state.purge_expired(key);
        match state.strings.get_mut(key) {
            Some((_, deadline)) => {
                *deadline = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.check_available()?;
        let mut state = self.inner.state.lock();
        state.purge_expired(key);
        let removed = state.strings.remove(key).is_some()
            | state.lists.remove(key).is_some()
            | state.sets.remove(key).is_some();
        Ok(removed)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_add(key, member)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_remove(key, member)
    }
}

impl SyncBroker for MemoryBroker {
    fn push_sync(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        self.inner.push(key, values)
    }

    fn set_add_sync(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_add(key, member)
    }

    fn set_remove_sync(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_remove(key, member)
    }
}

struct MemoryQueueReader {
    inner: Arc<Inner>,
    key: String,
}

#[async_trait]
impl QueueReader for MemoryQueueReader {
    async fn pop(&mut self) -> Result<String, StoreError> {
        loop {
            // Register for wakeups before checking, so a push between the
            // check and the await is not missed.
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.inner.try_pop(&self.key)? {
                return Ok(value);
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn pop_is_fifo() {
        let broker = MemoryBroker::new();
        broker.push("q", &strings(&["a", "b", "c"])).await.unwrap();

        let mut reader = broker.queue_reader("q").await.unwrap();
        assert_eq!(reader.pop().await.unwrap(), "a");
        assert_eq!(reader.pop().await.unwrap(), "b");
        assert_eq!(reader.pop().await.unwrap(), "c");
        assert_eq!(broker.list_len("q"), 0);
    }

    #[tokio::test]
    async fn pending_pop_wakes_on_push() {
        let broker = MemoryBroker::new();
        let mut reader = broker.queue_reader("q").await.unwrap();

        let waiter = tokio::spawn(async move { reader.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        broker.push_sync("q", &strings(&["late"])).unwrap();
        let value = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, "late");
    }

    #[tokio::test]
    async fn dropped_pop_does_not_consume() {
        let broker = MemoryBroker::new();
        let mut reader = broker.queue_reader("q").await.unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(10), reader.pop()).await;
        assert!(timed_out.is_err());

        broker.push("q", &strings(&["kept"])).await.unwrap();
        assert_eq!(broker.list("q"), vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn unavailable_broker_fails_pending_pop() {
        let broker = MemoryBroker::new();
        let mut reader = broker.queue_reader("q").await.unwrap();
        let waiter = tokio::spawn(async move { reader.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.set_unavailable(true);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StoreError::BrokerUnavailable(_))));
    }

    #[tokio::test]
    async fn strings_expire() {
        let broker = MemoryBroker::new();
        broker
            .set_with_ttl("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(broker.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.get("k").await.unwrap(), None);
        assert!(!broker.expire("k", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn expire_refreshes_ttl() {
        let broker = MemoryBroker::new();
        broker
            .set_with_ttl("k", "v", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(broker.expire("k", Duration::from_secs(100)).await.unwrap());
        assert!(broker.ttl("k").unwrap() > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn sets_add_if_absent() {
        let broker = MemoryBroker::new();
        assert!(broker.set_add("s", "a").await.unwrap());
        assert!(!broker.set_add_sync("s", "a").unwrap());
        assert!(broker.set_remove("s", "a").await.unwrap());
        assert!(!broker.set_remove_sync("s", "a").unwrap());
        assert!(broker.members("s").is_empty());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryBroker::new();
        let b = a.clone();
        a.push("q", &strings(&["x"])).await.unwrap();
        assert_eq!(b.list("q"), vec!["x".to_string()]);
    }
}
