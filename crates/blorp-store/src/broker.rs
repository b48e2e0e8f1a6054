//! Broker client contract.
//!
//! The broker is a keyed store of FIFO lists (with blocking pop), TTL'd
//! strings and sets. Every cross-instance interaction goes through it.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Async broker operations used from the event loop.
///
/// Implementations hand out pooled connections; callers must not assume the
/// same connection serves two consecutive calls.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a dedicated reader for blocking pops on `key`. The reader owns its
    /// own connection so a pending pop never stalls the shared pool.
    async fn queue_reader(&self, key: &str) -> Result<Box<dyn QueueReader>, StoreError>;

    /// Append values to the tail of the list at `key`, in order.
    async fn push(&self, key: &str, values: &[String]) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Reset the TTL of an existing key. Returns `false` when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns `true` when something was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomic add-if-absent. Returns `true` when the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;
}

/// Blocking consumer of one list key.
#[async_trait]
pub trait QueueReader: Send {
    /// Wait until the head of the list can be popped and return it.
    ///
    /// Dropping the returned future cancels the wait.
    async fn pop(&mut self) -> Result<String, StoreError>;
}

/// Synchronous subset used from the hosting thread, outside the event loop.
pub trait SyncBroker: Send + Sync + 'static {
    fn push_sync(&self, key: &str, values: &[String]) -> Result<(), StoreError>;

    /// Atomic add-if-absent. Returns `true` when the member was newly added.
    fn set_add_sync(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    fn set_remove_sync(&self, key: &str, member: &str) -> Result<bool, StoreError>;
}

/// Clamp a TTL to whole seconds, never below one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
