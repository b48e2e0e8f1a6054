pub mod broker;
pub mod error;
pub mod memory;
pub mod redis_broker;
pub mod sessions;

pub use broker::{Broker, QueueReader, SyncBroker};
pub use error::StoreError;
pub use memory::MemoryBroker;
pub use redis_broker::{RedisBroker, RedisSyncBroker};
pub use sessions::{Session, SessionStore, CREATED_AT};
