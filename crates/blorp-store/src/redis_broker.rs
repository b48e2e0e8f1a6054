use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use tracing::{debug, info};

use crate::broker::{ttl_secs, Broker, QueueReader, SyncBroker};
use crate::error::StoreError;

/// Redis-backed broker with a fixed pool of multiplexed connections.
pub struct RedisBroker {
    client: redis::Client,
    pool: Vec<MultiplexedConnection>,
    next: AtomicUsize,
}

impl RedisBroker {
    /// Open `pool_size` connections (at least one) up front.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let size = pool_size.max(1);
        let mut pool = Vec::with_capacity(size);
        for _ in 0..size {
            pool.push(client.get_multiplexed_async_connection().await?);
        }
        info!(pool_size = size, "redis pool ready");
        Ok(Self {
            client,
            pool,
            next: AtomicUsize::new(0),
        })
    }

    fn connection(&self) -> MultiplexedConnection {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].clone()
    }

    async fn query<T: FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.connection();
        Ok(cmd.query_async(&mut conn).await?)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn queue_reader(&self, key: &str) -> Result<Box<dyn QueueReader>, StoreError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!(key, "opened dedicated queue connection");
        Ok(Box::new(RedisQueueReader {
            conn,
            key: key.to_owned(),
        }))
    }

    async fn push(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(values);
        let _len: u64 = self.query(cmd).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs(ttl));
        self.query(cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs(ttl));
        let updated: i64 = self.query(cmd).await?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: u64 = self.query(cmd).await?;
        Ok(removed > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let added: u64 = self.query(cmd).await?;
        Ok(added == 1)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        let removed: u64 = self.query(cmd).await?;
        Ok(removed > 0)
    }
}

struct RedisQueueReader {
    conn: MultiplexedConnection,
    key: String,
}

#[async_trait]
impl QueueReader for RedisQueueReader {
    async fn pop(&mut self) -> Result<String, StoreError> {
        loop {
            // BLPOP with timeout 0 waits indefinitely; a nil reply only shows
            // up if the server was told otherwise, so just ask again.
            let mut cmd = redis::cmd("BLPOP");
            cmd.arg(&self.key).arg(0);
            let popped: Option<(String, String)> = cmd.query_async(&mut self.conn).await?;
            if let Some((_key, value)) = popped {
                return Ok(value);
            }
        }
    }
}

/// Blocking Redis client for the hosting thread.
pub struct RedisSyncBroker {
    conn: Mutex<redis::Connection>,
}

impl RedisSyncBroker {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query<T: FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        Ok(cmd.query(&mut *conn)?)
    }
}

impl SyncBroker for RedisSyncBroker {
    fn push_sync(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(values);
        let _len: u64 = self.query(cmd)?;
        Ok(())
    }

    fn set_add_sync(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let added: u64 = self.query(cmd)?;
        Ok(added == 1)
    }

    fn set_remove_sync(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        let removed: u64 = self.query(cmd)?;
        Ok(removed > 0)
    }
}
