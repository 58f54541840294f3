//! Shared counter store backed by Redis.
//!
//! Each counter is a hash `{count, start}` with a TTL equal to the window
//! length. Increment-and-expire is one Lua script, so concurrent requests from
//! any number of processes never lose an update.

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{CounterSnapshot, CounterStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
if count == 1 then
    redis.call('HSET', KEYS[1], 'start', ARGV[1])
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
elseif redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local start = tonumber(redis.call('HGET', KEYS[1], 'start')) or tonumber(ARGV[1])
return {count, start}
"#;

const SCAN_BATCH: usize = 200;

/// Lifecycle of the Redis connection. Only `Ready` accepts commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

/// Exponential delay between reconnect attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectBackoff {
    /// Delay before the given attempt, starting at 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

pub struct RedisCounterStore {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    state: watch::Sender<ConnectionState>,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    increment_script: Script,
}

impl RedisCounterStore {
    /// Validates the URL without connecting. Call [`connect`](Self::connect)
    /// or start the supervisor to bring the connection up.
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        Self::with_clock(redis_url, key_prefix, Arc::new(SystemClock))
    }

    pub fn with_clock(
        redis_url: &str,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let (state, _) = watch::channel(ConnectionState::Connecting);

        Ok(Self {
            client,
            connection: RwLock::new(None),
            state,
            key_prefix: key_prefix.into(),
            clock,
            increment_script: Script::new(INCREMENT_SCRIPT),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receive every connection state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            // Closed is terminal.
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            info!(from = ?previous, to = ?next, "redis connection state changed");
        }
    }

    pub async fn connect(&self) -> Result<(), StoreError> {
        if self.state() == ConnectionState::Closed {
            return Err(StoreError::Unavailable("store has been closed".into()));
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *self.connection.write().await = Some(conn);
                self.set_state(ConnectionState::Ready);
                if self.state() == ConnectionState::Closed {
                    self.connection.write().await.take();
                }
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Reconnecting);
                Err(err.into())
            }
        }
    }

    pub async fn close(&self) {
        self.set_state(ConnectionState::Closed);
        self.connection.write().await.take();
    }

    /// Reconnect with backoff whenever the connection is lost, until closed.
    pub fn spawn_supervisor(self: Arc<Self>, backoff: ReconnectBackoff) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut states = self.subscribe();
            loop {
                let current = *states.borrow_and_update();
                match current {
                    ConnectionState::Closed => break,
                    ConnectionState::Reconnecting => self.reconnect(&backoff).await,
                    ConnectionState::Connecting | ConnectionState::Ready => {}
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
            debug!("redis connection supervisor stopped");
        })
    }

    async fn reconnect(&self, backoff: &ReconnectBackoff) {
        let mut attempt = 0u32;
        while self.state() != ConnectionState::Closed {
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(backoff.delay(attempt)).await;
            match self.connect().await {
                Ok(()) => {
                    info!(attempt, "reconnected to redis");
                    return;
                }
                Err(err) => warn!(attempt, error = %err, "redis reconnect attempt failed"),
            }
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.state() != ConnectionState::Ready {
            return Err(StoreError::Unavailable(format!(
                "connection is {:?}",
                self.state()
            )));
        }
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| StoreError::Unavailable("no redis connection available".into()))
    }

    async fn observe<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(err) = &result {
            if err.is_connection_loss() && self.state() == ConnectionState::Ready {
                warn!(error = %err, "lost redis connection");
                self.connection.write().await.take();
                self.set_state(ConnectionState::Reconnecting);
            }
        }
        result
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let result = async {
            let mut conn = self.connection().await?;
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            if pong == "PONG" {
                Ok(())
            } else {
                Err(StoreError::Protocol(format!("unexpected PING reply '{pong}'")))
            }
        }
        .await;
        self.observe(result).await
    }

    async fn increment_inner(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let mut conn = self.connection().await?;
        let (count, start): (i64, i64) = self
            .increment_script
            .key(self.full_key(key))
            .arg(self.clock.now_millis())
            .arg(duration_millis(window).max(1))
            .invoke_async(&mut conn)
            .await?;

        snapshot_from_reply(count, start)
    }

    async fn read_inner(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
        let mut conn = self.connection().await?;
        let (count, start): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.full_key(key))
            .arg("count")
            .arg("start")
            .query_async(&mut conn)
            .await?;

        Ok(match (count, start) {
            (Some(count), Some(start)) => Some(CounterSnapshot::new(count, start)),
            _ => None,
        })
    }

    async fn reset_inner(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset_all_inner(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                deleted += keys.len();
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, i64>(&mut conn)
                    .await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(deleted, prefix = %self.key_prefix, "cleared shared counters");
        Ok(())
    }
}

fn snapshot_from_reply(count: i64, start: i64) -> Result<CounterSnapshot, StoreError> {
    let count = u64::try_from(count)
        .map_err(|_| StoreError::Protocol(format!("negative counter value {count}")))?;
    let start = u64::try_from(start)
        .map_err(|_| StoreError::Protocol(format!("negative window start {start}")))?;
    Ok(CounterSnapshot::new(count, start))
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        let result = self.increment_inner(key, window).await;
        self.observe(result).await
    }

    async fn read(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
        let result = self.read_inner(key).await;
        self.observe(result).await
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let result = self.reset_inner(key).await;
        self.observe(result).await
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        let result = self.reset_all_inner().await;
        self.observe(result).await
    }

    fn is_available(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
