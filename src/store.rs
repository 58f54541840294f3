//! Counter store interface shared by the Redis adapter and the local fallback.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Count and window start of one identity's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub count: u64,
    pub window_start_ms: u64,
}

impl CounterSnapshot {
    pub fn new(count: u64, window_start_ms: u64) -> Self {
        Self {
            count,
            window_start_ms,
        }
    }
}

/// Fixed-window counter storage.
///
/// `increment` must be atomic per key: concurrent callers never observe the
/// same post-increment count. An expired counter behaves as absent and the next
/// increment opens a new window at count 1.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError>;

    async fn read(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError>;

    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    async fn reset_all(&self) -> Result<(), StoreError>;

    /// Whether the store currently has a usable connection. Checked before
    /// each guarded call so a known-down store fails fast.
    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}
