//! In-process counter store used while the shared store is unreachable.
//!
//! Counts here are only consistent within this process; during an outage each
//! server instance enforces quotas on its own.

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{CounterSnapshot, CounterStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
struct LocalEntry {
    count: u64,
    window_start_ms: u64,
    window_ms: u64,
}

impl LocalEntry {
    fn expires_at(&self) -> u64 {
        self.window_start_ms.saturating_add(self.window_ms)
    }

    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }
}

#[derive(Debug)]
pub struct LocalCounterStore {
    entries: RwLock<HashMap<String, LocalEntry>>,
    clock: Arc<dyn Clock>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    // A panic while holding the lock cannot leave an entry half-written, so a
    // poisoned lock is still safe to use.
    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, LocalEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<String, LocalEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn increment_local(&self, key: &str, window: Duration) -> CounterSnapshot {
        let now = self.clock.now_millis();
        let window_ms = duration_millis(window);
        let mut entries = self.write();

        let entry = entries.entry(key.to_string()).or_insert(LocalEntry {
            count: 0,
            window_start_ms: now,
            window_ms,
        });

        if entry.is_expired(now) {
            entry.count = 0;
            entry.window_start_ms = now;
            entry.window_ms = window_ms;
        }

        entry.count += 1;
        CounterSnapshot::new(entry.count, entry.window_start_ms)
    }

    pub fn read_local(&self, key: &str) -> Option<CounterSnapshot> {
        let now = self.clock.now_millis();
        self.read_guard()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| CounterSnapshot::new(entry.count, entry.window_start_ms))
    }

    pub fn reset_local(&self, key: &str) {
        self.write().remove(key);
    }

    pub fn reset_all_local(&self) {
        self.write().clear();
    }

    /// Drop entries whose window has ended. Runs under the same write lock as
    /// `increment_local`, so a live window is never removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically sweep expired entries until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.sweep_expired();
                if removed > 0 {
                    debug!(removed, remaining = self.len(), "swept expired local counters");
                }
            }
        })
    }
}

impl Default for LocalCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        Ok(self.increment_local(key, window))
    }

    async fn read(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
        Ok(self.read_local(key))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.reset_local(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        self.reset_all_local();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
