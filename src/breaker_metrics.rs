//! Lock-free rolling call/error counters for the circuit breaker.
//!
//! The window is split into buckets. Each bucket is one `AtomicU64` packing
//! `[bucket epoch: 24 bits | calls: 20 bits | errors: 20 bits]`, so a record is
//! a single CAS and a stale bucket is reset in the same CAS that reuses it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const COUNT_BITS: u32 = 20;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const EPOCH_BITS: u32 = 24;
const EPOCH_MASK: u64 = (1 << EPOCH_BITS) - 1;

fn pack(epoch: u64, calls: u64, errors: u64) -> u64 {
    ((epoch & EPOCH_MASK) << (2 * COUNT_BITS))
        | ((calls & COUNT_MASK) << COUNT_BITS)
        | (errors & COUNT_MASK)
}

fn unpack(word: u64) -> (u64, u64, u64) {
    (
        (word >> (2 * COUNT_BITS)) & EPOCH_MASK,
        (word >> COUNT_BITS) & COUNT_MASK,
        word & COUNT_MASK,
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub calls: u64,
    pub errors: u64,
}

impl WindowTotals {
    pub fn error_rate_percent(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 * 100.0 / self.calls as f64
        }
    }
}

#[derive(Debug)]
pub struct RollingWindow {
    buckets: Box<[AtomicU64]>,
    bucket_ms: u64,
}

impl RollingWindow {
    /// `window` is divided into `buckets` slots; both must be non-zero.
    pub fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let bucket_ms = (window_ms / buckets as u64).max(1);

        Self {
            buckets: (0..buckets).map(|_| AtomicU64::new(0)).collect(),
            bucket_ms,
        }
    }

    fn bucket_index(&self, now_ms: u64) -> (u64, usize) {
        let bucket = now_ms / self.bucket_ms;
        (bucket & EPOCH_MASK, (bucket % self.buckets.len() as u64) as usize)
    }

    pub fn record(&self, now_ms: u64, failed: bool) {
        let (epoch, index) = self.bucket_index(now_ms);
        let slot = &self.buckets[index];
        let mut current = slot.load(Ordering::Acquire);

        loop {
            let (slot_epoch, calls, errors) = unpack(current);
            let (calls, errors) = if slot_epoch == epoch {
                (calls, errors)
            } else {
                (0, 0)
            };
            // Counts saturate rather than carry into the neighbouring field.
            let next = pack(
                epoch,
                (calls + 1).min(COUNT_MASK),
                (errors + u64::from(failed)).min(COUNT_MASK),
            );

            match slot.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn totals(&self, now_ms: u64) -> WindowTotals {
        let (epoch, _) = self.bucket_index(now_ms);
        let len = self.buckets.len() as u64;

        self.buckets
            .iter()
            .map(|slot| unpack(slot.load(Ordering::Acquire)))
            .filter(|(slot_epoch, _, _)| (epoch.wrapping_sub(*slot_epoch) & EPOCH_MASK) < len)
            .fold(WindowTotals::default(), |acc, (_, calls, errors)| WindowTotals {
                calls: acc.calls + calls,
                errors: acc.errors + errors,
            })
    }

    pub fn clear(&self) {
        for slot in self.buckets.iter() {
            slot.store(0, Ordering::Release);
        }
    }
}
