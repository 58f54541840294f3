//! Circuit breaker guarding calls to the shared counter store.
//!
//! State lives in atomics and transitions are compare-and-swap, so the hot
//! path never takes a lock. Call outcomes feed a bucketed rolling window; the
//! breaker opens once both the call volume and the error percentage in that
//! window reach their thresholds.
//!
//! The state, a transition generation and the transition time share one word,
//! `[transitioned_at_ms: 46 bits | generation: 16 bits | state: 2 bits]`, so a
//! reader never pairs a new state with an old timestamp. Half-open trial
//! counters carry the generation they were opened in; a trial that outlives
//! its half-open period is not counted toward the next one.

use crate::breaker_metrics::{RollingWindow, WindowTotals};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::{BreakerError, ConfigError};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const GENERATION_BITS: u32 = 16;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;
const TIME_SHIFT: u32 = STATE_BITS + GENERATION_BITS;
const TIME_MASK: u64 = (1 << (64 - TIME_SHIFT)) - 1;

const SLOT_COUNT_MASK: u64 = 0xFFFF_FFFF;

const STATE_CLOSED: u64 = 0;
const STATE_OPEN: u64 = 1;
const STATE_HALF_OPEN: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn to_bits(self) -> u64 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_bits(value: u64) -> Self {
        match value {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateWord {
    state: CircuitState,
    generation: u64,
    transitioned_at_ms: u64,
}

impl StateWord {
    fn pack(self) -> u64 {
        ((self.transitioned_at_ms & TIME_MASK) << TIME_SHIFT)
            | ((self.generation & GENERATION_MASK) << STATE_BITS)
            | self.state.to_bits()
    }

    fn unpack(word: u64) -> Self {
        Self {
            state: CircuitState::from_bits(word & STATE_MASK),
            generation: (word >> STATE_BITS) & GENERATION_MASK,
            transitioned_at_ms: (word >> TIME_SHIFT) & TIME_MASK,
        }
    }

    fn next_generation(self) -> u64 {
        (self.generation + 1) & GENERATION_MASK
    }
}

/// Half-open counter tagged with its generation: `[generation | count: 32 bits]`.
fn pack_slot(generation: u64, count: u64) -> u64 {
    (generation << 32) | (count & SLOT_COUNT_MASK)
}

fn unpack_slot(slot: u64) -> (u64, u64) {
    (slot >> 32, slot & SLOT_COUNT_MASK)
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Minimum calls in the rolling window before the error rate is considered.
    pub volume_threshold: u64,
    /// Error percentage (1..=100) at or above which the breaker opens.
    pub error_threshold_percent: f64,
    pub rolling_window: Duration,
    pub rolling_buckets: usize,
    /// Time spent open before trial calls are allowed.
    pub reset_timeout: Duration,
    /// Successful trials needed to close; also the cap on concurrent trials.
    pub half_open_trials: usize,
    /// Calls slower than this count as failures.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 10,
            error_threshold_percent: 50.0,
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            reset_timeout: Duration::from_secs(30),
            half_open_trials: 1,
            call_timeout: Duration::from_millis(250),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.volume_threshold == 0 {
            return Err(ConfigError::InvalidBreaker(
                "volume threshold must be greater than 0".into(),
            ));
        }
        if !(self.error_threshold_percent > 0.0 && self.error_threshold_percent <= 100.0) {
            return Err(ConfigError::InvalidBreaker(format!(
                "error threshold must be in (0, 100], got {}",
                self.error_threshold_percent
            )));
        }
        if self.rolling_buckets == 0 {
            return Err(ConfigError::InvalidBreaker(
                "rolling window needs at least one bucket".into(),
            ));
        }
        if duration_millis(self.rolling_window) < self.rolling_buckets as u64 {
            return Err(ConfigError::InvalidBreaker(
                "rolling window must be at least 1ms per bucket".into(),
            ));
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::InvalidBreaker(
                "reset timeout must be greater than 0".into(),
            ));
        }
        if self.half_open_trials == 0 {
            return Err(ConfigError::InvalidBreaker(
                "half-open trials must be greater than 0".into(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::InvalidBreaker(
                "call timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub error_rate_percent: f64,
    pub calls_in_window: u64,
    pub last_transition_at_ms: u64,
    pub since_transition_ms: u64,
}

#[derive(Debug)]
struct BreakerState {
    word: AtomicU64,
    half_open_in_flight: AtomicU64,
    half_open_successes: AtomicU64,
}

impl BreakerState {
    fn load(&self) -> StateWord {
        StateWord::unpack(self.word.load(Ordering::Acquire))
    }

    /// Start fresh counters for `generation`. Counters already on that
    /// generation or a later one are left alone.
    fn open_slots(&self, generation: u64) {
        for slot in [&self.half_open_in_flight, &self.half_open_successes] {
            let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let behind = generation.wrapping_sub(unpack_slot(current).0) & GENERATION_MASK;
                (behind != 0 && behind < 1 << (GENERATION_BITS - 1))
                    .then(|| pack_slot(generation, 0))
            });
        }
    }
}

/// Releases a half-open trial slot even if the guarded future is dropped.
struct Permit<'a> {
    state: &'a BreakerState,
    /// Generation of the half-open period a trial call belongs to.
    trial: Option<u64>,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trial {
            let _ = self.state.half_open_in_flight.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |slot| {
                    let (slot_generation, in_flight) = unpack_slot(slot);
                    (slot_generation == generation)
                        .then(|| pack_slot(slot_generation, in_flight.saturating_sub(1)))
                },
            );
        }
    }
}

/// Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<BreakerConfig>,
    state: Arc<BreakerState>,
    window: Arc<RollingWindow>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: &str,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let window = RollingWindow::new(config.rolling_window, config.rolling_buckets);
        let initial = StateWord {
            state: CircuitState::Closed,
            generation: 0,
            transitioned_at_ms: clock.now_millis(),
        };

        Ok(Self {
            name: Arc::from(name),
            state: Arc::new(BreakerState {
                word: AtomicU64::new(initial.pack()),
                half_open_in_flight: AtomicU64::new(0),
                half_open_successes: AtomicU64::new(0),
            }),
            window: Arc::new(window),
            config: Arc::new(config),
            clock,
        })
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.load().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now_millis();
        let totals = self.window.totals(now);
        let current = self.state.load();

        BreakerSnapshot {
            state: current.state,
            error_rate_percent: totals.error_rate_percent(),
            calls_in_window: totals.calls,
            last_transition_at_ms: current.transitioned_at_ms,
            since_transition_ms: now.saturating_sub(current.transitioned_at_ms),
        }
    }

    /// Run `operation` under breaker protection.
    pub async fn call<T, E, Fut, Op>(&self, operation: Op) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        self.call_when(true, operation).await
    }

    /// Like [`call`](Self::call), but when `available` is false the permitted
    /// call fails immediately and is recorded as a failure without running
    /// `operation`.
    pub async fn call_when<T, E, Fut, Op>(
        &self,
        available: bool,
        operation: Op,
    ) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.acquire().ok_or(BreakerError::Open)?;

        let result = if !available {
            Err(BreakerError::Unavailable)
        } else {
            match tokio::time::timeout(self.config.call_timeout, operation()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(BreakerError::Inner(err)),
                Err(_) => Err(BreakerError::Timeout(self.config.call_timeout)),
            }
        };

        let trial = permit.trial;
        drop(permit);
        match &result {
            Ok(_) => self.on_success(trial),
            Err(_) => self.on_failure(trial),
        }
        result
    }

    fn acquire(&self) -> Option<Permit<'_>> {
        loop {
            let current = self.state.load();
            match current.state {
                CircuitState::Closed => {
                    return Some(Permit {
                        state: &self.state,
                        trial: None,
                    })
                }
                CircuitState::Open => {
                    let elapsed = self
                        .clock
                        .now_millis()
                        .saturating_sub(current.transitioned_at_ms);
                    if elapsed < duration_millis(self.config.reset_timeout) {
                        return None;
                    }
                    // Counters for the next period exist before it is published.
                    self.state.open_slots(current.next_generation());
                    if self.transition(current, CircuitState::HalfOpen).is_some() {
                        info!(breaker = %self.name, "circuit breaker → half-open");
                    }
                }
                CircuitState::HalfOpen => {
                    let generation = current.generation;
                    let max = self.config.half_open_trials as u64;
                    let claimed = self.state.half_open_in_flight.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |slot| {
                            let (slot_generation, in_flight) = unpack_slot(slot);
                            (slot_generation == generation && in_flight < max)
                                .then(|| pack_slot(slot_generation, in_flight + 1))
                        },
                    );
                    match claimed {
                        Ok(previous) => {
                            debug!(
                                breaker = %self.name,
                                in_flight = unpack_slot(previous).1 + 1,
                                max,
                                "circuit breaker: half-open trial call"
                            );
                            return Some(Permit {
                                state: &self.state,
                                trial: Some(generation),
                            });
                        }
                        Err(slot) if unpack_slot(slot).0 == generation => return None,
                        // Counters lag the published period; catch them up and look again.
                        Err(_) => self.state.open_slots(generation),
                    }
                }
            }
        }
    }

    /// Move from exactly `expected` to `to`. Fails if any transition happened since.
    fn transition(&self, expected: StateWord, to: CircuitState) -> Option<StateWord> {
        let next = StateWord {
            state: to,
            generation: expected.next_generation(),
            transitioned_at_ms: self.clock.now_millis(),
        };
        self.state
            .word
            .compare_exchange(
                expected.pack(),
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| next)
    }

    /// Transition out of the half-open period `generation`, if it is still current.
    fn end_trial_period(&self, generation: u64, to: CircuitState) -> bool {
        let current = self.state.load();
        current.state == CircuitState::HalfOpen
            && current.generation == generation
            && self.transition(current, to).is_some()
    }

    fn on_success(&self, trial: Option<u64>) {
        let Some(generation) = trial else {
            self.window.record(self.clock.now_millis(), false);
            return;
        };

        let counted = self.state.half_open_successes.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |slot| {
                let (slot_generation, successes) = unpack_slot(slot);
                (slot_generation == generation).then(|| pack_slot(slot_generation, successes + 1))
            },
        );
        let Ok(previous) = counted else {
            debug!(breaker = %self.name, "circuit breaker: late trial success ignored");
            return;
        };

        let successes = unpack_slot(previous).1 + 1;
        if successes >= self.config.half_open_trials as u64
            && self.end_trial_period(generation, CircuitState::Closed)
        {
            self.window.clear();
            info!(breaker = %self.name, successes, "circuit breaker → closed");
        }
    }

    fn on_failure(&self, trial: Option<u64>) {
        if let Some(generation) = trial {
            if self.end_trial_period(generation, CircuitState::Open) {
                warn!(breaker = %self.name, "circuit breaker: trial failed → open");
            }
            return;
        }

        let now = self.clock.now_millis();
        self.window.record(now, true);
        let totals = self.window.totals(now);
        if !self.should_trip(totals) {
            return;
        }

        let current = self.state.load();
        if current.state == CircuitState::Closed
            && self.transition(current, CircuitState::Open).is_some()
        {
            error!(
                breaker = %self.name,
                calls = totals.calls,
                errors = totals.errors,
                error_rate = totals.error_rate_percent(),
                "circuit breaker → open"
            );
        }
    }

    fn should_trip(&self, totals: WindowTotals) -> bool {
        totals.calls >= self.config.volume_threshold
            && totals.error_rate_percent() >= self.config.error_threshold_percent
    }
}
