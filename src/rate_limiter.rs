use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::{BreakerError, ConfigError, Error, Result, StoreError};
use crate::local_store::LocalCounterStore;
use crate::rate_limit_config::{DegradedMode, Outcome, Policy};
use crate::store::{CounterSnapshot, CounterStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which store answered for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CounterSource {
    Shared,
    Local,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    RateLimited,
    StoreUnavailable,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::RateLimited => "RATE_LIMITED",
            RejectReason::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

/// Per-request admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub admitted: bool,
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_ms: u64,
    pub retry_after_secs: Option<u64>,
    pub source: CounterSource,
    pub reason: Option<RejectReason>,
}

impl Decision {
    pub fn reset_epoch_seconds(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    pub fn seconds_until_reset(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

enum Served {
    Counted(CounterSnapshot, CounterSource),
    Unavailable,
}

/// Fixed-window limiter over a shared store with a local fallback.
///
/// Shared-store calls go through the circuit breaker. Any failure there is
/// absorbed and the same operation is answered by the in-process store, so a
/// store outage degrades quotas to per-process enforcement instead of blocking
/// traffic (unless the policy asks for [`DegradedMode::Deny`]).
#[derive(Clone)]
pub struct RateLimiter {
    shared: Option<Arc<dyn CounterStore>>,
    local: Arc<LocalCounterStore>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        shared: Option<Arc<dyn CounterStore>>,
        local: Arc<LocalCounterStore>,
        breaker: CircuitBreaker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared,
            local,
            breaker,
            clock,
        }
    }

    /// Limiter that only ever counts in process memory.
    pub fn local_only() -> std::result::Result<Self, ConfigError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let breaker = CircuitBreaker::new("counter-store", BreakerConfig::default())?;
        Ok(Self::new(
            None,
            Arc::new(LocalCounterStore::with_clock(clock.clone())),
            breaker,
            clock,
        ))
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn local_store(&self) -> &Arc<LocalCounterStore> {
        &self.local
    }

    pub fn has_shared_store(&self) -> bool {
        self.shared.is_some()
    }

    /// True when decisions are currently expected to come from the shared store.
    pub fn using_shared_store(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|store| store.is_available() && self.breaker.state() == CircuitState::Closed)
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Count (or, for conditional modes, look up) this call and decide admission.
    pub async fn check(&self, identity_key: &str, policy: &Policy) -> Result<Decision> {
        if identity_key.is_empty() {
            return Err(Error::InvalidIdentity);
        }
        let key = storage_key(policy, identity_key);

        let served = if policy.counting_mode().is_conditional() {
            // Decide as if this call will be counted; the increment itself
            // happens in `record_outcome` once the outcome is known.
            match self.read(&key, policy).await {
                Served::Counted(snapshot, source) => Served::Counted(
                    CounterSnapshot::new(snapshot.count + 1, snapshot.window_start_ms),
                    source,
                ),
                Served::Unavailable => Served::Unavailable,
            }
        } else {
            self.increment(&key, policy).await
        };

        let decision = match served {
            Served::Counted(snapshot, source) => self.decide(policy, snapshot, source),
            Served::Unavailable => self.deny_unavailable(policy),
        };

        debug!(
            policy = policy.label(),
            identity = identity_key,
            admitted = decision.admitted,
            count = decision.count,
            remaining = decision.remaining,
            source = ?decision.source,
            "rate limit decision"
        );
        Ok(decision)
    }

    /// Apply the deferred increment for conditional counting modes. Returns
    /// the counter after the increment, or `None` when this outcome is not
    /// counted by the policy.
    pub async fn record_outcome(
        &self,
        identity_key: &str,
        policy: &Policy,
        outcome: Outcome,
    ) -> Result<Option<CounterSnapshot>> {
        if identity_key.is_empty() {
            return Err(Error::InvalidIdentity);
        }
        if !policy.counting_mode().counts(outcome) {
            return Ok(None);
        }

        let key = storage_key(policy, identity_key);
        Ok(match self.increment(&key, policy).await {
            Served::Counted(snapshot, _) => Some(snapshot),
            Served::Unavailable => None,
        })
    }

    /// Clear one identity's counter in both stores.
    pub async fn reset(&self, identity_key: &str, policy: &Policy) -> Result<()> {
        let key = storage_key(policy, identity_key);
        self.local.reset_local(&key);

        if let Some(shared) = &self.shared {
            self.breaker
                .call_when(shared.is_available(), || shared.reset(&key))
                .await
                .map_err(into_store_error)?;
        }
        Ok(())
    }

    pub async fn reset_all(&self) -> Result<()> {
        self.local.reset_all_local();

        if let Some(shared) = &self.shared {
            self.breaker
                .call_when(shared.is_available(), || shared.reset_all())
                .await
                .map_err(into_store_error)?;
        }
        Ok(())
    }

    async fn increment(&self, key: &str, policy: &Policy) -> Served {
        if let Some(shared) = &self.shared {
            let result = self
                .breaker
                .call_when(shared.is_available(), || shared.increment(key, policy.window()))
                .await;
            match result {
                Ok(snapshot) => return Served::Counted(snapshot, CounterSource::Shared),
                Err(err) => {
                    if self.absorb(shared.as_ref(), policy, "increment", &err) == DegradedMode::Deny {
                        return Served::Unavailable;
                    }
                }
            }
        }
        Served::Counted(
            self.local.increment_local(key, policy.window()),
            CounterSource::Local,
        )
    }

    async fn read(&self, key: &str, policy: &Policy) -> Served {
        let now = self.clock.now_millis();
        let fresh = CounterSnapshot::new(0, now);

        if let Some(shared) = &self.shared {
            let result = self
                .breaker
                .call_when(shared.is_available(), || shared.read(key))
                .await;
            match result {
                Ok(snapshot) => {
                    return Served::Counted(snapshot.unwrap_or(fresh), CounterSource::Shared)
                }
                Err(err) => {
                    if self.absorb(shared.as_ref(), policy, "read", &err) == DegradedMode::Deny {
                        return Served::Unavailable;
                    }
                }
            }
        }
        Served::Counted(
            self.local.read_local(key).unwrap_or(fresh),
            CounterSource::Local,
        )
    }

    fn absorb(
        &self,
        store: &dyn CounterStore,
        policy: &Policy,
        op: &str,
        err: &BreakerError<StoreError>,
    ) -> DegradedMode {
        if err.is_open() {
            debug!(
                store = store.name(),
                policy = policy.label(),
                op,
                "breaker open, using local counters"
            );
        } else {
            warn!(
                store = store.name(),
                policy = policy.label(),
                op,
                error = %err,
                breaker = ?self.breaker.state(),
                "shared counter store failed, using local counters"
            );
        }
        policy.degraded()
    }

    fn decide(&self, policy: &Policy, snapshot: CounterSnapshot, source: CounterSource) -> Decision {
        let now = self.clock.now_millis();
        let quota = policy.quota();
        let admitted = snapshot.count <= quota;
        let reset_at_ms = snapshot
            .window_start_ms
            .saturating_add(duration_millis(policy.window()));

        Decision {
            admitted,
            count: snapshot.count,
            limit: quota,
            remaining: quota.saturating_sub(snapshot.count),
            reset_at_ms,
            retry_after_secs: (!admitted)
                .then(|| reset_at_ms.saturating_sub(now).div_ceil(1000).max(1)),
            source,
            reason: (!admitted).then_some(RejectReason::RateLimited),
        }
    }

    fn deny_unavailable(&self, policy: &Policy) -> Decision {
        let retry_ms = duration_millis(self.breaker.config().reset_timeout);
        Decision {
            admitted: false,
            count: 0,
            limit: policy.quota(),
            remaining: 0,
            reset_at_ms: self.clock.now_millis().saturating_add(retry_ms),
            retry_after_secs: Some(retry_ms.div_ceil(1000).max(1)),
            source: CounterSource::None,
            reason: Some(RejectReason::StoreUnavailable),
        }
    }
}

/// Counters are scoped per policy so endpoint classes never share quota.
pub fn storage_key(policy: &Policy, identity_key: &str) -> String {
    format!("{}:{}", policy.label(), identity_key)
}

fn into_store_error(err: BreakerError<StoreError>) -> Error {
    match err {
        BreakerError::Inner(inner) => Error::Store(inner),
        other => Error::Store(StoreError::Unavailable(other.to_string())),
    }
}
