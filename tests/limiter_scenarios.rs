use async_trait::async_trait;
use quotaguard::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use quotaguard::clock::{Clock, ManualClock};
use quotaguard::error::StoreError;
use quotaguard::local_store::LocalCounterStore;
use quotaguard::rate_limit_config::{CountingMode, DegradedMode, Outcome, Policy, PolicySpec};
use quotaguard::rate_limiter::{CounterSource, RateLimiter, RejectReason};
use quotaguard::store::{CounterSnapshot, CounterStore};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const START: u64 = 1_700_000_000_000;

const HEALTHY: u8 = 0;
const FAILING: u8 = 1;
const HANGING: u8 = 2;

/// Shared store stand-in whose failure mode can be switched mid-test.
struct FlakyStore {
    inner: LocalCounterStore,
    mode: AtomicU8,
    available: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyStore {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: LocalCounterStore::with_clock(clock),
            mode: AtomicU8::new(HEALTHY),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_mode(&self, mode: u8) {
        self.mode.store(mode, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode.load(Ordering::SeqCst) {
            HEALTHY => Ok(()),
            FAILING => Err(StoreError::Protocol("injected failure".into())),
            _ => std::future::pending().await,
        }
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        self.enter().await?;
        Ok(self.inner.increment_local(key, window))
    }

    async fn read(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
        self.enter().await?;
        Ok(self.inner.read_local(key))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.inner.reset_local(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        self.enter().await?;
        self.inner.reset_all_local();
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

struct Harness {
    limiter: RateLimiter,
    store: Arc<FlakyStore>,
    clock: ManualClock,
}

fn breaker_config() -> BreakerConfig {
    BreakerConfig {
        volume_threshold: 4,
        error_threshold_percent: 50.0,
        rolling_window: Duration::from_secs(10),
        rolling_buckets: 10,
        reset_timeout: Duration::from_secs(5),
        half_open_trials: 1,
        call_timeout: Duration::from_millis(100),
    }
}

fn harness(config: BreakerConfig) -> Harness {
    let clock = ManualClock::new(START);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(FlakyStore::new(shared_clock.clone()));
    let breaker = CircuitBreaker::with_clock("store", config, shared_clock.clone()).unwrap();
    let limiter = RateLimiter::new(
        Some(store.clone() as Arc<dyn CounterStore>),
        Arc::new(LocalCounterStore::with_clock(shared_clock.clone())),
        breaker,
        shared_clock,
    );
    Harness {
        limiter,
        store,
        clock,
    }
}

fn policy(label: &str, quota: u64) -> Policy {
    Policy::from_spec(PolicySpec::new(label, Duration::from_secs(60), quota)).unwrap()
}

#[tokio::test]
async fn test_healthy_store_is_authoritative() {
    let h = harness(breaker_config());
    let policy = policy("query", 3);

    for expected in [2, 1, 0] {
        let decision = assert_ok!(h.limiter.check("user:1", &policy).await);
        assert!(decision.admitted);
        assert_eq!(decision.remaining, expected);
        assert_eq!(decision.source, CounterSource::Shared);
    }
    let rejected = assert_ok!(h.limiter.check("user:1", &policy).await);
    assert!(!rejected.admitted);
    assert_eq!(rejected.source, CounterSource::Shared);

    assert_eq!(h.store.calls(), 4);
    assert!(h.limiter.local_store().is_empty());
    assert!(h.limiter.using_shared_store());
}

#[tokio::test]
async fn test_breaker_opens_skips_store_and_recovers() {
    let h = harness(breaker_config());
    let policy = policy("query", 100);
    h.store.set_mode(FAILING);

    for _ in 0..4 {
        let decision = assert_ok!(h.limiter.check("user:1", &policy).await);
        assert!(decision.admitted);
        assert_eq!(decision.source, CounterSource::Local);
    }
    assert_eq!(h.limiter.breaker().state(), CircuitState::Open);
    assert_eq!(h.store.calls(), 4);
    assert!(!h.limiter.using_shared_store());

    // Open: nothing reaches the store.
    for _ in 0..5 {
        let decision = assert_ok!(h.limiter.check("user:1", &policy).await);
        assert_eq!(decision.source, CounterSource::Local);
    }
    assert_eq!(h.store.calls(), 4);
    assert_eq!(h.limiter.local_store().read_local("query:user:1").unwrap().count, 9);

    h.clock.advance(Duration::from_secs(5));
    h.store.set_mode(HEALTHY);

    let decision = assert_ok!(h.limiter.check("user:1", &policy).await);
    assert_eq!(decision.source, CounterSource::Shared);
    // Local counts are not merged back into the shared store.
    assert_eq!(decision.remaining, 99);
    assert_eq!(h.limiter.breaker().state(), CircuitState::Closed);
    assert_eq!(h.store.calls(), 5);
}

#[tokio::test]
async fn test_failed_trial_reopens() {
    let h = harness(breaker_config());
    let policy = policy("query", 100);
    h.store.set_mode(FAILING);

    for _ in 0..4 {
        h.limiter.check("user:1", &policy).await.unwrap();
    }
    assert_eq!(h.limiter.breaker().state(), CircuitState::Open);

    h.clock.advance(Duration::from_secs(5));
    let decision = h.limiter.check("user:1", &policy).await.unwrap();
    assert_eq!(decision.source, CounterSource::Local);
    assert_eq!(h.store.calls(), 5);
    assert_eq!(h.limiter.breaker().state(), CircuitState::Open);

    // The reset timeout starts over from the failed trial.
    h.clock.advance(Duration::from_secs(4));
    h.limiter.check("user:1", &policy).await.unwrap();
    assert_eq!(h.store.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_store_still_decides_locally() {
    let h = harness(BreakerConfig {
        volume_threshold: 3,
        ..breaker_config()
    });
    let policy = policy("mutation", 3);
    h.store.set_mode(HANGING);

    for expected in [2, 1, 0] {
        let decision = assert_ok!(h.limiter.check("ip:10.0.0.1", &policy).await);
        assert!(decision.admitted);
        assert_eq!(decision.remaining, expected);
        assert_eq!(decision.source, CounterSource::Local);
    }

    let rejected = assert_ok!(h.limiter.check("ip:10.0.0.1", &policy).await);
    assert!(!rejected.admitted);
    assert_eq!(rejected.reason, Some(RejectReason::RateLimited));
    assert_eq!(rejected.source, CounterSource::Local);
    assert_eq!(h.limiter.breaker().state(), CircuitState::Open);
    assert_eq!(h.store.calls(), 3);
}

#[tokio::test]
async fn test_unavailable_store_is_not_called() {
    let h = harness(breaker_config());
    let policy = policy("query", 100);
    h.store.available.store(false, Ordering::SeqCst);

    for _ in 0..6 {
        let decision = h.limiter.check("user:2", &policy).await.unwrap();
        assert_eq!(decision.source, CounterSource::Local);
    }
    assert_eq!(h.store.calls(), 0);
    assert_eq!(h.limiter.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_deny_policy_fails_closed() {
    let h = harness(breaker_config());
    let strict = Policy::from_spec(
        PolicySpec::new("payments", Duration::from_secs(60), 10).degraded(DegradedMode::Deny),
    )
    .unwrap();
    let lenient = policy("query", 10);
    h.store.set_mode(FAILING);

    let denied = h.limiter.check("user:3", &strict).await.unwrap();
    assert!(!denied.admitted);
    assert_eq!(denied.reason, Some(RejectReason::StoreUnavailable));
    assert_eq!(denied.source, CounterSource::None);
    assert_eq!(denied.retry_after_secs, Some(5));

    let admitted = h.limiter.check("user:3", &lenient).await.unwrap();
    assert!(admitted.admitted);
    assert_eq!(admitted.source, CounterSource::Local);
}

#[tokio::test]
async fn test_failures_only_counts_in_shared_store() {
    let h = harness(breaker_config());
    let policy = Policy::from_spec(
        PolicySpec::new("auth", Duration::from_secs(900), 2).counting(CountingMode::FailuresOnly),
    )
    .unwrap();

    for _ in 0..2 {
        let decision = h.limiter.check("ip:192.0.2.1", &policy).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.source, CounterSource::Shared);
        h.limiter
            .record_outcome("ip:192.0.2.1", &policy, Outcome::Failure)
            .await
            .unwrap();
    }
    assert_eq!(h.store.inner.read_local("auth:ip:192.0.2.1").unwrap().count, 2);

    let rejected = h.limiter.check("ip:192.0.2.1", &policy).await.unwrap();
    assert!(!rejected.admitted);
    assert_eq!(rejected.retry_after_secs, Some(900));
}

#[tokio::test]
async fn test_reset_surfaces_store_failure() {
    let h = harness(breaker_config());
    let policy = policy("query", 1);
    h.limiter.check("user:4", &policy).await.unwrap();

    h.store.set_mode(FAILING);
    assert!(h.limiter.reset("user:4", &policy).await.is_err());

    h.store.set_mode(HEALTHY);
    assert_ok!(h.limiter.reset("user:4", &policy).await);
    assert!(h.limiter.check("user:4", &policy).await.unwrap().admitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_shared_checks_never_over_admit() {
    let h = harness(breaker_config());
    let policy = Arc::new(policy("mutation", 15));

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let limiter = h.limiter.clone();
            let policy = policy.clone();
            tokio::spawn(async move { limiter.check("user:hot", &policy).await.unwrap() })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        let decision = handle.await.unwrap();
        assert_eq!(decision.source, CounterSource::Shared);
        if decision.admitted {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 15);
    assert_eq!(h.store.inner.read_local("mutation:user:hot").unwrap().count, 40);
}
