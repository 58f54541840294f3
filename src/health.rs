use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;
use tracing::warn;
use uuid::Uuid;

use crate::circuit_breaker::CircuitState;
use crate::rate_limiter::RateLimiter;
use crate::redis::{ConnectionState, RedisCounterStore};

static START_TIME: LazyLock<SystemTime> = LazyLock::new(SystemTime::now);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub instance_id: Uuid,
    pub using_shared_store: bool,
    pub breaker_state: CircuitState,
    pub error_rate_percent: f64,
    pub last_transition_at: u64,
    /// `None` when no shared store is configured.
    pub connection_state: Option<ConnectionState>,
    pub local_entries: usize,
}

impl HealthReport {
    /// Running on local counters while a shared store is configured.
    pub fn is_degraded(&self) -> bool {
        self.connection_state.is_some() && !self.using_shared_store
    }
}

/// Shared store status reported by `/ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedStoreStatus {
    Disabled,
    Connected,
    Unavailable,
}

#[derive(Clone)]
pub struct HealthChecker {
    limiter: RateLimiter,
    redis: Option<Arc<RedisCounterStore>>,
    instance_id: Uuid,
}

impl HealthChecker {
    pub fn new(limiter: RateLimiter, redis: Option<Arc<RedisCounterStore>>) -> Self {
        LazyLock::force(&START_TIME);
        Self {
            limiter,
            redis,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn check_health(&self) -> HealthReport {
        let breaker = self.limiter.breaker().snapshot();
        let uptime = SystemTime::now()
            .duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let mut report = HealthReport {
            status: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            instance_id: self.instance_id,
            using_shared_store: self.limiter.using_shared_store(),
            breaker_state: breaker.state,
            error_rate_percent: breaker.error_rate_percent,
            last_transition_at: breaker.last_transition_at_ms,
            connection_state: self.redis.as_ref().map(|redis| redis.state()),
            local_entries: self.limiter.local_store().len(),
        };
        // Degraded, not unhealthy: decisions keep flowing from local counters.
        report.status = if report.is_degraded() {
            "degraded"
        } else {
            "healthy"
        }
        .to_string();
        report
    }

    /// PINGs Redis when the connection claims to be ready, bounded by the
    /// breaker's call timeout. A failed PING marks the connection for
    /// reconnection.
    pub async fn shared_store_status(&self) -> SharedStoreStatus {
        let Some(redis) = &self.redis else {
            return SharedStoreStatus::Disabled;
        };
        if redis.state() != ConnectionState::Ready {
            return SharedStoreStatus::Unavailable;
        }

        let timeout = self.limiter.breaker().config().call_timeout;
        match tokio::time::timeout(timeout, redis.ping()).await {
            Ok(Ok(())) => SharedStoreStatus::Connected,
            Ok(Err(err)) => {
                warn!(error = %err, "readiness ping failed");
                SharedStoreStatus::Unavailable
            }
            Err(_) => {
                warn!(?timeout, "readiness ping timed out");
                SharedStoreStatus::Unavailable
            }
        }
    }
}
