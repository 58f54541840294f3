use crate::rate_limiter::{CounterSource, Decision, RejectReason};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetrics {
    pub total_requests: u64,
    pub admitted_requests: u64,
    pub rejected_requests: u64,
    /// Decisions answered by the in-process store while a shared store is configured.
    pub fallback_decisions: u64,
    pub store_unavailable_rejections: u64,
}

impl PolicyMetrics {
    fn absorb(&mut self, other: &PolicyMetrics) {
        self.total_requests += other.total_requests;
        self.admitted_requests += other.admitted_requests;
        self.rejected_requests += other.rejected_requests;
        self.fallback_decisions += other.fallback_decisions;
        self.store_unavailable_rejections += other.store_unavailable_rejections;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub since: u64,
    pub global: PolicyMetrics,
    pub policies: BTreeMap<String, PolicyMetrics>,
}

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    policy_metrics: Arc<RwLock<HashMap<String, PolicyMetrics>>>,
    since: u64,
    shared_configured: bool,
}

impl MetricsCollector {
    pub fn new(shared_configured: bool) -> Self {
        Self {
            policy_metrics: Arc::new(RwLock::new(HashMap::new())),
            since: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            shared_configured,
        }
    }

    pub async fn record_decision(&self, label: &str, decision: &Decision) {
        let mut metrics = self.policy_metrics.write().await;
        let entry = metrics.entry(label.to_string()).or_default();

        entry.total_requests += 1;
        if decision.admitted {
            entry.admitted_requests += 1;
        } else {
            entry.rejected_requests += 1;
        }
        if self.shared_configured && decision.source == CounterSource::Local {
            entry.fallback_decisions += 1;
        }
        if decision.reason == Some(RejectReason::StoreUnavailable) {
            entry.store_unavailable_rejections += 1;
        }
    }

    pub async fn get_policy_metrics(&self, label: &str) -> Option<PolicyMetrics> {
        let metrics = self.policy_metrics.read().await;
        metrics.get(label).cloned()
    }

    pub async fn get_global_metrics(&self) -> PolicyMetrics {
        let metrics = self.policy_metrics.read().await;
        let mut global = PolicyMetrics::default();
        for policy_metrics in metrics.values() {
            global.absorb(policy_metrics);
        }
        global
    }

    pub async fn report(&self) -> MetricsReport {
        let metrics = self.policy_metrics.read().await;
        let mut global = PolicyMetrics::default();
        for policy_metrics in metrics.values() {
            global.absorb(policy_metrics);
        }

        MetricsReport {
            since: self.since,
            global,
            policies: metrics
                .iter()
                .map(|(label, m)| (label.clone(), m.clone()))
                .collect(),
        }
    }

    pub async fn reset(&self) {
        self.policy_metrics.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(admitted: bool, source: CounterSource, reason: Option<RejectReason>) -> Decision {
        Decision {
            admitted,
            count: 1,
            limit: 1,
            remaining: 0,
            reset_at_ms: 0,
            retry_after_secs: None,
            source,
            reason,
        }
    }

    #[tokio::test]
    async fn test_counts_per_policy() {
        let collector = MetricsCollector::new(true);
        collector
            .record_decision("auth", &decision(true, CounterSource::Shared, None))
            .await;
        collector
            .record_decision("auth", &decision(true, CounterSource::Local, None))
            .await;
        collector
            .record_decision(
                "query",
                &decision(false, CounterSource::Shared, Some(RejectReason::RateLimited)),
            )
            .await;

        let auth = collector.get_policy_metrics("auth").await.unwrap();
        assert_eq!(auth.total_requests, 2);
        assert_eq!(auth.admitted_requests, 2);
        assert_eq!(auth.fallback_decisions, 1);

        let global = collector.get_global_metrics().await;
        assert_eq!(global.total_requests, 3);
        assert_eq!(global.rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_local_only_is_not_fallback() {
        let collector = MetricsCollector::new(false);
        collector
            .record_decision("query", &decision(true, CounterSource::Local, None))
            .await;
        assert_eq!(
            collector.get_policy_metrics("query").await.unwrap().fallback_decisions,
            0
        );
    }

    #[tokio::test]
    async fn test_report_and_reset() {
        let collector = MetricsCollector::new(true);
        collector
            .record_decision(
                "mutation",
                &decision(false, CounterSource::None, Some(RejectReason::StoreUnavailable)),
            )
            .await;

        let report = collector.report().await;
        assert_eq!(report.policies["mutation"].store_unavailable_rejections, 1);
        assert_eq!(report.global.rejected_requests, 1);

        collector.reset().await;
        assert!(collector.get_policy_metrics("mutation").await.is_none());
    }
}
