use crate::error::{Error, Result};
use crate::key_generator::{IdentityCandidates, KeyResolver};
use crate::metrics::MetricsCollector;
use crate::rate_limit_config::{Outcome, Policy};
use crate::rate_limiter::RateLimiter;
use crate::response::AdmissionResult;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// One request to admit: the endpoint class plus whatever identity the
/// caller could establish.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub label: String,
    #[serde(flatten)]
    pub identity: IdentityCandidates,
}

impl AdmissionRequest {
    pub fn new(label: impl Into<String>, identity: IdentityCandidates) -> Self {
        Self {
            label: label.into(),
            identity,
        }
    }
}

/// Main entry point for admission decisions.
#[derive(Clone)]
pub struct AdmissionGateway {
    resolver: KeyResolver,
    limiter: RateLimiter,
    metrics: MetricsCollector,
}

impl AdmissionGateway {
    pub fn new(resolver: KeyResolver, limiter: RateLimiter, metrics: MetricsCollector) -> Self {
        Self {
            resolver,
            limiter,
            metrics,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Resolve, count and decide. A rejection is an `Ok` result with
    /// `admitted == false`.
    pub async fn handle(&self, request: &AdmissionRequest) -> Result<AdmissionResult> {
        let (identity, policy) = self.resolver.resolve(&request.label, &request.identity)?;
        let decision = self.limiter.check(&identity, &policy).await?;
        self.metrics.record_decision(policy.label(), &decision).await;

        if !decision.admitted {
            info!(
                policy = policy.label(),
                identity = %identity,
                count = decision.count,
                limit = decision.limit,
                retry_after = ?decision.retry_after_secs,
                reason = ?decision.reason,
                "request rejected"
            );
        }

        Ok(AdmissionResult::from_decision(
            policy.label(),
            &identity,
            &decision,
            self.limiter.now_millis(),
        ))
    }

    /// Report how the protected operation ended, for conditional counting modes.
    pub async fn complete(&self, result: &AdmissionResult, outcome: Outcome) -> Result<()> {
        let policy = self.policy(&result.policy)?;
        self.record(&result.identity, &policy, outcome).await
    }

    /// Same as [`complete`](Self::complete) for callers that did not keep the
    /// admission result.
    pub async fn record_outcome(&self, request: &AdmissionRequest, outcome: Outcome) -> Result<()> {
        let (identity, policy) = self.resolver.resolve(&request.label, &request.identity)?;
        self.record(&identity, &policy, outcome).await
    }

    pub async fn reset(&self, label: &str, identity_key: &str) -> Result<()> {
        let policy = self.policy(label)?;
        self.limiter.reset(identity_key, &policy).await?;
        info!(policy = label, identity = identity_key, "counter reset");
        Ok(())
    }

    pub async fn reset_all(&self) -> Result<()> {
        self.limiter.reset_all().await?;
        info!("all counters reset");
        Ok(())
    }

    fn policy(&self, label: &str) -> Result<Arc<Policy>> {
        self.resolver
            .policies()
            .get(label)
            .ok_or_else(|| Error::UnknownPolicy(label.to_string()))
    }

    async fn record(&self, identity: &str, policy: &Policy, outcome: Outcome) -> Result<()> {
        if let Some(counter) = self.limiter.record_outcome(identity, policy, outcome).await? {
            debug!(
                policy = policy.label(),
                identity,
                ?outcome,
                count = counter.count,
                "outcome counted"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit_config::PolicyRegistry;
    use crate::rate_limiter::RejectReason;

    fn gateway() -> AdmissionGateway {
        AdmissionGateway::new(
            KeyResolver::new(Arc::new(PolicyRegistry::defaults())),
            RateLimiter::local_only().unwrap(),
            MetricsCollector::new(false),
        )
    }

    #[tokio::test]
    async fn test_handle_counts_and_rejects() {
        let gateway = gateway();
        let request = AdmissionRequest::new("mutation", IdentityCandidates::user("7"));

        for _ in 0..30 {
            let result = gateway.handle(&request).await.unwrap();
            assert!(result.admitted);
            assert_eq!(result.identity, "user:7");
        }
        let rejected = gateway.handle(&request).await.unwrap();
        assert!(!rejected.admitted);
        assert_eq!(rejected.reason, Some(RejectReason::RateLimited));
        assert!(rejected.retry_after_seconds.unwrap() >= 1);

        let metrics = gateway.metrics().get_policy_metrics("mutation").await.unwrap();
        assert_eq!(metrics.admitted_requests, 30);
        assert_eq!(metrics.rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_complete_counts_failures_for_auth() {
        let gateway = gateway();
        let request = AdmissionRequest::new("auth", IdentityCandidates::ip("203.0.113.9"));

        for _ in 0..5 {
            let result = gateway.handle(&request).await.unwrap();
            assert!(result.admitted);
            gateway.complete(&result, Outcome::Failure).await.unwrap();
        }
        assert!(!gateway.handle(&request).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_unknown_label() {
        let gateway = gateway();
        let request = AdmissionRequest::new("nope", IdentityCandidates::default());
        assert!(matches!(
            gateway.handle(&request).await,
            Err(Error::UnknownPolicy(_))
        ));
        assert!(matches!(
            gateway.reset("nope", "user:1").await,
            Err(Error::UnknownPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_readmits() {
        let gateway = gateway();
        let request = AdmissionRequest::new("admin", IdentityCandidates::user("root"));
        for _ in 0..51 {
            gateway.handle(&request).await.unwrap();
        }
        assert!(!gateway.handle(&request).await.unwrap().admitted);

        gateway.reset("admin", "user:root").await.unwrap();
        assert!(gateway.handle(&request).await.unwrap().admitted);
    }

    #[test]
    fn test_request_deserializes_flattened_identity() {
        let request: AdmissionRequest =
            serde_json::from_str(r#"{"label":"query","userId":"9"}"#).unwrap();
        assert_eq!(request.identity.user_id.as_deref(), Some("9"));
        assert_eq!(request.identity.ip, None);
    }
}
