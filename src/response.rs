use crate::rate_limiter::{CounterSource, Decision, RejectReason};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Admission outcome handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    pub admitted: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_epoch_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    pub policy: String,
    pub identity: String,
    pub source: CounterSource,
    #[serde(skip)]
    pub reset_after_seconds: u64,
}

impl AdmissionResult {
    pub fn from_decision(policy: &str, identity: &str, decision: &Decision, now_ms: u64) -> Self {
        Self {
            admitted: decision.admitted,
            limit: decision.limit,
            remaining: decision.remaining,
            reset_epoch_seconds: decision.reset_epoch_seconds(),
            retry_after_seconds: decision.retry_after_secs,
            reason: decision.reason,
            policy: policy.to_string(),
            identity: identity.to_string(),
            source: decision.source,
            reset_after_seconds: decision.seconds_until_reset(now_ms),
        }
    }

    pub fn status(&self) -> StatusCode {
        if self.admitted {
            StatusCode::OK
        } else {
            StatusCode::TOO_MANY_REQUESTS
        }
    }

    /// `RateLimit-Reset` is delta seconds, as in the IETF RateLimit header draft.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATE_LIMIT_RESET, HeaderValue::from(self.reset_after_seconds));

        if let Some(retry_after) = self.retry_after_seconds.filter(|_| !self.admitted) {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }
}

impl IntoResponse for AdmissionResult {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        self.apply_headers(&mut headers);
        (status, headers, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(admitted: bool) -> Decision {
        Decision {
            admitted,
            count: if admitted { 3 } else { 6 },
            limit: 5,
            remaining: if admitted { 2 } else { 0 },
            reset_at_ms: 1_700_000_060_500,
            retry_after_secs: (!admitted).then_some(31),
            source: CounterSource::Shared,
            reason: (!admitted).then_some(RejectReason::RateLimited),
        }
    }

    #[test]
    fn test_admitted_headers() {
        let result =
            AdmissionResult::from_decision("query", "user:1", &decision(true), 1_700_000_030_000);
        let mut headers = HeaderMap::new();
        result.apply_headers(&mut headers);

        assert_eq!(headers["ratelimit-limit"], "5");
        assert_eq!(headers["ratelimit-remaining"], "2");
        assert_eq!(headers["ratelimit-reset"], "31");
        assert!(headers.get(RETRY_AFTER).is_none());
        assert_eq!(result.status(), StatusCode::OK);
    }

    #[test]
    fn test_rejected_headers_and_body() {
        let result =
            AdmissionResult::from_decision("auth", "ip:1.2.3.4", &decision(false), 1_700_000_030_000);
        let mut headers = HeaderMap::new();
        result.apply_headers(&mut headers);
        assert_eq!(headers[RETRY_AFTER], "31");
        assert_eq!(result.status(), StatusCode::TOO_MANY_REQUESTS);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["admitted"], false);
        assert_eq!(json["reason"], "RATE_LIMITED");
        assert_eq!(json["retryAfterSeconds"], 31);
        assert_eq!(json["resetEpochSeconds"], 1_700_000_061u64);
        assert_eq!(json["source"], "shared");
        assert!(json.get("resetAfterSeconds").is_none());
    }

    #[test]
    fn test_admitted_body_omits_rejection_fields() {
        let result = AdmissionResult::from_decision("query", "user:1", &decision(true), 0);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("retryAfterSeconds").is_none());
        assert!(json.get("reason").is_none());
    }
}
