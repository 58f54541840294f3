use crate::key_generator::IdentityCandidates;
use crate::rate_limit_config::Outcome;
use crate::throttler::{AdmissionGateway, AdmissionRequest};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use tracing::{info, warn};

/// Identity established by upstream authentication. Insert it as a request
/// extension before [`enforce`] runs to key limits by user instead of IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// State for [`enforce`]: which gateway to ask and under which policy.
#[derive(Clone)]
pub struct RouteGuard {
    pub gateway: AdmissionGateway,
    pub label: String,
}

impl RouteGuard {
    pub fn new(gateway: AdmissionGateway, label: impl Into<String>) -> Self {
        Self {
            gateway,
            label: label.into(),
        }
    }
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request);

    info!(
        target: "quotaguard::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "quotaguard::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response
}

/// Admission control in front of any route.
///
/// Rejected requests get a 429 with the admission body and never reach the
/// inner service. Admitted responses carry the rate limit headers; for
/// conditional counting policies the inner status decides the outcome
/// (`>= 400` is a failure).
pub async fn enforce(State(guard): State<RouteGuard>, request: Request, next: Next) -> Response {
    let identity = IdentityCandidates {
        user_id: request
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.clone()),
        ip: Some(get_client_ip(&request)).filter(|ip| ip != "unknown"),
    };
    let admission = AdmissionRequest::new(guard.label.clone(), identity);

    let result = match guard.gateway.handle(&admission).await {
        Ok(result) => result,
        Err(err) => return err.into_response(),
    };
    if !result.admitted {
        return result.into_response();
    }

    let mut response = next.run(request).await;
    result.apply_headers(response.headers_mut());

    let outcome = if response.status().as_u16() >= 400 {
        Outcome::Failure
    } else {
        Outcome::Success
    };
    if let Err(err) = guard.gateway.complete(&result, outcome).await {
        warn!(policy = %result.policy, error = %err, "failed to record request outcome");
    }

    response
}

pub fn get_client_ip(request: &Request) -> String {
    // Try to get real IP from headers first
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.trim().to_string();
        }
    }

    // Fallback to connection info
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else if let Some(addr) = request.extensions().get::<SocketAddr>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}
