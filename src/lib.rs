pub mod breaker_metrics;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod local_store;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod redis;
pub mod response;
pub mod server;
pub mod store;
pub mod throttler;
pub mod validation;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use config::Config;
pub use error::{Error, Result};
pub use key_generator::{IdentityCandidates, KeyResolver};
pub use rate_limit_config::{CountingMode, DegradedMode, Outcome, Policy, PolicyRegistry, PolicySpec};
pub use rate_limiter::{Decision, RateLimiter};
pub use response::AdmissionResult;
pub use server::create_app;
pub use throttler::{AdmissionGateway, AdmissionRequest};
