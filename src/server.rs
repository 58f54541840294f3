use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::handlers::{
    check_admission, health_check, metrics, readiness_check, record_outcome, reset_all,
    reset_counter, AppState, SharedState,
};
use crate::health::HealthChecker;
use crate::key_generator::KeyResolver;
use crate::local_store::LocalCounterStore;
use crate::metrics::MetricsCollector;
use crate::middleware::logging_middleware;
use crate::rate_limiter::RateLimiter;
use crate::redis::{ReconnectBackoff, RedisCounterStore};
use crate::store::CounterStore;
use crate::throttler::AdmissionGateway;
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct Server {
    config: Config,
    state: SharedState,
    local: Arc<LocalCounterStore>,
    redis: Option<Arc<RedisCounterStore>>,
}

impl Server {
    /// Wire stores, breaker, limiter and gateway from configuration. Does not
    /// touch the network; connections are made by [`run`](Self::run).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let policies = Arc::new(config.load_policies()?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let redis = match config.redis_url() {
            Some(url) => Some(Arc::new(RedisCounterStore::with_clock(
                url,
                config.redis_key_prefix.clone(),
                clock.clone(),
            )?)),
            None => None,
        };
        let shared = redis
            .clone()
            .map(|store| store as Arc<dyn CounterStore>);

        let local = Arc::new(LocalCounterStore::with_clock(clock.clone()));
        let breaker = CircuitBreaker::with_clock("counter-store", config.breaker_config(), clock.clone())?;
        let limiter = RateLimiter::new(shared, local.clone(), breaker, clock);

        let gateway = AdmissionGateway::new(
            KeyResolver::new(policies.clone()),
            limiter.clone(),
            MetricsCollector::new(redis.is_some()),
        );
        let state = AppState::new(gateway, HealthChecker::new(limiter, redis.clone()));

        info!(
            policies = ?policies.labels(),
            shared_store = redis.is_some(),
            instance_id = %state.health.instance_id(),
            "admission gateway configured"
        );

        Ok(Self {
            config,
            state,
            local,
            redis,
        })
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweeper = self.local.clone().spawn_sweeper(self.config.sweep_interval());

        let supervisor = self.redis.clone().map(|redis| {
            let supervisor = redis.clone().spawn_supervisor(ReconnectBackoff::default());
            // A failed first connect leaves the store Reconnecting, which the
            // supervisor picks up.
            tokio::spawn(async move {
                if let Err(err) = redis.connect().await {
                    warn!(error = %err, "initial redis connection failed, using local counters");
                }
            });
            supervisor
        });

        info!("quotaguard listening on {}", listener.local_addr()?);
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        let app = create_app(self.state.clone());
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        sweeper.abort();
        if let Some(redis) = &self.redis {
            redis.close().await;
        }
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        info!("quotaguard stopped");

        result.map_err(Into::into)
    }
}

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/admission", delete(reset_all))
        .route("/admission/:label/check", post(check_admission))
        .route("/admission/:label/outcome", post(record_outcome))
        .route("/admission/:label/:identity", delete(reset_counter))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_local_only() {
        let server = Server::new(Config::default()).unwrap();
        assert!(server.redis.is_none());
        assert!(!server.state().gateway.limiter().has_shared_store());
    }

    #[test]
    fn test_new_with_redis_does_not_connect() {
        let config = Config {
            redis_url: "redis://127.0.0.1:1".to_string(),
            ..Config::default()
        };
        let server = Server::new(config).unwrap();
        assert!(server.redis.is_some());
        assert!(!server.state().gateway.limiter().using_shared_store());
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = Config {
            bind_addr: "nowhere".to_string(),
            ..Config::default()
        };
        assert!(Server::new(config).is_err());
    }
}
