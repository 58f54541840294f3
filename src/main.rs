use anyhow::Result;
use quotaguard::config::Config;
use quotaguard::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Flags first, environment as fallback
    let config = Config::load().unwrap_or_else(|e| e.exit());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("quotaguard={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting quotaguard admission service");
    tracing::info!(
        "Configuration: bind_addr={}, shared_store={}",
        config.bind_addr,
        if config.redis_url().is_some() {
            "redis"
        } else {
            "disabled"
        }
    );

    // Create and run the server
    let server = Server::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
