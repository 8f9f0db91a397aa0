use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use headlines::aggregator::Aggregator;
use headlines::cache::Cache;
use headlines::config::Config;
use headlines::fetcher::Fetcher;
use headlines::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "headlines=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("FEEDS_CONFIG").unwrap_or_else(|_| "feeds.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Loaded {} sources from {} (ttl {}s, timeout {}s, max {} items)",
        config.sources.len(),
        config_path,
        config.cache_ttl,
        config.fetch_timeout,
        config.max_items
    );

    let fetcher = Arc::new(Fetcher::new(config.timeout())?);
    let aggregator = Aggregator::new(
        fetcher,
        config.sources.clone(),
        config.timeout(),
        config.max_items,
    );
    let cache = Cache::new(aggregator, config.ttl());

    // Warm the cache; early requests join this refresh
    let warm_cache = cache.clone();
    tokio::spawn(async move {
        info!("Starting initial feed fetch");
        let entry = warm_cache.get(true).await;
        info!("Initial fetch cached {} items", entry.items.len());
    });

    let state = Arc::new(AppState::new(cache));
    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Server starting on http://{}", config.bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
