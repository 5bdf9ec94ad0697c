use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_lead_dispatch::audit::{OutcomeRecorder, PgOutcomeRecorder, TracingOutcomeRecorder};
use rust_lead_dispatch::cache::{CacheManager, CacheSettings, FileStore};
use rust_lead_dispatch::config::Config;
use rust_lead_dispatch::db::Database;
use rust_lead_dispatch::destination::{AnalyticsSource, Destination};
use rust_lead_dispatch::engine::Engine;
use rust_lead_dispatch::handlers::{self, AppState};
use rust_lead_dispatch::platform_client::PlatformClient;

/// Picks the audit recorder: Postgres when a database is configured and reachable, logs otherwise.
async fn build_recorder(config: &Config) -> Arc<dyn OutcomeRecorder> {
    let Some(database_url) = config.database_url.as_deref() else {
        return Arc::new(TracingOutcomeRecorder);
    };

    let db = match Database::new(database_url).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Audit database unavailable, logging outcomes only: {}", e);
            return Arc::new(TracingOutcomeRecorder);
        }
    };
    tracing::info!("Audit database connection pool established");

    let recorder = PgOutcomeRecorder::new(db.pool);
    if let Err(e) = recorder.ensure_schema().await {
        tracing::warn!("Could not ensure audit schema: {}", e);
    }
    Arc::new(recorder)
}

/// Main entry point for the application.
///
/// Initializes tracing, configuration, the two-tier cache (rehydrated from
/// the session directory), the audit recorder and the platform client, then
/// starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_lead_dispatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let cache = Arc::new(CacheManager::new(
        Arc::new(FileStore::new(config.cache_dir.clone())),
        CacheSettings::default(),
    ));
    let restored = cache.rehydrate().await;
    tracing::info!("Cache initialized ({} entries restored)", restored);

    let recorder = build_recorder(&config).await;

    let mut engine = Engine::new(cache, recorder).with_cache_ttls(
        config.cache_ttl(),
        Duration::from_secs(config.cache_ttl_secs.min(30)),
    );

    let destination = config.destination();
    let client = match PlatformClient::from_config(&destination) {
        Ok(client) => {
            tracing::info!("Platform client initialized: {}", destination.base_url);
            Some(Arc::new(client.with_rate_limits(
                engine.rate_limit_tracker(&destination.name),
            )))
        }
        Err(e) => {
            tracing::error!("Platform client unavailable: {}", e);
            None
        }
    };

    if let Some(client) = &client {
        let source: Arc<dyn AnalyticsSource> = client.clone();
        engine = engine.with_analytics(&destination, source, config.enrichment_settings());
    }

    let app_state = Arc::new(AppState {
        engine: Arc::new(engine),
        destination,
        destination_client: client.map(|c| c as Arc<dyn Destination>),
    });

    // 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    let protected_routes = handlers::api_routes().layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
