//! Feedbridge - a cross-platform notification relay
//!
//! Watches a reading-activity source for new events (votes, comments,
//! replies) and forwards them as push notifications to a sink platform,
//! delivering each event at most once per linked account.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Link management (token-protected)                        │
//! │  - Relay control: on-demand cycles                          │
//! │  - Sink webhook (HMAC-signed)                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Identity link registry                                   │
//! │  - Event fetcher + read cursors                             │
//! │  - Deduplication ledger (claim protocol)                    │
//! │  - Delivery scheduler (bounded fan-out, batch dispatch)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for link management, relay control, webhook
//! - `service`: registry, fetcher, ledger and scheduler
//! - `feed`: source-platform activity feed client
//! - `push`: sink-platform gateway and webhook signatures
//! - `data`: SQLite persistence layer
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod push;
pub mod service;

use std::sync::Arc;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains shared resources
/// like the database pool, the HTTP client, and the relay services.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client shared by source and sink calls
    pub http_client: Arc<reqwest::Client>,

    /// Identity link registry
    pub registry: Arc<service::RegistryService>,

    /// Deduplication ledger
    pub ledger: Arc<service::LedgerService>,

    /// Delivery scheduler
    pub scheduler: Arc<service::RelayScheduler>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the shared HTTP client
    /// 3. Wire the source feed client and sink push gateway
    /// 4. Assemble registry, fetcher, ledger and scheduler
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        use std::path::Path;

        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(Path::new(&config.database.path)).await?);
        tracing::info!("Database connected");

        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent("Feedbridge/0.1.0")
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        let feed_client = feed::HttpFeedClient::new(
            http_client.clone(),
            config.source.base_url.clone(),
            config.source.web_base_url.clone(),
            config.source.timeout(),
        );
        let gateway = push::HttpPushGateway::new(http_client.clone(), config.sink.timeout());

        let registry = Arc::new(service::RegistryService::new(
            db.clone(),
            config.sink.allow_private_endpoints,
        ));
        let fetcher = Arc::new(service::FetcherService::new(
            db.clone(),
            Arc::new(feed_client),
            config.relay.lookback(),
            config.relay.cold_start_max_events,
        ));
        let ledger = Arc::new(service::LedgerService::new(db.clone(), &config.relay));
        let scheduler = Arc::new(service::RelayScheduler::new(
            registry.clone(),
            fetcher,
            ledger.clone(),
            Arc::new(gateway),
            &config.relay,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            registry,
            ledger,
            scheduler,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, middleware};
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    let protected = Router::new()
        .merge(api::links_router())
        .merge(api::relay_router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_api_token,
        ));

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api/v1", protected)
        .merge(api::webhook_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
