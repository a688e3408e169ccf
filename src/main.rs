//! Feedbridge binary entry point

use feedbridge::service::CycleTrigger;
use feedbridge::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background tasks (delivery cycle, ledger purge)
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEEDBRIDGE__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "feedbridge=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "feedbridge=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Feedbridge...");

    // 2. Initialize metrics
    feedbridge::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        source = %config.source.base_url,
        cycle_interval_seconds = config.relay.cycle_interval_seconds,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Build Axum router
    let app = feedbridge::build_router(state.clone());

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // 7. Start background tasks
    spawn_cycle_task(state.clone());
    spawn_purge_task(state.clone());

    // Start server
    axum::serve(listener, app).await?;

    Ok(())
}

/// Spawn the periodic delivery cycle task
fn spawn_cycle_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.relay.cycle_interval());

        // Consume the immediate first tick so the first cycle runs one
        // interval after startup, not during it.
        interval.tick().await;

        loop {
            interval.tick().await;

            match state.scheduler.run_cycle(CycleTrigger::Timer).await {
                Ok(report) => {
                    tracing::info!(
                        accounts_processed = report.accounts_processed,
                        accounts_skipped = report.accounts_skipped,
                        accounts_failed = report.accounts_failed,
                        notifications_sent = report.notifications_sent,
                        "Delivery cycle completed"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Delivery cycle failed");
                }
            }
        }
    });

    tracing::info!("Delivery cycle task spawned");
}

/// Spawn the ledger retention purge task
fn spawn_purge_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.relay.purge_interval());

        // Consume the immediate first tick to delay the initial purge
        // until one interval passes.
        interval.tick().await;

        loop {
            interval.tick().await;

            match state.ledger.purge_expired().await {
                Ok(purged) => {
                    tracing::info!(purged = purged, "Ledger purge completed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Ledger purge failed");
                }
            }
        }
    });

    tracing::info!("Ledger purge task spawned");
}
