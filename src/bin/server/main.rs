//! QAN HTTP Server
//!
//! This binary exposes the query analytics data plane over HTTP/JSON.
//!
//! # Endpoints
//!
//! ## Collect
//! - `POST /v1/qan/collect` - Enqueue metric buckets from an agent
//!
//! ## Reports
//! - `POST /v1/qan/report` - Grouped report with sparklines
//! - `POST /v1/qan/metrics` - Metrics of one object or of the filtered set
//! - `POST /v1/qan/sparklines` - Time series of one metric
//! - `POST /v1/qan/filters` - Filter values with their share of the main metric
//! - `POST /v1/qan/labels` - Dimension and label values of one object
//! - `POST /v1/qan/histogram` - Latency histogram of one query
//!
//! ## Object details
//! - `POST /v1/qan/example` - Query examples
//! - `POST /v1/qan/plan` - Query plan
//! - `POST /v1/qan/exists` - Whether a service reported a query
//! - `POST /v1/qan/schema` - Schema of a query
//! - `POST /v1/qan/explain_fingerprint` - Explainable text of a query
//! - `POST /v1/qan/fingerprint` - Fingerprint of a query id
//!
//! ## Admin
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics
//!
//! # CLI Commands
//!
//! - `start` - Start the HTTP server (default if no command specified)
//! - `check-config` - Validate configuration file
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `--config` path
//! 2. `QAN_CONFIG` environment variable (path to TOML file)
//! 3. `./qan.toml` in current directory
//! 4. Default configuration

mod config;
mod handlers;
mod types;

use clap::{Parser, Subcommand};

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use handlers::AppState;
use qan_analytics::{
    config::Config,
    ingestion::Ingester,
    query::QueryEngine,
    retention::RetentionJob,
    store::{AnalyticsStore, ClickHouseStore},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{signal, sync::broadcast};
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

// =============================================================================
// Router and Server Setup
// =============================================================================

/// Build the application router
fn build_router(state: Arc<AppState>) -> Router {
    let max_body_size = state.config.server.max_body_size;
    Router::new()
        // Health and metrics
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Collect
        .route("/v1/qan/collect", post(handlers::collect))
        // Reports
        .route("/v1/qan/report", post(handlers::get_report))
        .route("/v1/qan/metrics", post(handlers::get_metrics))
        .route("/v1/qan/sparklines", post(handlers::select_sparklines))
        .route("/v1/qan/filters", post(handlers::select_filters))
        .route("/v1/qan/labels", post(handlers::get_labels))
        .route("/v1/qan/histogram", post(handlers::get_histogram))
        // Object details
        .route("/v1/qan/example", post(handlers::get_query_example))
        .route("/v1/qan/plan", post(handlers::get_query_plan))
        .route("/v1/qan/exists", post(handlers::query_exists))
        .route("/v1/qan/schema", post(handlers::schema_by_queryid))
        .route(
            "/v1/qan/explain_fingerprint",
            post(handlers::explain_fingerprint),
        )
        .route("/v1/qan/fingerprint", post(handlers::get_fingerprint))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(DefaultBodyLimit::max(max_body_size))
                .layer(TraceLayer::new_for_http()),
        )
}

/// Answer a panicked request with a 500 and log the panic message
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %message, "Request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(types::ErrorResponse {
            error: "internal error".to_string(),
            code: "internal",
        }),
    )
        .into_response()
}

/// Graceful shutdown signal handler
///
/// A failed signal registration is logged and that signal is ignored; the
/// server then has to be killed forcefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {},
            Err(e) => {
                warn!(
                    error = %e,
                    "Ctrl+C handler installation failed - graceful shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(
                    error = %e,
                    "SIGTERM handler installation failed - SIGTERM shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

// =============================================================================
// CLI Definition
// =============================================================================

/// QAN server - query analytics data plane
#[derive(Parser)]
#[command(name = "qan-server")]
#[command(version)]
#[command(about = "Query analytics ingestion and reporting over ClickHouse", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (overrides QAN_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Override listen address (e.g., 0.0.0.0:9911)
    #[arg(short, long, global = true)]
    listen: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Start,

    /// Validate configuration file without starting the server
    CheckConfig,
}

/// Load configuration and apply CLI overrides
fn load(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen.clone();
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(cli)?;

    println!("Configuration is valid!");
    println!();
    println!("Server Settings:");
    println!("  Listen address: {}", config.server.listen_addr);
    println!("  Query timeout: {}s", config.server.query_timeout_secs);
    println!("  Max body size: {} bytes", config.server.max_body_size);
    println!();
    println!("ClickHouse Settings:");
    println!("  URL: {}", config.clickhouse.url);
    println!("  Database: {}", config.clickhouse.database);
    println!();
    println!("Ingestion Settings:");
    println!("  Queue capacity: {}", config.ingestion.queue_capacity);
    println!("  Batch window: {}ms", config.ingestion.batch_window_ms);
    println!("  Error delay: {}ms", config.ingestion.error_delay_ms);
    println!("  Requeue attempts: {}", config.ingestion.requeue_attempts);
    println!();
    println!("Retention Settings:");
    println!("  Days: {}", config.retention.days);
    println!("  Interval: {}s", config.retention.interval_secs);

    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::CheckConfig) => return cmd_check_config(&cli),
        Some(Commands::Start) | None => {},
    }

    let config = load(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Starting QAN server v{}", env!("CARGO_PKG_VERSION"));
    debug!(
        "Configuration: listen_addr={}, database={}",
        config.server.listen_addr, config.clickhouse.database
    );

    qan_analytics::metrics::init();

    let clickhouse = ClickHouseStore::new(&config.clickhouse);
    match clickhouse.ping().await {
        Ok(()) => {
            if let Err(e) = clickhouse.ensure_schema().await {
                warn!(error = %e, "Could not create the metrics table");
            }
        },
        Err(e) => warn!(error = %e, "ClickHouse is not reachable yet"),
    }
    let store: Arc<dyn AnalyticsStore> = Arc::new(clickhouse);

    let engine = QueryEngine::new(Arc::clone(&store)).with_timeout(config.server.query_timeout());
    let ingester = Arc::new(Ingester::new(
        Arc::clone(&store),
        config.ingestion.to_ingestion_config(),
    )?);
    let retention = RetentionJob::new(
        Arc::clone(&store),
        config.clickhouse.database.clone(),
        config.retention.to_retention_config(),
    );

    // Background tasks stop on this signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let consumer = {
        let ingester = Arc::clone(&ingester);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { ingester.run(shutdown).await })
    };
    let pruner = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { retention.run(shutdown).await })
    };

    let state = Arc::new(AppState {
        engine,
        ingester: Arc::clone(&ingester),
        config: config.clone(),
    });
    let app = build_router(state);

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    info!("Server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background tasks; the consumer writes what is left in the queue
    let _ = shutdown_tx.send(());
    match consumer.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => error!(error = %e, "Ingestion consumer failed"),
        Err(e) => error!(error = %e, "Ingestion consumer panicked"),
    }
    if let Err(e) = pruner.await {
        error!(error = %e, "Retention job panicked");
    }

    info!("Server shutdown complete: {}", ingester.stats());
    Ok(())
}
