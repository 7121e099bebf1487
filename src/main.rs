// =============================================================================
// LIBRARY SERVICE - Main Entry Point
// =============================================================================
// This is the main entry point for the library operations service.
//
// WHAT THIS SERVICE DOES:
// - Manages the book catalog (create/update/delete with ISBN uniqueness)
// - Issues and returns book copies, verified by one-time codes
// - Transfers administrative ownership of books with an append-only audit trail
// - Authenticates users against bcrypt hashes with Redis-backed sessions
// - Exposes Prometheus metrics for observability
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod auth; // Sessions, extractor, authorization policy (auth.rs)
mod config; // Configuration loading (config.rs)
mod db; // Database operations (db.rs)
mod error; // Error types (error.rs)
mod handlers; // HTTP request handlers (handlers.rs)
mod metrics; // Prometheus metrics setup (metrics.rs)
mod models; // Data structures and domain rules (models.rs)

// -----------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------

use axum::{
    routing::{get, post},
    Router,
};

use std::sync::Arc;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::metrics::setup_metrics;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared state available to all request handlers via the State extractor.
#[derive(Clone)]
pub struct AppState {
    // Database connection pool wrapper
    pub db: Database,

    // Redis connection for session tokens
    pub redis: redis::aio::ConnectionManager,

    // Prometheus metrics handle, used to render the /metrics endpoint
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    // Parsed configuration (OTP validity window, session TTL)
    pub config: Config,
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load variables from .env for local development; missing file is fine
    dotenvy::dotenv().ok();

    // Structured JSON logging; RUST_LOG controls levels
    // Example: RUST_LOG=info,library_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,library_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Library Service...");

    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // PostgreSQL: connection pool, schema migrations, bootstrap admin
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    db.seed_admin(&config.admin_email, &config.admin_password)
        .await?;

    // Redis: session token store; ConnectionManager reconnects automatically
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    let state = Arc::new(AppState {
        db,
        redis: redis_conn,
        metrics_handle,
        config: config.clone(),
    });

    // -------------------------------------------------------------------------
    // ROUTES
    // -------------------------------------------------------------------------
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Auth -----
        .route("/api/v1/auth/login", post(handlers::login))
        .route("/api/v1/auth/logout", post(handlers::logout))
        // ----- Catalog -----
        .route(
            "/api/v1/books",
            get(handlers::list_books).post(handlers::create_book),
        )
        .route(
            "/api/v1/books/:id",
            get(handlers::get_book)
                .put(handlers::update_book)
                .delete(handlers::delete_book),
        )
        // ----- Circulation -----
        .route("/api/v1/books/:id/issue", post(handlers::issue_book))
        .route("/api/v1/books/:id/return", post(handlers::return_book))
        .route("/api/v1/issues/overdue", get(handlers::list_overdue))
        // ----- Ownership -----
        .route(
            "/api/v1/books/:id/transfer",
            post(handlers::transfer_ownership),
        )
        .route(
            "/api/v1/books/:id/ownership-history",
            get(handlers::ownership_history),
        )
        // ----- Middleware Layers -----
        // CORS: allow any origin (tighten for production deployments)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // Log every request
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // START THE HTTP SERVER
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Library Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
