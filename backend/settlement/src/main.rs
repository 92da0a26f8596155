//! Quadratic-funding settlement service entry point.
//!
//! Exposes an Axum REST API over a SQLite store for the lifecycle of a
//! matching round: recipient registration, contribution intake, score and
//! match computation, operator approval or override, and payout call data.
//! Transactions are prepared here but submitted elsewhere.

mod aggregator;
mod allocator;
mod api;
mod config;
mod csv;
mod db;
mod errors;
mod overrides;
mod payout;
mod registry;
mod settlement;
mod types;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(
        min_humanity_score = config.min_humanity_score,
        token_decimals = config.token_decimals,
        "Configuration loaded"
    );

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let api_state = Arc::new(api::ApiState {
        pool,
        config: config.clone(),
    });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/rounds", post(api::create_round))
        .route("/rounds/:id", get(api::get_round))
        .route(
            "/rounds/:id/registrations",
            get(api::list_registrations).post(api::register),
        )
        .route(
            "/rounds/:id/registrations/:campaign_id",
            axum::routing::delete(api::remove_registration),
        )
        .route(
            "/rounds/:id/registrations/:campaign_id/confirm",
            post(api::confirm_registration),
        )
        .route(
            "/rounds/:id/registrations/:campaign_id/reject",
            post(api::reject_registration),
        )
        .route("/rounds/:id/contributions", post(api::record_contribution))
        .route("/rounds/:id/results", get(api::compute_results))
        .route("/rounds/:id/results/approve", post(api::approve_results))
        .route(
            "/rounds/:id/approved-result",
            get(api::get_approved_result).post(api::upload_approved_result),
        )
        .route(
            "/rounds/:id/approved-result/upload",
            post(api::upload_approved_result_file),
        )
        .route("/rounds/:id/payout", post(api::build_payout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
