mod auth;
mod config;
mod middleware;

mod db;
mod dispatch;
mod error;
mod geo;
mod models;
mod notify;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::Config,
    models::{AppState, DispatchSettings},
    notify::PgNotifier,
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;

    if cfg.run_migrations {
        db::run_migrations(&pool).await?;
    }

    let state = AppState {
        db: pool.clone(),
        session_ttl_hours: cfg.session_ttl_hours,
        dispatch: DispatchSettings {
            radius_km: cfg.dispatch_radius_km,
            offer_ttl_secs: cfg.partner_offer_ttl_secs,
        },
        notifier: Arc::new(PgNotifier::new(pool)),
    };

    tracing::info!(
        radius_km = cfg.dispatch_radius_km,
        offer_ttl_secs = cfg.partner_offer_ttl_secs,
        "dispatch settings"
    );
    dispatch::sweeper::spawn(state.clone(), Duration::from_secs(cfg.reassign_sweep_secs));

    // Browser and mobile clients call the API cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
