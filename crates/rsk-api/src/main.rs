//! rsk-api entry point.
//!
//! Thin by design: tracing, settings, shared state, middleware, serve.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use rsk_api::{middleware, routes, state::AppState};
use rsk_config::Settings;
use rsk_kafka::EventProducer;
use rsk_metrics::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::dotenv();

    init_tracing();

    let settings = Settings::from_env()?;

    let pool = rsk_db::connect(&settings.database_url).await?;
    let producer = EventProducer::new(&settings)?;
    let metrics = Arc::new(Metrics::new()?);

    let shared = Arc::new(AppState::new(pool, producer, metrics));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&shared),
            middleware::track_http_metrics,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_layer());

    let addr: SocketAddr = format!("{}:{}", settings.api_host, settings.api_port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address {}:{}",
                settings.api_host, settings.api_port
            )
        })?;
    info!("rsk-api listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
