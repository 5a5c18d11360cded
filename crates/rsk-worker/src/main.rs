//! rsk-worker entry point.
//!
//! Resolves settings, loads the scorer, wires the shutdown channel and the
//! metrics listener, then hands control to the consumer loop.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use rsk_config::Settings;
use rsk_metrics::Metrics;
use rsk_worker::{run_worker, RetryPolicy, WorkerContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::dotenv();

    init_tracing();

    let settings = Settings::from_env()?;
    let pool = rsk_db::connect(&settings.database_url).await?;
    let metrics = Arc::new(Metrics::new()?);

    let (scorer, model_metadata) = rsk_model::load_scorer(Path::new(&settings.model_path));
    match &model_metadata {
        Some(meta) => {
            rsk_db::register_model_version(
                &pool,
                &meta.model_version,
                &meta.params_hash,
                serde_json::to_value(meta).ok(),
            )
            .await?;
            metrics
                .active_model_info
                .with_label_values(&[&meta.model_version, &meta.params_hash])
                .set(1);
        }
        None => {
            metrics
                .active_model_info
                .with_label_values(&[scorer.model_version(), "none"])
                .set(1);
        }
    }

    rsk_worker::spawn_metrics_server(Arc::clone(&metrics), settings.worker_metrics_port);

    let shutdown = spawn_signal_handler();

    let consumer = rsk_kafka::create_consumer(&settings)?;
    let ctx = WorkerContext::new(
        pool,
        scorer,
        metrics,
        RetryPolicy::from_settings(&settings),
    );

    let processed = run_worker(
        &ctx,
        consumer,
        shutdown,
        None,
        &settings.kafka_topic,
    )
    .await?;

    info!(processed, "worker stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// SIGINT/SIGTERM flip the shutdown flag; the loop finishes its in-flight
/// message and exits.
fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm => {}
        }

        info!("received shutdown signal, initiating shutdown");
        let _ = tx.send(true);
    });

    rx
}
