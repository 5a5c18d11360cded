//! Scoring worker: consume the events topic, drive every message to a
//! terminal state, commit offsets only afterwards.
//!
//! One sequential loop per process; horizontal scale comes from running more
//! instances in the same consumer group. Shutdown is a watch channel flipped
//! by the signal handler; the in-flight message finishes its terminal
//! decision, the offset is committed, and the consumer closes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::Offset;
use tokio::sync::watch;
use tracing::{error, info, warn};

use rsk_metrics::Metrics;

pub mod processor;
pub mod retry;

pub use processor::{AttemptOutcome, Disposition, ProcessError, WorkerContext};
pub use retry::RetryPolicy;

/// Resolves when the shutdown flag flips (or its sender is gone).
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

const LAG_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Consume until shutdown (or `max_messages`, used by tests). Returns the
/// number of messages driven to a committed terminal state.
pub async fn run_worker(
    ctx: &WorkerContext,
    consumer: StreamConsumer,
    shutdown: watch::Receiver<bool>,
    max_messages: Option<usize>,
    topic: &str,
) -> Result<usize> {
    info!(
        topic,
        max_retries = ctx.policy.max_retries,
        base_delay_ms = ctx.policy.base_delay.as_millis() as u64,
        "worker started"
    );

    let mut shutdown_wait = Box::pin(wait_for_shutdown(shutdown.clone()));
    let mut lag_timer = tokio::time::interval(LAG_SAMPLE_INTERVAL);
    let mut stream = consumer.stream();
    let mut processed: usize = 0;

    loop {
        if let Some(max) = max_messages {
            if processed >= max {
                info!(max, "reached max messages limit");
                break;
            }
        }

        tokio::select! {
            _ = &mut shutdown_wait => {
                info!("shutdown requested");
                break;
            }
            _ = lag_timer.tick() => {
                sample_consumer_lag(&consumer, &ctx.metrics, topic);
            }
            next = stream.next() => {
                let Some(result) = next else { break };
                let msg = match result {
                    Ok(msg) => msg,
                    Err(err) => {
                        error!(error = %err, "consumer error");
                        continue;
                    }
                };

                let raw = msg.payload().unwrap_or_default();
                match ctx.process_with_retries(raw, &shutdown).await {
                    Some(_disposition) => {
                        // The terminal state is durable; the commit must not
                        // be cancelled mid-flight.
                        if let Err(err) = consumer.commit_message(&msg, CommitMode::Sync) {
                            error!(error = %err, "offset commit failed");
                        } else {
                            processed += 1;
                        }
                    }
                    None => {
                        warn!("interrupted before a terminal state; offset left uncommitted");
                        break;
                    }
                }
            }
        }
    }

    drop(stream);
    info!(processed, "closing consumer");
    Ok(processed)
}

/// Expose `consumer_lag{topic,partition}` from broker watermarks vs. the
/// consumer's current positions.
fn sample_consumer_lag(consumer: &StreamConsumer, metrics: &Arc<Metrics>, topic: &str) {
    let assignment = match consumer.assignment() {
        Ok(list) => list,
        Err(err) => {
            warn!(error = %err, "lag sampling: assignment unavailable");
            return;
        }
    };
    let position = match consumer.position() {
        Ok(list) => list,
        Err(err) => {
            warn!(error = %err, "lag sampling: position unavailable");
            return;
        }
    };

    for elem in assignment.elements() {
        if elem.topic() != topic {
            continue;
        }
        let current = match position
            .find_partition(elem.topic(), elem.partition())
            .map(|p| p.offset())
        {
            Some(Offset::Offset(offset)) => offset,
            _ => continue,
        };
        let (_low, high) = match consumer.fetch_watermarks(
            elem.topic(),
            elem.partition(),
            Duration::from_millis(500),
        ) {
            Ok(watermarks) => watermarks,
            Err(err) => {
                warn!(error = %err, partition = elem.partition(), "lag sampling: watermarks unavailable");
                continue;
            }
        };
        metrics
            .consumer_lag
            .with_label_values(&[topic, &elem.partition().to_string()])
            .set((high - current).max(0));
    }
}

/// Small liveness + metrics listener for the worker process.
pub fn spawn_metrics_server(metrics: Arc<Metrics>, port: u16) {
    use axum::routing::get;

    tokio::spawn(async move {
        let render_metrics = Arc::clone(&metrics);
        let app = axum::Router::new()
            .route(
                "/metrics",
                get(move || {
                    let metrics = Arc::clone(&render_metrics);
                    async move {
                        metrics.render().unwrap_or_else(|err| {
                            error!(error = ?err, "metrics rendering failed");
                            String::new()
                        })
                    }
                }),
            )
            .route("/health", get(|| async { "ok" }));

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("worker metrics listening on http://{}", addr);
                if let Err(err) = axum::serve(listener, app).await {
                    error!(error = %err, "worker metrics server crashed");
                }
            }
            Err(err) => error!(error = %err, "worker metrics bind failed"),
        }
    });
}
