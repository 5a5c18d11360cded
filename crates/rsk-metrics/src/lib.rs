//! Process metrics.
//!
//! One `Metrics` value owns the registry and every collector; it is built at
//! startup and passed around as `Arc<Metrics>`. Nothing registers globally
//! after initialization.

use anyhow::{Context, Result};
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    pub http_request_duration: HistogramVec,
    pub http_requests_total: IntCounterVec,
    pub events_ingested_total: IntCounterVec,
    pub events_processed_total: IntCounterVec,
    pub scoring_duration: HistogramVec,
    pub dlq_events_total: IntCounterVec,
    pub retry_attempts_total: IntCounterVec,
    pub consumer_lag: IntGaugeVec,
    pub active_model_info: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["method", "endpoint", "status"],
        )?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "endpoint", "status"],
        )?;

        let events_ingested_total = IntCounterVec::new(
            Opts::new("events_ingested_total", "Total events ingested via API"),
            &["event_type", "status"],
        )?;

        let events_processed_total = IntCounterVec::new(
            Opts::new(
                "events_processed_total",
                "Total events processed by worker",
            ),
            &["event_type", "status"],
        )?;

        let scoring_duration = HistogramVec::new(
            HistogramOpts::new("scoring_duration_seconds", "Time to compute risk score")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]),
            &["model_version"],
        )?;

        let dlq_events_total = IntCounterVec::new(
            Opts::new(
                "dlq_events_total",
                "Total events sent to dead letter queue",
            ),
            &["reason"],
        )?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["attempt_number"],
        )?;

        let consumer_lag = IntGaugeVec::new(
            Opts::new("consumer_lag", "Kafka consumer lag (messages behind)"),
            &["topic", "partition"],
        )?;

        let active_model_info = IntGaugeVec::new(
            Opts::new("active_model_info", "Currently loaded model information"),
            &["model_version", "params_hash"],
        )?;

        for collector in [
            Box::new(http_request_duration.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_requests_total.clone()),
            Box::new(events_ingested_total.clone()),
            Box::new(events_processed_total.clone()),
            Box::new(scoring_duration.clone()),
            Box::new(dlq_events_total.clone()),
            Box::new(retry_attempts_total.clone()),
            Box::new(consumer_lag.clone()),
            Box::new(active_model_info.clone()),
        ] {
            registry
                .register(collector)
                .context("metric registration failed")?;
        }

        Ok(Self {
            registry,
            http_request_duration,
            http_requests_total,
            events_ingested_total,
            events_processed_total,
            scoring_duration,
            dlq_events_total,
            retry_attempts_total,
            consumer_lag,
            active_model_info,
        })
    }

    /// Prometheus text exposition of everything in the registry.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .context("metrics encoding failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectors_register_and_render() {
        let metrics = Metrics::new().unwrap();
        metrics
            .events_ingested_total
            .with_label_values(&["signup", "accepted"])
            .inc();
        metrics
            .http_request_duration
            .with_label_values(&["POST", "/events", "202"])
            .observe(0.012);
        metrics
            .consumer_lag
            .with_label_values(&["risk.events", "0"])
            .set(7);

        let text = metrics.render().unwrap();
        assert!(text.contains("events_ingested_total"));
        assert!(text.contains("http_request_duration_seconds_bucket"));
        assert!(text.contains("consumer_lag"));
    }

    #[test]
    fn separate_instances_do_not_share_state() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.dlq_events_total.with_label_values(&["schema"]).inc();
        assert!(!b.render().unwrap().contains("schema"));
    }
}
