//! Shared state for the API service.
//!
//! Everything a handler needs is constructed once in `main` and injected
//! through `State<Arc<AppState>>`; there are no module-level singletons.

use std::sync::Arc;

use sqlx::PgPool;

use rsk_kafka::EventProducer;
use rsk_metrics::Metrics;

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

pub struct AppState {
    pub pool: PgPool,
    pub producer: EventProducer,
    pub metrics: Arc<Metrics>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(pool: PgPool, producer: EventProducer, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            producer,
            metrics,
            build: BuildInfo {
                service: "rsk-api",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}
