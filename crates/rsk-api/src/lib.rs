//! Ingest + query HTTP service for the risk pipeline.
//!
//! `main.rs` is intentionally thin: it resolves settings, builds the shared
//! state, wires middleware, and serves. Route handlers live in `routes.rs`,
//! shared state in `state.rs`, the error-to-status mapping in `error.rs`,
//! and the request-metrics layer in `middleware.rs`.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
