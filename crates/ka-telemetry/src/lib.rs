//! Observability for the keep-alive daemon.
//!
//! - **Logging**: `tracing-subscriber` setup, human-readable or JSON
//! - **Metrics**: a small process-wide registry with Prometheus text export
//! - **Middleware**: axum layers for request IDs and HTTP request metrics

pub mod logging;
pub mod metrics;
pub mod middleware;
