//! Status HTTP surface for the keep-alive daemon.
//!
//! - [`http_api`]: axum router exposing liveness, health, run statistics
//!   and a manual trigger
//! - [`api_error`]: JSON error responses

pub mod api_error;
pub mod http_api;

pub use api_error::ApiError;
pub use http_api::{api_router, ApiState, CycleControl, EngineStatus};
