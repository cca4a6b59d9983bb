//! Shared types, error taxonomy and configuration for the keep-alive daemon.
//!
//! Every other `ka-*` crate builds on the vocabulary defined here:
//! - **Types**: session state, run statistics, cycle phases and reports
//! - **Errors**: the transport / rejected / internal taxonomy used by the engine
//! - **Config**: environment-driven settings validated once at startup

pub mod config;
pub mod error;
pub mod types;
