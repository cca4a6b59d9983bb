//! Keep-alive daemon: alternates login and logout against a backend on a
//! fixed interval, alerts when logins keep failing, and serves a small
//! status API.
//!
//! - [`engine`]: the login/logout state machine
//! - [`scheduler`]: interval loop driving the engine
//! - [`daemon`]: wiring, status server and shutdown sequence
//! - [`environment`]: `.env` loading

pub mod daemon;
pub mod engine;
pub mod environment;
pub mod scheduler;
