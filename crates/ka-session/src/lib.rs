//! Session client for the kept-alive backend.
//!
//! Issues cookie-based login, verify and logout calls. The client never
//! stores the session itself: every call takes the credential explicitly,
//! and ownership of the current session stays with the cycle engine.

pub mod client;

pub use client::{HttpSessionClient, SessionApi};
