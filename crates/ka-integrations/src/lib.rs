//! Outbound notifications for the keep-alive daemon.
//!
//! The [`alert`] module owns the rate-limited exhaustion alert; [`mail`]
//! provides the SMTP transport it sends through.

pub mod alert;
pub mod mail;

pub use alert::{AlertContext, AlertError, AlertNotifier, AlertTransport, LogTransport};
pub use mail::SmtpTransport;
