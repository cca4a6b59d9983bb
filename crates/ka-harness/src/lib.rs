//! Harness: reliability primitives shared by the keep-alive daemon.
//!
//! - Bounded exponential-backoff retry for fallible async operations
//! - Cooperative shutdown coordination between the scheduler, the status
//!   server and the signal handler

pub mod retry;
pub mod shutdown;
