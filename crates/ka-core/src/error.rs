use thiserror::Error;

// ---------------------------------------------------------------------------
// AuthError
// ---------------------------------------------------------------------------

/// Failures returned by a single login, logout or verify call.
///
/// Both variants are recoverable: the cycle engine retries them through the
/// backoff retrier and records the final one in the run statistics. Neither
/// ever escapes the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The request never produced a usable response.
    ///
    /// Covers connection failures, DNS errors and per-request timeouts.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered, but refused the request.
    ///
    /// `status` carries the HTTP status when one was received; `message` is
    /// the backend's own explanation when it sent one.
    #[error("rejected by backend{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Rejected {
        status: Option<u16>,
        message: String,
    },
}

impl AuthError {
    pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        AuthError::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Short machine-friendly label, used for metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Transport(_) => "transport",
            AuthError::Rejected { .. } => "rejected",
        }
    }
}

// ---------------------------------------------------------------------------
// CycleError
// ---------------------------------------------------------------------------

/// Errors raised at the tick boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CycleError {
    /// A programming or logic error inside a cycle (including a panicked tick).
    #[error("internal cycle error: {0}")]
    Internal(String),
}
