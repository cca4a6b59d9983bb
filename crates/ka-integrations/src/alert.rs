use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ka_core::types::AlertState;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AlertError {
    /// The transport could not be configured or the message not built.
    #[error("alert setup failed: {0}")]
    Setup(String),

    /// The message was built but could not be delivered.
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything an exhaustion alert reports.
#[derive(Debug, Clone)]
pub struct AlertContext {
    pub backend_url: String,
    pub attempts: u32,
    pub last_error: String,
    pub occurred_at: DateTime<Utc>,
}

impl AlertContext {
    pub fn subject(&self) -> String {
        format!("[keep-alive] login failing for {}", self.backend_url)
    }

    pub fn body(&self) -> String {
        format!(
            "The keep-alive daemon could not log in to {url}.\n\n\
             Attempts:   {attempts}\n\
             Last error: {error}\n\
             Time:       {at}\n\n\
             Further alerts are suppressed until a login succeeds.\n",
            url = self.backend_url,
            attempts = self.attempts,
            error = self.last_error,
            at = self.occurred_at.to_rfc3339(),
        )
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Delivery channel for alerts.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Writes alerts to the log instead of sending them anywhere. Used when no
/// alert recipient is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl AlertTransport for LogTransport {
    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        error!(subject, body, "keep-alive alert");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

// ---------------------------------------------------------------------------
// AlertNotifier
// ---------------------------------------------------------------------------

/// Rate-limited notifier for login exhaustion.
///
/// After one alert goes out, further alerts are withheld until
/// [`clear_suppression`](Self::clear_suppression) is called by a successful
/// login. Independently of that, no two alerts are sent closer together than
/// `cooldown`. Delivery failures are logged and swallowed.
pub struct AlertNotifier {
    transport: Arc<dyn AlertTransport>,
    cooldown: Duration,
    state: Mutex<AlertState>,
}

impl AlertNotifier {
    pub fn new(transport: Arc<dyn AlertTransport>, cooldown: Duration) -> Self {
        Self {
            transport,
            cooldown,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub async fn state(&self) -> AlertState {
        self.state.lock().await.clone()
    }

    /// Send an exhaustion alert unless suppressed or inside the cooldown.
    ///
    /// `context.occurred_at` is used as "now". Returns `true` only when the
    /// transport accepted the message.
    pub async fn notify_exhausted(&self, context: &AlertContext) -> bool {
        let now = context.occurred_at;
        {
            let state = self.state.lock().await;
            if state.suppressed {
                info!(attempts = context.attempts, "alert suppressed until next successful login");
                return false;
            }
            if let Some(last) = state.last_sent_at {
                // A clock step backwards counts as "inside the cooldown".
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < self.cooldown {
                    info!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "alert suppressed by cooldown"
                    );
                    return false;
                }
            }
        }

        match self
            .transport
            .send(&context.subject(), &context.body())
            .await
        {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.suppressed = true;
                state.last_sent_at = Some(now);
                warn!(
                    transport = self.transport.name(),
                    attempts = context.attempts,
                    "login exhaustion alert dispatched"
                );
                true
            }
            Err(e) => {
                error!(
                    transport = self.transport.name(),
                    error = %e,
                    "failed to dispatch alert"
                );
                false
            }
        }
    }

    /// Re-arm alerting after a successful login. Also resets the cooldown
    /// window so the next failure streak alerts immediately.
    pub async fn clear_suppression(&self) {
        let mut state = self.state.lock().await;
        if state.suppressed {
            info!("alert suppression cleared");
        }
        *state = AlertState::default();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
