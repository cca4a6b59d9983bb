use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// How the account identifies itself on the login endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Username(String),
    Email(String),
}

impl Identity {
    /// JSON field name the backend expects for this identity.
    pub fn field_name(&self) -> &'static str {
        match self {
            Identity::Username(_) => "username",
            Identity::Email(_) => "email",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Identity::Username(v) | Identity::Email(v) => v,
        }
    }
}

/// Identity + secret pair sent on every login.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub identity: Identity,
    pub password: String,
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("identity", &self.identity)
            .field("password", &"***")
            .finish()
    }
}

/// Opaque session token (the `Cookie` header value) proving an
/// authenticated backend session. Never empty.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential(String);

impl SessionCredential {
    /// Wrap a cookie string. Returns `None` for empty or whitespace-only input.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionCredential(<{} bytes>)", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The account's current session as seen by the cycle engine.
///
/// The credential is present exactly when the session is authenticated; the
/// only mutators are [`establish`](Self::establish) and [`clear`](Self::clear).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    credential: Option<SessionCredential>,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }

    pub fn credential(&self) -> Option<&SessionCredential> {
        self.credential.as_ref()
    }

    pub fn establish(&mut self, credential: SessionCredential) {
        self.credential = Some(credential);
    }

    /// Drop the session, returning the credential that was held.
    pub fn clear(&mut self) -> Option<SessionCredential> {
        self.credential.take()
    }
}

// ---------------------------------------------------------------------------
// NextAction / CyclePhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Login,
    Logout,
}

impl NextAction {
    pub fn toggled(self) -> Self {
        match self {
            NextAction::Login => NextAction::Logout,
            NextAction::Logout => NextAction::Login,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NextAction::Login => "login",
            NextAction::Logout => "logout",
        }
    }
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the cycle engine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Waiting for the next tick.
    Idle,
    RunningLogin,
    RunningLogout,
    /// A login tick failed completely; the next tick comes after the short
    /// failure delay instead of the normal interval.
    Cooldown,
}

impl CyclePhase {
    pub fn running(action: NextAction) -> Self {
        match action {
            NextAction::Login => CyclePhase::RunningLogin,
            NextAction::Logout => CyclePhase::RunningLogout,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, CyclePhase::RunningLogin | CyclePhase::RunningLogout)
    }
}

// ---------------------------------------------------------------------------
// AlertState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertState {
    pub suppressed: bool,
    pub last_sent_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// CycleStats
// ---------------------------------------------------------------------------

/// Process-wide run statistics.
///
/// `total_runs == successful_runs + failed_runs` holds whenever no cycle is
/// in flight; the counters only move through
/// [`StatsHandle::record_success`] and [`StatsHandle::record_failure`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub consecutive_failures: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CycleStats {
    /// Fraction of runs that succeeded, `None` before the first run.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_runs == 0 {
            None
        } else {
            Some(self.successful_runs as f64 / self.total_runs as f64)
        }
    }

    /// True when the most recent completed run failed.
    pub fn last_run_failed(&self) -> bool {
        self.consecutive_failures > 0
    }
}

/// Writable handle on the shared [`CycleStats`], held by the cycle engine
/// and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<RwLock<CycleStats>>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read-only view for observers such as the status API.
    pub fn reader(&self) -> StatsReader {
        StatsReader {
            inner: Arc::clone(&self.inner),
        }
    }

    pub async fn snapshot(&self) -> CycleStats {
        self.inner.read().await.clone()
    }

    pub async fn record_success(&self, at: DateTime<Utc>) {
        let mut stats = self.inner.write().await;
        stats.total_runs += 1;
        stats.successful_runs += 1;
        stats.consecutive_failures = 0;
        stats.last_run_at = Some(at);
        stats.last_success_at = Some(at);
    }

    pub async fn record_failure(&self, at: DateTime<Utc>, error: impl Into<String>) {
        let mut stats = self.inner.write().await;
        stats.total_runs += 1;
        stats.failed_runs += 1;
        stats.consecutive_failures += 1;
        stats.last_run_at = Some(at);
        stats.last_error = Some(error.into());
    }

    pub async fn set_last_error(&self, error: Option<String>) {
        self.inner.write().await.last_error = error;
    }

    pub async fn set_next_run(&self, at: Option<DateTime<Utc>>) {
        self.inner.write().await.next_run_at = at;
    }
}

/// Read-only handle on the shared [`CycleStats`].
#[derive(Debug, Clone)]
pub struct StatsReader {
    inner: Arc<RwLock<CycleStats>>,
}

impl StatsReader {
    pub async fn snapshot(&self) -> CycleStats {
        self.inner.read().await.clone()
    }
}

// ---------------------------------------------------------------------------
// CycleReport / TickOutcome
// ---------------------------------------------------------------------------

/// What a single completed tick did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub action: NextAction,
    pub success: bool,
    /// Backend attempts made across every batch of this tick.
    pub attempts: u32,
    pub alert_dispatched: bool,
    /// Overrides the scheduler interval for the following tick only.
    #[serde(with = "millis_serde")]
    pub retry_after: Option<Duration>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The tick ran to completion.
    Completed(CycleReport),
    /// Another cycle was already running; nothing happened.
    Skipped,
}

impl TickOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            TickOutcome::Completed(report) => Some(report),
            TickOutcome::Skipped => None,
        }
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        dur.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}
