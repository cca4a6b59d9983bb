use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ka_bridge::{CycleControl, EngineStatus};
use ka_core::config::Config;
use ka_core::error::AuthError;
use ka_core::types::{
    CyclePhase, CycleReport, LoginCredentials, NextAction, SessionCredential, SessionState,
    StatsHandle, TickOutcome,
};
use ka_harness::retry::{retry, Retried, RetryError, RetryPolicy};
use ka_integrations::{AlertContext, AlertNotifier};
use ka_session::SessionApi;
use ka_telemetry::metrics::global_metrics;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub credentials: LoginCredentials,
    /// Backend root, reported in alerts.
    pub backend_url: String,
    pub login: RetryPolicy,
    pub logout: RetryPolicy,
    /// Full login batches run after the exhaustion alert. Zero disables.
    pub follow_up_batches: u32,
    /// Reported as `retry_after` when every login batch failed.
    pub failure_retry_delay: Duration,
    /// Check each fresh credential against the verify endpoint.
    pub verify_session: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let schedule = &config.schedule;
        Self {
            credentials: config.backend.credentials(),
            backend_url: config.backend.base_url.clone(),
            login: RetryPolicy::new(
                schedule.login_max_attempts,
                schedule.login_base_delay,
                schedule.login_max_delay,
            ),
            logout: RetryPolicy::new(
                schedule.logout_max_attempts,
                schedule.logout_base_delay,
                schedule.login_max_delay,
            ),
            follow_up_batches: schedule.login_follow_up_batches,
            failure_retry_delay: schedule.failure_retry_delay,
            verify_session: config.backend.verify_session,
        }
    }
}

/// Published after every completed tick, whoever ran it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickCompletion {
    pub success: bool,
    /// Replaces the normal interval before the next tick.
    pub retry_after: Option<Duration>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct EngineState {
    session: SessionState,
    next_action: NextAction,
    phase: CyclePhase,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            session: SessionState::default(),
            next_action: NextAction::Login,
            phase: CyclePhase::Idle,
        }
    }
}

/// Holds the re-entrancy flag for the duration of one tick.
///
/// Dropping it (normal return, panic unwind or cancellation) releases the
/// flag and moves an interrupted `Running*` phase back to `Idle`.
struct CycleGuard<'a> {
    engine: &'a CycleEngine,
}

impl<'a> CycleGuard<'a> {
    fn acquire(engine: &'a CycleEngine) -> Option<Self> {
        engine
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { engine })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.engine.lock_state();
        if state.phase.is_running() {
            warn!(phase = ?state.phase, "cycle interrupted before completion");
            state.phase = CyclePhase::Idle;
        }
        drop(state);
        self.engine.cycle_running.store(false, Ordering::Release);
        self.engine.cycle_done.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// CycleEngine
// ---------------------------------------------------------------------------

/// Alternates between logging in and logging out, one action per tick.
///
/// Ticks never overlap: a tick that finds another one in flight returns
/// [`TickOutcome::Skipped`] without touching any state. The run counters
/// move exactly once per completed tick, and every completed tick is
/// announced on [`CycleEngine::subscribe`]. Once closed, the engine refuses
/// new ticks.
pub struct CycleEngine {
    api: Arc<dyn SessionApi>,
    notifier: Arc<AlertNotifier>,
    stats: StatsHandle,
    settings: EngineSettings,
    cycle_running: AtomicBool,
    cycle_done: Notify,
    closed: AtomicBool,
    completions: watch::Sender<TickCompletion>,
    state: Mutex<EngineState>,
}

impl CycleEngine {
    pub fn new(
        api: Arc<dyn SessionApi>,
        notifier: Arc<AlertNotifier>,
        stats: StatsHandle,
        settings: EngineSettings,
    ) -> Self {
        Self {
            api,
            notifier,
            stats,
            settings,
            cycle_running: AtomicBool::new(false),
            cycle_done: Notify::new(),
            closed: AtomicBool::new(false),
            completions: watch::channel(TickCompletion::default()).0,
            state: Mutex::new(EngineState::default()),
        }
    }

    // ---- accessors -------------------------------------------------------

    pub fn next_action(&self) -> NextAction {
        self.lock_state().next_action
    }

    pub fn phase(&self) -> CyclePhase {
        self.lock_state().phase
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock_state().session.is_authenticated()
    }

    pub fn is_running(&self) -> bool {
        self.cycle_running.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Watch the ticks that complete after this call, manual ones included.
    pub fn subscribe(&self) -> watch::Receiver<TickCompletion> {
        self.completions.subscribe()
    }

    /// Refuse every tick from now on. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("engine closed to new cycles");
        }
    }

    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    pub fn notifier(&self) -> &Arc<AlertNotifier> {
        &self.notifier
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // The lock is never held across an await.
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- tick ------------------------------------------------------------

    /// Run one login or logout cycle, whichever is due.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = CycleGuard::acquire(self) else {
            debug!("cycle already running, skipping tick");
            return TickOutcome::Skipped;
        };
        if self.is_closed() {
            debug!("engine closed, refusing tick");
            return TickOutcome::Skipped;
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let action = {
            let mut state = self.lock_state();
            state.phase = CyclePhase::running(state.next_action);
            state.next_action
        };

        let span = info_span!("keepalive_cycle", action = %action);
        let report = async {
            info!("cycle started");
            match action {
                NextAction::Login => self.run_login(started_at).await,
                NextAction::Logout => self.run_logout(started_at).await,
            }
        }
        .instrument(span)
        .await;

        let metrics = global_metrics();
        let outcome = if report.success { "success" } else { "failure" };
        metrics.increment_counter(
            "keepalive_cycles_total",
            &[("action", action.as_str()), ("outcome", outcome)],
        );
        metrics.record_duration(
            "keepalive_cycle_duration_seconds",
            clock.elapsed().as_secs_f64(),
        );
        metrics.set_gauge("keepalive_authenticated", i64::from(self.is_authenticated()));

        self.completions.send_replace(TickCompletion {
            success: report.success,
            retry_after: report.retry_after,
        });
        TickOutcome::Completed(report)
    }

    // ---- login -----------------------------------------------------------

    /// One full retrier batch of login (+ verify) attempts.
    async fn login_batch(&self) -> Result<Retried<SessionCredential>, RetryError<AuthError>> {
        let api = self.api.as_ref();
        let credentials = &self.settings.credentials;
        let verify = self.settings.verify_session;

        retry(&self.settings.login, move |attempt| async move {
            debug!(attempt, "login attempt");
            let result = login_once(api, credentials, verify).await;
            let outcome = match &result {
                Ok(_) => "success",
                Err(e) => e.kind(),
            };
            global_metrics()
                .increment_counter("keepalive_login_attempts_total", &[("outcome", outcome)]);
            result
        })
        .await
    }

    async fn run_login(&self, started_at: DateTime<Utc>) -> CycleReport {
        let batches = 1 + self.settings.follow_up_batches;
        let mut attempts = 0;
        let mut alert_dispatched = false;
        let mut last_error = None;

        for batch in 1..=batches {
            match self.login_batch().await {
                Ok(retried) => {
                    attempts += retried.attempts;
                    return self
                        .login_succeeded(retried.value, attempts, alert_dispatched, started_at)
                        .await;
                }
                Err(exhausted) => {
                    attempts += exhausted.attempts();
                    let err = exhausted.into_last();
                    warn!(batch, batches, attempts, error = %err, "login batch exhausted");
                    self.stats.set_last_error(Some(err.to_string())).await;

                    if batch == 1 {
                        alert_dispatched = self.alert(attempts, &err).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "login failed".to_string());
        let finished_at = Utc::now();
        self.stats.record_failure(finished_at, message.clone()).await;
        {
            let mut state = self.lock_state();
            state.phase = CyclePhase::Cooldown;
            state.next_action = NextAction::Login;
        }
        error!(
            attempts,
            retry_after_ms = self.settings.failure_retry_delay.as_millis() as u64,
            error = %message,
            "login failed in every batch, cooling down"
        );

        CycleReport {
            action: NextAction::Login,
            success: false,
            attempts,
            alert_dispatched,
            retry_after: Some(self.settings.failure_retry_delay),
            error: Some(message),
            started_at,
            finished_at,
        }
    }

    async fn login_succeeded(
        &self,
        credential: SessionCredential,
        attempts: u32,
        alert_dispatched: bool,
        started_at: DateTime<Utc>,
    ) -> CycleReport {
        {
            let mut state = self.lock_state();
            state.session.establish(credential);
            state.next_action = NextAction::Logout;
            state.phase = CyclePhase::Idle;
        }
        let finished_at = Utc::now();
        self.stats.record_success(finished_at).await;
        self.stats.set_last_error(None).await;
        self.notifier.clear_suppression().await;
        info!(attempts, "login succeeded, session established");

        CycleReport {
            action: NextAction::Login,
            success: true,
            attempts,
            alert_dispatched,
            retry_after: None,
            error: None,
            started_at,
            finished_at,
        }
    }

    async fn alert(&self, attempts: u32, err: &AuthError) -> bool {
        let context = AlertContext {
            backend_url: self.settings.backend_url.clone(),
            attempts,
            last_error: err.to_string(),
            occurred_at: Utc::now(),
        };
        let sent = self.notifier.notify_exhausted(&context).await;
        let outcome = if sent { "sent" } else { "skipped" };
        global_metrics().increment_counter("keepalive_alerts_total", &[("outcome", outcome)]);
        sent
    }

    // ---- logout ----------------------------------------------------------

    async fn run_logout(&self, started_at: DateTime<Utc>) -> CycleReport {
        let credential = self.lock_state().session.credential().cloned();

        let Some(credential) = credential else {
            info!("no session held, nothing to log out");
            return self.logout_finished(started_at, 0, None).await;
        };

        let api = self.api.as_ref();
        let credential = &credential;
        let result = retry(&self.settings.logout, move |attempt| async move {
            debug!(attempt, "logout attempt");
            api.logout(credential).await
        })
        .await;

        match result {
            Ok(retried) => {
                info!(attempts = retried.attempts, "logout succeeded");
                self.logout_finished(started_at, retried.attempts, None).await
            }
            Err(exhausted) => {
                let attempts = exhausted.attempts();
                let err = exhausted.into_last();
                warn!(attempts, error = %err, "logout failed, dropping local session anyway");
                self.logout_finished(started_at, attempts, Some(err.to_string()))
                    .await
            }
        }
    }

    /// Clear the local session and flip back to login, whatever the outcome.
    async fn logout_finished(
        &self,
        started_at: DateTime<Utc>,
        attempts: u32,
        error: Option<String>,
    ) -> CycleReport {
        {
            let mut state = self.lock_state();
            state.session.clear();
            state.next_action = NextAction::Login;
            state.phase = CyclePhase::Idle;
        }
        let finished_at = Utc::now();
        match &error {
            None => self.stats.record_success(finished_at).await,
            Some(message) => self.stats.record_failure(finished_at, message.clone()).await,
        }

        CycleReport {
            action: NextAction::Logout,
            success: error.is_none(),
            attempts,
            alert_dispatched: false,
            retry_after: None,
            error,
            started_at,
            finished_at,
        }
    }

    // ---- shutdown --------------------------------------------------------

    /// Close the engine, then make one best-effort logout of a held session.
    ///
    /// A cycle already in flight is waited for, so a login it completes is
    /// logged out too. The wait and the logout share `timeout`. Run counters
    /// are not touched. Returns `true` only when the backend confirmed the
    /// logout.
    pub async fn shutdown_logout(&self, timeout: Duration) -> bool {
        self.close();
        match tokio::time::timeout(timeout, self.final_logout()).await {
            Ok(logged_out) => logged_out,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "shutdown logout timed out");
                false
            }
        }
    }

    async fn final_logout(&self) -> bool {
        let _guard = self.wait_for_idle().await;
        let credential = {
            let mut state = self.lock_state();
            state.next_action = NextAction::Login;
            state.session.clear()
        };
        let Some(credential) = credential else {
            debug!("no session held at shutdown");
            return false;
        };

        match self.api.logout(&credential).await {
            Ok(()) => {
                info!("session logged out on shutdown");
                true
            }
            Err(e) => {
                warn!(error = %e, "shutdown logout failed");
                false
            }
        }
    }

    /// Claim the re-entrancy flag, waiting out any cycle in flight.
    async fn wait_for_idle(&self) -> CycleGuard<'_> {
        loop {
            let done = self.cycle_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();
            if let Some(guard) = CycleGuard::acquire(self) {
                return guard;
            }
            debug!("waiting for the in-flight cycle to finish");
            done.await;
        }
    }
}

/// One login, verified when asked.
///
/// A credential that fails verification is logged out before the error is
/// returned, so the account never holds more than one backend session.
async fn login_once(
    api: &dyn SessionApi,
    credentials: &LoginCredentials,
    verify: bool,
) -> Result<SessionCredential, AuthError> {
    let credential = api.login(credentials).await?;
    if verify {
        if let Err(err) = api.verify(&credential).await {
            if let Err(release) = api.logout(&credential).await {
                debug!(error = %release, "could not release unverified session");
            }
            return Err(err);
        }
    }
    Ok(credential)
}

#[async_trait]
impl CycleControl for CycleEngine {
    async fn trigger(&self) -> TickOutcome {
        self.tick().await
    }

    async fn status(&self) -> EngineStatus {
        let state = self.lock_state();
        EngineStatus {
            next_action: state.next_action,
            phase: state.phase,
            authenticated: state.session.is_authenticated(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ka_core::types::Identity;
    use ka_integrations::LogTransport;

    struct AlwaysOk;

    #[async_trait]
    impl SessionApi for AlwaysOk {
        async fn login(&self, _: &LoginCredentials) -> Result<SessionCredential, AuthError> {
            Ok(SessionCredential::new("sid=1").unwrap())
        }
        async fn verify(&self, _: &SessionCredential) -> Result<(), AuthError> {
            Ok(())
        }
        async fn logout(&self, _: &SessionCredential) -> Result<(), AuthError> {
            Ok(())
        }
    }

    fn engine() -> CycleEngine {
        let settings = EngineSettings {
            credentials: LoginCredentials {
                identity: Identity::Username("keeper".into()),
                password: "pw".into(),
            },
            backend_url: "http://backend.test".into(),
            login: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
            logout: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(4)),
            follow_up_batches: 1,
            failure_retry_delay: Duration::from_secs(60),
            verify_session: true,
        };
        let notifier = Arc::new(AlertNotifier::new(Arc::new(LogTransport), Duration::from_secs(60)));
        CycleEngine::new(Arc::new(AlwaysOk), notifier, StatsHandle::new(), settings)
    }

    #[test]
    fn starts_idle_expecting_login() {
        let engine = engine();
        assert_eq!(engine.next_action(), NextAction::Login);
        assert_eq!(engine.phase(), CyclePhase::Idle);
        assert!(!engine.is_authenticated());
        assert!(!engine.is_running());
    }

    #[test]
    fn guard_is_exclusive_and_released_on_drop() {
        let engine = engine();
        let guard = CycleGuard::acquire(&engine).expect("first claim");
        assert!(CycleGuard::acquire(&engine).is_none());
        engine.lock_state().phase = CyclePhase::RunningLogin;
        drop(guard);
        assert!(!engine.is_running());
        assert_eq!(engine.phase(), CyclePhase::Idle);
        assert!(CycleGuard::acquire(&engine).is_some());
    }

    #[tokio::test]
    async fn alternates_login_and_logout() {
        let engine = engine();
        let first = engine.tick().await;
        assert_eq!(first.report().unwrap().action, NextAction::Login);
        assert!(engine.is_authenticated());
        assert_eq!(engine.next_action(), NextAction::Logout);

        let second = engine.tick().await;
        assert_eq!(second.report().unwrap().action, NextAction::Logout);
        assert!(!engine.is_authenticated());
        assert_eq!(engine.next_action(), NextAction::Login);
    }

    #[tokio::test]
    async fn logout_without_session_is_local_success() {
        let engine = engine();
        engine.lock_state().next_action = NextAction::Logout;
        let outcome = engine.tick().await;
        let report = outcome.report().unwrap();
        assert!(report.success);
        assert_eq!(report.attempts, 0);
        assert_eq!(engine.next_action(), NextAction::Login);
        assert_eq!(engine.stats().snapshot().await.successful_runs, 1);
    }

    #[tokio::test]
    async fn shutdown_logout_drops_session_without_counting() {
        let engine = engine();
        engine.tick().await;
        assert!(engine.shutdown_logout(Duration::from_secs(1)).await);
        assert!(!engine.is_authenticated());
        assert_eq!(engine.stats().snapshot().await.total_runs, 1);
        assert!(!engine.shutdown_logout(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn closed_engine_refuses_ticks() {
        let engine = engine();
        engine.close();
        engine.close();
        assert!(engine.is_closed());
        assert!(matches!(engine.tick().await, TickOutcome::Skipped));
        assert_eq!(engine.stats().snapshot().await.total_runs, 0);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn completed_ticks_are_announced() {
        let engine = engine();
        let mut completions = engine.subscribe();
        engine.tick().await;
        assert!(completions.has_changed().unwrap());
        let completion = *completions.borrow_and_update();
        assert!(completion.success);
        assert_eq!(completion.retry_after, None);
    }

    #[tokio::test]
    async fn status_reflects_state() {
        let engine = engine();
        engine.tick().await;
        let status = CycleControl::status(&engine).await;
        assert_eq!(
            status,
            EngineStatus {
                next_action: NextAction::Logout,
                phase: CyclePhase::Idle,
                authenticated: true,
            }
        );
    }
}
