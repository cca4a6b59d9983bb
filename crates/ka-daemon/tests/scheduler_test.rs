use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ka_core::error::AuthError;
use ka_core::types::{CycleStats, Identity, LoginCredentials, SessionCredential, StatsHandle};
use ka_daemon::engine::{CycleEngine, EngineSettings};
use ka_daemon::scheduler::{ScheduleTiming, Scheduler};
use ka_harness::retry::RetryPolicy;
use ka_harness::shutdown::ShutdownSignal;
use ka_integrations::{AlertNotifier, LogTransport};
use ka_session::SessionApi;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Succeed,
    Reject,
    Panic,
}

struct Backend {
    mode: Mode,
    logins: AtomicU32,
}

impl Backend {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            logins: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SessionApi for Backend {
    async fn login(&self, _: &LoginCredentials) -> Result<SessionCredential, AuthError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Succeed => Ok(SessionCredential::new("sid=1").unwrap()),
            Mode::Reject => Err(AuthError::rejected(Some(403), "locked")),
            Mode::Panic => panic!("backend exploded"),
        }
    }

    async fn verify(&self, _: &SessionCredential) -> Result<(), AuthError> {
        Ok(())
    }

    async fn logout(&self, _: &SessionCredential) -> Result<(), AuthError> {
        Ok(())
    }
}

fn engine(api: Arc<Backend>) -> Arc<CycleEngine> {
    let settings = EngineSettings {
        credentials: LoginCredentials {
            identity: Identity::Email("keeper@example.com".into()),
            password: "pw".into(),
        },
        backend_url: "http://backend.test".into(),
        login: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30)),
        logout: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(30)),
        follow_up_batches: 1,
        failure_retry_delay: Duration::from_secs(60),
        verify_session: false,
    };
    let notifier = Arc::new(AlertNotifier::new(Arc::new(LogTransport), Duration::from_secs(60)));
    Arc::new(CycleEngine::new(api, notifier, StatsHandle::new(), settings))
}

/// Poll the stats until `done` holds, advancing paused time in small steps.
async fn wait_for(stats: &StatsHandle, done: impl Fn(&CycleStats) -> bool) -> CycleStats {
    for _ in 0..100_000 {
        let snapshot = stats.snapshot().await;
        if done(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition never reached");
}

const INTERVAL: Duration = Duration::from_secs(720);

#[tokio::test(start_paused = true)]
async fn runs_immediately_and_schedules_the_interval() {
    let backend = Backend::new(Mode::Succeed);
    let engine = engine(backend.clone());
    let shutdown = ShutdownSignal::new();
    let handle = Scheduler::start(
        ScheduleTiming {
            interval: INTERVAL,
            run_on_start: true,
        },
        engine.clone(),
        shutdown.clone(),
    );

    let started = Utc::now();
    let stats = wait_for(engine.stats(), |s| s.total_runs == 1 && s.next_run_at > s.last_run_at).await;
    let next = stats.next_run_at.unwrap();
    let ahead = (next - started).num_seconds();
    assert!((700..=721).contains(&ahead), "next run {ahead}s ahead");
    assert!(engine.is_authenticated());

    // One interval later the logout runs.
    let stats = wait_for(engine.stats(), |s| s.total_runs == 2).await;
    assert_eq!(stats.successful_runs, 2);
    assert!(!engine.is_authenticated());

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_login_overrides_next_delay_once() {
    let backend = Backend::new(Mode::Reject);
    let engine = engine(backend.clone());
    let handle = Scheduler::start(
        ScheduleTiming {
            interval: INTERVAL,
            run_on_start: true,
        },
        engine.clone(),
        ShutdownSignal::new(),
    );

    let stats = wait_for(engine.stats(), |s| {
        s.failed_runs == 1 && s.next_run_at > s.last_run_at
    })
    .await;
    let ahead = (stats.next_run_at.unwrap() - Utc::now()).num_seconds();
    assert!((55..=61).contains(&ahead), "next run {ahead}s ahead");
    assert_eq!(backend.logins.load(Ordering::SeqCst), 6);

    // Sixty seconds later the next login tick runs.
    wait_for(engine.stats(), |s| s.failed_runs == 2).await;
    assert_eq!(backend.logins.load(Ordering::SeqCst), 12);

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_manual_tick_pulls_the_next_run_forward() {
    let backend = Backend::new(Mode::Reject);
    let engine = engine(backend.clone());
    let handle = Scheduler::start(
        ScheduleTiming {
            interval: INTERVAL,
            run_on_start: false,
        },
        engine.clone(),
        ShutdownSignal::new(),
    );
    let first = wait_for(engine.stats(), |s| s.next_run_at.is_some()).await;

    let report = engine.tick().await.report().cloned().unwrap();
    assert_eq!(report.retry_after, Some(Duration::from_secs(60)));

    let stats = wait_for(engine.stats(), |s| s.next_run_at < first.next_run_at).await;
    let ahead = (stats.next_run_at.unwrap() - Utc::now()).num_seconds();
    assert!((55..=61).contains(&ahead), "next run {ahead}s ahead");

    // The retry runs about a minute later, long before the interval is up.
    let before = tokio::time::Instant::now();
    wait_for(engine.stats(), |s| s.failed_runs == 2).await;
    assert!(before.elapsed() < Duration::from_secs(120), "{:?}", before.elapsed());
    assert_eq!(backend.logins.load(Ordering::SeqCst), 12);

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn successful_manual_tick_restarts_the_interval() {
    let backend = Backend::new(Mode::Succeed);
    let engine = engine(backend.clone());
    let handle = Scheduler::start(
        ScheduleTiming {
            interval: INTERVAL,
            run_on_start: false,
        },
        engine.clone(),
        ShutdownSignal::new(),
    );
    let first = wait_for(engine.stats(), |s| s.next_run_at.is_some()).await;

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(engine.tick().await.report().unwrap().success);

    let stats = wait_for(engine.stats(), |s| s.next_run_at > first.next_run_at).await;
    let ahead = (stats.next_run_at.unwrap() - Utc::now()).num_seconds();
    assert!((700..=721).contains(&ahead), "next run {ahead}s ahead");

    // The originally planned run time passes without a tick.
    tokio::time::sleep(Duration::from_secs(480)).await;
    assert_eq!(engine.stats().snapshot().await.total_runs, 1);
    assert!(engine.is_authenticated());

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn panicking_tick_is_recorded_and_the_loop_continues() {
    let backend = Backend::new(Mode::Panic);
    let engine = engine(backend.clone());
    let handle = Scheduler::start(
        ScheduleTiming {
            interval: Duration::from_secs(5),
            run_on_start: true,
        },
        engine.clone(),
        ShutdownSignal::new(),
    );

    let stats = wait_for(engine.stats(), |s| s.failed_runs >= 2).await;
    assert_eq!(stats.total_runs, stats.successful_runs + stats.failed_runs);
    assert!(stats.last_error.unwrap().contains("backend exploded"));
    assert!(!handle.is_finished());

    handle.stop();
    handle.join().await.unwrap();
    assert!(!engine.is_running());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_loop_and_confirms_drain() {
    let backend = Backend::new(Mode::Succeed);
    let engine = engine(backend.clone());
    let shutdown = ShutdownSignal::new();
    let handle = Scheduler::start(
        ScheduleTiming {
            interval: INTERVAL,
            run_on_start: false,
        },
        engine.clone(),
        shutdown.clone(),
    );

    let stats = wait_for(engine.stats(), |s| s.next_run_at.is_some()).await;
    assert_eq!(stats.total_runs, 0);

    shutdown.trigger();
    handle.join().await.unwrap();

    assert!(shutdown.wait_for_drain(1, Duration::from_secs(1)).await.is_complete());
    assert_eq!(backend.logins.load(Ordering::SeqCst), 0);
    assert!(engine.stats().snapshot().await.next_run_at.is_none());
}
