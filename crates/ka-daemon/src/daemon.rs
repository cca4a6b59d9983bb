use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ka_bridge::http_api::{api_router, ApiState};
use ka_core::config::Config;
use ka_core::types::StatsHandle;
use ka_harness::shutdown::ShutdownSignal;
use ka_integrations::{AlertNotifier, AlertTransport, LogTransport, SmtpTransport};
use ka_session::{HttpSessionClient, SessionApi};
use tracing::{error, info, warn};

use crate::engine::{CycleEngine, EngineSettings};
use crate::scheduler::{ScheduleTiming, Scheduler};

/// How long to wait for the scheduler to confirm it has stopped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The keep-alive daemon: cycle engine, scheduler and status server.
///
/// Shuts down when the [`ShutdownSignal`] fires: the scheduler stops first,
/// then a held session is logged out, then the status server drains.
pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    stats: StatsHandle,
    engine: Arc<CycleEngine>,
}

impl Daemon {
    /// Wire the daemon from config: HTTP session client plus SMTP alerts when
    /// an alert recipient is configured, log-only alerts otherwise.
    pub fn new(config: Config) -> Result<Self> {
        let api = HttpSessionClient::new(&config.backend).context("failed to build HTTP client")?;
        let transport: Arc<dyn AlertTransport> = match SmtpTransport::from_config(&config.alert)
            .context("failed to configure alert mail")?
        {
            Some(smtp) => {
                info!(recipient = %smtp.recipient(), "mail alerts enabled");
                Arc::new(smtp)
            }
            None => {
                info!("no ALERT_EMAIL configured, alerts are logged only");
                Arc::new(LogTransport)
            }
        };
        Ok(Self::with_collaborators(config, Arc::new(api), transport))
    }

    /// Wire the daemon with explicit backend and alert collaborators.
    pub fn with_collaborators(
        config: Config,
        api: Arc<dyn SessionApi>,
        transport: Arc<dyn AlertTransport>,
    ) -> Self {
        let stats = StatsHandle::new();
        let notifier = Arc::new(AlertNotifier::new(transport, config.alert.cooldown));
        let engine = Arc::new(CycleEngine::new(
            api,
            notifier,
            stats.clone(),
            EngineSettings::from_config(&config),
        ));
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            stats,
            engine,
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &Arc<CycleEngine> {
        &self.engine
    }

    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured address and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.server.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind status server on {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Run until shutdown using a pre-bound listener.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let state = ApiState::new(self.stats.reader()).with_control(self.engine.clone());
        let router = api_router(Arc::new(state));
        let local_addr = listener.local_addr()?;

        // Stopped separately so the status API stays up through the logout.
        let server_stop = ShutdownSignal::new();
        let server_signal = server_stop.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_signal.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "status server error");
            }
        });
        info!(%local_addr, "status server listening");

        let schedule = &self.config.schedule;
        info!(
            backend = %self.config.backend.base_url,
            interval_ms = schedule.interval.as_millis() as u64,
            login_attempts = schedule.login_max_attempts,
            follow_up_batches = schedule.login_follow_up_batches,
            "keep-alive daemon started"
        );
        let scheduler = Scheduler::start(
            ScheduleTiming {
                interval: schedule.interval,
                run_on_start: schedule.run_on_start,
            },
            self.engine.clone(),
            self.shutdown.clone(),
        );

        self.shutdown.cancelled().await;
        info!("shutting down");
        // No manual cycles from here on; one in flight finishes first.
        self.engine.close();

        scheduler.stop();
        if let Err(e) = scheduler.join().await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
        self.shutdown.wait_for_drain(1, DRAIN_TIMEOUT).await;

        self.engine
            .shutdown_logout(schedule.shutdown_logout_timeout)
            .await;

        server_stop.trigger();
        if let Err(e) = server.await {
            warn!(error = %e, "status server task ended abnormally");
        }

        let stats = self.stats.snapshot().await;
        info!(
            total_runs = stats.total_runs,
            successful_runs = stats.successful_runs,
            failed_runs = stats.failed_runs,
            "daemon stopped"
        );
        Ok(())
    }
}
