use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ka_core::error::CycleError;
use ka_core::types::TickOutcome;
use ka_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::engine::{CycleEngine, TickCompletion};

/// When ticks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTiming {
    pub interval: Duration,
    /// Tick immediately instead of waiting one interval first.
    pub run_on_start: bool,
}

/// Drives [`CycleEngine::tick`] on a fixed interval.
///
/// Each tick runs in its own task so a panic inside it is contained. After
/// every tick the next run time is published to the shared stats: the
/// tick's `retry_after` when set, otherwise the normal interval. A tick run
/// outside the schedule (a manual trigger) restarts the wait the same way.
pub struct Scheduler;

impl Scheduler {
    /// Spawn the scheduling loop.
    ///
    /// The loop exits when either the process-wide `shutdown` fires or the
    /// returned handle is stopped. An in-flight tick is aborted.
    pub fn start(
        timing: ScheduleTiming,
        engine: Arc<CycleEngine>,
        shutdown: ShutdownSignal,
    ) -> SchedulerHandle {
        let stop = ShutdownSignal::new();
        let task = tokio::spawn(run_loop(timing, engine, shutdown, stop.clone()));
        SchedulerHandle { stop, task }
    }
}

pub struct SchedulerHandle {
    stop: ShutdownSignal,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the loop to exit. Idempotent.
    pub fn stop(&self) {
        if !self.stop.is_shutting_down() {
            self.stop.trigger();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop task to end.
    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }
}

async fn halted(shutdown: &ShutdownSignal, stop: &ShutdownSignal) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = stop.cancelled() => {}
    }
}

async fn run_loop(
    timing: ScheduleTiming,
    engine: Arc<CycleEngine>,
    shutdown: ShutdownSignal,
    stop: ShutdownSignal,
) {
    // Confirms drain to the process shutdown coordinator when the loop ends.
    let _drain = ShutdownGuard::new(shutdown.clone());
    let stats = engine.stats().clone();
    let mut completions = engine.subscribe();

    info!(
        interval_ms = timing.interval.as_millis() as u64,
        run_on_start = timing.run_on_start,
        "scheduler started"
    );

    let mut delay = if timing.run_on_start {
        Duration::ZERO
    } else {
        timing.interval
    };

    loop {
        let next_run = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        stats.set_next_run(next_run).await;
        debug!(delay_ms = delay.as_millis() as u64, "next tick scheduled");

        tokio::select! {
            _ = halted(&shutdown, &stop) => break,
            _ = tokio::time::sleep(delay) => {}
            Ok(()) = completions.changed() => {
                delay = next_delay(&mut completions, timing.interval);
                debug!("cycle ran outside the schedule, rescheduling");
                continue;
            }
        }

        let tick_engine = Arc::clone(&engine);
        let mut tick = tokio::spawn(async move { tick_engine.tick().await });

        let joined = tokio::select! {
            _ = halted(&shutdown, &stop) => {
                tick.abort();
                let _ = tick.await;
                info!("in-flight cycle aborted");
                break;
            }
            joined = &mut tick => joined,
        };

        delay = match joined {
            // The latest completion wins, in case a manual tick slipped in
            // right after ours.
            Ok(TickOutcome::Completed(_)) => next_delay(&mut completions, timing.interval),
            Ok(TickOutcome::Skipped) => {
                debug!("tick skipped, another cycle was running");
                timing.interval
            }
            Err(e) => {
                let err = CycleError::Internal(join_error_message(e));
                error!(error = %err, "cycle task failed");
                stats.record_failure(Utc::now(), err.to_string()).await;
                timing.interval
            }
        };
    }

    stats.set_next_run(None).await;
    info!("scheduler stopped");
}

fn next_delay(completions: &mut watch::Receiver<TickCompletion>, interval: Duration) -> Duration {
    completions.borrow_and_update().retry_after.unwrap_or(interval)
}

fn join_error_message(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("cycle panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("cycle panicked: {s}")
    } else {
        "cycle panicked".to_string()
    }
}
