//! ka-daemon: keeps a backend session alive by cycling login and logout.

use anyhow::{Context, Result};
use ka_core::config::Config;
use ka_daemon::daemon::Daemon;
use ka_daemon::environment::{self, EnvSource};
use ka_harness::shutdown::ShutdownSignal;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let env_source = environment::load_env();
    let config = Config::from_env().context("invalid configuration")?;

    ka_telemetry::logging::init_logging("ka-daemon", &config.logging.level, config.logging.json);
    match &env_source {
        EnvSource::Failed { .. } => warn!("{}", env_source.describe()),
        _ => info!("{}", env_source.describe()),
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "ka-daemon starting"
    );

    let daemon = Daemon::new(config)?;
    tokio::spawn(forward_signals(daemon.shutdown_handle()));

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon execution failed");
        return Err(e);
    }
    Ok(())
}

/// Trigger shutdown on ctrl-c or SIGTERM.
async fn forward_signals(shutdown: ShutdownSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, initiating shutdown"),
        _ = terminate => info!("SIGTERM received, initiating shutdown"),
    }
    shutdown.trigger();
}
