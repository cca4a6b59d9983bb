use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` is used as the filter
/// directive (e.g. `"info"` or `"ka_daemon=debug,info"`). `json` switches to
/// one-object-per-line output for log shippers.
///
/// Safe to call more than once (tests): later calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init()
            .is_ok()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_line_number(true)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::info!(
            service = service_name,
            format = if json { "json" } else { "pretty" },
            "logging initialised"
        );
    }
}
