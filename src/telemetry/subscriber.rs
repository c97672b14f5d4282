use super::config::TelemetryConfig;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the telemetry subsystem alive for the lifetime of the process.
pub struct TelemetryGuard {
    _private: (),
}

static TELEMETRY_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber once.
///
/// `RUST_LOG` wins over `config.log_filter`. Later calls are no-ops, and an
/// already installed global subscriber is left in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    TELEMETRY_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

        let fmt_layer = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_ansi(config.enable_console_colors);

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok();

        if installed {
            tracing::debug!(service = %config.service_name, "Telemetry initialised");
        }
    });

    TelemetryGuard { _private: () }
}

/// Flushes pending output. The fmt layer writes synchronously, so there is
/// nothing to drain yet.
pub fn shutdown_telemetry() {
    tracing::debug!("Telemetry shut down");
}
