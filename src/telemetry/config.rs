/// Configuration for the telemetry subsystem.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported in the startup line.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset (e.g. "info", "metadata_indexer=debug,warn").
    pub log_filter: String,
    /// Whether to enable ANSI-colored console output.
    pub enable_console_colors: bool,
    /// Whether to include target module in output.
    pub show_target: bool,
    /// Whether to include thread IDs.
    pub show_thread_ids: bool,
}

impl TelemetryConfig {
    /// Default config with `log_filter` replaced when given.
    #[must_use]
    pub fn with_filter(filter: Option<&str>) -> Self {
        let mut config = Self::default();
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            config.log_filter = filter.to_string();
        }
        config
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "metadata-indexer".into(),
            log_filter: "info".into(),
            enable_console_colors: true,
            show_target: true,
            show_thread_ids: false,
        }
    }
}
