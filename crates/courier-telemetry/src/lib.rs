mod metrics;

pub use metrics::{spawn_reporter, HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "courier_supervisor" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from textual levels; unknown level names fall back to INFO.
    pub fn from_levels<'a>(
        level: &str,
        module_levels: impl IntoIterator<Item = (&'a str, &'a str)>,
        json: bool,
    ) -> Self {
        Self {
            log_level: parse_level(level),
            module_levels: module_levels
                .into_iter()
                .map(|(module, lvl)| (module.to_string(), parse_level(lvl)))
                .collect(),
            json,
        }
    }

    /// The `EnvFilter` directive string used when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

fn parse_level(s: &str) -> Level {
    s.trim().parse().unwrap_or(Level::INFO)
}

/// Keeps the process-wide metrics recorder alive.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Shared recorder handed to supervisors.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
    {
        eprintln!("courier-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}
