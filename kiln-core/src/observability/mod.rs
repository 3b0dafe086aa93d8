//! Observability infrastructure: tracing, metrics, progress and reports.
//!
//! Every component logs through `tracing` and counts through the `metrics`
//! facade. [`init`] installs the subscriber; embedding programs that bring
//! their own subscriber simply skip it.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod collector;
pub mod metrics;
pub mod progress;
pub mod report;

pub use collector::{MetricsCollector, MetricsSnapshot, OperationMetrics, OperationOutcome};
pub use progress::{PlatformProgress, ProgressTracker};
pub use report::BuildReport;

/// Resolves the effective log level.
///
/// Explicit level first, then `LOG_LEVEL`, then `info`. `fatal` maps to
/// `error`; unknown values fall back to `info`.
pub fn resolve_level(explicit: Option<&str>) -> &'static str {
    let raw = explicit.map(str::to_string).or_else(|| std::env::var("LOG_LEVEL").ok());
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") | Some("fatal") => "error",
        _ => "info",
    }
}

/// Initialize the global tracing subscriber and register metric descriptions.
///
/// `RUST_LOG` directives, when set, refine the resolved level per target.
/// Calling this more than once is a no-op.
pub fn init(level: Option<&str>, json: bool) {
    let level = resolve_level(level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(tracing_subscriber::fmt::layer().json().with_target(true)).try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
            .try_init()
    };

    if installed.is_ok() {
        metrics::register_core_metrics();
        tracing::debug!(level, json, "Observability initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_level() {
        assert_eq!(resolve_level(Some("fatal")), "error");
        assert_eq!(resolve_level(Some("DEBUG")), "debug");
        assert_eq!(resolve_level(Some("loud")), "info");
    }

    #[test]
    fn test_init_is_idempotent() {
        init(Some("warn"), false);
        init(Some("debug"), true);
    }
}
