//! Observability infrastructure: tracing, exporter self-metrics, health.

use crate::error::{PvemonError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod exposition;
pub mod health;
pub mod metrics;

/// Map a `--loglevel` name onto an `EnvFilter` directive.
pub fn level_directive(log_level: &str) -> Result<&'static str> {
    match log_level.to_ascii_uppercase().as_str() {
        "DEBUG" => Ok("debug"),
        "INFO" => Ok("info"),
        "WARNING" | "WARN" => Ok("warn"),
        "ERROR" | "CRITICAL" => Ok("error"),
        other => Err(PvemonError::InvalidConfig { reason: format!("unknown log level {:?}", other) }),
    }
}

/// Initialize logging and the global metrics recorder.
///
/// Must be called once at startup. `RUST_LOG` takes precedence over
/// `log_level` when set. The returned handle renders the exporter's own
/// counters and gauges.
pub fn init(log_level: &str, prefix: &str) -> Result<PrometheusHandle> {
    let directive = level_directive(log_level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(|e| PvemonError::Internal(format!("failed to install tracing subscriber: {}", e)))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PvemonError::Internal(format!("failed to install metrics recorder: {}", e)))?;

    metrics::register_exporter_metrics(prefix);
    tracing::info!(level = directive, "observability initialized");

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("DEBUG").unwrap(), "debug");
        assert_eq!(level_directive("warning").unwrap(), "warn");
        assert_eq!(level_directive("CRITICAL").unwrap(), "error");
        assert!(matches!(level_directive("TRACE"), Err(PvemonError::InvalidConfig { .. })));
    }
}
