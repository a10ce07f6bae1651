//! Exporter self-metrics.
//!
//! These go through the global recorder installed by
//! [`init`](super::init), not through the per-scrape family exposition.

use crate::collector::PassStats;
use crate::config::{prefixed, DEFAULT_METRICS_PREFIX};
use metrics::{describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;

pub const MONITOR_SESSIONS_TOTAL: &str = "exporter_monitor_sessions_total";
pub const MONITOR_FAILURES_TOTAL: &str = "exporter_monitor_failures_total";
pub const MONITOR_CACHE_MISSES_TOTAL: &str = "exporter_monitor_cache_misses_total";
pub const UNIT_FAILURES_TOTAL: &str = "exporter_unit_failures_total";

/// Prefix fixed by the first [`register_exporter_metrics`] call.
static COUNTER_PREFIX: OnceCell<String> = OnceCell::new();

/// Full name of an exporter counter, e.g. `pve_exporter_monitor_sessions_total`.
pub fn counter_name(name: &str) -> String {
    let prefix = COUNTER_PREFIX.get().map(String::as_str).unwrap_or(DEFAULT_METRICS_PREFIX);
    prefixed(prefix, name)
}

/// Register descriptions so the series carry HELP text from the first scrape.
///
/// Also fixes the prefix used by the counters for the life of the process.
pub fn register_exporter_metrics(prefix: &str) {
    let _ = COUNTER_PREFIX.set(prefix.to_string());

    describe_counter!(counter_name(MONITOR_SESSIONS_TOTAL), "qm monitor sessions opened (by command)");
    describe_counter!(counter_name(MONITOR_FAILURES_TOTAL), "qm monitor session failures (by reason)");
    describe_counter!(
        counter_name(MONITOR_CACHE_MISSES_TOTAL),
        "Monitor queries not answered from the cache (by command)"
    );
    describe_counter!(counter_name(UNIT_FAILURES_TOTAL), "Failed per-VM collection units (by unit, reason)");

    describe_gauge!(
        prefixed(prefix, "exporter_collect_duration_seconds"),
        "Duration of the last collection pass"
    );
    describe_gauge!(
        prefixed(prefix, "exporter_deferred_sessions"),
        "Monitor sessions waiting for a deferred close"
    );
    describe_gauge!(prefixed(prefix, "exporter_monitor_cache_entries"), "Entries in the monitor output cache");
    describe_gauge!(prefixed(prefix, "exporter_failed_units"), "Collection units that failed in the last pass");
}

pub fn record_pass(prefix: &str, stats: &PassStats) {
    gauge!(prefixed(prefix, "exporter_collect_duration_seconds")).set(stats.duration.as_secs_f64());
    gauge!(prefixed(prefix, "exporter_deferred_sessions")).set(stats.deferred_sessions as f64);
    gauge!(prefixed(prefix, "exporter_monitor_cache_entries")).set(stats.cache_entries as f64);
    gauge!(prefixed(prefix, "exporter_failed_units")).set(stats.failed_units as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::time::Duration;

    #[test]
    fn test_record_pass_renders_gauges() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let stats = PassStats {
            duration: Duration::from_millis(250),
            vm_count: 3,
            failed_units: 1,
            deferred_sessions: 2,
            cache_entries: 6,
            dynamic_series: 4,
        };

        metrics::with_local_recorder(&recorder, || {
            register_exporter_metrics("pve");
            record_pass("pve", &stats);
        });

        let text = handle.render();
        assert!(text.contains("pve_exporter_collect_duration_seconds 0.25"));
        assert!(text.contains("pve_exporter_deferred_sessions 2"));
        assert!(text.contains("pve_exporter_monitor_cache_entries 6"));
        assert!(text.contains("# HELP pve_exporter_failed_units"));
    }

    #[test]
    fn test_counters_share_the_gauge_prefix() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_exporter_metrics(DEFAULT_METRICS_PREFIX);
            metrics::counter!(counter_name(MONITOR_SESSIONS_TOTAL), "command" => "info block").increment(2);
        });

        let text = handle.render();
        assert!(text.contains("pve_exporter_monitor_sessions_total{command=\"info block\"} 2"));
        assert!(text.contains("# HELP pve_exporter_monitor_sessions_total"));
        assert!(!text.contains("pvemon_"));
        assert_eq!(counter_name(UNIT_FAILURES_TOTAL), "pve_exporter_unit_failures_total");
    }
}
