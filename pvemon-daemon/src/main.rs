use clap::Parser;
use pvemon_core::observability::health::{MONITOR_SUBSYSTEM, STORAGE_SUBSYSTEM};
use pvemon_core::{init_observability, HealthChecker, PveCollector};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

mod cli;
mod server;

use cli::Cli;
use server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    // Initialize observability FIRST
    let self_metrics = init_observability(&config.log_level, &config.metrics_prefix)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        collect_running_vms = config.collect_running_vms,
        collect_storage = config.collect_storage,
        "pvemon starting"
    );
    if cli.interval.is_some() {
        warn!("--interval has no effect; metrics are collected on every scrape");
    }

    let collector = Arc::new(PveCollector::from_config(&config));

    if cli.profile {
        run_profile(&collector).await;
        return Ok(());
    }

    let health = HealthChecker::new();
    health.register_subsystem(MONITOR_SUBSYSTEM).await;
    if config.collect_storage {
        health.register_subsystem(STORAGE_SUBSYSTEM).await;
    }

    let state = Arc::new(AppState {
        collector,
        health,
        self_metrics,
        prefix: config.metrics_prefix.clone(),
    });
    server::run_server(state, &config.listen_address, config.port).await?;

    info!("pvemon shutting down");
    Ok(())
}

/// One pass with per-family sample counts, for timing a node by hand.
async fn run_profile(collector: &Arc<PveCollector>) {
    let started = Instant::now();
    let report = collector.collect().await;
    for family in &report.families {
        info!(family = family.name(), samples = family.len(), "profiled family");
    }
    if let Some(e) = &report.escalation {
        warn!(error = %e, "monitor sessions escalated during profiling");
    }
    info!(
        vms = report.stats.vm_count,
        failed_units = report.stats.failed_units,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "profile pass finished"
    );
}
