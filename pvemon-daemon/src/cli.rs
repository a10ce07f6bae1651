use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use pvemon_core::{ExporterConfig, Result};
use std::path::PathBuf;

/// Prometheus exporter for Proxmox VE KVM guests.
#[derive(Parser, Debug)]
#[command(name = "pvemon", version)]
#[command(about = "Export Proxmox VE KVM and storage metrics to Prometheus", long_about = None)]
pub struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long, env = "PVEMON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, env = "PVEMON_PORT")]
    pub port: Option<u16>,

    /// Address to listen on
    #[arg(long, env = "PVEMON_LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    /// Accepted for compatibility; collection runs on every scrape
    #[arg(long, env = "PVEMON_INTERVAL")]
    pub interval: Option<u64>,

    /// Collect metrics of running VMs
    #[arg(long, env = "PVEMON_COLLECT_RUNNING_VMS", value_parser = BoolishValueParser::new())]
    pub collect_running_vms: Option<bool>,

    /// Collect storage pool metrics
    #[arg(long, env = "PVEMON_COLLECT_STORAGE", value_parser = BoolishValueParser::new())]
    pub collect_storage: Option<bool>,

    /// Prefix for all metric names; empty for none
    #[arg(long, env = "PVEMON_METRICS_PREFIX")]
    pub metrics_prefix: Option<String>,

    /// DEBUG, INFO, WARNING, ERROR or CRITICAL
    #[arg(long, env = "PVEMON_LOGLEVEL")]
    pub loglevel: Option<String>,

    /// Run one collection pass, log a summary and exit
    #[arg(
        long,
        env = "PVEMON_PROFILE",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    pub profile: bool,

    /// Seconds to wait for the `qm>` prompt
    #[arg(long, env = "PVEMON_QM_TERMINAL_TIMEOUT")]
    pub qm_terminal_timeout: Option<u64>,

    /// Base lifetime in seconds of cached monitor output
    #[arg(long, env = "PVEMON_QM_MAX_TTL")]
    pub qm_max_ttl: Option<u64>,

    /// Random spread in seconds applied to the cache lifetime
    #[arg(long, env = "PVEMON_QM_RAND")]
    pub qm_rand: Option<u64>,

    /// Retry failed session teardowns on later scrapes
    #[arg(long, env = "PVEMON_QM_MONITOR_DEFER_CLOSE", value_parser = BoolishValueParser::new())]
    pub qm_monitor_defer_close: Option<bool>,

    /// Maximum concurrent collection units
    #[arg(long, env = "PVEMON_MAX_WORKERS")]
    pub max_workers: Option<usize>,
}

impl Cli {
    /// Load the config file, if any, then apply flag overrides and validate.
    pub fn resolve_config(&self) -> Result<ExporterConfig> {
        let mut config = match &self.config {
            Some(path) => ExporterConfig::load(path)?,
            None => ExporterConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(address) = &self.listen_address {
            config.listen_address = address.clone();
        }
        if let Some(enabled) = self.collect_running_vms {
            config.collect_running_vms = enabled;
        }
        if let Some(enabled) = self.collect_storage {
            config.collect_storage = enabled;
        }
        if let Some(prefix) = &self.metrics_prefix {
            config.metrics_prefix = prefix.clone();
        }
        if let Some(level) = &self.loglevel {
            config.log_level = level.clone();
        }
        if let Some(secs) = self.qm_terminal_timeout {
            config.qm_terminal_timeout_secs = secs;
        }
        if let Some(secs) = self.qm_max_ttl {
            config.qm_max_ttl_secs = secs;
        }
        if let Some(secs) = self.qm_rand {
            config.qm_rand_secs = secs;
        }
        if let Some(enabled) = self.qm_monitor_defer_close {
            config.qm_monitor_defer_close = enabled;
        }
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }

        config.validate()?;
        Ok(config)
    }
}
