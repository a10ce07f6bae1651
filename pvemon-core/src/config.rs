//! Exporter configuration.
//!
//! Values come from an optional JSON file and are then overridden by
//! command-line flags in the daemon.

use crate::error::{PvemonError, Result};
use crate::paths::HostPaths;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

static PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z_][a-zA-Z0-9_]*)?$").expect("Invalid metrics prefix regex")
});

/// Runtime configuration for the exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub listen_address: String,
    pub port: u16,
    pub metrics_prefix: String,
    pub log_level: String,
    pub collect_running_vms: bool,
    pub collect_storage: bool,
    /// Per-prompt wait for `qm monitor`.
    pub qm_terminal_timeout_secs: u64,
    /// Base TTL of cached monitor output.
    pub qm_max_ttl_secs: u64,
    /// Jitter applied to the cache TTL, in both directions.
    pub qm_rand_secs: u64,
    pub qm_monitor_defer_close: bool,
    pub qm_close_timeout_secs: u64,
    pub qm_defer_grace_secs: u64,
    pub max_workers: usize,
    pub stale_block_retries: u32,
    pub qm_binary: String,
    pub qemu_binary: PathBuf,
    pub paths: HostPaths,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 9116,
            metrics_prefix: DEFAULT_METRICS_PREFIX.to_string(),
            log_level: "INFO".to_string(),
            collect_running_vms: true,
            collect_storage: false,
            qm_terminal_timeout_secs: 10,
            qm_max_ttl_secs: 600,
            qm_rand_secs: 60,
            qm_monitor_defer_close: true,
            qm_close_timeout_secs: 5,
            qm_defer_grace_secs: 60,
            max_workers: 16,
            stale_block_retries: 1,
            qm_binary: "qm".to_string(),
            qemu_binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            paths: HostPaths::default(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from `path`, falling back to defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| PvemonError::IoError { path: path.to_path_buf(), source: e })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| PvemonError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.qm_terminal_timeout_secs == 0 {
            return Err(PvemonError::InvalidConfig {
                reason: "qm_terminal_timeout_secs must be greater than zero".to_string(),
            });
        }
        if self.max_workers == 0 {
            return Err(PvemonError::InvalidConfig {
                reason: "max_workers must be greater than zero".to_string(),
            });
        }
        if self.qm_rand_secs > self.qm_max_ttl_secs {
            return Err(PvemonError::InvalidConfig {
                reason: format!(
                    "qm_rand_secs ({}) must not exceed qm_max_ttl_secs ({})",
                    self.qm_rand_secs, self.qm_max_ttl_secs
                ),
            });
        }
        if !PREFIX_RE.is_match(&self.metrics_prefix) {
            return Err(PvemonError::InvalidConfig {
                reason: format!("invalid metrics prefix {:?}", self.metrics_prefix),
            });
        }
        Ok(())
    }

    pub fn terminal_timeout(&self) -> Duration {
        Duration::from_secs(self.qm_terminal_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.qm_max_ttl_secs)
    }

    pub fn cache_jitter(&self) -> Duration {
        Duration::from_secs(self.qm_rand_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.qm_close_timeout_secs)
    }

    pub fn defer_grace(&self) -> Duration {
        Duration::from_secs(self.qm_defer_grace_secs)
    }

    /// Apply the configured prefix to a family name.
    pub fn metric_name(&self, name: &str) -> String {
        prefixed(&self.metrics_prefix, name)
    }
}

pub const DEFAULT_METRICS_PREFIX: &str = "pve";

pub(crate) fn prefixed(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExporterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 9116);
        assert_eq!(config.metric_name("kvm_cpu"), "pve_kvm_cpu");
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExporterConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.max_workers, 16);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvemon.json");
        std::fs::write(&path, r#"{"metrics_prefix": "", "qm_max_ttl_secs": 30, "qm_rand_secs": 5}"#)
            .unwrap();
        let config = ExporterConfig::load(&path).unwrap();
        assert_eq!(config.metric_name("kvm_cpu"), "kvm_cpu");
        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.port, 9116);
    }

    #[test]
    fn test_rejects_jitter_larger_than_ttl() {
        let config = ExporterConfig { qm_max_ttl_secs: 10, qm_rand_secs: 20, ..Default::default() };
        assert!(matches!(config.validate(), Err(PvemonError::InvalidConfig { .. })));

        let config = ExporterConfig { metrics_prefix: "9bad-prefix".into(), ..Default::default() };
        assert!(config.validate().is_err());
    }
}
