//! Centralized host path configuration.
//!
//! Every file the exporter reads goes through [`HostPaths`] so tests can point
//! the collectors at a temporary tree instead of the live host.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn env_or(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// Roots of the host filesystems the collectors read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    /// procfs mount point (`PVEMON_PROC_ROOT`, default `/proc`).
    pub proc_root: PathBuf,
    /// sysfs mount point (`PVEMON_SYS_ROOT`, default `/sys`).
    pub sys_root: PathBuf,
    /// Per-VM configuration directory (`PVEMON_QEMU_CONF_DIR`).
    pub qemu_conf_dir: PathBuf,
    /// Cluster storage configuration (`PVEMON_STORAGE_CFG`).
    pub storage_cfg: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            proc_root: env_or("PVEMON_PROC_ROOT", "/proc"),
            sys_root: env_or("PVEMON_SYS_ROOT", "/sys"),
            qemu_conf_dir: env_or("PVEMON_QEMU_CONF_DIR", "/etc/pve/qemu-server"),
            storage_cfg: env_or("PVEMON_STORAGE_CFG", "/etc/pve/storage.cfg"),
        }
    }
}

impl HostPaths {
    /// Build a path set rooted entirely under `root`. Used by tests.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            proc_root: root.join("proc"),
            sys_root: root.join("sys"),
            qemu_conf_dir: root.join("etc/pve/qemu-server"),
            storage_cfg: root.join("etc/pve/storage.cfg"),
        }
    }

    pub fn proc_pid(&self, pid: i32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    pub fn meminfo(&self) -> PathBuf {
        self.proc_root.join("meminfo")
    }

    /// `/etc/pve/qemu-server/<vmid>.conf`
    pub fn vm_config(&self, vmid: &str) -> PathBuf {
        self.qemu_conf_dir.join(format!("{}.conf", vmid))
    }

    pub fn interface_statistics(&self, ifname: &str) -> PathBuf {
        self.sys_root.join("class/net").join(ifname).join("statistics")
    }

    pub fn block_size(&self, device: &str) -> PathBuf {
        self.sys_root.join("class/block").join(device).join("size")
    }
}
