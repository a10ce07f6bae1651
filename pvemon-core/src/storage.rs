//! Storage pool metrics from `/etc/pve/storage.cfg`.
//!
//! The file is a list of sections. A `type: name` line opens a section and
//! the indented lines below it are `key value` pairs; a bare key means
//! `true`. The parse is cached until the file's mtime changes.

use crate::config::prefixed;
use crate::error::{PvemonError, Result};
use crate::series::{FamilyKind, MetricFamily, SeriesValue};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, warn};

static LABEL_UNSAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_]").expect("Invalid label sanitizer regex"));

pub fn sanitize_key(key: &str) -> String {
    LABEL_UNSAFE.replace_all(key, "_").into_owned()
}

/// One storage definition. Always has `type` and `name` keys.
pub type StorageSection = BTreeMap<String, String>;

pub fn parse_storage_cfg(content: &str) -> Vec<StorageSection> {
    let mut sections = Vec::new();
    let mut current: Option<StorageSection> = None;

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let header = if raw.starts_with(char::is_whitespace) { None } else { line.split_once(':') };
        if let Some((kind, name)) = header {
            sections.extend(current.take());
            current = Some(BTreeMap::from([
                ("type".to_string(), sanitize_key(kind.trim())),
                ("name".to_string(), sanitize_key(name.trim())),
            ]));
        } else if let Some(section) = current.as_mut() {
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = sanitize_key(parts.next().unwrap_or_default().trim());
            let value = parts.next().map(str::trim).unwrap_or("true");
            section.insert(key, value.to_string());
        }
    }
    sections.extend(current);
    sections
}

/// Total and free bytes of a filesystem-backed storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSize {
    pub total: u64,
    pub free: u64,
}

/// `statvfs` sizes for `dir`, `nfs`, `cephfs` and `zfspool` storages.
/// ZFS totals are approximate.
pub fn storage_size(section: &StorageSection) -> Option<StorageSize> {
    let path = match section.get("type").map(String::as_str) {
        Some("dir" | "nfs" | "cephfs") => section.get("path")?,
        Some("zfspool") => section.get("mountpoint")?,
        _ => return None,
    };
    match nix::sys::statvfs::statvfs(Path::new(path)) {
        Ok(stat) => {
            let frsize = stat.fragment_size() as u64;
            Some(StorageSize {
                total: frsize * stat.blocks() as u64,
                free: frsize * stat.blocks_available() as u64,
            })
        }
        Err(e) => {
            warn!(storage = ?section.get("name"), path, error = %e, "statvfs failed");
            None
        }
    }
}

struct CachedConfig {
    mtime: SystemTime,
    sections: Vec<StorageSection>,
}

/// Collects `node_storage*` families.
pub struct StorageCollector {
    path: PathBuf,
    prefix: String,
    cache: Mutex<Option<CachedConfig>>,
}

impl StorageCollector {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self { path: path.into(), prefix: prefix.into(), cache: Mutex::new(None) }
    }

    /// Parsed sections, re-read only when the file changed.
    pub fn sections(&self) -> Result<Vec<StorageSection>> {
        let meta = std::fs::metadata(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PvemonError::StorageConfigMissing { path: self.path.clone() },
            _ => PvemonError::IoError { path: self.path.clone(), source: e },
        })?;
        let mtime = meta
            .modified()
            .map_err(|e| PvemonError::IoError { path: self.path.clone(), source: e })?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.as_ref().filter(|c| c.mtime == mtime) {
            debug!("storage.cfg unchanged, using cached parse");
            return Ok(cached.sections.clone());
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| PvemonError::IoError { path: self.path.clone(), source: e })?;
        let sections = parse_storage_cfg(&content);
        debug!(count = sections.len(), "parsed storage.cfg");
        *cache = Some(CachedConfig { mtime, sections: sections.clone() });
        Ok(sections)
    }

    /// Build the storage families. Blocking.
    pub fn collect(&self) -> Result<Vec<MetricFamily>> {
        let info = MetricFamily::new(
            prefixed(&self.prefix, "node_storage"),
            "information for each PVE storage",
            FamilyKind::Info,
            Vec::<String>::new(),
        );
        let size = MetricFamily::new(
            prefixed(&self.prefix, "node_storage_size"),
            "Size of the storage pool. This number is inaccurate for ZFS.",
            FamilyKind::Gauge,
            ["name", "type"],
        );
        let free = MetricFamily::new(
            prefixed(&self.prefix, "node_storage_free"),
            "Free space on the storage pool",
            FamilyKind::Gauge,
            ["name", "type"],
        );

        for section in self.sections()? {
            let name = section.get("name").cloned().unwrap_or_default();
            let kind = section.get("type").cloned().unwrap_or_default();
            if let Some(sz) = storage_size(&section) {
                size.add_metric([name.as_str(), kind.as_str()], SeriesValue::Gauge(sz.total as f64))?;
                free.add_metric([name.as_str(), kind.as_str()], SeriesValue::Gauge(sz.free as f64))?;
            }
            info.add_metric(Vec::<String>::new(), SeriesValue::Info(section))?;
        }
        Ok(vec![info, size, free])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORAGE_CFG: &str = "\
dir: local
\tpath /var/lib/vz
\tcontent iso,vztmpl,backup

# thin pool
lvmthin: local-lvm
\tthinpool data
\tvgname pve
\tcontent rootdir,images

zfspool: local-zfs
\tpool rpool/data
\tsparse
\tcontent images,rootdir

nfs: backup.nas-01
\texport /volume1/pve
\tpath /mnt/pve/backup
\tserver 10.0.0.5
\tprune-backups keep-last=3
";

    #[test]
    fn test_parse_sections() {
        let sections = parse_storage_cfg(STORAGE_CFG);
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0]["type"], "dir");
        assert_eq!(sections[0]["path"], "/var/lib/vz");
        assert_eq!(sections[1]["name"], "local_lvm");
        assert_eq!(sections[2]["sparse"], "true");
        assert_eq!(sections[3]["name"], "backup_nas_01");
        assert_eq!(sections[3]["prune_backups"], "keep-last=3");
    }

    #[test]
    fn test_sizes_only_for_filesystem_storages() {
        let dir = tempfile::tempdir().unwrap();
        let sections = parse_storage_cfg(&format!("dir: scratch\n\tpath {}\n\nlvmthin: data\n\tvgname pve\n", dir.path().display()));

        let size = storage_size(&sections[0]).unwrap();
        assert!(size.total > 0);
        assert!(size.free <= size.total);
        assert_eq!(storage_size(&sections[1]), None);
    }

    #[test]
    fn test_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let collector = StorageCollector::new(dir.path().join("storage.cfg"), "pve");
        assert!(matches!(collector.collect(), Err(PvemonError::StorageConfigMissing { .. })));
    }

    #[test]
    fn test_collect_and_reparse_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("storage.cfg");
        std::fs::write(&cfg, format!("dir: local\n\tpath {}\n", dir.path().display())).unwrap();
        let collector = StorageCollector::new(&cfg, "pve");

        let families = collector.collect().unwrap();
        assert_eq!(families[0].name(), "pve_node_storage");
        assert_eq!(families[0].samples().len(), 1);
        assert_eq!(families[1].samples().len(), 1);

        std::fs::write(&cfg, "dir: local\n\tpath /nonexistent\nrbd: ceph\n\tpool vm\n").unwrap();
        let past = SystemTime::now() - std::time::Duration::from_secs(60);
        std::fs::File::options().write(true).open(&cfg).unwrap().set_modified(past).unwrap();
        let families = collector.collect().unwrap();
        assert_eq!(families[0].samples().len(), 2);
        assert!(families[1].samples().is_empty());
    }
}
