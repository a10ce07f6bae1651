//! `info block` parser.
//!
//! QEMU prints one block per drive:
//!
//! ```text
//! drive-scsi0 (#block152): /dev/zvol/rpool/data/vm-100-disk-0 (raw)
//!     Attached to:      scsi0
//!     Cache mode:       writeback, direct
//!     Detect zeroes:    unmap
//! ```
//!
//! The path may also be a `json:{...}` block-driver descriptor, in which case
//! the nested `host_device` node names the real device.

use crate::error::{PvemonError, Result};
use crate::monitor::{MonitorCommand, MonitorContext, VmId};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

static DRIVE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\w+) \(#block(\d+)\): (.+) \(([\w, -]+)\)").expect("Invalid drive header regex")
});

static LVM_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/dev/([^/]+)/(vm-\d+-disk-\d+)").expect("Invalid LVM path regex")
});

/// A drive block starts with `drive-` at the beginning of a line. The marker
/// also shows up inside json descriptors (`throttle-drive-scsi0`).
static DRIVE_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*drive-").expect("Invalid drive marker regex"));

/// Storage backend of a virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskType {
    File,
    Qcow2,
    Zvol,
    Lvm,
    Rbd,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::File => "file",
            DiskType::Qcow2 => "qcow2",
            DiskType::Zvol => "zvol",
            DiskType::Lvm => "lvm",
            DiskType::Rbd => "rbd",
        }
    }

    /// Backends that sit on a host block device node.
    pub fn expects_device(&self) -> bool {
        matches!(self, DiskType::Zvol | DiskType::Lvm | DiskType::Rbd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    pub disk_name: String,
    pub block_id: String,
    pub disk_path: String,
    pub disk_type: DiskType,
    /// Driver string as reported by QEMU (`raw`, `qcow2`, ...).
    pub format: String,
    pub read_only: bool,
    pub vol_name: Option<String>,
    pub pool: Option<String>,
    pub vg_name: Option<String>,
    pub cluster_id: Option<String>,
    pub device: Option<String>,
    pub attached_to: Option<String>,
    pub cache_modes: BTreeSet<String>,
    pub detect_zeroes: Option<String>,
}

impl DiskRecord {
    /// True when the backend should have a device node but none was found.
    pub fn device_unresolved(&self) -> bool {
        self.disk_type.expects_device() && self.device.is_none()
    }

    /// Attribute map for the `kvm_disk` info series.
    pub fn to_info_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("disk_name".to_string(), self.disk_name.clone());
        map.insert("block_id".to_string(), self.block_id.clone());
        map.insert("disk_path".to_string(), self.disk_path.clone());
        map.insert("disk_type".to_string(), self.disk_type.as_str().to_string());
        map.insert("format".to_string(), self.format.clone());
        if self.read_only {
            map.insert("read_only".to_string(), "true".to_string());
        }

        let optional = [
            ("vol_name", &self.vol_name),
            ("vg_name", &self.vg_name),
            ("cluster_id", &self.cluster_id),
            ("device", &self.device),
            ("attached_to", &self.attached_to),
            ("detect_zeroes", &self.detect_zeroes),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                map.insert(key.to_string(), value.clone());
            }
        }
        if let Some(pool) = &self.pool {
            let key = if self.disk_type == DiskType::Rbd { "pool_name" } else { "pool" };
            map.insert(key.to_string(), pool.clone());
        }
        for mode in &self.cache_modes {
            map.insert(format!("cache_mode_{}", mode), "true".to_string());
        }
        map
    }
}

/// Resolves a device path to the kernel device name behind it.
pub trait DeviceResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Option<String>;
}

/// Follows symlinks on the live host, e.g. `/dev/zvol/rpool/data/vm-100-disk-0` to `zd16`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDeviceResolver;

impl DeviceResolver for HostDeviceResolver {
    fn resolve(&self, path: &str) -> Option<String> {
        let real = std::fs::canonicalize(path).ok()?;
        real.file_name().map(|name| name.to_string_lossy().into_owned())
    }
}

/// Parse `info block` output into records keyed by disk name.
///
/// Malformed blocks are skipped. EFI disks are never returned.
pub fn parse_block_info(raw: &str, resolver: &dyn DeviceResolver) -> BTreeMap<String, DiskRecord> {
    let mut disks = BTreeMap::new();
    for segment in DRIVE_START.split(raw).skip(1) {
        match parse_drive(segment.trim(), resolver) {
            Ok(Some(record)) => {
                disks.insert(record.disk_name.clone(), record);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "skipping disk"),
        }
    }
    disks
}

fn parse_drive(segment: &str, resolver: &dyn DeviceResolver) -> Result<Option<DiskRecord>> {
    let mut lines = segment.lines().map(str::trim);
    let header = lines.next().unwrap_or_default();
    let Some(caps) = DRIVE_HEADER.captures(header) else {
        debug!(line = header, "not a drive header");
        return Ok(None);
    };

    let disk_name = caps[1].to_string();
    if disk_name.contains("efidisk") {
        return Ok(None);
    }
    let block_id = caps[2].to_string();
    let flags: Vec<&str> = caps[4].split(", ").collect();
    let format = flags.first().copied().unwrap_or_default().to_string();
    let read_only = flags.contains(&"read-only");

    let disk_path = match caps[3].strip_prefix("json:") {
        Some(descriptor) => host_device_path(&disk_name, descriptor)?,
        None => caps[3].to_string(),
    };

    let mut record = DiskRecord {
        disk_name,
        block_id,
        disk_type: if format == "qcow2" { DiskType::Qcow2 } else { DiskType::File },
        format,
        read_only,
        vol_name: None,
        pool: None,
        vg_name: None,
        cluster_id: None,
        device: None,
        attached_to: None,
        cache_modes: BTreeSet::new(),
        detect_zeroes: None,
        disk_path,
    };
    classify_backend(&mut record);
    if record.disk_type.expects_device() {
        record.device = resolver.resolve(&record.disk_path);
    }

    // A blank line ends the drive block; anything after it belongs to
    // devices without a drive (empty CD-ROM slots and the like).
    for line in lines.take_while(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "Attached to" => record.attached_to = Some(normalize_attachment(value)),
            "Cache mode" => {
                record.cache_modes.extend(value.split(", ").filter(|m| !m.is_empty()).map(String::from));
            }
            "Detect zeroes" => record.detect_zeroes = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(Some(record))
}

fn classify_backend(record: &mut DiskRecord) {
    let path = record.disk_path.as_str();
    let segments: Vec<&str> = path.split('/').collect();

    if path.starts_with("/dev/zvol/") && segments.len() >= 5 {
        record.disk_type = DiskType::Zvol;
        record.pool = Some(segments[3..segments.len() - 1].join("/"));
        record.vol_name = segments.last().map(|s| s.to_string());
    } else if path.starts_with("/dev/rbd-pve/") && segments.len() >= 6 {
        let n = segments.len();
        record.disk_type = DiskType::Rbd;
        record.cluster_id = Some(segments[n - 3].to_string());
        record.pool = Some(segments[n - 2].to_string());
        record.vol_name = Some(segments[n - 1].to_string());
    } else if let Some(caps) = LVM_PATH.captures(path) {
        record.disk_type = DiskType::Lvm;
        record.vg_name = Some(caps[1].to_string());
        record.vol_name = Some(caps[2].to_string());
    } else if record.disk_type == DiskType::Qcow2 {
        record.vol_name = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.split('.').next())
            .map(String::from);
    }
}

/// `/machine/peripheral/virtio0/virtio-backend` becomes `virtio0`.
fn normalize_attachment(value: &str) -> String {
    if value.contains("virtio") {
        if let Some(segment) = value.split('/').nth(3) {
            return segment.to_string();
        }
    }
    value.to_string()
}

fn host_device_path(disk_name: &str, descriptor: &str) -> Result<String> {
    let tree: Value = serde_json::from_str(descriptor).map_err(|e| {
        PvemonError::UnrecognizedDiskLine { line: format!("{}: invalid json descriptor: {}", disk_name, e) }
    })?;
    find_host_device(&tree)
        .map(String::from)
        .ok_or_else(|| PvemonError::MissingHostDevice { disk: disk_name.to_string() })
}

fn find_host_device(node: &Value) -> Option<&str> {
    match node {
        Value::Object(map) => {
            if map.get("driver").and_then(Value::as_str) == Some("host_device") {
                if let Some(filename) = map.get("filename").and_then(Value::as_str) {
                    return Some(filename);
                }
            }
            map.values().find_map(find_host_device)
        }
        Value::Array(items) => items.iter().find_map(find_host_device),
        _ => None,
    }
}

/// Query and parse the disks of one VM.
///
/// A disk whose backend needs a device node that cannot be resolved usually
/// means the cached text predates a disk move. The cache entry is then
/// dropped and the query repeated, at most `max_retries` times. A refresh
/// that fails falls back to the disks parsed before it.
#[instrument(skip(ctx, resolver), fields(vm_id = %vmid))]
pub async fn extract_disk_info(
    ctx: &MonitorContext,
    vmid: &VmId,
    resolver: &Arc<dyn DeviceResolver>,
    max_retries: u32,
) -> Result<BTreeMap<String, DiskRecord>> {
    let mut attempt = 0;
    let mut previous: Option<BTreeMap<String, DiskRecord>> = None;
    loop {
        let output = match ctx.query(vmid, MonitorCommand::InfoBlock).await {
            Ok(output) => output,
            Err(e) => match previous.take() {
                Some(disks) => {
                    warn!(error = %e, attempt, "block info refresh failed, keeping previous result");
                    return Ok(disks);
                }
                None => return Err(e),
            },
        };
        // resolving device links touches the filesystem
        let shared = resolver.clone();
        let disks = tokio::task::spawn_blocking(move || parse_block_info(&output.raw_text, shared.as_ref()))
            .await
            .map_err(|e| PvemonError::Internal(format!("block info parse task failed: {}", e)))?;
        let unresolved: Vec<&str> =
            disks.values().filter(|d| d.device_unresolved()).map(|d| d.disk_name.as_str()).collect();

        if unresolved.is_empty() || attempt >= max_retries {
            if !unresolved.is_empty() {
                warn!(?unresolved, "device still unresolved after refresh");
            }
            return Ok(disks);
        }
        debug!(?unresolved, attempt, "unresolved device, refreshing cached block info");
        ctx.invalidate(vmid, MonitorCommand::InfoBlock);
        previous = Some(disks);
        attempt += 1;
    }
}
