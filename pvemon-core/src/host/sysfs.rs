//! sysfs readers for interface counters and disk sizes.

use crate::error::{PvemonError, Result};
use crate::paths::HostPaths;
use crate::parser::{DiskRecord, DiskType};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::debug;

const SECTOR_SIZE: u64 = 512;
const QCOW2_MAGIC: &[u8; 4] = b"QFI\xfb";

/// Counters from `/sys/class/net/<ifname>/statistics`.
///
/// A missing interface yields an empty map; it may have gone away with its VM.
pub fn read_interface_stats(paths: &HostPaths, ifname: &str) -> BTreeMap<String, u64> {
    let dir = paths.interface_statistics(ifname);
    let mut stats = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        debug!(ifname, "no statistics directory");
        return stats;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        match std::fs::read_to_string(entry.path()).map(|s| s.trim().parse::<u64>()) {
            Ok(Ok(value)) => {
                stats.insert(name, value);
            }
            _ => debug!(ifname, stat = %name, "unreadable interface counter"),
        }
    }
    stats
}

/// Virtual size in bytes from a qcow2 image header.
pub fn qcow2_virtual_size(path: &Path) -> Result<u64> {
    let io_err = |e| PvemonError::IoError { path: path.to_path_buf(), source: e };
    let mut header = [0u8; 32];
    std::fs::File::open(path).and_then(|mut f| f.read_exact(&mut header)).map_err(io_err)?;
    if &header[..4] != QCOW2_MAGIC {
        return Err(PvemonError::Internal(format!("{} is not a qcow2 image", path.display())));
    }
    let mut size = [0u8; 8];
    size.copy_from_slice(&header[24..32]);
    Ok(u64::from_be_bytes(size))
}

/// Size in bytes of the storage behind a disk.
///
/// Block devices are read from sysfs, qcow2 images from their header, and
/// anything else from the file length. `None` when it cannot be determined.
pub fn disk_size(paths: &HostPaths, disk: &DiskRecord) -> Option<u64> {
    if let Some(device) = &disk.device {
        let sectors = std::fs::read_to_string(paths.block_size(device)).ok()?;
        return sectors.trim().parse::<u64>().ok().map(|n| n * SECTOR_SIZE);
    }
    let path = Path::new(&disk.disk_path);
    let size = match disk.disk_type {
        DiskType::Qcow2 => qcow2_virtual_size(path),
        DiskType::File => std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| PvemonError::IoError { path: path.to_path_buf(), source: e }),
        _ => return None,
    };
    match size {
        Ok(size) => Some(size),
        Err(e) => {
            debug!(disk = %disk.disk_name, error = %e, "failed to size disk");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_block_info, DeviceResolver};

    struct NoDevices;
    impl DeviceResolver for NoDevices {
        fn resolve(&self, _path: &str) -> Option<String> {
            None
        }
    }

    struct Zd16;
    impl DeviceResolver for Zd16 {
        fn resolve(&self, _path: &str) -> Option<String> {
            Some("zd16".to_string())
        }
    }

    #[test]
    fn test_interface_stats() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted_at(dir.path());
        let stats_dir = paths.interface_statistics("tap100i0");
        std::fs::create_dir_all(&stats_dir).unwrap();
        std::fs::write(stats_dir.join("rx_bytes"), "1024\n").unwrap();
        std::fs::write(stats_dir.join("tx_packets"), "12\n").unwrap();
        std::fs::write(stats_dir.join("broken"), "n/a\n").unwrap();

        let stats = read_interface_stats(&paths, "tap100i0");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["rx_bytes"], 1024);
        assert!(read_interface_stats(&paths, "tap999i0").is_empty());
    }

    #[test]
    fn test_disk_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted_at(dir.path());

        let mut header = Vec::from(&QCOW2_MAGIC[..]);
        header.extend_from_slice(&[0u8; 20]);
        header.extend_from_slice(&(32u64 * 1024 * 1024 * 1024).to_be_bytes());
        let qcow2 = dir.path().join("vm-100-disk-0.qcow2");
        std::fs::write(&qcow2, &header).unwrap();

        let raw = dir.path().join("vm-100-disk-1.raw");
        std::fs::write(&raw, vec![0u8; 4096]).unwrap();

        let text = format!(
            "drive-virtio0 (#block0): {} (qcow2)\ndrive-virtio1 (#block1): {} (raw)\n",
            qcow2.display(),
            raw.display()
        );
        let disks = parse_block_info(&text, &NoDevices);
        assert_eq!(disk_size(&paths, &disks["virtio0"]), Some(32 * 1024 * 1024 * 1024));
        assert_eq!(disk_size(&paths, &disks["virtio1"]), Some(4096));

        std::fs::create_dir_all(paths.block_size("zd16").parent().unwrap()).unwrap();
        std::fs::write(paths.block_size("zd16"), "2097152\n").unwrap();
        let zvol = parse_block_info("drive-scsi0 (#block2): /dev/zvol/rpool/data/vm-100-disk-0 (raw)\n", &Zd16);
        assert_eq!(disk_size(&paths, &zvol["scsi0"]), Some(1024 * 1024 * 1024));

        let lvm = parse_block_info("drive-scsi1 (#block3): /dev/pve/vm-100-disk-1 (raw)\n", &NoDevices);
        assert_eq!(disk_size(&paths, &lvm["scsi1"]), None);
    }
}
