//! Parsers for human-readable `qm monitor` output.

pub mod block;
pub mod network;

pub use block::{extract_disk_info, parse_block_info, DeviceResolver, DiskRecord, DiskType, HostDeviceResolver};
pub use network::{extract_nic_info, parse_network_info, NicRecord};
