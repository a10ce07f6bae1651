//! Host-side data sources: the process table and sysfs.

pub mod proc;
pub mod sysfs;

pub use proc::{flag_value, parse_mem, CpuTimes, CtxSwitches, IoCounters, ProcFsTable, ProcessTable, VmProcess};
pub use sysfs::{disk_size, qcow2_virtual_size, read_interface_stats};
