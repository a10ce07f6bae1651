//! Error types for pvemon.
//!
//! All errors use `thiserror` so callers get proper error chains. Session and
//! parse errors carry the VM id they belong to so log lines can be correlated.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pvemon operations.
pub type Result<T> = std::result::Result<T, PvemonError>;

/// Main error type for pvemon.
#[derive(Error, Debug)]
pub enum PvemonError {
    // Monitor session errors
    #[error("Failed to spawn monitor session for VM {vmid}: {source}")]
    SessionSpawn {
        vmid: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Monitor session for VM {vmid} timed out after {timeout:?} waiting for prompt ({phase})")]
    SessionTimeout { vmid: String, phase: &'static str, timeout: Duration },

    #[error("Monitor session for VM {vmid} closed before the prompt appeared")]
    SessionClosed { vmid: String },

    #[error("Monitor session I/O failed for VM {vmid}: {source}")]
    SessionIo {
        vmid: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to terminate monitor session for VM {vmid}: {reason}")]
    TeardownFailure { vmid: String, reason: String },

    #[error("{count} monitor session(s) still open after {grace:?}: {vmids:?}")]
    UnterminatedSessions { count: usize, grace: Duration, vmids: Vec<String> },

    // Parse errors
    #[error("No host_device driver in JSON descriptor of disk {disk}")]
    MissingHostDevice { disk: String },

    #[error("Unrecognized disk line: {line}")]
    UnrecognizedDiskLine { line: String },

    #[error("NIC {netdev} is missing required keys: {missing:?}")]
    UnrecognizedNicLine { netdev: String, missing: Vec<&'static str> },

    // Storage errors
    #[error("Storage configuration not found at {path:?}")]
    StorageConfigMissing { path: PathBuf },

    // Metric family errors
    #[error("Metric {family} expects {expected} label values, got {actual}")]
    LabelMismatch { family: String, expected: usize, actual: usize },

    // Host errors
    #[error("Process {pid} is not a VM process: {reason}")]
    NotAVmProcess { pid: i32, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PvemonError {
    /// Short, stable label for the failure class. Used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            PvemonError::SessionSpawn { .. } => "session_spawn",
            PvemonError::SessionTimeout { .. } => "session_timeout",
            PvemonError::SessionClosed { .. } => "session_closed",
            PvemonError::SessionIo { .. } => "session_io",
            PvemonError::TeardownFailure { .. } => "teardown",
            PvemonError::UnterminatedSessions { .. } => "unterminated_sessions",
            PvemonError::MissingHostDevice { .. } => "missing_host_device",
            PvemonError::UnrecognizedDiskLine { .. } => "unrecognized_disk_line",
            PvemonError::UnrecognizedNicLine { .. } => "unrecognized_nic_line",
            PvemonError::StorageConfigMissing { .. } => "storage_config_missing",
            PvemonError::LabelMismatch { .. } => "label_mismatch",
            PvemonError::NotAVmProcess { .. } => "not_a_vm",
            PvemonError::IoError { .. } => "io",
            PvemonError::InvalidConfig { .. } => "invalid_config",
            PvemonError::Internal(_) => "internal",
            PvemonError::Other(_) => "other",
        }
    }
}
