//! pvemon core library
//!
//! Monitor sessions, output caching, parsers and concurrent collection for
//! the Proxmox VE KVM metrics exporter.

pub mod collector;
pub mod config;
pub mod error;
pub mod host;
pub mod monitor;
pub mod observability;
pub mod parser;
pub mod paths;
pub mod series;
pub mod storage;

// Re-export commonly used items
pub use collector::{CollectReport, PassStats, PveCollector};
pub use config::ExporterConfig;
pub use error::{PvemonError, Result};
pub use monitor::{MonitorClient, MonitorCommand, MonitorContext, SessionCommandResult, VmId};
pub use observability::{exposition::render_families, health::HealthChecker, init as init_observability};
pub use series::{FamilyKind, MetricFamily, SeriesRegistry, SeriesValue};
