//! QEMU monitor access through `qm monitor`.
//!
//! The [`MonitorClient`] trait is the seam between the collectors and the
//! interactive session. [`MonitorContext`] bundles the client with the
//! process-wide state shared by every collection pass: the output cache, the
//! deferred-close registry and the dynamic series registry.

use crate::config::ExporterConfig;
use crate::error::Result;
use crate::observability::metrics::{counter_name, MONITOR_CACHE_MISSES_TOTAL};
use crate::series::SeriesRegistry;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

pub mod cache;
pub mod deferred;
pub mod qm;

pub use cache::{CacheKey, TtlCache};
pub use deferred::{DeferredCloseRegistry, DeferredSession};
pub use qm::QmMonitorClient;

/// Identifier of a running VM, as passed to `qm` and QEMU's `-id` flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(String);

impl VmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VmId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Commands the exporter issues on the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MonitorCommand {
    InfoBlock,
    InfoNetwork,
}

impl MonitorCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorCommand::InfoBlock => "info block",
            MonitorCommand::InfoNetwork => "info network",
        }
    }
}

impl fmt::Display for MonitorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output of one monitor command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommandResult {
    pub vmid: VmId,
    pub command: MonitorCommand,
    pub raw_text: String,
    pub captured_at: SystemTime,
}

impl SessionCommandResult {
    pub fn new(vmid: VmId, command: MonitorCommand, raw_text: impl Into<String>) -> Self {
        Self { vmid, command, raw_text: raw_text.into(), captured_at: SystemTime::now() }
    }
}

/// Runs a single command against a VM's monitor.
///
/// Implementations must always try to tear the session down before
/// returning, whether the command succeeded or not.
#[async_trait]
pub trait MonitorClient: Send + Sync {
    async fn run(&self, vmid: &VmId, command: MonitorCommand) -> Result<SessionCommandResult>;
}

/// A session process that can be closed later.
///
/// Sessions whose first close attempt failed are parked in the
/// [`DeferredCloseRegistry`] as boxed handles.
#[async_trait]
pub trait SessionHandle: Send {
    fn vmid(&self) -> &VmId;

    /// Terminate the session, waiting at most `timeout`.
    async fn close(&mut self, timeout: Duration) -> Result<()>;
}

/// Shared state for every collection pass.
pub struct MonitorContext {
    client: Arc<dyn MonitorClient>,
    cache: TtlCache<CacheKey, Arc<SessionCommandResult>>,
    deferred: Arc<DeferredCloseRegistry>,
    series: SeriesRegistry,
}

impl MonitorContext {
    pub fn new(
        client: Arc<dyn MonitorClient>,
        deferred: Arc<DeferredCloseRegistry>,
        ttl: Duration,
        jitter: Duration,
    ) -> Self {
        Self { client, cache: TtlCache::new(ttl, jitter), deferred, series: SeriesRegistry::new() }
    }

    /// Build the production context: `qm monitor` sessions, with failed
    /// teardowns parked in a fresh registry when deferred close is enabled.
    pub fn from_config(config: &ExporterConfig) -> Self {
        let deferred = Arc::new(DeferredCloseRegistry::new(config.close_timeout()));
        let client = QmMonitorClient::new(
            config.qm_binary.clone(),
            config.terminal_timeout(),
            config.close_timeout(),
            config.qm_monitor_defer_close.then(|| deferred.clone()),
        );
        Self::new(Arc::new(client), deferred, config.cache_ttl(), config.cache_jitter())
    }

    /// Run `command` on `vmid`, answering from the cache while the entry is fresh.
    pub async fn query(
        &self,
        vmid: &VmId,
        command: MonitorCommand,
    ) -> Result<Arc<SessionCommandResult>> {
        let key = CacheKey::new(vmid.clone(), command);
        let client = &self.client;
        self.cache
            .get_or_compute(key, || async move {
                debug!(vm_id = %vmid, %command, "monitor cache miss");
                metrics::counter!(counter_name(MONITOR_CACHE_MISSES_TOTAL), "command" => command.as_str())
                    .increment(1);
                client.run(vmid, command).await.map(Arc::new)
            })
            .await
    }

    pub fn invalidate(&self, vmid: &VmId, command: MonitorCommand) {
        self.cache.invalidate(&CacheKey::new(vmid.clone(), command));
    }

    pub fn cache(&self) -> &TtlCache<CacheKey, Arc<SessionCommandResult>> {
        &self.cache
    }

    pub fn deferred(&self) -> &Arc<DeferredCloseRegistry> {
        &self.deferred
    }

    pub fn series(&self) -> &SeriesRegistry {
        &self.series
    }
}
