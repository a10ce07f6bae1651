//! Scrape-time collection across all running VMs.
//!
//! A pass enumerates the QEMU processes, records the per-process gauges
//! inline, then fans one NIC unit and one disk unit per VM out to a bounded
//! pool of tokio tasks. Units talk to `qm monitor` through the shared
//! [`MonitorContext`]; their failures only drop that VM's series.

use crate::config::{prefixed, ExporterConfig};
use crate::error::{PvemonError, Result};
use crate::host::{disk_size, parse_mem, read_interface_stats, ProcFsTable, ProcessTable, VmProcess};
use crate::monitor::{MonitorContext, VmId};
use crate::observability::metrics::{counter_name, UNIT_FAILURES_TOTAL};
use crate::parser::{extract_disk_info, extract_nic_info, DeviceResolver, HostDeviceResolver};
use crate::paths::HostPaths;
use crate::series::{MetricFamily, SeriesValue};
use crate::storage::StorageCollector;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

mod families;

pub use families::KvmFamilies;

const NIC_LABELS: [&str; 2] = ["id", "ifname"];
const DISK_LABELS: [&str; 2] = ["id", "disk_name"];

/// Outcome of one collection pass.
#[derive(Debug)]
pub struct CollectReport {
    /// Families in exposition order: static infos, dynamic infos, static
    /// gauges, dynamic gauges, storage.
    pub families: Vec<MetricFamily>,
    /// Set when deferred sessions stayed open past the grace period.
    pub escalation: Option<PvemonError>,
    /// Set when the storage pass failed; the KVM families are unaffected.
    pub storage_error: Option<PvemonError>,
    pub stats: PassStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PassStats {
    pub duration: Duration,
    pub vm_count: usize,
    pub failed_units: usize,
    pub deferred_sessions: usize,
    pub cache_entries: usize,
    pub dynamic_series: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Nic,
    Disk,
}

impl UnitKind {
    fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Nic => "nic",
            UnitKind::Disk => "disk",
        }
    }
}

/// Collector behind the `/metrics` endpoint.
pub struct PveCollector {
    ctx: Arc<MonitorContext>,
    processes: Arc<dyn ProcessTable>,
    resolver: Arc<dyn DeviceResolver>,
    storage: Option<Arc<StorageCollector>>,
    paths: HostPaths,
    prefix: String,
    collect_running_vms: bool,
    max_workers: usize,
    stale_block_retries: u32,
    defer_grace: Duration,
    // Dynamic families are shared; two passes must not interleave samples
    pass_lock: Mutex<()>,
}

impl PveCollector {
    pub fn new(
        config: &ExporterConfig,
        ctx: Arc<MonitorContext>,
        processes: Arc<dyn ProcessTable>,
        resolver: Arc<dyn DeviceResolver>,
    ) -> Self {
        let storage = config
            .collect_storage
            .then(|| Arc::new(StorageCollector::new(&config.paths.storage_cfg, &config.metrics_prefix)));
        Self {
            ctx,
            processes,
            resolver,
            storage,
            paths: config.paths.clone(),
            prefix: config.metrics_prefix.clone(),
            collect_running_vms: config.collect_running_vms,
            max_workers: config.max_workers,
            stale_block_retries: config.stale_block_retries,
            defer_grace: config.defer_grace(),
            pass_lock: Mutex::new(()),
        }
    }

    /// Wire the collector to the live host.
    pub fn from_config(config: &ExporterConfig) -> Self {
        let ctx = Arc::new(MonitorContext::from_config(config));
        let processes = Arc::new(ProcFsTable::new(config.paths.clone(), &config.qemu_binary));
        Self::new(config, ctx, processes, Arc::new(HostDeviceResolver))
    }

    pub fn context(&self) -> &Arc<MonitorContext> {
        &self.ctx
    }

    /// Run one full pass. Never fails as a whole; see [`CollectReport`].
    #[instrument(skip(self))]
    pub async fn collect(self: &Arc<Self>) -> CollectReport {
        let _pass = self.pass_lock.lock().await;
        let started = Instant::now();
        let mut families = Vec::new();
        let mut stats = PassStats::default();
        let mut escalation = None;
        let mut storage_error = None;

        if self.collect_running_vms {
            let (kvm, vm_count, failed_units) = self.collect_kvm().await;
            families.extend(kvm);
            stats.vm_count = vm_count;
            stats.failed_units = failed_units;

            if let Err(e) = self.ctx.deferred().retry_all(self.defer_grace).await {
                error!(error = %e, "monitor sessions could not be terminated");
                escalation = Some(e);
            }
        }

        if let Some(storage) = &self.storage {
            let storage = storage.clone();
            match tokio::task::spawn_blocking(move || storage.collect()).await {
                Ok(Ok(storage_families)) => families.extend(storage_families),
                Ok(Err(e)) => {
                    error!(error = %e, "storage collection failed");
                    storage_error = Some(e);
                }
                Err(e) => {
                    error!(error = %e, "storage collection task failed");
                    storage_error = Some(PvemonError::Internal(format!("storage task failed: {}", e)));
                }
            }
        }

        stats.duration = started.elapsed();
        stats.deferred_sessions = self.ctx.deferred().len();
        stats.cache_entries = self.ctx.cache().len();
        stats.dynamic_series = self.ctx.series().created();
        info!(
            vms = stats.vm_count,
            failed_units = stats.failed_units,
            duration_ms = stats.duration.as_millis() as u64,
            "collection pass finished"
        );

        CollectReport { families, escalation, storage_error, stats }
    }

    /// Returns the KVM families, the number of VMs seen and the number of
    /// failed units.
    async fn collect_kvm(self: &Arc<Self>) -> (Vec<MetricFamily>, usize, usize) {
        let table = self.processes.clone();
        let procs = match tokio::task::spawn_blocking(move || table.vm_processes()).await {
            Ok(Ok(procs)) => procs,
            Ok(Err(e)) => {
                error!(error = %e, "failed to enumerate VM processes");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "process enumeration task failed");
                Vec::new()
            }
        };

        let statics = Arc::new(KvmFamilies::new(&self.prefix));
        let series = self.ctx.series();
        series.clear_samples();

        for process in &procs {
            if let Err(e) = record_process(&statics, process) {
                warn!(vm_id = %process.vmid, error = %e, "failed to record process metrics");
            }
        }

        let failed_units = self.run_units(&statics, procs.iter().map(|p| p.vmid.clone())).await;

        let statics = Arc::try_unwrap(statics).unwrap_or_else(|shared| shared.snapshot());
        let (kvm_info, gauges) = statics.into_parts();
        let mut families = vec![kvm_info];
        families.extend(series.infos().iter().filter(|f| !f.is_empty()).map(|f| f.snapshot()));
        families.extend(gauges);
        families.extend(series.gauges().iter().filter(|f| !f.is_empty()).map(|f| f.snapshot()));
        (families, procs.len(), failed_units)
    }

    /// Dispatch a NIC and a disk unit per VM, at most `max_workers` at a time.
    async fn run_units(
        self: &Arc<Self>,
        statics: &Arc<KvmFamilies>,
        vmids: impl Iterator<Item = VmId>,
    ) -> usize {
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut units = JoinSet::new();

        for vmid in vmids {
            for kind in [UnitKind::Nic, UnitKind::Disk] {
                let this = self.clone();
                let statics = statics.clone();
                let permits = permits.clone();
                let vmid = vmid.clone();
                units.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let result = match kind {
                        UnitKind::Nic => this.nic_unit(&statics, &vmid).await,
                        UnitKind::Disk => this.disk_unit(&statics, &vmid).await,
                    };
                    (vmid, kind, result)
                });
            }
        }

        let mut failed = 0;
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => {}
                Ok((vmid, kind, Err(e))) => {
                    warn!(vm_id = %vmid, unit = kind.as_str(), error = %e, "collection unit failed");
                    metrics::counter!(
                        counter_name(UNIT_FAILURES_TOTAL),
                        "unit" => kind.as_str(),
                        "reason" => e.kind()
                    )
                    .increment(1);
                    failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "collection unit panicked");
                    failed += 1;
                }
            }
        }
        failed
    }

    async fn nic_unit(&self, statics: &KvmFamilies, vmid: &VmId) -> Result<()> {
        let nics = extract_nic_info(&self.ctx, vmid).await?;
        let paths = self.paths.clone();
        let nics = blocking(move || {
            nics.into_iter()
                .map(|nic| {
                    let stats = read_interface_stats(&paths, &nic.ifname);
                    (nic, stats)
                })
                .collect::<Vec<_>>()
        })
        .await?;

        let series = self.ctx.series();
        let nic_info = series.info(&prefixed(&self.prefix, "kvm_nic"), &NIC_LABELS);

        for (nic, stats) in nics {
            let labels = [vmid.as_str(), nic.ifname.as_str()];
            nic_info.add_metric(labels, SeriesValue::Info(nic.to_info_map()))?;
            statics.nic_queues.add_metric(labels, SeriesValue::Gauge(nic.queue_count as f64))?;

            for (stat, value) in stats {
                let name = prefixed(&self.prefix, &format!("kvm_nic_{}", stat));
                series.gauge(&name, &NIC_LABELS).add_metric(labels, SeriesValue::Gauge(value as f64))?;
            }
        }
        Ok(())
    }

    async fn disk_unit(&self, statics: &KvmFamilies, vmid: &VmId) -> Result<()> {
        let disks = extract_disk_info(&self.ctx, vmid, &self.resolver, self.stale_block_retries).await?;
        let paths = self.paths.clone();
        let disks = blocking(move || {
            disks
                .into_iter()
                .map(|(disk_name, disk)| {
                    let size = disk_size(&paths, &disk);
                    (disk_name, disk, size)
                })
                .collect::<Vec<_>>()
        })
        .await?;
        let disk_info = self.ctx.series().info(&prefixed(&self.prefix, "kvm_disk"), &DISK_LABELS);

        for (disk_name, disk, size) in disks {
            let labels = [vmid.as_str(), disk_name.as_str()];
            disk_info.add_metric(labels, SeriesValue::Info(disk.to_info_map()))?;
            match size {
                Some(size) => statics.disk_size.add_metric(labels, SeriesValue::Gauge(size as f64))?,
                None => debug!(vm_id = %vmid, disk = %disk_name, "disk size unavailable"),
            }
        }
        Ok(())
    }
}

/// Run sysfs and image header reads off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PvemonError::Internal(format!("blocking task failed: {}", e)))
}

/// Gauges derived from the process table alone.
fn record_process(families: &KvmFamilies, process: &VmProcess) -> Result<()> {
    let id = process.vmid.as_str();
    let gauge = SeriesValue::Gauge;

    let info = BTreeMap::from([
        ("id".to_string(), id.to_string()),
        ("name".to_string(), process.flag("-name")),
        ("cpu".to_string(), process.flag("-cpu")),
        ("pid".to_string(), process.pid.to_string()),
    ]);
    families.kvm_info.add_metric(Vec::<String>::new(), SeriesValue::Info(info))?;

    let vcores = process.flag("-smp").parse::<f64>().unwrap_or(0.0);
    families.vcores.add_metric([id], gauge(vcores))?;
    families.maxmem.add_metric([id], gauge(parse_mem(&process.cmdline) as f64))?;
    families.memory_percent.add_metric([id], gauge(process.memory_percent))?;
    families.threads.add_metric([id], gauge(process.num_threads as f64))?;

    let cpu = &process.cpu;
    for (mode, seconds) in [("user", cpu.user), ("system", cpu.system), ("iowait", cpu.iowait)] {
        families.cpu.add_metric([id, mode], gauge(seconds))?;
    }

    let io = &process.io;
    families.io_read_count.add_metric([id], gauge(io.read_count as f64))?;
    families.io_read_bytes.add_metric([id], gauge(io.read_bytes as f64))?;
    families.io_read_chars.add_metric([id], gauge(io.read_chars as f64))?;
    families.io_write_count.add_metric([id], gauge(io.write_count as f64))?;
    families.io_write_bytes.add_metric([id], gauge(io.write_bytes as f64))?;
    families.io_write_chars.add_metric([id], gauge(io.write_chars as f64))?;

    let switches = &process.ctx_switches;
    families.ctx_switches.add_metric([id, "voluntary"], gauge(switches.voluntary as f64))?;
    families.ctx_switches.add_metric([id, "involuntary"], gauge(switches.involuntary as f64))?;

    for (kind, bytes) in &process.memory_extended {
        families.memory_extended.add_metric([id, kind.as_str()], gauge(*bytes as f64))?;
    }
    Ok(())
}
