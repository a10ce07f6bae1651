use crate::config::prefixed;
use crate::series::MetricFamily;

/// Families with names known up front, rebuilt on every pass.
pub struct KvmFamilies {
    pub kvm_info: MetricFamily,
    pub cpu: MetricFamily,
    pub vcores: MetricFamily,
    pub maxmem: MetricFamily,
    pub memory_percent: MetricFamily,
    pub memory_extended: MetricFamily,
    pub threads: MetricFamily,
    pub io_read_count: MetricFamily,
    pub io_read_bytes: MetricFamily,
    pub io_read_chars: MetricFamily,
    pub ctx_switches: MetricFamily,
    pub io_write_count: MetricFamily,
    pub io_write_bytes: MetricFamily,
    pub io_write_chars: MetricFamily,
    pub nic_queues: MetricFamily,
    pub disk_size: MetricFamily,
}

impl KvmFamilies {
    pub fn new(prefix: &str) -> Self {
        let gauge = |name: &str, help: &str, labels: &[&str]| {
            MetricFamily::gauge(prefixed(prefix, name), help, labels.iter().copied())
        };
        Self {
            kvm_info: MetricFamily::info(
                prefixed(prefix, "kvm"),
                "information for each KVM process",
                Vec::<String>::new(),
            ),
            cpu: gauge("kvm_cpu", "CPU time for VM", &["id", "mode"]),
            vcores: gauge("kvm_vcores", "vCores allocated to the VM", &["id"]),
            maxmem: gauge("kvm_maxmem", "Maximum memory (bytes) allocated to the VM", &["id"]),
            memory_percent: gauge("kvm_memory_percent", "Percentage of host memory used by VM", &["id"]),
            memory_extended: gauge("kvm_memory_extended", "Detailed memory metrics for VM", &["id", "type"]),
            threads: gauge("kvm_threads", "Threads used by the KVM process", &["id"]),
            io_read_count: gauge(
                "kvm_io_read_count",
                "Number of read system calls made by the KVM process",
                &["id"],
            ),
            io_read_bytes: gauge("kvm_io_read_bytes", "Number of bytes read from disk", &["id"]),
            io_read_chars: gauge("kvm_io_read_chars", "Number of bytes read including buffers", &["id"]),
            ctx_switches: gauge("kvm_ctx_switches", "Context switches", &["id", "type"]),
            io_write_count: gauge(
                "kvm_io_write_count",
                "Number of write system calls made by the KVM process",
                &["id"],
            ),
            io_write_bytes: gauge("kvm_io_write_bytes", "Number of bytes written to disk", &["id"]),
            io_write_chars: gauge("kvm_io_write_chars", "Number of bytes written including buffers", &["id"]),
            nic_queues: gauge("kvm_nic_queues", "Number of queues in multiqueue config", &["id", "ifname"]),
            disk_size: gauge("kvm_disk_size", "Size of virtual disk", &["id", "disk_name"]),
        }
    }

    /// Gauge families in exposition order.
    pub fn into_gauges(self) -> Vec<MetricFamily> {
        vec![
            self.cpu,
            self.vcores,
            self.maxmem,
            self.memory_percent,
            self.memory_extended,
            self.threads,
            self.io_read_count,
            self.io_read_bytes,
            self.io_read_chars,
            self.ctx_switches,
            self.io_write_count,
            self.io_write_bytes,
            self.io_write_chars,
            self.nic_queues,
            self.disk_size,
        ]
    }

    /// Split into the `kvm` info family and the gauges.
    pub fn into_parts(self) -> (MetricFamily, Vec<MetricFamily>) {
        let info = self.kvm_info.snapshot();
        (info, self.into_gauges())
    }

    pub fn snapshot(&self) -> Self {
        Self {
            kvm_info: self.kvm_info.snapshot(),
            cpu: self.cpu.snapshot(),
            vcores: self.vcores.snapshot(),
            maxmem: self.maxmem.snapshot(),
            memory_percent: self.memory_percent.snapshot(),
            memory_extended: self.memory_extended.snapshot(),
            threads: self.threads.snapshot(),
            io_read_count: self.io_read_count.snapshot(),
            io_read_bytes: self.io_read_bytes.snapshot(),
            io_read_chars: self.io_read_chars.snapshot(),
            ctx_switches: self.ctx_switches.snapshot(),
            io_write_count: self.io_write_count.snapshot(),
            io_write_bytes: self.io_write_bytes.snapshot(),
            io_write_chars: self.io_write_chars.snapshot(),
            nic_queues: self.nic_queues.snapshot(),
            disk_size: self.disk_size.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_names_are_prefixed() {
        let families = KvmFamilies::new("pve");
        assert_eq!(families.kvm_info.name(), "pve_kvm");
        let (_, gauges) = families.into_parts();
        assert_eq!(gauges.len(), 15);
        assert_eq!(gauges[0].name(), "pve_kvm_cpu");
        assert_eq!(gauges[14].label_names(), ["id", "disk_name"]);

        let bare = KvmFamilies::new("");
        assert_eq!(bare.disk_size.name(), "kvm_disk_size");
    }
}
