//! QEMU process discovery through procfs.

use crate::error::{PvemonError, Result};
use crate::monitor::VmId;
use crate::paths::HostPaths;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: f64,
    pub system: f64,
    pub iowait: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_chars: u64,
    pub write_chars: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtxSwitches {
    pub voluntary: u64,
    pub involuntary: u64,
}

/// Snapshot of one running VM's QEMU process.
#[derive(Debug, Clone, PartialEq)]
pub struct VmProcess {
    pub pid: i32,
    pub vmid: VmId,
    pub cmdline: Vec<String>,
    pub cpu: CpuTimes,
    pub io: IoCounters,
    pub ctx_switches: CtxSwitches,
    pub num_threads: u64,
    pub memory_percent: f64,
    /// `Vm*`, `Rss*` and `Hugetlb*` lines of `/proc/<pid>/status`, in bytes.
    pub memory_extended: BTreeMap<String, u64>,
}

impl VmProcess {
    /// Value following `flag` on the command line, see [`flag_value`].
    pub fn flag(&self, flag: &str) -> String {
        flag_value(&self.cmdline, flag)
    }
}

/// Source of running VM processes.
pub trait ProcessTable: Send + Sync {
    /// Every QEMU process with a VM config on this node. Blocking.
    fn vm_processes(&self) -> Result<Vec<VmProcess>>;
}

/// First comma-separated piece of the argument after `flag`, or `"unknown"`.
pub fn flag_value(args: &[String], flag: &str) -> String {
    args.windows(2)
        .find(|pair| pair[0] == flag)
        .and_then(|pair| pair[1].split(',').next())
        .unwrap_or("unknown")
        .to_string()
}

/// Configured memory in bytes.
///
/// `-m 4096` is in MiB. With memory hotplug or NUMA the size is spread over
/// `memory-backend-ram` objects, which are summed instead.
pub fn parse_mem(args: &[String]) -> u64 {
    let m = flag_value(args, "-m");
    if let Ok(mib) = m.parse::<u64>() {
        return mib * 1024 * 1024;
    }

    let backends: u64 = args
        .iter()
        .filter(|arg| arg.contains("memory-backend-ram"))
        .filter_map(|arg| arg.split(',').find_map(|opt| opt.strip_prefix("size=")))
        .filter_map(parse_size)
        .sum();
    if backends > 0 {
        return backends;
    }
    m.strip_prefix("size=").and_then(parse_size).unwrap_or(0)
}

/// `2048M`, `4G` or a plain MiB count to bytes.
fn parse_size(value: &str) -> Option<u64> {
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => value.split_at(i),
        None => (value, "M"),
    };
    let n: u64 = digits.parse().ok()?;
    let mult = match unit {
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        "T" | "t" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(n * mult)
}

/// Reads `/proc` directly.
pub struct ProcFsTable {
    paths: HostPaths,
    qemu_binary: PathBuf,
    clock_ticks: f64,
}

impl ProcFsTable {
    pub fn new(paths: HostPaths, qemu_binary: impl Into<PathBuf>) -> Self {
        Self { paths, qemu_binary: qemu_binary.into(), clock_ticks: clock_ticks() }
    }

    /// Override the tick rate used to convert `/proc/<pid>/stat` times.
    pub fn with_clock_ticks(mut self, ticks: f64) -> Self {
        self.clock_ticks = ticks;
        self
    }

    fn pids(&self) -> Result<Vec<i32>> {
        let dir = std::fs::read_dir(&self.paths.proc_root)
            .map_err(|e| PvemonError::IoError { path: self.paths.proc_root.clone(), source: e })?;
        Ok(dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
            .collect())
    }

    fn is_qemu(&self, pid: i32) -> bool {
        match std::fs::read_link(self.paths.proc_pid(pid).join("exe")) {
            Ok(exe) => {
                let exe = exe.to_string_lossy();
                // An upgraded binary keeps running as "<path> (deleted)"
                Path::new(exe.trim_end_matches(" (deleted)")) == self.qemu_binary.as_path()
            }
            Err(_) => false,
        }
    }

    fn read_process(&self, pid: i32, total_memory: Option<u64>) -> Result<VmProcess> {
        let dir = self.paths.proc_pid(pid);
        let cmdline: Vec<String> = read(&dir.join("cmdline"))?
            .split('\0')
            .filter(|arg| !arg.is_empty())
            .map(String::from)
            .collect();

        let vmid = flag_value(&cmdline, "-id");
        if vmid == "unknown" {
            return Err(PvemonError::NotAVmProcess { pid, reason: "no -id flag".to_string() });
        }
        // Incoming migrations run before the config is moved to this node
        if !self.paths.vm_config(&vmid).exists() {
            return Err(PvemonError::NotAVmProcess { pid, reason: format!("no config for VM {}", vmid) });
        }

        let stat = parse_stat(&read(&dir.join("stat"))?, self.clock_ticks)
            .ok_or_else(|| PvemonError::Internal(format!("malformed /proc/{}/stat", pid)))?;
        let io = parse_io(&read(&dir.join("io"))?);
        let status = read(&dir.join("status"))?;
        let (ctx_switches, memory_extended) = parse_status(&status);

        let rss = memory_extended.get("vmrss").copied().unwrap_or(0);
        let memory_percent = match total_memory {
            Some(total) if total > 0 => rss as f64 / total as f64 * 100.0,
            _ => 0.0,
        };

        Ok(VmProcess {
            pid,
            vmid: VmId::new(vmid),
            cmdline,
            cpu: stat.cpu,
            io,
            ctx_switches,
            num_threads: stat.num_threads,
            memory_percent,
            memory_extended,
        })
    }

    fn total_memory(&self) -> Option<u64> {
        let meminfo = std::fs::read_to_string(self.paths.meminfo()).ok()?;
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix("MemTotal:"))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    }
}

impl ProcessTable for ProcFsTable {
    fn vm_processes(&self) -> Result<Vec<VmProcess>> {
        let total_memory = self.total_memory();
        let mut procs = Vec::new();
        for pid in self.pids()? {
            if !self.is_qemu(pid) {
                continue;
            }
            // Processes exit between listing and reading; skip them
            match self.read_process(pid, total_memory) {
                Ok(process) => procs.push(process),
                Err(e) => debug!(pid, error = %e, "skipping process"),
            }
        }
        procs.sort_by(|a, b| a.vmid.cmp(&b.vmid));
        trace!(count = procs.len(), "discovered VM processes");
        Ok(procs)
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| PvemonError::IoError { path: path.to_path_buf(), source: e })
}

fn clock_ticks() -> f64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

struct StatFields {
    cpu: CpuTimes,
    num_threads: u64,
}

/// Fields of `/proc/<pid>/stat`, counted from `state` (field 3) after the
/// parenthesized command name.
fn parse_stat(stat: &str, clock_ticks: f64) -> Option<StatFields> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |n: usize| -> Option<u64> { fields.get(n - 3)?.parse().ok() };

    Some(StatFields {
        cpu: CpuTimes {
            user: field(14)? as f64 / clock_ticks,
            system: field(15)? as f64 / clock_ticks,
            iowait: field(42).unwrap_or(0) as f64 / clock_ticks,
        },
        num_threads: field(20)?,
    })
}

fn parse_io(io: &str) -> IoCounters {
    let mut counters = IoCounters::default();
    for line in io.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let Ok(value) = value.trim().parse::<u64>() else { continue };
        match key.trim() {
            "syscr" => counters.read_count = value,
            "syscw" => counters.write_count = value,
            "read_bytes" => counters.read_bytes = value,
            "write_bytes" => counters.write_bytes = value,
            "rchar" => counters.read_chars = value,
            "wchar" => counters.write_chars = value,
            _ => {}
        }
    }
    counters
}

fn parse_status(status: &str) -> (CtxSwitches, BTreeMap<String, u64>) {
    let mut ctx = CtxSwitches::default();
    let mut memory = BTreeMap::new();
    for line in status.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else { continue };
        let key = key.trim_end_matches(':');
        let Ok(value) = value.parse::<u64>() else { continue };

        match key {
            "voluntary_ctxt_switches" => ctx.voluntary = value,
            "nonvoluntary_ctxt_switches" => ctx.involuntary = value,
            _ if ["Vm", "Rss", "Hugetlb"].iter().any(|p| key.starts_with(p)) => {
                if parts.next() == Some("kB") {
                    memory.insert(key.to_lowercase(), value * 1024);
                }
            }
            _ => {}
        }
    }
    (ctx, memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_flag_value() {
        let cmdline = args("/usr/bin/kvm -id 100 -name web01,debug-threads=on -smp 4,sockets=1 -cpu host,+kvm_pv_eoi");
        assert_eq!(flag_value(&cmdline, "-id"), "100");
        assert_eq!(flag_value(&cmdline, "-name"), "web01");
        assert_eq!(flag_value(&cmdline, "-smp"), "4");
        assert_eq!(flag_value(&cmdline, "-cpu"), "host");
        assert_eq!(flag_value(&cmdline, "-machine"), "unknown");
    }

    #[test]
    fn test_parse_mem() {
        assert_eq!(parse_mem(&args("-id 100 -m 2048")), 2048 * 1024 * 1024);

        let numa = args(
            "-m size=4096,slots=255,maxmem=4194304M \
             -object memory-backend-ram,id=ram-node0,size=2048M \
             -object memory-backend-ram,id=ram-node1,size=2G",
        );
        assert_eq!(parse_mem(&numa), 4096 * 1024 * 1024);

        assert_eq!(parse_mem(&args("-m size=1024,slots=255")), 1024 * 1024 * 1024);
        assert_eq!(parse_mem(&args("-id 100")), 0);
    }

    #[test]
    fn test_parse_stat() {
        let stat = "4242 (kvm) S 1 4242 4242 0 -1 138412416 1234 0 0 0 500 250 0 0 20 0 7 0 123456 5000000 1000 18446744073709551615 1 1 0 0 0 0 0 4096 0 0 0 0 17 3 0 0 30 0 0";
        let fields = parse_stat(stat, 100.0).unwrap();
        assert_eq!(fields.cpu.user, 5.0);
        assert_eq!(fields.cpu.system, 2.5);
        assert_eq!(fields.cpu.iowait, 0.3);
        assert_eq!(fields.num_threads, 7);
    }

    #[test]
    fn test_parse_status() {
        let status = "Name:\tkvm\nVmPeak:\t 5000 kB\nVmRSS:\t 2048 kB\nRssAnon:\t 1024 kB\nHugetlbPages:\t 0 kB\nThreads:\t7\nvoluntary_ctxt_switches:\t42\nnonvoluntary_ctxt_switches:\t7\n";
        let (ctx, memory) = parse_status(status);
        assert_eq!(ctx, CtxSwitches { voluntary: 42, involuntary: 7 });
        assert_eq!(memory["vmrss"], 2048 * 1024);
        assert_eq!(memory["rssanon"], 1024 * 1024);
        assert_eq!(memory["hugetlbpages"], 0);
        assert!(!memory.contains_key("threads"));
    }

    #[cfg(unix)]
    #[test]
    fn test_procfs_table_reads_fake_tree() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::rooted_at(dir.path());
        let qemu = dir.path().join("qemu-system-x86_64");
        std::fs::write(&qemu, "").unwrap();
        std::fs::create_dir_all(&paths.qemu_conf_dir).unwrap();
        std::fs::write(paths.vm_config("100"), "memory: 2048\n").unwrap();
        std::fs::create_dir_all(&paths.proc_root).unwrap();
        std::fs::write(paths.meminfo(), "MemTotal:       8192 kB\n").unwrap();

        for (pid, vmid) in [(4242, "100"), (4343, "101")] {
            let proc_dir = paths.proc_pid(pid);
            std::fs::create_dir_all(&proc_dir).unwrap();
            std::os::unix::fs::symlink(&qemu, proc_dir.join("exe")).unwrap();
            std::fs::write(proc_dir.join("cmdline"), format!("/usr/bin/kvm\0-id\0{}\0-m\02048\0", vmid)).unwrap();
            std::fs::write(
                proc_dir.join("stat"),
                format!("{} (kvm) S 1 1 1 0 -1 0 0 0 0 0 100 50 0 0 20 0 3 0 1 1 1", pid),
            )
            .unwrap();
            std::fs::write(proc_dir.join("io"), "rchar: 10\nwchar: 20\nsyscr: 1\nsyscw: 2\nread_bytes: 4096\nwrite_bytes: 8192\n").unwrap();
            std::fs::write(proc_dir.join("status"), "VmRSS:\t 4096 kB\nvoluntary_ctxt_switches:\t5\nnonvoluntary_ctxt_switches:\t6\n").unwrap();
        }
        // Not a VM
        std::fs::create_dir_all(paths.proc_pid(1)).unwrap();

        let table = ProcFsTable::new(paths, &qemu).with_clock_ticks(100.0);
        let procs = table.vm_processes().unwrap();

        // 101 has no config file and is skipped
        assert_eq!(procs.len(), 1);
        let vm = &procs[0];
        assert_eq!(vm.vmid, VmId::from("100"));
        assert_eq!(vm.pid, 4242);
        assert_eq!(vm.cpu.user, 1.0);
        assert_eq!(vm.num_threads, 3);
        assert_eq!(vm.io.read_bytes, 4096);
        assert_eq!(vm.io.write_chars, 20);
        assert_eq!(vm.ctx_switches.involuntary, 6);
        assert_eq!(vm.memory_percent, 50.0);
        assert_eq!(parse_mem(&vm.cmdline), 2048 * 1024 * 1024);
    }
}
