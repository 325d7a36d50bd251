use super::client::MonitoringClient;
use crate::client::Message;
use crate::helpers;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use sysinfo::{Disks, ProcessRefreshKind, ProcessesToUpdate, System};

pub const METHOD: &str = "host_info.get";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostInfoType {
    Memory,
    Cpu,
    Filesystem,
    Procs,
}

impl FromStr for HostInfoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MEMORY" => Ok(HostInfoType::Memory),
            "CPU" => Ok(HostInfoType::Cpu),
            "FILESYSTEM" => Ok(HostInfoType::Filesystem),
            "PROCS" => Ok(HostInfoType::Procs),
            _ => Err(format!("unknown host info type: {}", s)),
        }
    }
}

/// Answer a `host_info.get` request.
///
/// Unknown or missing types get an empty result rather than an error reply.
pub async fn host_info_get(client: Arc<MonitoringClient>, msg: Message) {
    let requested = msg.param_str("type").map(str::to_string);
    log::debug!("[agent] host_info.get type={:?} datacenter={}", requested, client.datacenter());

    let result = match requested.as_deref().map(HostInfoType::from_str) {
        Some(Ok(kind)) => match tokio::task::spawn_blocking(move || collect(kind)).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("[agent] host info collection for {:?} failed: {}", kind, e);
                json!({})
            }
        },
        _ => {
            log::error!("[agent] host info not implemented: type={:?}", requested);
            json!({})
        }
    };

    if let Err(e) = client.respond(&msg, result).await {
        log::warn!("[agent] failed to answer host_info.get {}: {}", msg.id, e);
    }
}

/// Gather one report. Blocking; CPU sampling alone waits for a refresh interval.
pub fn collect(kind: HostInfoType) -> Value {
    let metrics = match kind {
        HostInfoType::Memory => memory(),
        HostInfoType::Cpu => cpu(),
        HostInfoType::Filesystem => filesystems(),
        HostInfoType::Procs => processes(),
    };

    json!({
        "metrics": metrics,
        "timestamp": helpers::timestamp(),
    })
}

fn memory() -> Value {
    let mem = match sys_info::mem_info() {
        Ok(mem) => mem,
        Err(e) => {
            log::error!("[agent] failed to read memory info: {}", e);
            return json!({});
        }
    };

    // sys_info reports KiB
    let bytes = |kib: u64| kib.saturating_mul(1024);
    let percent = |part: u64| {
        if mem.total > 0 {
            (part as f64 / mem.total as f64) * 100.0
        } else {
            0.0
        }
    };

    let used = mem.total.saturating_sub(mem.free);
    let actual_used = mem.total.saturating_sub(mem.avail);

    json!({
        "actual_free": bytes(mem.avail),
        "actual_used": bytes(actual_used),
        "total": bytes(mem.total),
        "used": bytes(used),
        "free": bytes(mem.free),
        "swap_total": bytes(mem.swap_total),
        "swap_used": bytes(mem.swap_total.saturating_sub(mem.swap_free)),
        "swap_free": bytes(mem.swap_free),
        "used_percent": percent(used),
        "free_percent": percent(mem.free),
    })
}

fn cpu() -> Value {
    let mut system = System::new();
    system.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_cpu_usage();
    system.refresh_cpu_frequency();

    system
        .cpus()
        .iter()
        .map(|cpu| {
            json!({
                "name": cpu.name(),
                "brand": cpu.brand(),
                "vendor": cpu.vendor_id(),
                "frequency": cpu.frequency(),
                "usage": cpu.cpu_usage(),
            })
        })
        .collect()
}

fn filesystems() -> Value {
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .map(|disk| {
            let total = disk.total_space();
            let avail = disk.available_space();
            json!({
                "dir_name": disk.mount_point().to_string_lossy(),
                "dev_name": disk.name().to_string_lossy(),
                "sys_type_name": disk.file_system().to_string_lossy(),
                "total": total,
                "free": avail,
                "avail": avail,
                "used": total.saturating_sub(avail),
            })
        })
        .collect()
}

fn processes() -> Value {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::everything());

    let mut pids: Vec<_> = system.processes().keys().copied().collect();
    pids.sort_unstable();

    pids.into_iter()
        .filter_map(|pid| system.process(pid).map(|process| (pid, process)))
        .map(|(pid, process)| {
            let path = |p: Option<&std::path::Path>| p.map(|p| p.display().to_string()).unwrap_or_default();
            json!({
                "pid": pid.as_u32(),
                "exe_name": process.name().to_string_lossy(),
                "exe_cwd": path(process.cwd()),
                "exe_root": path(process.root()),
                "state_name": process.status().to_string(),
                "state_ppid": process.parent().map(|p| p.as_u32()),
                "memory_size": process.virtual_memory(),
                "memory_resident": process.memory(),
                "time_start_time": process.start_time(),
                "time_total": process.run_time(),
                "cpu_usage": process.cpu_usage(),
            })
        })
        .collect()
}
