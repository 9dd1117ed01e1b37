use crate::agent::{NetCounters, ResourceSnapshot};
use sysinfo::{CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};

pub fn collect_resources(
    system: &mut System,
    prev_net: Option<&NetCounters>,
    now_unix: i64,
) -> (ResourceSnapshot, NetCounters) {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_disks_list();
    system.refresh_disks();
    system.refresh_networks_list();
    system.refresh_networks();

    let cpu_percent = if system.cpus().is_empty() {
        0.0
    } else {
        let sum: f32 = system.cpus().iter().map(|c| c.cpu_usage()).sum();
        (sum / system.cpus().len() as f32) as f64
    };

    let memory_total = (system.total_memory() * 1024) as f64;
    let memory_used = (system.used_memory() * 1024) as f64;
    let memory_percent = if memory_total > 0.0 {
        memory_used / memory_total * 100.0
    } else {
        0.0
    };

    let (disk_total, disk_used) = root_disk_usage(system);
    let disk_percent = if disk_total > 0.0 {
        disk_used / disk_total * 100.0
    } else {
        0.0
    };

    let mut rx_bytes_total = 0_u64;
    let mut tx_bytes_total = 0_u64;
    for (_iface, data) in system.networks().iter() {
        rx_bytes_total = rx_bytes_total.saturating_add(data.total_received());
        tx_bytes_total = tx_bytes_total.saturating_add(data.total_transmitted());
    }
    let net = NetCounters {
        rx_bytes_total,
        tx_bytes_total,
        at_unix: now_unix,
    };

    let (upload_speed, download_speed) = match prev_net {
        Some(prev) => net.rates_since(prev),
        None => (0.0, 0.0),
    };

    (
        ResourceSnapshot {
            cpu_percent,
            memory_percent,
            memory_total,
            memory_used,
            disk_percent,
            disk_total,
            disk_used,
            upload_speed,
            download_speed,
        },
        net,
    )
}

// Корневой раздел, а при его отсутствии самый ёмкий диск.
fn root_disk_usage(system: &System) -> (f64, f64) {
    let root = system
        .disks()
        .iter()
        .find(|d| d.mount_point().to_string_lossy() == "/")
        .or_else(|| {
            system
                .disks()
                .iter()
                .max_by_key(|d| d.total_space())
        });

    match root {
        Some(disk) => {
            let total = disk.total_space();
            let used = total.saturating_sub(disk.available_space());
            (total as f64, used as f64)
        }
        None => (0.0, 0.0),
    }
}
