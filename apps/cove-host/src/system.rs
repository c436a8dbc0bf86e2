use std::sync::Mutex;
use std::time::Instant;

use cove_proto::{CpuStats, MemoryStats, SystemSnapshot};
use sysinfo::System;

/// Collects the system block reported in every heartbeat response.
/// sysinfo needs a warm-up refresh before CPU usage means anything, so
/// the constructor does one immediately.
pub struct SystemMonitor {
    system: Mutex<System>,
    started: Instant,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpus = system.cpus();
        let speed = cpus
            .first()
            .map(|cpu| format!("{:.2} GHz", cpu.frequency() as f64 / 1000.0))
            .unwrap_or_else(|| "unknown".to_string());

        SystemSnapshot {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os_name: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
            ip: primary_ipv4(),
            cpu: CpuStats {
                count: cpus.len(),
                speed,
                usage_percent: system.global_cpu_usage(),
            },
            memory: MemoryStats {
                used: system.used_memory(),
                total: system.total_memory(),
            },
            uptime: System::uptime(),
            process_uptime: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// First non-loopback IPv4 address, or "unknown" when none is up.
fn primary_ipv4() -> String {
    if let Ok(addrs) = if_addrs::get_if_addrs() {
        for iface in addrs {
            if iface.is_loopback() {
                continue;
            }
            if let if_addrs::IfAddr::V4(v4) = iface.addr {
                return v4.ip.to_string();
            }
        }
    }
    "unknown".to_string()
}
