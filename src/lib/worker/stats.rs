use std::sync::Mutex;

use serde::{Serialize, ser::SerializeStruct};
use sysinfo::{Disks, System};

/// Point-in-time view of the host the engine runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct HostStats {
    pub cpu_usage: f32,
    pub total_memory: u64,
    pub used_memory: u64,
    pub total_swap: u64,
    pub used_swap: u64,
    pub system_name: String,
    pub hostname: String,
    pub total_cpus: u64,
    pub disk_usage: f32,
    pub managed_containers: u64,
}

impl Serialize for HostStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("HostStats", 10)?;
        state.serialize_field("cpu_usage", &format!("{:.2}%", self.cpu_usage))?;
        state.serialize_field("total_memory", &format!("{} MB", self.total_memory))?;
        state.serialize_field("used_memory", &format!("{} MB", self.used_memory))?;
        state.serialize_field("total_swap", &format!("{} MB", self.total_swap))?;
        state.serialize_field("used_swap", &format!("{} MB", self.used_swap))?;
        state.serialize_field("system_name", &self.system_name)?;
        state.serialize_field("hostname", &self.hostname)?;
        state.serialize_field("total_cpus", &self.total_cpus)?;
        state.serialize_field("disk_usage", &format!("{:.2}%", self.disk_usage))?;
        state.serialize_field("managed_containers", &self.managed_containers)?;
        state.end()
    }
}

/// Keeps one `System` around so CPU usage is measured between refreshes.
pub struct HostMonitor {
    system: Mutex<System>,
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        HostMonitor {
            system: Mutex::new(system),
        }
    }

    pub fn snapshot(&self, managed_containers: u64) -> HostStats {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();
        get_stats(&system, managed_containers)
    }
}

pub fn get_stats(sysinfo: &System, managed_containers: u64) -> HostStats {
    HostStats {
        cpu_usage: (sysinfo.global_cpu_usage() * 100.0).round() / 100.0,
        total_memory: sysinfo.total_memory() / 1024 / 1024,
        used_memory: sysinfo.used_memory() / 1024 / 1024,
        total_swap: sysinfo.total_swap() / 1024 / 1024,
        used_swap: sysinfo.used_swap() / 1024 / 1024,
        system_name: System::name().unwrap_or_else(|| "Unknown".to_string()),
        hostname: System::host_name().unwrap_or_else(|| "Unknown".to_string()),
        total_cpus: sysinfo.cpus().len() as u64,
        disk_usage: {
            let disks = Disks::new_with_refreshed_list();
            let used_space: f32 = disks
                .iter()
                .map(|disk| disk.total_space() as f32 - disk.available_space() as f32)
                .sum();
            let total_space: f32 = disks.iter().map(|disk| disk.total_space() as f32).sum();
            if total_space > 0.0 {
                (used_space / total_space) * 100.0
            } else {
                0.0
            }
        },
        managed_containers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_units() {
        let stats = HostStats {
            cpu_usage: 12.5,
            total_memory: 2048,
            used_memory: 512,
            total_swap: 0,
            used_swap: 0,
            system_name: "Linux".to_string(),
            hostname: "node-1".to_string(),
            total_cpus: 4,
            disk_usage: 50.0,
            managed_containers: 3,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["cpu_usage"], "12.50%");
        assert_eq!(json["total_memory"], "2048 MB");
        assert_eq!(json["disk_usage"], "50.00%");
        assert_eq!(json["managed_containers"], 3);
    }

    #[test]
    fn snapshot_reports_managed_count() {
        let monitor = HostMonitor::new();
        let stats = monitor.snapshot(7);
        assert_eq!(stats.managed_containers, 7);
        assert!(stats.total_memory >= stats.used_memory);
    }
}
