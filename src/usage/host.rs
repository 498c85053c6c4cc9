//! Host health snapshot.

use chrono::Utc;
use sysinfo::{Components, Disks, System};

use crate::authority::SystemMetrics;

/// Keeps a `System` between samples so CPU usage has a previous reading
/// to diff against.
pub struct HostSampler {
    system: System,
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self { system }
    }

    pub fn snapshot(&mut self) -> SystemMetrics {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        let cpu_usage = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };

        SystemMetrics {
            timestamp: Utc::now(),
            cpu_usage,
            memory_usage: percent(self.system.used_memory(), self.system.total_memory()),
            temperature: max_temperature(),
            disk_usage: root_disk_usage(),
            uptime: System::uptime(),
        }
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0) as f32
    }
}

fn root_disk_usage() -> f32 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == std::path::Path::new("/"))
        .map(|disk| {
            let total = disk.total_space();
            percent(total.saturating_sub(disk.available_space()), total)
        })
        .unwrap_or(0.0)
}

/// Hottest readable sensor, 0 without sensors.
fn max_temperature() -> f32 {
    let components = Components::new_with_refreshed_list();
    components
        .list()
        .iter()
        .map(|c| c.temperature())
        .filter(|t| t.is_finite())
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }

    #[test]
    fn test_snapshot_is_in_range() {
        let mut sampler = HostSampler::new();
        let metrics = sampler.snapshot();
        assert!((0.0..=100.0).contains(&metrics.memory_usage));
        assert!((0.0..=100.0).contains(&metrics.disk_usage));
        assert!(metrics.temperature >= 0.0);
    }
}
