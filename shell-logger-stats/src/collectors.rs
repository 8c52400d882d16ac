//! The built-in CPU, memory and disk collectors.

use crate::{Sample, Samples, StatsCollector, now_millis};
use nix::sys::statvfs::statvfs;
use std::collections::BTreeMap;
use std::path::Path;
use sysinfo::{Disks, System};

/// Round a percentage to one decimal place.
fn percent(part: f64, whole: f64) -> f32 {
    if whole <= 0.0 {
        return 0.0;
    }
    ((part / whole * 1000.0).round() / 10.0) as f32
}

/// Global CPU utilisation across all cores.
pub struct CpuCollector {
    system: System,
    samples: Vec<Sample>,
}

impl CpuCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        // Utilisation is computed between two refreshes; this one sets the baseline.
        system.refresh_cpu_usage();
        Self {
            system,
            samples: Vec::new(),
        }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector for CpuCollector {
    fn stat_name(&self) -> &'static str {
        "cpu"
    }

    fn collect(&mut self) {
        self.system.refresh_cpu_usage();
        let usage = self.system.global_cpu_usage().clamp(0.0, 100.0);
        self.samples.push((now_millis(), usage));
    }

    fn into_samples(self: Box<Self>) -> Samples {
        Samples::Series(self.samples)
    }
}

/// Share of physical memory in use.
pub struct MemoryCollector {
    system: System,
    samples: Vec<Sample>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            samples: Vec::new(),
        }
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector for MemoryCollector {
    fn stat_name(&self) -> &'static str {
        "memory"
    }

    fn collect(&mut self) {
        self.system.refresh_memory();
        let used = self.system.used_memory() as f64;
        let total = self.system.total_memory() as f64;
        self.samples.push((now_millis(), percent(used, total)));
    }

    fn into_samples(self: Box<Self>) -> Samples {
        Samples::Series(self.samples)
    }
}

/// Disk usage of every mounted filesystem.
///
/// Mount points are discovered once, when the collector is built.
pub struct DiskCollector {
    samples: BTreeMap<String, Vec<Sample>>,
}

impl DiskCollector {
    pub fn new() -> Self {
        Self::with_mount_points(discover_mount_points())
    }

    /// Poll exactly the given mount points.
    pub fn with_mount_points(mount_points: impl IntoIterator<Item = String>) -> Self {
        Self {
            samples: mount_points.into_iter().map(|m| (m, Vec::new())).collect(),
        }
    }

    pub fn mount_points(&self) -> impl Iterator<Item = &str> {
        self.samples.keys().map(String::as_str)
    }
}

impl Default for DiskCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector for DiskCollector {
    fn stat_name(&self) -> &'static str {
        "disk"
    }

    fn collect(&mut self) {
        let timestamp = now_millis();
        for (mount, series) in self.samples.iter_mut() {
            match disk_usage(Path::new(mount)) {
                Some(usage) => series.push((timestamp, usage)),
                None => tracing::trace!(mount = %mount, "could not stat mount point"),
            }
        }
    }

    fn into_samples(self: Box<Self>) -> Samples {
        Samples::PerMount(self.samples)
    }
}

/// Percentage of a filesystem's space in use, as `df` reports it.
///
/// Blocks reserved for the superuser count as neither used nor available.
fn disk_usage(path: &Path) -> Option<f32> {
    let stat = statvfs(path).ok()?;
    let fragment = stat.fragment_size() as f64;
    let total = stat.blocks() as f64 * fragment;
    let free = stat.blocks_free() as f64 * fragment;
    let available = stat.blocks_available() as f64 * fragment;
    let used = total - free;
    Some(percent(used, used + available))
}

/// Mounted filesystems plus a few ephemeral locations that may not be
/// separate mounts.
fn discover_mount_points() -> Vec<String> {
    let disks = Disks::new_with_refreshed_list();
    let mut mounts: Vec<String> = disks
        .list()
        .iter()
        .map(|disk| disk.mount_point().to_string_lossy().into_owned())
        .collect();

    let uid = nix::unistd::getuid();
    for location in [
        "/tmp".to_string(),
        "/dev/shm".to_string(),
        format!("/var/run/user/{uid}"),
    ] {
        if !mounts.contains(&location) && Path::new(&location).exists() {
            mounts.push(location);
        }
    }
    tracing::debug!(count = mounts.len(), "discovered mount points");
    mounts
}
