//! Host-wide information read once at startup.

use std::path::Path;

use procfs::{DiskStats, FromRead, Meminfo};
use rustc_hash::FxHashMap;

/// Memory totals and the block-device name map of the host.
///
/// Collected once when the collector is built and read-only afterwards.
/// Unavailable pieces are logged and left empty; they never abort startup.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    /// `MemTotal` in bytes.
    pub mem_total: Option<u64>,
    /// `SwapTotal` in bytes.
    pub swap_total: Option<u64>,
    /// `major:minor` → device name, from the disk statistics.
    pub block_devices: FxHashMap<String, String>,
}

impl HostInfo {
    pub fn collect(procfs_root: &Path) -> Self {
        let mut info = HostInfo::default();

        match Meminfo::from_file(procfs_root.join("meminfo")) {
            Ok(meminfo) => {
                info.mem_total = Some(meminfo.mem_total);
                info.swap_total = Some(meminfo.swap_total);
            }
            Err(err) => log::error!("failed to read the host memory info: {err}"),
        }

        match DiskStats::from_file(procfs_root.join("diskstats")) {
            Ok(stats) => {
                for disk in stats.0 {
                    info.block_devices
                        .insert(format!("{}:{}", disk.major, disk.minor), disk.name);
                }
            }
            Err(err) => log::error!("failed to read the host block devices: {err}"),
        }

        info
    }

    /// Resolves a `major:minor` pair to a device name, falling back to the
    /// pair itself for devices that appeared after startup.
    pub fn device_name(&self, major_minor: &str) -> String {
        self.block_devices
            .get(major_minor)
            .cloned()
            .unwrap_or_else(|| major_minor.to_string())
    }

    /// Memory limit with the "unlimited" sentinel replaced by the host total.
    pub fn memory_total_or(&self, limit: u64) -> f64 {
        if limit == u64::MAX {
            if let Some(total) = self.mem_total.filter(|v| *v > 0) {
                return total as f64;
            }
        }
        limit as f64
    }

    /// Swap limit with the "unlimited" sentinel replaced by the host swap
    /// total, then the host memory total, then the sentinel itself.
    pub fn swap_total_or(&self, limit: u64) -> f64 {
        if limit == u64::MAX {
            if let Some(swap) = self.swap_total.filter(|v| *v > 0) {
                return swap as f64;
            }
            if let Some(mem) = self.mem_total.filter(|v| *v > 0) {
                return mem as f64;
            }
        }
        limit as f64
    }
}
