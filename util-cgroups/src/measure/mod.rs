//! Measurement of compute-unit statistics.
//!
//! The two cgroup layouts are read by two independent types behind the
//! [`StatsReader`] trait; they share no state and the right one is chosen
//! once, when the collector is built.

pub mod cpuset;
mod parse;
pub mod psi;
mod v1;
mod v2;

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::discover::CgroupPath;
use crate::host::HostInfo;
use crate::manager::{CgroupManager, CgroupMode};

pub use v1::V1Reader;
pub use v2::V2Reader;

/// Statistics of one compute unit, in normalized units: CPU and PSI times in
/// seconds, memory and block-io in bytes.
///
/// Built with the unit's path and uuid, populated by one read pass, consumed
/// by the exposition step and discarded.
#[derive(Debug, Default)]
pub struct CgroupMetric {
    pub uuid: String,
    pub path: CgroupPath,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub cpu_total: f64,
    /// Cardinality of the effective cpuset.
    pub cpus: usize,
    pub cpu_psi: f64,
    pub memory_rss: f64,
    pub memory_cache: f64,
    pub memory_used: f64,
    pub memory_total: f64,
    pub memory_fail_count: f64,
    pub memsw_used: f64,
    pub memsw_total: f64,
    pub memsw_fail_count: f64,
    pub memory_psi: f64,
    /// Per-device counters, keyed by device name.
    pub blkio_read_bytes: FxHashMap<String, f64>,
    pub blkio_write_bytes: FxHashMap<String, f64>,
    pub blkio_read_reqs: FxHashMap<String, f64>,
    pub blkio_write_reqs: FxHashMap<String, f64>,
    pub blkio_psi: f64,
    /// Per-RDMA-device counters, keyed by device name.
    pub rdma_hca_handles: FxHashMap<String, f64>,
    pub rdma_hca_objects: FxHashMap<String, f64>,
    /// Set when any part of the read pass failed; the affected fields stay
    /// at zero and the metric is still emitted.
    pub err: bool,
}

impl CgroupMetric {
    pub fn new(path: CgroupPath, uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            path,
            ..Default::default()
        }
    }
}

/// Reads the statistics of one compute unit into its metric record.
///
/// A reader never fails outright: partial failures are logged, flagged on
/// the metric and leave the untouched fields at zero.
pub trait StatsReader: Send + Sync {
    fn read(&self, metric: &mut CgroupMetric);
}

/// Picks the stats reader matching the manager's cgroup layout.
pub fn reader_for(manager: &CgroupManager, host: HostInfo) -> Arc<dyn StatsReader> {
    match manager.mode() {
        CgroupMode::V1 => Arc::new(V1Reader::new(manager.root().to_owned(), host)),
        CgroupMode::V2 => Arc::new(V2Reader::new(manager.root().to_owned(), host)),
    }
}

/// Flags a failed read on the metric. The unit is still emitted, with the
/// untouched fields at zero.
pub(crate) fn fail(path: &Path, err: std::io::Error, m: &mut CgroupMetric) {
    log::error!("failed to read {}: {err}", path.display());
    m.err = true;
}

/// Parses `rdma.current`: one line per device with `hca_handle` and
/// `hca_object` counters. The file format is identical in both hierarchies.
/// The RDMA controller only exists on hosts with RDMA hardware; an absent
/// file is skipped.
pub(crate) fn read_rdma_current(path: &Path, m: &mut CgroupMetric) {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => {
            fail(path, err, m);
            return;
        }
    };
    for line in content.lines() {
        let Some((device, counters)) = line.split_once(' ') else {
            continue;
        };
        for (key, value) in parse::eq_tokens(counters) {
            match key {
                "hca_handle" => {
                    m.rdma_hca_handles.insert(device.to_string(), value as f64);
                }
                "hca_object" => {
                    m.rdma_hca_objects.insert(device.to_string(), value as f64);
                }
                _ => (),
            }
        }
    }
}
