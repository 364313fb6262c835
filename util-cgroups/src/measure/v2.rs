//! Stats reading for the unified (v2) hierarchy.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::host::HostInfo;
use crate::measure::{cpuset, fail, parse, psi, read_rdma_current, CgroupMetric, StatsReader};

/// Reads compute-unit statistics from a unified cgroup hierarchy.
///
/// All files of a unit live in one directory: the unit-relative path joined
/// to the hierarchy root.
pub struct V2Reader {
    root: PathBuf,
    host: HostInfo,
}

impl V2Reader {
    pub fn new(root: PathBuf, host: HostInfo) -> Self {
        Self { root, host }
    }

    fn cpu(&self, dir: &Path, m: &mut CgroupMetric) {
        // cpu.stat reports microseconds
        let path = dir.join("cpu.stat");
        match parse::read_kv(&path) {
            Ok(kv) => {
                m.cpu_user = kv.get("user_usec").copied().unwrap_or_default() as f64 / 1e6;
                m.cpu_system = kv.get("system_usec").copied().unwrap_or_default() as f64 / 1e6;
                m.cpu_total = kv.get("usage_usec").copied().unwrap_or_default() as f64 / 1e6;
            }
            Err(err) => fail(&path, err, m),
        }

        match fs::read_to_string(dir.join("cpuset.cpus.effective")) {
            Ok(content) => match cpuset::parse_cpuset(&content) {
                Ok(cpus) => m.cpus = cpus.len(),
                Err(err) => log::debug!("unparseable cpuset for {}: {err}", m.path),
            },
            Err(err) => log::debug!("no effective cpuset for {}: {err}", m.path),
        }
    }

    fn memory(&self, dir: &Path, m: &mut CgroupMetric) {
        let path = dir.join("memory.current");
        match parse::read_u64(&path) {
            Ok(used) => m.memory_used = used as f64,
            Err(err) => fail(&path, err, m),
        }

        let path = dir.join("memory.max");
        match parse::read_limit(&path) {
            Ok(limit) => m.memory_total = self.host.memory_total_or(limit),
            Err(err) => fail(&path, err, m),
        }

        // `file` is the page cache, `anon` the resident anonymous memory
        let path = dir.join("memory.stat");
        match parse::read_kv(&path) {
            Ok(kv) => {
                m.memory_cache = kv.get("file").copied().unwrap_or_default() as f64;
                m.memory_rss = kv.get("anon").copied().unwrap_or_default() as f64;
            }
            Err(err) => fail(&path, err, m),
        }

        // The `oom` event count feeds the same metric as the v1 failcnt for
        // downstream compatibility, even though it counts kills rather than
        // failed allocations.
        let path = dir.join("memory.events");
        match parse::read_kv(&path) {
            Ok(kv) => m.memory_fail_count = kv.get("oom").copied().unwrap_or_default() as f64,
            Err(err) => fail(&path, err, m),
        }
    }

    /// Swap accounting may be disabled host-wide; absent files are skipped.
    fn swap(&self, dir: &Path, m: &mut CgroupMetric) {
        let path = dir.join("memory.swap.current");
        match parse::read_u64(&path) {
            Ok(used) => m.memsw_used = used as f64,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                fail(&path, err, m);
                return;
            }
        }

        let path = dir.join("memory.swap.max");
        match parse::read_limit(&path) {
            Ok(limit) => m.memsw_total = self.host.swap_total_or(limit),
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => fail(&path, err, m),
        }
        // v2 exposes no swap failure events; memsw_fail_count stays zero
    }

    fn blkio(&self, dir: &Path, m: &mut CgroupMetric) {
        let path = dir.join("io.stat");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                fail(&path, err, m);
                return;
            }
        };
        for line in content.lines() {
            let Some((major_minor, counters)) = line.split_once(' ') else {
                continue;
            };
            let device = self.host.device_name(major_minor);
            for (key, value) in parse::eq_tokens(counters) {
                let value = value as f64;
                match key {
                    "rbytes" => {
                        m.blkio_read_bytes.insert(device.clone(), value);
                    }
                    "wbytes" => {
                        m.blkio_write_bytes.insert(device.clone(), value);
                    }
                    "rios" => {
                        m.blkio_read_reqs.insert(device.clone(), value);
                    }
                    "wios" => {
                        m.blkio_write_reqs.insert(device.clone(), value);
                    }
                    _ => (),
                }
            }
        }
    }

    /// PSI needs CONFIG_PSI; absent files are skipped.
    fn pressure(&self, dir: &Path, m: &mut CgroupMetric) {
        m.cpu_psi = pressure_file(&dir.join("cpu.pressure"), m);
        m.memory_psi = pressure_file(&dir.join("memory.pressure"), m);
        m.blkio_psi = pressure_file(&dir.join("io.pressure"), m);
    }

    fn rdma(&self, dir: &Path, m: &mut CgroupMetric) {
        read_rdma_current(&dir.join("rdma.current"), m);
    }
}

impl StatsReader for V2Reader {
    fn read(&self, metric: &mut CgroupMetric) {
        let dir = self.root.join(&metric.path.rel);
        self.cpu(&dir, metric);
        self.memory(&dir, metric);
        self.swap(&dir, metric);
        self.blkio(&dir, metric);
        self.pressure(&dir, metric);
        self.rdma(&dir, metric);
    }
}

fn pressure_file(path: &Path, m: &mut CgroupMetric) -> f64 {
    match fs::read_to_string(path) {
        Ok(content) => psi::full_stall_seconds(&content).unwrap_or_default(),
        Err(err) if err.kind() == ErrorKind::NotFound => 0.0,
        Err(err) => {
            fail(path, err, m);
            0.0
        }
    }
}
