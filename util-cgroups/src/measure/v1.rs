//! Stats reading for the legacy (v1) hierarchies.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::host::HostInfo;
use crate::measure::{cpuset, fail, parse, read_rdma_current, CgroupMetric, StatsReader};

/// The kernel reports a page-rounded `i64::MAX` in the `*_in_bytes` limit
/// files when no limit is set; anything in that top range means unlimited.
const V1_UNLIMITED: u64 = 1 << 62;

/// Reads compute-unit statistics from the legacy per-controller hierarchies.
///
/// Every controller mounts its own tree, so the unit-relative path is joined
/// to `{root}/{controller}` for each file read.
pub struct V1Reader {
    root: PathBuf,
    host: HostInfo,
}

impl V1Reader {
    pub fn new(root: PathBuf, host: HostInfo) -> Self {
        Self { root, host }
    }

    fn controller_dir(&self, controller: &str, m: &CgroupMetric) -> PathBuf {
        self.root.join(controller).join(&m.path.rel)
    }

    fn cpu(&self, m: &mut CgroupMetric) {
        // cpuacct reports nanoseconds
        let dir = self.controller_dir("cpuacct", m);
        m.cpu_user = cpu_seconds(&dir.join("cpuacct.usage_user"), m);
        m.cpu_system = cpu_seconds(&dir.join("cpuacct.usage_sys"), m);
        m.cpu_total = cpu_seconds(&dir.join("cpuacct.usage"), m);

        match fs::read_to_string(self.controller_dir("cpuset", m).join("cpuset.cpus")) {
            Ok(content) => match cpuset::parse_cpuset(&content) {
                Ok(cpus) => m.cpus = cpus.len(),
                Err(err) => log::debug!("unparseable cpuset for {}: {err}", m.path),
            },
            Err(err) => log::debug!("no cpuset for {}: {err}", m.path),
        }
    }

    fn memory(&self, m: &mut CgroupMetric) {
        let dir = self.controller_dir("memory", m);

        let path = dir.join("memory.stat");
        match parse::read_kv(&path) {
            Ok(kv) => {
                m.memory_rss = kv.get("total_rss").copied().unwrap_or_default() as f64;
                m.memory_cache = kv.get("total_cache").copied().unwrap_or_default() as f64;
            }
            Err(err) => fail(&path, err, m),
        }

        let path = dir.join("memory.usage_in_bytes");
        match parse::read_u64(&path) {
            Ok(used) => m.memory_used = used as f64,
            Err(err) => fail(&path, err, m),
        }

        let path = dir.join("memory.limit_in_bytes");
        match parse::read_u64(&path) {
            Ok(limit) => m.memory_total = self.host.memory_total_or(normalize_limit(limit)),
            Err(err) => fail(&path, err, m),
        }

        let path = dir.join("memory.failcnt");
        match parse::read_u64(&path) {
            Ok(count) => m.memory_fail_count = count as f64,
            Err(err) => fail(&path, err, m),
        }
    }

    /// The memsw files only exist with swap accounting enabled
    /// (`swapaccount=1`); absent files are skipped.
    fn swap(&self, m: &mut CgroupMetric) {
        let dir = self.controller_dir("memory", m);

        let path = dir.join("memory.memsw.usage_in_bytes");
        match parse::read_u64(&path) {
            Ok(used) => m.memsw_used = used as f64,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                fail(&path, err, m);
                return;
            }
        }

        let path = dir.join("memory.memsw.limit_in_bytes");
        match parse::read_u64(&path) {
            Ok(limit) => m.memsw_total = self.host.swap_total_or(normalize_limit(limit)),
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => fail(&path, err, m),
        }

        let path = dir.join("memory.memsw.failcnt");
        match parse::read_u64(&path) {
            Ok(count) => m.memsw_fail_count = count as f64,
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => fail(&path, err, m),
        }
    }

    fn blkio(&self, m: &mut CgroupMetric) {
        let dir = self.controller_dir("blkio", m);

        // bytes transferred
        for row in self.blkio_rows(&dir.join("blkio.io_service_bytes_recursive"), m) {
            match row.op {
                BlkioOp::Read => m.blkio_read_bytes.insert(row.device, row.value),
                BlkioOp::Write => m.blkio_write_bytes.insert(row.device, row.value),
            };
        }
        // IOs completed
        for row in self.blkio_rows(&dir.join("blkio.io_serviced_recursive"), m) {
            match row.op {
                BlkioOp::Read => m.blkio_read_reqs.insert(row.device, row.value),
                BlkioOp::Write => m.blkio_write_reqs.insert(row.device, row.value),
            };
        }
    }

    /// Parses one recursive blkio stat file. Lines look like `8:0 Read 1310`
    /// with per-operation rows per device and a trailing `Total` row; only
    /// the `Read` and `Write` operations are retained.
    fn blkio_rows(&self, path: &Path, m: &mut CgroupMetric) -> Vec<BlkioRow> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                fail(path, err, m);
                return Vec::new();
            }
        };
        let mut rows = Vec::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(major_minor), Some(op), Some(value)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let op = match op {
                "Read" => BlkioOp::Read,
                "Write" => BlkioOp::Write,
                _ => continue,
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            rows.push(BlkioRow {
                device: self.host.device_name(major_minor),
                op,
                value: value as f64,
            });
        }
        rows
    }

    fn rdma(&self, m: &mut CgroupMetric) {
        let path = self.controller_dir("rdma", m).join("rdma.current");
        read_rdma_current(&path, m);
    }
}

impl StatsReader for V1Reader {
    fn read(&self, metric: &mut CgroupMetric) {
        self.cpu(metric);
        self.memory(metric);
        self.swap(metric);
        self.blkio(metric);
        self.rdma(metric);
        // PSI is not exposed by the v1 hierarchies; those fields stay zero
    }
}

fn cpu_seconds(path: &Path, m: &mut CgroupMetric) -> f64 {
    match parse::read_u64(path) {
        Ok(nanoseconds) => nanoseconds as f64 / 1e9,
        Err(err) => {
            fail(path, err, m);
            0.0
        }
    }
}

fn normalize_limit(limit: u64) -> u64 {
    if limit >= V1_UNLIMITED {
        u64::MAX
    } else {
        limit
    }
}

enum BlkioOp {
    Read,
    Write,
}

struct BlkioRow {
    device: String,
    op: BlkioOp,
    value: f64,
}
