//! Discovery of compute-unit cgroups.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use procfs::process::Process;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use walkdir::WalkDir;

use crate::escape;
use crate::manager::CgroupManager;

/// Location of one cgroup directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupPath {
    /// Absolute path with unicode escapes decoded, for display and matching.
    pub abs: String,
    /// Raw on-disk path relative to the hierarchy root, for file access.
    pub rel: PathBuf,
}

impl fmt::Display for CgroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.abs)
    }
}

/// One live compute unit: a Slurm job, a libvirt virtual machine, …
#[derive(Debug)]
pub struct Cgroup {
    /// Identifier used internally by the resource manager.
    pub id: String,
    /// Identifier known to the user. Defaults to `id`; a resource manager
    /// with two representations may override it.
    pub uuid: String,
    /// Root cgroup of the unit.
    pub path: CgroupPath,
    /// Every cgroup belonging to the unit, the root included.
    pub children: Vec<CgroupPath>,
    /// Processes currently alive in the unit's cgroups.
    pub procs: Vec<Process>,
}

impl fmt::Display for Cgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id: {} path: {} num_procs: {} num_children: {}",
            self.id,
            self.path,
            self.procs.len(),
            self.children.len()
        )
    }
}

/// Error aborting a discovery pass.
#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("failed to walk the cgroup hierarchy under {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

impl CgroupManager {
    /// Finds all compute units currently live under the mount point.
    ///
    /// A root and its children may be visited in any order, so member
    /// processes and child paths are joined into the root cgroups after the
    /// walk. Directories that vanish while we walk contribute nothing; any
    /// other filesystem error aborts the pass.
    pub fn discover(&self) -> Result<Vec<Cgroup>, DiscoverError> {
        let mut roots: Vec<Cgroup> = Vec::new();
        let mut seen_roots: FxHashSet<String> = FxHashSet::default();
        let mut procs: FxHashMap<String, Vec<Process>> = FxHashMap::default();
        let mut children: FxHashMap<String, Vec<CgroupPath>> = FxHashMap::default();

        for entry in WalkDir::new(self.mount_point()) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if is_not_found(&err) => continue,
                Err(err) => {
                    return Err(DiscoverError::Walk {
                        path: self.mount_point().to_owned(),
                        source: err,
                    })
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }

            let raw = entry.path();
            let Some(raw_str) = raw.to_str() else {
                log::error!("cgroup path is not valid UTF-8: {}", raw.display());
                continue;
            };
            let abs = match escape::unescape_path(raw_str) {
                Ok(abs) => abs,
                Err(err) => {
                    log::error!("failed to sanitize cgroup path {raw_str}: {err}");
                    continue;
                }
            };

            let Some(captures) = self.id_regex().captures(&abs) else {
                continue;
            };
            let id = captures
                .get(1)
                .map(|m| m.as_str().trim())
                .unwrap_or_default()
                .to_string();
            if id.is_empty() {
                // the pattern matched but captured nothing: a regex problem,
                // not a reason to abort the pass
                log::error!("empty cgroup id extracted from {abs}");
                continue;
            }

            let rel = match raw.strip_prefix(self.hierarchy_root()) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => {
                    log::error!("cgroup path {raw_str} is outside of the hierarchy root");
                    continue;
                }
            };

            self.resolve_procs(raw_str, procs.entry(id.to_string()).or_default());

            let path = CgroupPath { abs, rel };
            if self.is_child(&path.abs) {
                children.entry(id.to_string()).or_default().push(path);
                continue;
            }
            if !seen_roots.insert(id.to_string()) {
                log::warn!("duplicate root cgroup for unit {id}, keeping the first: {path}");
                continue;
            }
            children.entry(id.to_string()).or_default().push(path.clone());
            roots.push(Cgroup {
                id: id.to_string(),
                uuid: id.to_string(),
                path,
                children: Vec::new(),
                procs: Vec::new(),
            });
        }

        // join processes and child paths into their root
        for cgroup in &mut roots {
            if let Some(p) = procs.remove(&cgroup.id) {
                cgroup.procs = p;
            }
            if let Some(c) = children.remove(&cgroup.id) {
                cgroup.children = c;
            }
        }
        Ok(roots)
    }

    /// Reads `cgroup.procs` and resolves each PID from procfs.
    ///
    /// Processes can exit between the listing and the lookup; those PIDs are
    /// dropped silently, as are the manager's housekeeping processes.
    fn resolve_procs(&self, cgroup_dir: &str, out: &mut Vec<Process>) {
        let procs_file = PathBuf::from(cgroup_dir).join("cgroup.procs");
        let content = match fs::read_to_string(&procs_file) {
            Ok(content) => content,
            Err(_) => return,
        };
        for line in content.lines() {
            let Ok(pid) = line.trim().parse::<u32>() else {
                continue;
            };
            let Ok(process) = Process::new_with_root(self.procfs_root().join(pid.to_string())) else {
                continue;
            };
            let cmdline = process.cmdline().map(|args| args.join(" ")).unwrap_or_default();
            if self.ignore_proc(&cmdline) {
                continue;
            }
            out.push(process);
        }
    }
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error().is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}
