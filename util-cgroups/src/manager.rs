//! Per-host cgroup configuration for a resource manager.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;

/// Cgroup layouts this crate understands.
///
/// Hybrid hosts are handled as legacy: the controllers this crate reads all
/// live in the v1 hierarchies there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    /// Legacy (v1) per-controller hierarchies.
    V1,
    /// Unified (v2) hierarchy.
    V2,
}

/// Resource managers whose compute units can be discovered.
///
/// A new resource manager is added by giving a new variant its policy data
/// below; the discovery and measurement code stays untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceManager {
    /// Slurm batch jobs.
    Slurm,
    /// libvirt/QEMU virtual machines.
    Libvirt,
}

/*
Slurm paths:
  v1: {root}/cpuacct/slurm/uid_1000/job_211
  v2: {root}/system.slice/slurmstepd.scope/job_211[/step_extern/user/task_0]

libvirt paths (escaped characters are decoded first, see the escape module):
  v1: {root}/cpuacct/machine.slice/machine-qemu\x2d2\x2dinstance\x2d00000001.scope
  v2: {root}/machine.slice/machine-qemu\x2d2\x2dinstance\x2d00000001.scope[/libvirt|/emulator|/vcpu*]
*/
const SLURM_ID_PATTERN: &str = "^.*/slurm(?:.*?)/job_([0-9]+)(?:.*$)";
const LIBVIRT_ID_PATTERN: &str = "^.*/(?:.+?)-qemu-(?:[0-9]+)-(instance-[0-9a-f]+)(?:.*$)";
const SLURM_IGNORED_PROCS_PATTERN: &str = "slurmstepd:(.*)|sleep ([0-9]+)|/bin/bash (.*)/slurm_script";

impl ResourceManager {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceManager::Slurm => "slurm",
            ResourceManager::Libvirt => "libvirt",
        }
    }
}

impl fmt::Display for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceManager {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, ManagerError> {
        match s {
            "slurm" => Ok(ResourceManager::Slurm),
            "libvirt" => Ok(ResourceManager::Libvirt),
            other => Err(ManagerError::UnknownManager(other.to_string())),
        }
    }
}

/// Errors of [`CgroupManager`] construction.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown resource manager: {0}")]
    UnknownManager(String),
    #[error("invalid cgroup id pattern: {0}")]
    IdPattern(#[from] regex::Error),
}

/// Construction options for [`CgroupManager`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Root of the cgroup filesystem.
    pub cgroupfs_root: PathBuf,
    /// Root of procfs.
    pub procfs_root: PathBuf,
    /// Controller whose hierarchy is walked on cgroups v1.
    pub active_controller: String,
    /// Bypasses layout auto-detection. Only meant for tests.
    pub force_mode: Option<CgroupMode>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cgroupfs_root: PathBuf::from("/sys/fs/cgroup"),
            procfs_root: PathBuf::from("/proc"),
            active_controller: "cpuacct".to_string(),
            force_mode: None,
        }
    }
}

/// Knows where one resource manager puts its cgroups on this host and how to
/// recognize them.
///
/// The mount point, id pattern, child classification and process filter are
/// all fixed at construction; discovery and measurement only read them.
pub struct CgroupManager {
    manager: ResourceManager,
    mode: CgroupMode,
    root: PathBuf,
    procfs_root: PathBuf,
    active_controller: String,
    slice: &'static str,
    scope: Option<&'static str>,
    mount_point: PathBuf,
    hierarchy_root: PathBuf,
    id_regex: Regex,
    ignored_procs: Option<Regex>,
}

impl CgroupManager {
    pub fn new(manager: ResourceManager, opts: Options) -> Result<Self, ManagerError> {
        let mode = opts.force_mode.unwrap_or_else(|| detect_mode(&opts.cgroupfs_root));
        let root = opts.cgroupfs_root;

        // Unit cgroups live under `mount_point`; unit-relative paths are
        // resolved against `hierarchy_root`, which is shifted down to the
        // active controller on v1.
        let (slice, scope, mount_point, hierarchy_root) = match (manager, mode) {
            (ResourceManager::Slurm, CgroupMode::V2) => (
                "system.slice",
                Some("slurmstepd.scope"),
                root.join("system.slice").join("slurmstepd.scope"),
                root.clone(),
            ),
            (ResourceManager::Slurm, CgroupMode::V1) => (
                "slurm",
                None,
                root.join(&opts.active_controller).join("slurm"),
                root.join(&opts.active_controller),
            ),
            (ResourceManager::Libvirt, CgroupMode::V2) => {
                ("machine.slice", None, root.join("machine.slice"), root.clone())
            }
            (ResourceManager::Libvirt, CgroupMode::V1) => (
                "machine.slice",
                None,
                root.join(&opts.active_controller).join("machine.slice"),
                root.join(&opts.active_controller),
            ),
        };

        let id_regex = Regex::new(match manager {
            ResourceManager::Slurm => SLURM_ID_PATTERN,
            ResourceManager::Libvirt => LIBVIRT_ID_PATTERN,
        })?;
        let ignored_procs = match manager {
            ResourceManager::Slurm => Some(Regex::new(SLURM_IGNORED_PROCS_PATTERN)?),
            ResourceManager::Libvirt => None,
        };

        Ok(Self {
            manager,
            mode,
            root,
            procfs_root: opts.procfs_root,
            active_controller: opts.active_controller,
            slice,
            scope,
            mount_point,
            hierarchy_root,
            id_regex,
            ignored_procs,
        })
    }

    pub fn resource_manager(&self) -> ResourceManager {
        self.manager
    }

    pub fn mode(&self) -> CgroupMode {
        self.mode
    }

    /// Root of the cgroup filesystem, shared by all v1 controller hierarchies.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn procfs_root(&self) -> &Path {
        &self.procfs_root
    }

    pub fn active_controller(&self) -> &str {
        &self.active_controller
    }

    /// Directory under which the resource manager creates unit cgroups.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Directory that unit-relative paths are resolved against.
    pub fn hierarchy_root(&self) -> &Path {
        &self.hierarchy_root
    }

    /// Pattern whose first capture group is the resource-manager id of a unit.
    /// Applied to unescaped paths.
    pub fn id_regex(&self) -> &Regex {
        &self.id_regex
    }

    /// True for cgroups that belong to a unit but are not its root: Slurm
    /// steps, libvirt emulator/vcpu/libvirt sub-scopes.
    pub fn is_child(&self, sanitized_path: &str) -> bool {
        match self.manager {
            ResourceManager::Slurm => sanitized_path.contains("/step_"),
            // In v1 the emulator and vcpu* children sit flat under the scope,
            // in v2 they are all inside a libvirt child.
            ResourceManager::Libvirt => {
                sanitized_path.contains("/libvirt")
                    || sanitized_path.contains("/emulator")
                    || sanitized_path.contains("/vcpu")
            }
        }
    }

    /// True when a member process must not be attributed to the unit, based
    /// on its command line.
    pub fn ignore_proc(&self, cmdline: &str) -> bool {
        self.ignored_procs.as_ref().is_some_and(|re| re.is_match(cmdline))
    }
}

impl fmt::Debug for CgroupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupManager")
            .field("manager", &self.manager)
            .field("mode", &self.mode)
            .field("root", &self.root)
            .field("slice", &self.slice)
            .field("scope", &self.scope)
            .field("mount_point", &self.mount_point)
            .finish_non_exhaustive()
    }
}

/// The unified hierarchy always exposes `cgroup.controllers` at its root.
fn detect_mode(root: &Path) -> CgroupMode {
    if root.join("cgroup.controllers").is_file() {
        CgroupMode::V2
    } else {
        CgroupMode::V1
    }
}
