// Prevent compiling outside of Linux: cgroups only exist on Linux, and we rely on
// Linux mechanisms like /proc and the cgroup filesystem layout.
#[cfg(not(target_os = "linux"))]
compile_error!("only Linux is supported");

pub mod discover;
pub mod escape;
pub mod host;
pub mod manager;
pub mod measure;

// re-exports
pub use discover::{Cgroup, CgroupPath, DiscoverError};
pub use host::HostInfo;
pub use manager::{CgroupManager, CgroupMode, ManagerError, Options, ResourceManager};
pub use measure::{reader_for, CgroupMetric, StatsReader};
