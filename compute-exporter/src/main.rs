use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use util_cgroups::{CgroupManager, CgroupMode, HostInfo, Options, ResourceManager};

mod collector;
mod server;

use collector::{CollectorOpts, ComputeCollector};

#[derive(Parser)]
#[command(
    name = "compute-exporter",
    version,
    about = "Prometheus exporter for per-compute-unit cgroup statistics."
)]
struct Cli {
    /// Address to expose the /metrics endpoint on.
    #[arg(long, default_value = "127.0.0.1:9306")]
    web_listen_address: SocketAddr,

    /// Mount point of the cgroup filesystem.
    #[arg(long, default_value = "/sys/fs/cgroup")]
    path_cgroupfs: PathBuf,

    /// Mount point of procfs.
    #[arg(long, default_value = "/proc")]
    path_procfs: PathBuf,

    /// Resource manager that creates the compute units.
    #[arg(long, value_enum)]
    resource_manager: ManagerArg,

    /// Active cgroup controller, cgroups v1 only.
    #[arg(long, default_value = "cpuacct")]
    collector_active_controller: String,

    /// Force the cgroup layout instead of auto-detecting it. Testing only.
    #[arg(long, value_enum, hide = true)]
    collector_force_cgroup_version: Option<VersionArg>,

    /// Expose swap usage.
    #[arg(long)]
    collector_swap: bool,

    /// Expose block IO statistics.
    #[arg(long)]
    collector_blkio: bool,

    /// Expose pressure stall information (cgroups v2 only).
    #[arg(long)]
    collector_psi: bool,

    /// Time budget of one scrape; reads still pending past it are reported
    /// as collection errors.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    scrape_timeout: Duration,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ManagerArg {
    Slurm,
    Libvirt,
}

impl From<ManagerArg> for ResourceManager {
    fn from(arg: ManagerArg) -> Self {
        match arg {
            ManagerArg::Slurm => ResourceManager::Slurm,
            ManagerArg::Libvirt => ResourceManager::Libvirt,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum VersionArg {
    V1,
    V2,
}

impl From<VersionArg> for CgroupMode {
    fn from(arg: VersionArg) -> Self {
        match arg {
            VersionArg::V1 => CgroupMode::V1,
            VersionArg::V2 => CgroupMode::V2,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let manager = CgroupManager::new(
        cli.resource_manager.into(),
        Options {
            cgroupfs_root: cli.path_cgroupfs,
            procfs_root: cli.path_procfs.clone(),
            active_controller: cli.collector_active_controller,
            force_mode: cli.collector_force_cgroup_version.map(CgroupMode::from),
        },
    )
    .context("invalid collector configuration")?;
    log::info!("watching {:?} compute units in {:?} mode", manager.resource_manager(), manager.mode());

    let host = HostInfo::collect(&cli.path_procfs);
    let hostname = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|raw| raw.to_string_lossy().into_owned());

    let collector = Arc::new(ComputeCollector::new(
        manager,
        host,
        CollectorOpts {
            swap: cli.collector_swap,
            blkio: cli.collector_blkio,
            psi: cli.collector_psi,
        },
        hostname,
        cli.scrape_timeout,
    ));

    server::run(cli.web_listen_address, collector).await
}
