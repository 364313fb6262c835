//! Discovery tests against fake cgroup trees.

use std::fs;
use std::path::Path;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use util_cgroups::{CgroupManager, CgroupMode, Options, ResourceManager};

fn manager(rm: ResourceManager, mode: CgroupMode, root: &Path) -> CgroupManager {
    CgroupManager::new(
        rm,
        Options {
            cgroupfs_root: root.to_path_buf(),
            force_mode: Some(mode),
            ..Options::default()
        },
    )
    .unwrap()
}

#[test]
fn slurm_v2_job_with_steps() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    let job = root.path().join("system.slice/slurmstepd.scope/job_42");
    fs::create_dir_all(job.join("step_extern/user/task_0"))?;
    fs::create_dir_all(job.join("step_interactive"))?;
    // our own PID resolves from /proc; the bogus one vanished and is dropped
    fs::write(job.join("cgroup.procs"), format!("{}\n4294967\n", std::process::id()))?;

    let manager = manager(ResourceManager::Slurm, CgroupMode::V2, root.path());
    let cgroups = manager.discover()?;

    assert_eq!(cgroups.len(), 1);
    let cgroup = &cgroups[0];
    assert_eq!(cgroup.id, "42");
    assert_eq!(cgroup.uuid, "42");
    assert_eq!(
        cgroup.path.rel,
        Path::new("system.slice/slurmstepd.scope/job_42")
    );
    // the root and its four step directories
    assert_eq!(cgroup.children.len(), 5);
    assert!(cgroup
        .children
        .iter()
        .any(|child| child.abs.ends_with("job_42/step_interactive")));
    assert_eq!(cgroup.procs.len(), 1);
    Ok(())
}

#[test]
fn libvirt_v1_two_machines_with_escaped_names() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    let slice = root.path().join("cpuacct/machine.slice");
    let vm_a = slice.join(r"machine-qemu\x2d1\x2dinstance\x2d0000000a.scope");
    let vm_b = slice.join(r"machine-qemu\x2d2\x2dinstance\x2d0000000b.scope");
    fs::create_dir_all(vm_a.join("emulator"))?;
    fs::create_dir_all(vm_a.join("vcpu0"))?;
    fs::create_dir_all(&vm_b)?;

    let manager = manager(ResourceManager::Libvirt, CgroupMode::V1, root.path());
    let mut cgroups = manager.discover()?;
    cgroups.sort_by(|a, b| a.id.cmp(&b.id));

    assert_eq!(cgroups.len(), 2);
    assert_eq!(cgroups[0].uuid, "instance-0000000a");
    assert_eq!(cgroups[1].uuid, "instance-0000000b");
    // emulator and vcpu0 are children of the first machine, not units
    assert_eq!(cgroups[0].children.len(), 3);
    assert_eq!(cgroups[1].children.len(), 1);
    // the decoded path is what the unit reports
    assert!(cgroups[0]
        .path
        .abs
        .ends_with("machine.slice/machine-qemu-1-instance-0000000a.scope"));
    Ok(())
}

#[test]
fn empty_mount_point_yields_no_units() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    fs::create_dir_all(root.path().join("system.slice/slurmstepd.scope"))?;

    let manager = manager(ResourceManager::Slurm, CgroupMode::V2, root.path());
    assert!(manager.discover()?.is_empty());
    Ok(())
}

#[test]
fn missing_mount_point_yields_no_units() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    let manager = manager(ResourceManager::Slurm, CgroupMode::V2, root.path());
    assert!(manager.discover()?.is_empty());
    Ok(())
}

#[test]
fn two_passes_agree_when_nothing_changed() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    fs::create_dir_all(root.path().join("system.slice/slurmstepd.scope/job_1"))?;
    fs::create_dir_all(root.path().join("system.slice/slurmstepd.scope/job_2"))?;

    let manager = manager(ResourceManager::Slurm, CgroupMode::V2, root.path());
    let ids = |cgroups: Vec<util_cgroups::Cgroup>| {
        let mut ids: Vec<String> = cgroups.into_iter().map(|c| c.uuid).collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(manager.discover()?), ids(manager.discover()?));
    Ok(())
}
