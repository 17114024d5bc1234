//! Per-job chroot tree construction.
//!
//! The host side prepares `<base_dir>/<uuid>/` with the init binary, the
//! writable workspace and every mount point; the in-namespace init then
//! executes the mount plan and pivots into the tree. Host paths outside
//! the tree are reachable read-only at most (runtime mounts) and the only
//! writable locations are `work/` and the named volumes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::config::JobletConfig;
use crate::job::Job;
use crate::platform::{MountRequest, Platform};
use crate::runtime::ResolvedRuntime;

/// Directory name of the writable workspace inside the tree.
pub const WORK_DIR: &str = "work";
/// Where named volumes appear inside the chroot.
pub const VOLUMES_DIR: &str = "volumes";
/// Path of the init binary inside the tree.
pub const INIT_PATH: &str = "sbin/init";

/// A prepared chroot tree.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub work_dir: PathBuf,
}

pub struct WorkspaceManager {
    platform: Arc<dyn Platform>,
    base_dir: PathBuf,
    volumes_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(platform: Arc<dyn Platform>, config: &JobletConfig) -> WorkspaceManager {
        WorkspaceManager {
            platform,
            base_dir: config.base_dir.clone(),
            volumes_dir: config.volumes_dir.clone(),
        }
    }

    pub fn job_root(&self, uuid: &str) -> PathBuf {
        self.base_dir.join(uuid)
    }

    /// Build the tree skeleton: workspace, pseudo-filesystem mount points,
    /// and a mount point per volume and runtime target.
    pub fn prepare(&self, job: &Job, runtime: Option<&ResolvedRuntime>) -> Result<Workspace> {
        let root = self.job_root(&job.uuid);
        for dir in ["", WORK_DIR, "proc", "sys", "dev", "dev/pts", "tmp", "sbin"] {
            self.platform.mkdir_all(&root.join(dir))?;
        }

        for volume in &job.volumes {
            let source = self.volumes_dir.join(volume);
            if !self.platform.is_dir(&source) {
                bail!("volume {volume:?} does not exist at {}", source.display());
            }
            self.platform
                .mkdir_all(&root.join(VOLUMES_DIR).join(volume))?;
        }

        if let Some(rt) = runtime {
            for mount in rt.mounts() {
                let target = root.join(mount.target.trim_start_matches('/'));
                self.platform.mkdir_all(&target)?;
            }
        }

        debug!(job_id = %job.uuid, root = %root.display(), "workspace prepared");
        Ok(Workspace {
            work_dir: root.join(WORK_DIR),
            root,
        })
    }

    /// Copy the daemon binary into the tree as `sbin/init`, exec bit set.
    pub fn install_init(&self, workspace: &Workspace, daemon_exe: &Path) -> Result<PathBuf> {
        let init = workspace.root.join(INIT_PATH);
        self.platform
            .copy_file(daemon_exe, &init, 0o755)
            .context("install init binary")?;
        Ok(init)
    }

    /// Remove the whole tree. Mounts inside it must already be gone.
    pub fn cleanup(&self, uuid: &str) -> Result<()> {
        self.platform.remove_all(&self.job_root(uuid))
    }
}

/// The ordered mount list the in-namespace init performs after
/// `CLONE_NEWNS`, before pivoting into `root`. Also consulted by cleanup
/// to unmount in reverse when a tree is torn down without its namespace.
pub fn build_mount_plan(
    root: &Path,
    volumes_dir: &Path,
    volumes: &[String],
    runtime: Option<&ResolvedRuntime>,
) -> Vec<MountRequest> {
    let mut plan = Vec::new();
    // Nothing below may propagate back to the host mount table.
    plan.push(MountRequest::rprivate_root());
    plan.push(MountRequest::filesystem("proc", root.join("proc")));
    plan.push(MountRequest::filesystem("sysfs", root.join("sys")));
    plan.push(MountRequest::bind("/dev", root.join("dev")).recursive());
    plan.push(
        MountRequest::filesystem("devpts", root.join("dev/pts")).with_data("newinstance,ptmxmode=0666"),
    );
    plan.push(MountRequest::filesystem("tmpfs", root.join("tmp")));

    if let Some(rt) = runtime {
        for mount in rt.mounts() {
            let target = root.join(mount.target.trim_start_matches('/'));
            let source = rt.resolve_source(&mount.source);
            plan.push(MountRequest::bind(&source, &target));
            if mount.readonly {
                plan.push(MountRequest::remount_readonly(&target));
            }
        }
    }

    for volume in volumes {
        plan.push(MountRequest::bind(
            volumes_dir.join(volume),
            root.join(VOLUMES_DIR).join(volume),
        ));
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobRequest};
    use crate::platform::testing::FakePlatform;
    use chrono::Utc;

    fn job_with_volumes(volumes: &[&str]) -> Job {
        let req = JobRequest {
            command: "echo".to_string(),
            volumes: volumes.iter().map(|s| s.to_string()).collect(),
            ..JobRequest::default()
        };
        Job::build(req, &JobletConfig::default(), Utc::now()).expect("build job")
    }

    #[test]
    fn prepare_builds_skeleton() {
        let platform = Arc::new(FakePlatform::new());
        let mgr = WorkspaceManager::new(platform.clone(), &JobletConfig::default());
        let job = job_with_volumes(&[]);
        let ws = mgr.prepare(&job, None).expect("prepare");
        assert_eq!(ws.root, PathBuf::from("/opt/joblet/jobs").join(&job.uuid));
        assert_eq!(ws.work_dir, ws.root.join("work"));
        for dir in ["work", "proc", "sys", "dev/pts", "tmp", "sbin"] {
            assert!(platform.is_dir(&ws.root.join(dir)), "missing {dir}");
        }
    }

    #[test]
    fn missing_volume_fails_preparation() {
        let platform = Arc::new(FakePlatform::new());
        let mgr = WorkspaceManager::new(platform, &JobletConfig::default());
        let job = job_with_volumes(&["data"]);
        assert!(mgr.prepare(&job, None).is_err());
    }

    #[test]
    fn known_volume_gets_a_mount_point() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_dir("/opt/joblet/volumes/data");
        let mgr = WorkspaceManager::new(platform.clone(), &JobletConfig::default());
        let job = job_with_volumes(&["data"]);
        let ws = mgr.prepare(&job, None).expect("prepare");
        assert!(platform.is_dir(&ws.root.join("volumes/data")));
    }

    #[test]
    fn mount_plan_orders_pseudo_filesystems_first() {
        let root = Path::new("/opt/joblet/jobs/j1");
        let plan = build_mount_plan(
            root,
            Path::new("/opt/joblet/volumes"),
            &["data".to_string()],
            None,
        );
        assert!(plan[0].make_rprivate);
        assert_eq!(plan[1].fstype.as_deref(), Some("proc"));
        let last = plan.last().expect("volume mount");
        assert_eq!(last.target, root.join("volumes/data"));
        assert!(last.bind && !last.readonly);
    }
}
