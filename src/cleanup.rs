//! Ordered teardown of everything a job owns.
//!
//! The sequence is fixed: processes die first (the kernel refuses to
//! remove a cgroup with members), then namespace file references, the
//! cgroup, the network allocation, and finally the workspace tree. Every
//! step tolerates "already gone", so the coordinator is idempotent; a
//! per-job in-flight marker makes concurrent calls cheap — the second
//! caller returns immediately with `InProgress`.
//!
//! Runtime-build jobs use the system-resources-only variant so their
//! published artifacts under the runtimes directory outlive the job.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::cgroup::CgroupManager;
use crate::config::JobletConfig;
use crate::error::{Error, Result};
use crate::job::JobKind;
use crate::network::NetworkManager;
use crate::platform::Platform;
use crate::process::ProcessManager;
use crate::store::JobStore;
use crate::workspace::WorkspaceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Done,
    /// Another caller is already tearing this job down.
    InProgress,
}

pub struct CleanupCoordinator {
    platform: Arc<dyn Platform>,
    config: JobletConfig,
    cgroups: Arc<CgroupManager>,
    workspaces: Arc<WorkspaceManager>,
    network: Arc<NetworkManager>,
    processes: Arc<ProcessManager>,
    store: Arc<JobStore>,
    in_flight: Mutex<HashSet<String>>,
}

impl CleanupCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn Platform>,
        config: JobletConfig,
        cgroups: Arc<CgroupManager>,
        workspaces: Arc<WorkspaceManager>,
        network: Arc<NetworkManager>,
        processes: Arc<ProcessManager>,
        store: Arc<JobStore>,
    ) -> CleanupCoordinator {
        CleanupCoordinator {
            platform,
            config,
            cgroups,
            workspaces,
            network,
            processes,
            store,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Full teardown, workspace included.
    pub fn cleanup_job(&self, uuid: &str) -> Result<CleanupOutcome> {
        self.run(uuid, None, true)
    }

    /// Steps 1–4 only: process, namespace refs, cgroup, network. Used
    /// for runtime builds, whose filesystem artifacts must survive.
    pub fn cleanup_system_resources_only(&self, uuid: &str) -> Result<CleanupOutcome> {
        self.run(uuid, None, false)
    }

    /// The `StopJob` path for a runtime build: the caller supplies the
    /// pid because the record may already be past its Running state.
    pub fn cleanup_with_process_system_only(&self, uuid: &str, pid: u32) -> Result<CleanupOutcome> {
        self.run(uuid, Some(pid), false)
    }

    /// Pick the variant a job's kind requires.
    pub fn cleanup_for_kind(&self, uuid: &str, kind: JobKind) -> Result<CleanupOutcome> {
        if kind.preserve_artifacts() {
            self.cleanup_system_resources_only(uuid)
        } else {
            self.cleanup_job(uuid)
        }
    }

    fn run(
        &self,
        uuid: &str,
        pid_override: Option<u32>,
        remove_workspace: bool,
    ) -> Result<CleanupOutcome> {
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight set");
            if !in_flight.insert(uuid.to_string()) {
                debug!(job_id = %uuid, "cleanup already in progress");
                return Ok(CleanupOutcome::InProgress);
            }
        }
        let result = self.run_steps(uuid, pid_override, remove_workspace);
        self.in_flight
            .lock()
            .expect("in-flight set")
            .remove(uuid);
        result.map(|()| CleanupOutcome::Done)
    }

    fn run_steps(
        &self,
        uuid: &str,
        pid_override: Option<u32>,
        remove_workspace: bool,
    ) -> Result<()> {
        let job = self.store.get(uuid).ok();
        let mut hard_error: Option<Error> = None;

        // 1. Process group: graceful, then forceful. A survivor is the
        // one error worth surfacing, but the remaining steps still run.
        let pid = pid_override.or_else(|| job.as_ref().and_then(|j| j.pid));
        if let Some(pid) = pid
            && self.platform.process_alive(pid)
            && let Err(e) = self.processes.stop(pid)
        {
            warn!(job_id = %uuid, pid, error = %e, "process survived termination");
            hard_error = Some(Error::Cleanup(format!("{e:#}")));
        }

        // 2. Namespace file references.
        let netns_ref = NetworkManager::netns_ref_path(&self.config.run_dir, uuid);
        if self.platform.path_exists(&netns_ref) {
            if let Err(e) = self.platform.unmount(&netns_ref) {
                warn!(job_id = %uuid, error = %e, "netns ref unmount failed");
            }
            if let Err(e) = self.platform.remove_all(&netns_ref) {
                warn!(job_id = %uuid, error = %e, "netns ref removal failed");
            }
        }

        // 3. Cgroup (kernel refuses while members remain; step 1 made
        // sure there are none).
        let cgroup_path = job
            .as_ref()
            .map(|j| j.cgroup_path.clone())
            .unwrap_or_else(|| self.config.job_cgroup_path(uuid));
        if let Err(e) = self.cgroups.cleanup(&cgroup_path) {
            warn!(job_id = %uuid, error = %e, "cgroup removal failed");
        }

        // 4. Network allocation.
        if let Some(alloc) = self.network.remove_allocation(uuid) {
            self.network.teardown_job_network(&alloc);
        }

        // 5. Workspace.
        if remove_workspace
            && let Err(e) = self.workspaces.cleanup(uuid)
        {
            warn!(job_id = %uuid, error = %e, "workspace removal failed");
        }

        match hard_error {
            Some(e) => Err(e),
            None => {
                info!(job_id = %uuid, "cleanup complete");
                Ok(())
            }
        }
    }

    /// Periodic sweep: anything on disk without a live job record gets
    /// torn down. Runs every five minutes from [`spawn_reconciler`].
    pub fn reconcile(&self) {
        let live: HashSet<String> = self.store.active_uuids().into_iter().collect();

        // Orphaned workspaces.
        if let Ok(entries) = self.platform.read_dir(&self.config.base_dir) {
            for entry in entries {
                let Some(uuid) = entry.file_name().map(|n| n.to_string_lossy().into_owned())
                else {
                    continue;
                };
                if live.contains(&uuid) {
                    continue;
                }
                let kind = self
                    .store
                    .get(&uuid)
                    .map(|j| j.kind)
                    .unwrap_or(JobKind::Standard);
                debug!(job_id = %uuid, "reconciling orphaned workspace");
                let _ = self.cleanup_for_kind(&uuid, kind);
            }
        }

        // Orphaned cgroups (workspace may already be gone).
        if let Ok(entries) = self.platform.read_dir(&self.config.cgroup_root()) {
            for entry in entries {
                let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let Some(uuid) = name.strip_prefix("job-") else {
                    continue;
                };
                if !live.contains(uuid) {
                    debug!(job_id = %uuid, "reconciling orphaned cgroup");
                    let _ = self.cgroups.cleanup(&entry);
                }
            }
        }

        // Orphaned IP allocations.
        for alloc in self.network.allocations() {
            if !live.contains(&alloc.job_uuid) {
                debug!(job_id = %alloc.job_uuid, ip = %alloc.ip_address, "reconciling orphaned allocation");
                self.network.remove_allocation(&alloc.job_uuid);
                self.network.teardown_job_network(&alloc);
            }
        }
    }

    pub fn spawn_reconciler(
        self: Arc<Self>,
        shutdown: Receiver<()>,
    ) -> std::thread::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        std::thread::Builder::new()
            .name("cleanup-reconciler".to_string())
            .spawn(move || {
                loop {
                    match shutdown.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => self.reconcile(),
                        _ => return,
                    }
                }
            })
            .expect("spawn reconciler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobRequest, JobStatus};
    use crate::platform::testing::{FakeOp, FakePlatform};
    use chrono::Utc;

    struct Fixture {
        platform: Arc<FakePlatform>,
        store: Arc<JobStore>,
        network: Arc<NetworkManager>,
        cleanup: Arc<CleanupCoordinator>,
    }

    fn fixture() -> Fixture {
        let platform = Arc::new(FakePlatform::new());
        platform.add_file(
            "/sys/fs/cgroup/cgroup.controllers",
            b"cpuset cpu io memory\n",
        );
        let config = JobletConfig::default();
        let (store, _persist_rx) = JobStore::new(config.buffer_retain_bytes);
        let network =
            Arc::new(NetworkManager::new(platform.clone(), &config).expect("network"));
        let cleanup = Arc::new(CleanupCoordinator::new(
            platform.clone(),
            config.clone(),
            Arc::new(CgroupManager::new(platform.clone(), &config)),
            Arc::new(WorkspaceManager::new(platform.clone(), &config)),
            network.clone(),
            Arc::new(ProcessManager::new(platform.clone(), &config)),
            store.clone(),
        ));
        Fixture {
            platform,
            store,
            network,
            cleanup,
        }
    }

    fn running_job(fixture: &Fixture, pid: u32) -> Job {
        let mut job = Job::build(
            JobRequest {
                command: "sleep".to_string(),
                ..JobRequest::default()
            },
            &JobletConfig::default(),
            Utc::now(),
        )
        .expect("build");
        job.status = JobStatus::Running;
        job.pid = Some(pid);
        fixture.store.put(job.clone());
        fixture.platform.mark_alive(pid);
        job
    }

    #[test]
    fn full_cleanup_tears_everything_down_in_order() {
        let f = fixture();
        let job = running_job(&f, 5001);
        f.platform.add_dir(format!("/opt/joblet/jobs/{}", job.uuid));
        let ip = f.network.allocate_ip("bridge").expect("allocate");
        let alloc = f
            .network
            .make_allocation(&job.uuid, "bridge", ip, 5001, Utc::now());
        f.network.assign_job(alloc).expect("assign");

        let outcome = f.cleanup.cleanup_job(&job.uuid).expect("cleanup");
        assert_eq!(outcome, CleanupOutcome::Done);
        assert!(!f.platform.process_alive(5001));
        assert!(f.network.allocation_for(&job.uuid).is_none());
        let ws: std::path::PathBuf = format!("/opt/joblet/jobs/{}", job.uuid).into();
        assert!(!f.platform.is_dir(&ws), "workspace removed");
        // The kill precedes the workspace removal.
        let ops = f.platform.ops();
        let kill_idx = ops
            .iter()
            .position(|op| matches!(op, FakeOp::KillGroup(5001, _)))
            .expect("kill op");
        let ws_idx = ops
            .iter()
            .position(|op| {
                matches!(op, FakeOp::RemoveAll(p) if p.ends_with(&job.uuid) && p.starts_with("/opt/joblet/jobs"))
            })
            .expect("workspace removal op");
        assert!(kill_idx < ws_idx);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let f = fixture();
        let job = running_job(&f, 5002);
        f.cleanup.cleanup_job(&job.uuid).expect("first");
        let again = f.cleanup.cleanup_job(&job.uuid).expect("second");
        assert_eq!(again, CleanupOutcome::Done);
    }

    #[test]
    fn concurrent_cleanup_runs_once() {
        let f = fixture();
        let job = running_job(&f, 5003);
        let uuid = job.uuid.clone();
        let cleanup = f.cleanup.clone();
        // Hold the in-flight marker by hand to model the racing caller.
        cleanup
            .in_flight
            .lock()
            .expect("in-flight")
            .insert(uuid.clone());
        assert_eq!(
            cleanup.cleanup_job(&uuid).expect("racing call"),
            CleanupOutcome::InProgress
        );
        cleanup.in_flight.lock().expect("in-flight").remove(&uuid);
        assert_eq!(
            cleanup.cleanup_job(&uuid).expect("real call"),
            CleanupOutcome::Done
        );
    }

    #[test]
    fn system_only_variant_preserves_the_workspace() {
        let f = fixture();
        let job = running_job(&f, 5004);
        let ws: std::path::PathBuf = format!("/opt/joblet/jobs/{}", job.uuid).into();
        f.platform.add_dir(&ws);
        f.cleanup
            .cleanup_system_resources_only(&job.uuid)
            .expect("cleanup");
        assert!(f.platform.is_dir(&ws), "workspace must survive");
    }

    #[test]
    fn unknown_job_cleanup_still_sweeps_paths() {
        let f = fixture();
        // No record at all; derived paths are used and nothing errors.
        assert_eq!(
            f.cleanup.cleanup_job("ghost").expect("cleanup"),
            CleanupOutcome::Done
        );
    }

    #[test]
    fn reconcile_removes_orphans_and_keeps_active_jobs() {
        let f = fixture();
        let live = running_job(&f, 5005);
        let live_ws: std::path::PathBuf = format!("/opt/joblet/jobs/{}", live.uuid).into();
        f.platform.add_dir(&live_ws);
        f.platform.add_dir("/opt/joblet/jobs/dead-job");
        f.platform
            .add_dir("/sys/fs/cgroup/joblet/job-dead-job");

        let ip = f.network.allocate_ip("bridge").expect("allocate");
        let alloc = f
            .network
            .make_allocation("dead-job", "bridge", ip, 77, Utc::now());
        f.network.assign_job(alloc).expect("assign");

        f.cleanup.reconcile();

        assert!(f.platform.is_dir(&live_ws), "active workspace kept");
        assert!(!f.platform.is_dir(std::path::Path::new("/opt/joblet/jobs/dead-job")));
        assert!(f.network.allocation_for("dead-job").is_none());
    }
}
