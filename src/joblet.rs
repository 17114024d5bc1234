//! The daemon façade: validation, job construction, dispatch, and
//! lifecycle orchestration.
//!
//! Construction is a strict DAG — platform, then the resource managers,
//! then process manager and coordinator, with the façade holding the
//! references; nothing points back up. The façade owns the background
//! threads: the scheduler and its executor, the persist forwarder, the
//! metrics sampler and the cleanup reconciler.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cgroup::CgroupManager;
use crate::cleanup::{CleanupCoordinator, CleanupOutcome};
use crate::config::JobletConfig;
use crate::coordinator::ExecutionCoordinator;
use crate::error::{Error, Result};
use crate::job::{Job, JobRequest, JobStatus, JobSummary};
use crate::metrics::MetricsSampler;
use crate::network::{NetworkInfo, NetworkManager};
use crate::platform::Platform;
use crate::process::ProcessManager;
use crate::runtime::installer::{InstallOutcome, Progress, RuntimeInstaller};
use crate::runtime::{InstalledRuntime, RuntimeCatalog};
use crate::scheduler::Scheduler;
use crate::store::{JobStore, LogChunk, MetricSample, PersistFrame};
use crate::upload::UploadManager;
use crate::workspace::WorkspaceManager;

/// Result of `delete_all_jobs`: active jobs are skipped, not killed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteAllResult {
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct Joblet {
    platform: Arc<dyn Platform>,
    config: JobletConfig,
    store: Arc<JobStore>,
    cgroups: Arc<CgroupManager>,
    workspaces: Arc<WorkspaceManager>,
    network: Arc<NetworkManager>,
    coordinator: Arc<ExecutionCoordinator>,
    scheduler: Arc<Scheduler>,
    cleanup: Arc<CleanupCoordinator>,
    catalog: Arc<RuntimeCatalog>,
    installer: Arc<RuntimeInstaller>,
    // Receivers handed to background threads by `start`.
    persist_rx: Mutex<Option<Receiver<PersistFrame>>>,
    due_rx: Mutex<Option<Receiver<Job>>>,
    shutdown_txs: Mutex<Vec<Sender<()>>>,
}

impl Joblet {
    /// Wire the component DAG. Nothing starts running until
    /// [`start`](Self::start).
    pub fn new(platform: Arc<dyn Platform>, config: JobletConfig) -> Result<Arc<Joblet>> {
        let (store, persist_rx) = JobStore::new(config.buffer_retain_bytes);
        let cgroups = Arc::new(CgroupManager::new(platform.clone(), &config));
        let workspaces = Arc::new(WorkspaceManager::new(platform.clone(), &config));
        let network = Arc::new(NetworkManager::new(platform.clone(), &config)?);
        let uploads = Arc::new(UploadManager::new(platform.clone()));
        let processes = Arc::new(ProcessManager::new(platform.clone(), &config));
        let catalog = Arc::new(RuntimeCatalog::new(platform.clone(), &config));
        let installer = Arc::new(RuntimeInstaller::new(
            platform.clone(),
            &config,
            catalog.clone(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            platform.clone(),
            config.clone(),
            workspaces.clone(),
            network.clone(),
            uploads.clone(),
            processes.clone(),
            store.clone(),
            catalog.clone(),
        ));
        let (scheduler, due_rx) = Scheduler::new();
        let cleanup = Arc::new(CleanupCoordinator::new(
            platform.clone(),
            config.clone(),
            cgroups.clone(),
            workspaces.clone(),
            network.clone(),
            processes.clone(),
            store.clone(),
        ));

        Ok(Arc::new(Joblet {
            platform,
            config,
            store,
            cgroups,
            workspaces,
            network,
            coordinator,
            scheduler,
            cleanup,
            catalog,
            installer,
            persist_rx: Mutex::new(Some(persist_rx)),
            due_rx: Mutex::new(Some(due_rx)),
            shutdown_txs: Mutex::new(Vec::new()),
        }))
    }

    /// Start the background machinery. Call once.
    pub fn start(self: &Arc<Self>) {
        if let Some(rx) = self.persist_rx.lock().expect("persist rx").take() {
            let _ = self.platform.mkdir_all(&self.config.run_dir);
            crate::store::spawn_persist_forwarder(rx, self.config.persist_socket());
        }

        self.scheduler.spawn();
        if let Some(due_rx) = self.due_rx.lock().expect("due rx").take() {
            let joblet = self.clone();
            std::thread::Builder::new()
                .name("scheduler-executor".to_string())
                .spawn(move || {
                    for job in due_rx.iter() {
                        if let Err(e) = joblet.run_due(job) {
                            error!(error = %e, "scheduled job failed to start");
                        }
                    }
                })
                .expect("spawn scheduler executor");
        }

        let (metrics_shutdown_tx, metrics_shutdown_rx) = unbounded();
        MetricsSampler::new(self.platform.clone(), self.store.clone(), &self.config)
            .spawn(metrics_shutdown_rx);
        let (reconcile_shutdown_tx, reconcile_shutdown_rx) = unbounded();
        self.cleanup.clone().spawn_reconciler(reconcile_shutdown_rx);
        self.shutdown_txs
            .lock()
            .expect("shutdown txs")
            .extend([metrics_shutdown_tx, reconcile_shutdown_tx]);

        if !self.coordinator.ci_mode()
            && let Err(e) = self.network.ensure_default_bridge()
        {
            warn!(error = %e, "default bridge setup failed; bridge jobs will not start");
        }
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        for tx in self.shutdown_txs.lock().expect("shutdown txs").drain(..) {
            let _ = tx.send(());
        }
    }

    // ---- job lifecycle ----

    /// Validate, build, and either schedule or launch.
    pub fn start_job(self: &Arc<Self>, req: JobRequest) -> Result<JobSummary> {
        let mut job = Job::build(req, &self.config, Utc::now())?;
        info!(job_id = %job.uuid, command = %job.command, "job accepted");

        if let Some(when) = job.scheduled_time {
            if !job.uploads.is_empty() {
                // Pre-stage now; the scheduler holds references only.
                let runtime = self
                    .coordinator
                    .resolve_runtime(&job)
                    .map_err(|e| Error::ResourceSetup(format!("{e:#}")))?;
                let workspace = self
                    .workspaces
                    .prepare(&job, runtime.as_ref())
                    .map_err(|e| Error::ResourceSetup(format!("{e:#}")))?;
                let uploads = std::mem::take(&mut job.uploads);
                UploadManager::new(self.platform.clone())
                    .prestage(&workspace.work_dir, &uploads, job.limits.memory_mb)
                    .map_err(|e| Error::ResourceSetup(format!("{e:#}")))?;
            }
            let summary = job.summary();
            self.store.put(job.clone());
            self.scheduler.add(job, when);
            return Ok(summary);
        }

        self.run_immediate(job)
    }

    /// A scheduled job came due: back to Initializing, then the normal
    /// launch path.
    fn run_due(self: &Arc<Self>, mut job: Job) -> Result<JobSummary> {
        job.status = JobStatus::Initializing;
        self.run_immediate(job)
    }

    fn run_immediate(self: &Arc<Self>, job: Job) -> Result<JobSummary> {
        let ci = self.coordinator.ci_mode();

        if !ci {
            let runtime = self
                .coordinator
                .resolve_runtime(&job)
                .map_err(|e| Error::ResourceSetup(format!("{e:#}")))?;
            if let Err(e) = self.cgroups.create(&job.cgroup_path, &job.limits) {
                return Err(Error::ResourceSetup(format!("{e:#}")));
            }
            if let Err(e) = self.workspaces.prepare(&job, runtime.as_ref()) {
                // Roll back what resource setup already created.
                let _ = self.cgroups.cleanup(&job.cgroup_path);
                return Err(Error::ResourceSetup(format!("{e:#}")));
            }
        }

        self.store.put(job.clone());

        match self.coordinator.start_job(&job) {
            Ok(pid) => {
                let summary = self
                    .store
                    .update(&job.uuid, |j| {
                        j.status = JobStatus::Running;
                        j.pid = Some(pid);
                    })?
                    .summary();
                self.spawn_monitor(job.uuid.clone(), pid, job.kind);
                Ok(summary)
            }
            Err(e) => {
                error!(job_id = %job.uuid, error = %format!("{e:#}"), "launch failed");
                let _ = self.store.update(&job.uuid, |j| {
                    j.finish(JobStatus::Failed, -1, Utc::now());
                });
                let _ = self.cleanup.cleanup_for_kind(&job.uuid, job.kind);
                Err(Error::Launch(format!("{e:#}")))
            }
        }
    }

    /// Wait for exit, set the terminal state, tear down.
    fn spawn_monitor(self: &Arc<Self>, uuid: String, pid: u32, kind: crate::job::JobKind) {
        let joblet = self.clone();
        std::thread::Builder::new()
            .name(format!("monitor-{uuid}"))
            .spawn(move || {
                let exit = joblet.platform.wait(pid);
                let (status, code) = match exit {
                    Ok(exit) if exit.success() => (JobStatus::Completed, 0),
                    Ok(exit) => (JobStatus::Failed, exit.code_or(-1)),
                    Err(_) => (JobStatus::Failed, -1),
                };
                let _ = joblet.store.update(&uuid, |j| {
                    // A racing stop already holds the terminal state.
                    if j.status == JobStatus::Running {
                        j.finish(status, code, Utc::now());
                    }
                });
                info!(job_id = %uuid, status = status.as_str(), code, "job finished");
                if let Err(e) = joblet.cleanup.cleanup_for_kind(&uuid, kind) {
                    warn!(job_id = %uuid, error = %e, "post-exit cleanup incomplete");
                }
            })
            .expect("spawn monitor thread");
    }

    /// Stop a scheduled or running job. `force` skips the graceful
    /// window; `reason` is recorded in the log only.
    pub fn stop_job(&self, uuid: &str, force: bool, reason: &str) -> Result<JobSummary> {
        let job = self.store.get(uuid)?;
        info!(job_id = %uuid, force, reason, "stop requested");
        match job.status {
            JobStatus::Scheduled => {
                self.scheduler.remove(uuid);
                let summary = self
                    .store
                    .update(uuid, |j| j.finish(JobStatus::Stopped, -1, Utc::now()))?
                    .summary();
                if !job.kind.preserve_artifacts() {
                    let _ = self.cleanup.cleanup_job(uuid);
                }
                Ok(summary)
            }
            JobStatus::Running => {
                if force && let Some(pid) = job.pid {
                    let _ = self
                        .platform
                        .kill_process_group(pid, crate::platform::Sig::Kill);
                }
                let outcome = if job.kind.preserve_artifacts() {
                    match job.pid {
                        Some(pid) => self.cleanup.cleanup_with_process_system_only(uuid, pid),
                        None => self.cleanup.cleanup_system_resources_only(uuid),
                    }
                } else {
                    self.cleanup.cleanup_job(uuid)
                };
                if matches!(outcome, Ok(CleanupOutcome::InProgress)) {
                    // The monitor raced us; the record just needs the
                    // operator-stopped marker.
                    info!(job_id = %uuid, "cleanup already running, marking stopped");
                }
                let summary = self
                    .store
                    .update(uuid, |j| {
                        if !j.status.is_terminal() {
                            j.finish(JobStatus::Stopped, -1, Utc::now());
                        } else {
                            j.status = JobStatus::Stopped;
                        }
                    })?
                    .summary();
                Ok(summary)
            }
            status => Err(Error::InvalidState(format!(
                "job {uuid} is {}, not running or scheduled",
                status.as_str()
            ))),
        }
    }

    /// Remove a terminal job and everything persisted about it. Running
    /// and scheduled jobs must be stopped first.
    pub fn delete_job(&self, uuid: &str) -> Result<()> {
        let job = self.store.get(uuid)?;
        if job.status.is_active() {
            return Err(Error::InvalidState(format!(
                "job {uuid} is {}; stop it before deleting",
                job.status.as_str()
            )));
        }
        self.store.remove(uuid)?;
        // Final sweep for anything still on disk.
        let _ = self.cleanup.cleanup_for_kind(uuid, job.kind);
        info!(job_id = %uuid, "job deleted");
        Ok(())
    }

    pub fn delete_all_jobs(&self) -> DeleteAllResult {
        let mut result = DeleteAllResult::default();
        for job in self.store.list() {
            if job.status.is_active() {
                result.skipped.push(job.uuid);
            } else if self.delete_job(&job.uuid).is_ok() {
                result.deleted.push(job.uuid);
            } else {
                result.skipped.push(job.uuid);
            }
        }
        result
    }

    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.store.list().iter().map(Job::summary).collect()
    }

    pub fn get_job(&self, uuid: &str) -> Result<JobSummary> {
        Ok(self.store.get(uuid)?.summary())
    }

    // ---- streams ----

    pub fn stream_logs(&self, uuid: &str) -> Result<(Vec<LogChunk>, Receiver<LogChunk>)> {
        self.store.get(uuid)?;
        Ok(self.store.subscribe(uuid))
    }

    pub fn stream_metrics(&self, uuid: &str) -> Result<(Vec<MetricSample>, Receiver<MetricSample>)> {
        self.store.get(uuid)?;
        Ok(self.store.subscribe_metrics(uuid))
    }

    // ---- networks ----

    pub fn create_network(&self, name: &str, cidr: &str) -> Result<NetworkInfo> {
        self.network.create_network(name, cidr)
    }

    pub fn remove_network(&self, name: &str) -> Result<()> {
        self.network.remove_network(name)
    }

    pub fn list_networks(&self) -> Vec<NetworkInfo> {
        self.network.list_networks()
    }

    // ---- runtimes ----

    pub fn list_runtimes(&self) -> Vec<InstalledRuntime> {
        self.catalog.list()
    }

    pub fn remove_runtime(&self, reference: &str) -> Result<()> {
        self.catalog.remove(reference)
    }

    pub fn install_runtime(
        &self,
        spec: &str,
        force: bool,
        progress: Progress<'_>,
    ) -> Result<InstallOutcome> {
        self.installer.install_from_registry(spec, force, progress)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn install_runtime_from_github(
        &self,
        spec: &str,
        repo: &str,
        branch: Option<&str>,
        path: Option<&str>,
        force: bool,
        progress: Progress<'_>,
    ) -> Result<InstallOutcome> {
        self.installer
            .install_from_github(spec, repo, branch, path, force, progress)
    }

    /// The address a running bridge-network job holds, if any.
    pub fn job_ip(&self, uuid: &str) -> Option<Ipv4Addr> {
        self.network.allocation_for(uuid).map(|a| a.ip_address)
    }
}
