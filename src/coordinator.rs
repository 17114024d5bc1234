//! Two-phase job launch.
//!
//! The coordinator is the only component that knows about phases. A job
//! with uploads first runs an upload-phase child (full isolation, cgroup
//! limits, bounded wall clock) that materializes the manifest inside the
//! chroot; only a clean exit lets the execute phase start. The execute
//! phase carries the command across the fork boundary in `JOB_*`
//! variables and, for bridge networks, blocks on a ready pipe until the
//! parent has wired the veth pair.
//!
//! `JOBLET_CI_MODE=true` swaps in a minimal path: no namespaces, uploads
//! written directly, the command in its own process group.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::cgroup::CgroupManager;
use crate::config::JobletConfig;
use crate::job::Job;
use crate::jobenv;
use crate::network::NetworkManager;
use crate::platform::{NamespaceSpec, Platform, Sig, SpawnedChild};
use crate::process::{LaunchConfig, ProcessManager};
use crate::runtime::{ResolvedRuntime, RuntimeCatalog, RuntimeSpecifier};
use crate::store::{JobStore, StreamKind, pump_output};
use crate::upload::{UploadManager, encode_manifest};
use crate::workspace::{Workspace, WorkspaceManager};

pub struct ExecutionCoordinator {
    platform: Arc<dyn Platform>,
    config: JobletConfig,
    workspaces: Arc<WorkspaceManager>,
    network: Arc<NetworkManager>,
    uploads: Arc<UploadManager>,
    processes: Arc<ProcessManager>,
    store: Arc<JobStore>,
    catalog: Arc<RuntimeCatalog>,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn Platform>,
        config: JobletConfig,
        workspaces: Arc<WorkspaceManager>,
        network: Arc<NetworkManager>,
        uploads: Arc<UploadManager>,
        processes: Arc<ProcessManager>,
        store: Arc<JobStore>,
        catalog: Arc<RuntimeCatalog>,
    ) -> ExecutionCoordinator {
        ExecutionCoordinator {
            platform,
            config,
            workspaces,
            network,
            uploads,
            processes,
            store,
            catalog,
        }
    }

    /// Whether the CI fallback is active for this daemon.
    pub fn ci_mode(&self) -> bool {
        self.platform.getenv(jobenv::JOBLET_CI_MODE).as_deref() == Some("true")
    }

    /// Resolve the job's runtime reference against the catalog.
    pub fn resolve_runtime(&self, job: &Job) -> Result<Option<ResolvedRuntime>> {
        match job.runtime.as_deref() {
            Some(reference) => {
                let spec = RuntimeSpecifier::parse(reference)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                let resolved = self
                    .catalog
                    .resolve(&spec)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                Ok(Some(resolved))
            }
            None => Ok(None),
        }
    }

    /// Launch the job and return its pid. The caller owns monitoring and
    /// cleanup; on error everything this call created is already gone.
    pub fn start_job(&self, job: &Job) -> Result<u32> {
        if self.ci_mode() {
            return self.start_job_ci(job);
        }

        let runtime = self.resolve_runtime(job)?;
        let workspace = Workspace {
            root: self.workspaces.job_root(&job.uuid),
            work_dir: self.workspaces.job_root(&job.uuid).join(crate::workspace::WORK_DIR),
        };
        let daemon_exe = self.platform.current_exe()?;
        let init_path = self.workspaces.install_init(&workspace, &daemon_exe)?;

        if !job.uploads.is_empty() {
            self.run_upload_phase(job, &runtime, &workspace, &init_path)?;
        }
        self.run_execute_phase(job, &runtime, &workspace, &init_path)
    }

    fn run_upload_phase(
        &self,
        job: &Job,
        runtime: &Option<ResolvedRuntime>,
        workspace: &Workspace,
        init_path: &PathBuf,
    ) -> Result<()> {
        self.uploads
            .check_budget(&job.uploads, job.limits.memory_mb)?;

        let mut env = self.base_env(job, runtime, workspace);
        env.insert(
            jobenv::JOB_PHASE.to_string(),
            jobenv::PHASE_UPLOAD.to_string(),
        );
        env.insert(
            jobenv::JOB_UPLOADS_DATA.to_string(),
            encode_manifest(&job.uploads)?,
        );
        env.insert(
            jobenv::JOB_UPLOADS_COUNT.to_string(),
            job.uploads.len().to_string(),
        );

        let child = self.processes.launch(LaunchConfig {
            job_uuid: job.uuid.clone(),
            program: init_path.clone(),
            args: Vec::new(),
            env: env.into_iter().collect(),
            cwd: None,
            namespaces: Some(NamespaceSpec::full(job.network.wants_netns())),
            into_cgroup: Some(CgroupManager::proc_subgroup(&job.cgroup_path)),
            extra_fd: None,
            new_process_group: false,
        })?;
        let pid = child.pid;
        self.attach_output(job, child);
        debug!(job_id = %job.uuid, pid, "upload phase started");

        match self
            .processes
            .wait_timeout(pid, self.config.upload_timeout())?
        {
            Some(exit) if exit.success() => {
                debug!(job_id = %job.uuid, "upload phase complete");
                Ok(())
            }
            Some(exit) => bail!("upload phase failed with {exit:?}"),
            None => {
                warn!(job_id = %job.uuid, pid, "upload phase timed out");
                let _ = self.processes.kill(pid, Sig::Kill);
                let _ = self.processes.wait(pid);
                bail!(
                    "upload phase exceeded its {:?} budget",
                    self.config.upload_timeout()
                )
            }
        }
    }

    fn run_execute_phase(
        &self,
        job: &Job,
        runtime: &Option<ResolvedRuntime>,
        workspace: &Workspace,
        init_path: &PathBuf,
    ) -> Result<u32> {
        let mut env = self.base_env(job, runtime, workspace);
        env.insert(
            jobenv::JOB_PHASE.to_string(),
            jobenv::PHASE_EXECUTE.to_string(),
        );
        env.insert(jobenv::JOB_COMMAND.to_string(), job.command.clone());
        env.insert(
            jobenv::JOB_ARGS_COUNT.to_string(),
            job.args.len().to_string(),
        );
        for (i, arg) in job.args.iter().enumerate() {
            env.insert(format!("{}{i}", jobenv::JOB_ARG_PREFIX), arg.clone());
        }
        env.insert(
            jobenv::JOB_HAS_UPLOADS.to_string(),
            (!job.uploads.is_empty()).to_string(),
        );
        if let Some(dir) = &job.working_directory {
            env.insert(jobenv::JOB_WORKING_DIR.to_string(), dir.clone());
        }

        // Any network namespace gets a ready pipe; bridged jobs wait for
        // the veth, isolated ones are released immediately.
        let mut ready_tx = None;
        let mut extra_fd = None;
        if job.network.wants_netns() {
            let (rx, tx) = std::io::pipe().context("network ready pipe")?;
            env.insert(jobenv::NETWORK_READY_FD.to_string(), "3".to_string());
            extra_fd = Some(std::os::fd::OwnedFd::from(rx));
            ready_tx = Some(tx);
        }

        let child = self.processes.launch(LaunchConfig {
            job_uuid: job.uuid.clone(),
            program: init_path.clone(),
            args: Vec::new(),
            env: env.into_iter().collect(),
            cwd: None,
            namespaces: Some(NamespaceSpec::full(job.network.wants_netns())),
            into_cgroup: Some(CgroupManager::proc_subgroup(&job.cgroup_path)),
            extra_fd,
            new_process_group: false,
        })?;
        let pid = child.pid;
        self.attach_output(job, child);

        if job.network.needs_veth()
            && let Err(e) = self.wire_network(job, pid)
        {
            let _ = self.processes.kill(pid, Sig::Kill);
            let _ = self.processes.wait(pid);
            return Err(e.context("job network setup"));
        }

        if let Some(mut tx) = ready_tx {
            tx.write_all(&[1]).context("signal network ready")?;
        }
        info!(job_id = %job.uuid, pid, network = job.network.as_str(), "job started");
        Ok(pid)
    }

    /// Allocate, record, wire. On failure the address and the allocation
    /// record are rolled back before the error is surfaced.
    fn wire_network(&self, job: &Job, pid: u32) -> Result<()> {
        let network = job
            .network
            .network_name()
            .expect("veth networks have a name");
        let ip = self
            .network
            .allocate_ip(network)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let alloc = self
            .network
            .make_allocation(&job.uuid, network, ip, pid, chrono::Utc::now());
        if let Err(e) = self.network.assign_job(alloc.clone()) {
            self.network.release_ip(network, ip);
            return Err(anyhow::anyhow!("{e}"));
        }
        if let Err(e) = self.network.setup_job_network(&alloc, pid) {
            self.network.teardown_job_network(&alloc);
            self.network.remove_allocation(&job.uuid);
            return Err(e);
        }
        Ok(())
    }

    /// CI fallback: no namespaces, direct uploads, own process group,
    /// minimal environment.
    fn start_job_ci(&self, job: &Job) -> Result<u32> {
        let work_dir = self.workspaces.job_root(&job.uuid).join(crate::workspace::WORK_DIR);
        self.platform.mkdir_all(&work_dir)?;
        if !job.uploads.is_empty() {
            self.uploads
                .check_budget(&job.uploads, job.limits.memory_mb)?;
            self.uploads.apply(&work_dir, &job.uploads)?;
        }

        let program = if job.command.starts_with('/') {
            PathBuf::from(&job.command)
        } else {
            self.platform
                .lookup_path(&job.command)
                .with_context(|| format!("command {:?} not found", job.command))?
        };

        let mut env: BTreeMap<String, String> = job
            .environment
            .iter()
            .chain(job.secret_environment.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.entry("PATH".to_string()).or_insert_with(|| {
            self.platform
                .getenv("PATH")
                .unwrap_or_else(|| "/usr/bin:/bin".to_string())
        });
        env.insert("HOME".to_string(), "/tmp".to_string());
        env.insert("USER".to_string(), "joblet".to_string());
        env.insert(jobenv::JOB_ID.to_string(), job.uuid.clone());

        let child = self.processes.launch(LaunchConfig {
            job_uuid: job.uuid.clone(),
            program,
            args: job.args.clone(),
            env: env.into_iter().collect(),
            cwd: Some(work_dir),
            namespaces: None,
            into_cgroup: None,
            extra_fd: None,
            new_process_group: true,
        })?;
        let pid = child.pid;
        self.attach_output(job, child);
        info!(job_id = %job.uuid, pid, "job started (CI mode)");
        Ok(pid)
    }

    /// Everything both phases share. User environment first, engine keys
    /// over it so nothing can shadow the control variables.
    fn base_env(
        &self,
        job: &Job,
        runtime: &Option<ResolvedRuntime>,
        workspace: &Workspace,
    ) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = job
            .environment
            .iter()
            .chain(job.secret_environment.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        env.insert(jobenv::JOBLET_MODE.to_string(), jobenv::MODE_INIT.to_string());
        env.insert(jobenv::JOB_ID.to_string(), job.uuid.clone());
        env.insert(
            jobenv::JOB_CHROOT_DIR.to_string(),
            workspace.root.display().to_string(),
        );
        env.insert(
            jobenv::JOBLET_VOLUMES_DIR.to_string(),
            self.config.volumes_dir.display().to_string(),
        );
        env.insert(
            jobenv::JOB_CGROUP_HOST_PATH.to_string(),
            job.cgroup_path.display().to_string(),
        );
        env.insert(
            jobenv::JOB_CGROUP_PATH.to_string(),
            "/sys/fs/cgroup".to_string(),
        );
        env.insert(
            jobenv::JOB_MAX_CPU.to_string(),
            job.limits.cpu_percent.to_string(),
        );
        env.insert(
            jobenv::JOB_MAX_MEMORY.to_string(),
            job.limits.memory_mb.to_string(),
        );
        env.insert(
            jobenv::JOB_MAX_IOBPS.to_string(),
            job.limits.io_bps.to_string(),
        );
        env.insert(
            jobenv::JOB_CPU_CORES.to_string(),
            job.limits
                .cpu_cores
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
        env.insert(
            jobenv::JOB_VOLUMES_COUNT.to_string(),
            job.volumes.len().to_string(),
        );
        for (i, volume) in job.volumes.iter().enumerate() {
            env.insert(format!("{}{i}", jobenv::JOB_VOLUME_PREFIX), volume.clone());
        }
        if let Some(reference) = &job.runtime {
            env.insert(jobenv::JOB_RUNTIME.to_string(), reference.clone());
        }
        if let Some(rt) = runtime {
            env.insert(
                jobenv::JOB_RUNTIME_PATH.to_string(),
                rt.dir.display().to_string(),
            );
        }
        env
    }

    fn attach_output(&self, job: &Job, child: SpawnedChild) {
        pump_output(
            self.store.clone(),
            job.uuid.clone(),
            StreamKind::Stdout,
            child.stdout,
        );
        pump_output(
            self.store.clone(),
            job.uuid.clone(),
            StreamKind::Stderr,
            child.stderr,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use crate::platform::testing::FakePlatform;
    use chrono::Utc;

    fn coordinator(platform: Arc<FakePlatform>) -> (ExecutionCoordinator, Arc<JobStore>) {
        let config = JobletConfig::default();
        let (store, _persist_rx) = JobStore::new(config.buffer_retain_bytes);
        let coordinator = ExecutionCoordinator::new(
            platform.clone(),
            config.clone(),
            Arc::new(WorkspaceManager::new(platform.clone(), &config)),
            Arc::new(NetworkManager::new(platform.clone(), &config).expect("network")),
            Arc::new(UploadManager::new(platform.clone())),
            Arc::new(ProcessManager::new(platform.clone(), &config)),
            store.clone(),
            Arc::new(RuntimeCatalog::new(platform, &config)),
        );
        (coordinator, store)
    }

    fn job(command: &str) -> Job {
        Job::build(
            JobRequest {
                command: command.to_string(),
                ..JobRequest::default()
            },
            &JobletConfig::default(),
            Utc::now(),
        )
        .expect("build job")
    }

    #[test]
    fn base_env_carries_the_contract() {
        let platform = Arc::new(FakePlatform::new());
        let (coordinator, _store) = coordinator(platform);
        let mut j = job("echo");
        j.limits.cpu_percent = 50;
        j.limits.memory_mb = 128;
        j.volumes = vec!["data".to_string()];
        j.environment
            .insert("APP_FLAG".to_string(), "on".to_string());
        let workspace = Workspace {
            root: PathBuf::from("/opt/joblet/jobs").join(&j.uuid),
            work_dir: PathBuf::from("/opt/joblet/jobs").join(&j.uuid).join("work"),
        };
        let env = coordinator.base_env(&j, &None, &workspace);
        assert_eq!(env.get("JOBLET_MODE").map(String::as_str), Some("init"));
        assert_eq!(env.get("JOB_ID"), Some(&j.uuid));
        assert_eq!(env.get("JOB_MAX_CPU").map(String::as_str), Some("50"));
        assert_eq!(env.get("JOB_MAX_MEMORY").map(String::as_str), Some("128"));
        assert_eq!(env.get("JOB_VOLUMES_COUNT").map(String::as_str), Some("1"));
        assert_eq!(env.get("JOB_VOLUME_0").map(String::as_str), Some("data"));
        assert_eq!(env.get("APP_FLAG").map(String::as_str), Some("on"));
        assert_eq!(
            env.get("JOB_CGROUP_HOST_PATH"),
            Some(&j.cgroup_path.display().to_string())
        );
    }

    #[test]
    fn user_env_cannot_shadow_engine_keys() {
        let platform = Arc::new(FakePlatform::new());
        let (coordinator, _store) = coordinator(platform);
        let mut j = job("echo");
        j.environment
            .insert("JOB_ID".to_string(), "spoofed".to_string());
        let workspace = Workspace {
            root: PathBuf::from("/w"),
            work_dir: PathBuf::from("/w/work"),
        };
        let env = coordinator.base_env(&j, &None, &workspace);
        assert_eq!(env.get("JOB_ID"), Some(&j.uuid));
    }

    #[test]
    fn unknown_runtime_fails_before_launch() {
        let platform = Arc::new(FakePlatform::new());
        let (coordinator, _store) = coordinator(platform);
        let mut j = job("echo");
        j.runtime = Some("ghost@1.0.0".to_string());
        assert!(coordinator.resolve_runtime(&j).is_err());
    }
}
