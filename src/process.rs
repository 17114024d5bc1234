//! Process launch and termination.
//!
//! `launch` validates the request, then spawns on a dedicated thread —
//! namespace membership is established at clone time, and the spawn must
//! not depend on the caller's thread state — with a hard start timeout.
//! Termination is graceful-then-forceful: SIGTERM to the process group,
//! a short window, then SIGKILL to the group and the pid.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::{debug, info, warn};

use crate::config::JobletConfig;
use crate::platform::{Exit, NamespaceSpec, Platform, Sig, SpawnSpec, SpawnedChild};

pub struct LaunchConfig {
    pub job_uuid: String,
    /// Absolute path of the binary to start (the job's `sbin/init`, or
    /// the user command itself in CI mode).
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub namespaces: Option<NamespaceSpec>,
    /// Cgroup `proc/` subgroup the child is cloned into.
    pub into_cgroup: Option<PathBuf>,
    pub extra_fd: Option<std::os::fd::OwnedFd>,
    pub new_process_group: bool,
}

pub struct ProcessManager {
    platform: Arc<dyn Platform>,
    start_timeout: Duration,
    graceful_timeout: Duration,
}

impl ProcessManager {
    pub fn new(platform: Arc<dyn Platform>, config: &JobletConfig) -> ProcessManager {
        ProcessManager {
            platform,
            start_timeout: config.start_timeout(),
            graceful_timeout: config.graceful_timeout(),
        }
    }

    /// Start the child described by `config`. The spawn happens on its
    /// own thread and must complete within the start timeout; a spawn
    /// that lands after the deadline is killed by the janitor rather
    /// than leaked.
    pub fn launch(&self, config: LaunchConfig) -> Result<SpawnedChild> {
        self.validate(&config)?;
        let spec = SpawnSpec {
            program: config.program.clone(),
            args: config.args,
            env: config.env,
            cwd: config.cwd,
            namespaces: config.namespaces,
            into_cgroup: config.into_cgroup,
            extra_fd: config.extra_fd,
            new_process_group: config.new_process_group,
        };

        let (tx, rx) = bounded(1);
        let platform = self.platform.clone();
        std::thread::Builder::new()
            .name(format!("spawn-{}", config.job_uuid))
            .spawn(move || {
                let _ = tx.send(platform.spawn(spec));
            })
            .context("spawn launcher thread")?;

        match rx.recv_timeout(self.start_timeout) {
            Ok(Ok(child)) => {
                info!(job_id = %config.job_uuid, pid = child.pid, "process started");
                Ok(child)
            }
            Ok(Err(e)) => Err(e).context("process start"),
            Err(RecvTimeoutError::Timeout) => {
                let platform = self.platform.clone();
                let uuid = config.job_uuid.clone();
                std::thread::spawn(move || {
                    if let Ok(Ok(child)) = rx.recv() {
                        warn!(job_id = %uuid, pid = child.pid, "late start after timeout, killing");
                        let _ = platform.kill(child.pid, Sig::Kill);
                        let _ = platform.wait(child.pid);
                    }
                });
                bail!(
                    "process for job {} did not start within {:?}",
                    config.job_uuid,
                    self.start_timeout
                )
            }
            Err(RecvTimeoutError::Disconnected) => bail!("launcher thread died"),
        }
    }

    fn validate(&self, config: &LaunchConfig) -> Result<()> {
        if config.job_uuid.is_empty() {
            bail!("job uuid is empty");
        }
        if !config.program.is_absolute() {
            bail!("program path {:?} is not absolute", config.program);
        }
        if !self.platform.path_exists(&config.program) {
            bail!("program {:?} does not exist", config.program);
        }
        for arg in &config.args {
            if arg.contains('\0') {
                bail!("argument contains NUL");
            }
        }
        for (k, v) in &config.env {
            if k.is_empty() || k.contains('=') || k.contains('\0') || v.contains('\0') {
                bail!("bad environment entry {k:?}");
            }
        }
        Ok(())
    }

    /// Blocking wait for exit.
    pub fn wait(&self, pid: u32) -> Result<Exit> {
        self.platform.wait(pid)
    }

    /// Poll for exit until the deadline; `None` means still running.
    pub fn wait_timeout(&self, pid: u32, timeout: Duration) -> Result<Option<Exit>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.platform.try_wait(pid)? {
                return Ok(Some(exit));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn kill(&self, pid: u32, sig: Sig) -> Result<()> {
        self.platform.kill(pid, sig)
    }

    pub fn kill_process_group(&self, pid: u32, sig: Sig) -> Result<()> {
        self.platform.kill_process_group(pid, sig)
    }

    /// Graceful stop: SIGTERM to the group, wait out the graceful
    /// window, SIGKILL if anything survives. Returns whether force was
    /// needed. The only hard error is a process outliving SIGKILL.
    pub fn stop(&self, pid: u32) -> Result<bool> {
        if !self.platform.process_alive(pid) {
            return Ok(false);
        }
        let _ = self.platform.kill_process_group(pid, Sig::Term);
        let _ = self.platform.kill(pid, Sig::Term);

        let deadline = Instant::now() + self.graceful_timeout;
        while Instant::now() < deadline {
            if !self.platform.process_alive(pid) {
                debug!(pid, "process exited within the graceful window");
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let _ = self.platform.kill_process_group(pid, Sig::Kill);
        let _ = self.platform.kill(pid, Sig::Kill);
        // Give the kernel a beat to tear the group down.
        let kill_deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < kill_deadline {
            if !self.platform.process_alive(pid) {
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        bail!("pid {pid} still alive after SIGKILL")
    }
}
