//! Daemon configuration.
//!
//! Resolution order for the config file:
//!   1. `--config` CLI flag
//!   2. `JOBLET_CONFIG` environment variable
//!   3. `/opt/joblet/config.toml`
//!
//! A missing file is not an error: every field has a compiled-in default,
//! so the daemon runs on a bare host with no configuration at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::job::Limits;

pub const DEFAULT_CONFIG_PATH: &str = "/opt/joblet/config.toml";

/// Top-level daemon configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobletConfig {
    /// Per-job workspace trees live at `<base_dir>/<uuid>/`.
    pub base_dir: PathBuf,
    /// Published runtimes: `<runtimes_dir>/<name>/<version>/runtime.yml`.
    pub runtimes_dir: PathBuf,
    /// Named volumes: `<volumes_dir>/<name>` bind-mounted read-write.
    pub volumes_dir: PathBuf,
    /// Sockets and other runtime state.
    pub run_dir: PathBuf,
    /// cgroup v2 mount point; the daemon owns `<cgroup_base>/joblet/`.
    pub cgroup_base: PathBuf,
    /// Runtime registry index URL.
    pub registry_url: String,
    /// The default shared bridge jobs land on when they ask for `bridge`.
    pub bridge: BridgeConfig,
    /// Limits applied when a request leaves them unset (0 = unlimited).
    pub default_limits: Limits,
    /// Wall-clock budget for the upload phase.
    pub upload_timeout_secs: u64,
    /// Hard bound on process start.
    pub start_timeout_secs: u64,
    /// SIGTERM-to-SIGKILL window.
    pub graceful_timeout_ms: u64,
    /// Bytes of recent output retained per job for late subscribers.
    pub buffer_retain_bytes: usize,
    /// Seconds between resource-metric samples for running jobs.
    pub metrics_interval_secs: u64,
    /// Seconds between orphan-reconciliation sweeps.
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub name: String,
    pub cidr: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            name: "joblet0".to_string(),
            cidr: "172.20.0.0/16".to_string(),
        }
    }
}

impl Default for JobletConfig {
    fn default() -> Self {
        JobletConfig {
            base_dir: PathBuf::from("/opt/joblet/jobs"),
            runtimes_dir: PathBuf::from("/opt/joblet/runtimes"),
            volumes_dir: PathBuf::from("/opt/joblet/volumes"),
            run_dir: PathBuf::from("/opt/joblet/run"),
            cgroup_base: PathBuf::from("/sys/fs/cgroup"),
            registry_url: "https://registry.joblet.dev/index.json".to_string(),
            bridge: BridgeConfig::default(),
            default_limits: Limits::default(),
            upload_timeout_secs: 60,
            start_timeout_secs: 10,
            graceful_timeout_ms: 100,
            buffer_retain_bytes: 4 * 1024 * 1024,
            metrics_interval_secs: 5,
            reconcile_interval_secs: 300,
        }
    }
}

impl JobletConfig {
    /// Load following the flag → env → default-path chain. A file that
    /// exists but fails to parse is an error; an absent file yields the
    /// defaults.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = match cli_path {
            Some(p) => Some(p.to_path_buf()),
            None => match std::env::var("JOBLET_CONFIG") {
                Ok(v) if !v.is_empty() => Some(PathBuf::from(v)),
                _ => {
                    let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                    default.exists().then_some(default)
                }
            },
        };

        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("read config {}", p.display()))?;
                let cfg: JobletConfig = toml::from_str(&raw)
                    .with_context(|| format!("parse config {}", p.display()))?;
                Ok(cfg)
            }
            None => Ok(JobletConfig::default()),
        }
    }

    /// Root of the daemon's cgroup subtree.
    pub fn cgroup_root(&self) -> PathBuf {
        self.cgroup_base.join("joblet")
    }

    /// The immutable cgroup path assigned to a job at build time.
    pub fn job_cgroup_path(&self, uuid: &str) -> PathBuf {
        self.cgroup_root().join(format!("job-{uuid}"))
    }

    /// The job's chroot tree root.
    pub fn job_dir(&self, uuid: &str) -> PathBuf {
        self.base_dir.join(uuid)
    }

    pub fn persist_socket(&self) -> PathBuf {
        self.run_dir.join("persist-ipc.sock")
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }
}
