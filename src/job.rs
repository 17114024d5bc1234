//! Domain model: the authoritative job record and its lifecycle.
//!
//! A `Job` is built once from a validated request and then only mutated
//! through the store. The status field follows a fixed state machine:
//!
//! ```text
//! Initializing ── setup ok ──► Running ── exit 0 ──► Completed
//!       │                        │ ─── exit ≠ 0 ──► Failed
//!       │ schedule=future        │ ─── stop ──────► Stopped
//!       ▼
//!    Scheduled ── due ──► Initializing
//!       └────── cancel ──► Stopped
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::config::JobletConfig;
use crate::error::{Error, Result};

/// The four semantic resource quantities. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub cpu_percent: u32,
    /// Ordered core indices for `cpuset.cpus`; empty = no affinity.
    pub cpu_cores: Vec<u32>,
    pub memory_mb: u64,
    pub io_bps: u64,
}

impl Limits {
    /// Fill zero fields from the daemon defaults. The core set is taken
    /// as-is: an empty set means "no affinity", not "use the default".
    pub fn or_defaults(mut self, defaults: &Limits) -> Limits {
        if self.cpu_percent == 0 {
            self.cpu_percent = defaults.cpu_percent;
        }
        if self.memory_mb == 0 {
            self.memory_mb = defaults.memory_mb;
        }
        if self.io_bps == 0 {
            self.io_bps = defaults.io_bps;
        }
        self
    }
}

/// Which network a job joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkSpec {
    /// The default shared bridge: internet uplink and DNS.
    Bridge,
    /// Own network namespace, no uplink: jobs cannot reach each other.
    Isolated,
    /// No network namespace requested at all; only loopback is visible.
    None,
    /// A named network created via `create_network`.
    Custom(String),
}

impl NetworkSpec {
    /// Empty string and "bridge" mean the shared bridge.
    pub fn parse(s: &str) -> NetworkSpec {
        match s {
            "" | "bridge" => NetworkSpec::Bridge,
            "isolated" => NetworkSpec::Isolated,
            "none" => NetworkSpec::None,
            other => NetworkSpec::Custom(other.to_string()),
        }
    }

    /// Whether the child is cloned with a fresh network namespace.
    pub fn wants_netns(&self) -> bool {
        !matches!(self, NetworkSpec::None)
    }

    /// Whether the parent must build a veth pair and signal readiness.
    pub fn needs_veth(&self) -> bool {
        matches!(self, NetworkSpec::Bridge | NetworkSpec::Custom(_))
    }

    /// The network-manager key this spec allocates from, if any.
    pub fn network_name(&self) -> Option<&str> {
        match self {
            NetworkSpec::Bridge => Some("bridge"),
            NetworkSpec::Custom(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NetworkSpec::Bridge => "bridge",
            NetworkSpec::Isolated => "isolated",
            NetworkSpec::None => "none",
            NetworkSpec::Custom(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initializing,
    Scheduled,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initializing => "initializing",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// Running and Scheduled jobs hold live resources or future intent.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Scheduled)
    }
}

/// Runtime-build jobs publish filesystem artifacts that outlive the job
/// record; cleanup branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Standard,
    RuntimeBuild,
}

impl JobKind {
    pub fn preserve_artifacts(&self) -> bool {
        matches!(self, JobKind::RuntimeBuild)
    }
}

/// One uploaded file or directory, carried in the streamed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    /// Destination path, relative to the job workspace.
    pub path: String,
    /// File bytes; empty for directories. Base64 on the wire.
    #[serde(with = "b64_bytes")]
    pub content: Vec<u8>,
    /// Unix permission bits.
    pub mode: u32,
    pub is_directory: bool,
}

mod b64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// What a client submits; the façade validates it and builds a [`Job`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub command: String,
    pub args: Vec<String>,
    pub limits: Limits,
    /// Raw network string: "", "bridge", "isolated", "none" or a name.
    pub network: String,
    pub volumes: Vec<String>,
    /// Runtime reference, `<name>[@<version>|@latest]`.
    pub runtime: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub secret_environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub dependencies: Vec<String>,
    pub workflow_uuid: Option<String>,
    pub uploads: Vec<FileUpload>,
    /// RFC3339 instant or relative duration (`10s`, `2min`, `1h`).
    pub schedule: Option<String>,
    pub runtime_build: bool,
}

/// The authoritative job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub uuid: String,
    pub command: String,
    pub args: Vec<String>,
    pub limits: Limits,
    pub network: NetworkSpec,
    pub volumes: Vec<String>,
    pub runtime: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub secret_environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub dependencies: Vec<String>,
    pub workflow_uuid: Option<String>,
    pub uploads: Vec<FileUpload>,
    pub kind: JobKind,
    pub status: JobStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// `<cgroup_base>/joblet/job-<uuid>`, assigned at build time and
    /// never reused.
    pub cgroup_path: PathBuf,
}

impl Job {
    /// Build the immutable identity fields from a validated request.
    pub fn build(req: JobRequest, config: &JobletConfig, now: DateTime<Utc>) -> Result<Job> {
        validate_request(&req)?;
        let scheduled_time = match req.schedule.as_deref() {
            Some(s) => Some(parse_schedule(s, now)?),
            None => None,
        };
        let uuid = Ulid::new().to_string().to_lowercase();
        let cgroup_path = config.job_cgroup_path(&uuid);
        let status = if scheduled_time.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Initializing
        };
        Ok(Job {
            uuid,
            command: req.command,
            args: req.args,
            limits: req.limits.or_defaults(&config.default_limits),
            network: NetworkSpec::parse(&req.network),
            volumes: req.volumes,
            runtime: req.runtime,
            environment: req.environment,
            secret_environment: req.secret_environment,
            working_directory: req.working_directory,
            dependencies: req.dependencies,
            workflow_uuid: req.workflow_uuid,
            uploads: req.uploads,
            kind: if req.runtime_build {
                JobKind::RuntimeBuild
            } else {
                JobKind::Standard
            },
            status,
            pid: None,
            exit_code: None,
            start_time: now,
            end_time: None,
            scheduled_time,
            cgroup_path,
        })
    }

    /// Move to a terminal state, recording exit code and end time.
    pub fn finish(&mut self, status: JobStatus, exit_code: i32, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.exit_code = Some(exit_code);
        self.end_time = Some(now);
    }

    /// Client-facing view. Secret values never appear.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            uuid: self.uuid.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            status: self.status,
            network: self.network.as_str().to_string(),
            runtime: self.runtime.clone(),
            pid: self.pid,
            exit_code: self.exit_code,
            // A scheduled job shows its future trigger time, not the
            // submission time.
            start_time: self.scheduled_time.unwrap_or(self.start_time),
            end_time: self.end_time,
            scheduled: self.scheduled_time.is_some() && self.status == JobStatus::Scheduled,
            environment_keys: self
                .environment
                .keys()
                .chain(self.secret_environment.keys())
                .cloned()
                .collect(),
        }
    }
}

/// What `ListJobs`/`GetJob` return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub uuid: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: JobStatus,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub scheduled: bool,
    /// Names only; secret values are never exposed.
    pub environment_keys: Vec<String>,
}

/// Parse a schedule as an RFC3339 instant or a positive relative duration
/// of the form `<N>(s|min|h)`.
pub fn parse_schedule(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation_field("schedule", "schedule is empty"));
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    let (digits, unit): (String, String) = {
        let idx = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        (s[..idx].to_string(), s[idx..].to_string())
    };
    let n: i64 = digits
        .parse()
        .map_err(|_| Error::validation_field("schedule", format!("unparseable schedule {s:?}")))?;
    if n <= 0 {
        return Err(Error::validation_field(
            "schedule",
            format!("schedule duration must be positive, got {s:?}"),
        ));
    }
    let delta = match unit.as_str() {
        "s" => ChronoDuration::seconds(n),
        "min" => ChronoDuration::minutes(n),
        "h" => ChronoDuration::hours(n),
        _ => {
            return Err(Error::validation_field(
                "schedule",
                format!("unknown schedule unit in {s:?} (want s, min or h)"),
            ));
        }
    };
    Ok(now + delta)
}

/// Request-level checks that need no OS access: these fail before any
/// side effect.
pub fn validate_request(req: &JobRequest) -> Result<()> {
    if req.command.is_empty() {
        return Err(Error::validation_field("command", "command is empty"));
    }
    if req.command.contains('\0') {
        return Err(Error::validation_field("command", "command contains NUL"));
    }
    for arg in &req.args {
        if arg.contains('\0') {
            return Err(Error::validation_field("args", "argument contains NUL"));
        }
    }
    for (k, v) in req.environment.iter().chain(req.secret_environment.iter()) {
        if k.is_empty() || k.contains('=') || k.contains('\0') || v.contains('\0') {
            return Err(Error::validation_field(
                "environment",
                format!("bad environment entry {k:?}"),
            ));
        }
    }
    for vol in &req.volumes {
        if vol.is_empty() || vol.contains('/') || vol.contains('\0') {
            return Err(Error::validation_field(
                "volumes",
                format!("bad volume name {vol:?}"),
            ));
        }
    }
    if let Some(rt) = req.runtime.as_deref() {
        crate::runtime::RuntimeSpecifier::parse(rt)?;
    }
    Ok(())
}
