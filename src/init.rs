//! The in-namespace init branch.
//!
//! The daemon binary re-enters itself as `sbin/init` inside the job's
//! fresh namespaces (`JOBLET_MODE=init`). At that point the mount
//! namespace is still a copy of the host's, so the init can read the
//! runtime manifest and perform the prepared mount list, then pivot into
//! the chroot. The upload phase materializes the manifest and exits; the
//! execute phase waits for the network-ready byte, resolves the user
//! command and `exec`s it — the command becomes PID 1.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::jobenv;

/// Paths searched when the command is neither absolute nor on `PATH`.
const FALLBACK_PATH_DIRS: &[&str] = &["/bin", "/usr/bin", "/usr/local/bin", "/sbin", "/usr/sbin"];

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Whether this invocation of the binary is the in-namespace init.
pub fn is_init_invocation() -> bool {
    std::env::var(jobenv::JOBLET_MODE).as_deref() == Ok(jobenv::MODE_INIT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Upload,
    Execute,
}

/// The `JOB_*` environment decoded back into a usable shape.
#[derive(Debug)]
pub struct InitContext {
    pub job_id: String,
    pub phase: Phase,
    pub chroot_dir: PathBuf,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub volumes: Vec<String>,
    pub volumes_dir: PathBuf,
    pub runtime_path: Option<PathBuf>,
    pub uploads_data: Option<String>,
    pub working_dir: Option<String>,
    pub network_ready_fd: Option<i32>,
}

impl InitContext {
    pub fn from_env() -> Result<InitContext> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse from any key/value source; the tests feed a map.
    pub fn from_lookup<F>(lookup: F) -> Result<InitContext>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require =
            |key: &str| lookup(key).with_context(|| format!("missing {key} in init environment"));

        let phase = match require(jobenv::JOB_PHASE)?.as_str() {
            jobenv::PHASE_UPLOAD => Phase::Upload,
            jobenv::PHASE_EXECUTE => Phase::Execute,
            other => bail!("unknown job phase {other:?}"),
        };
        let job_id = require(jobenv::JOB_ID)?;
        let chroot_dir = PathBuf::from(require(jobenv::JOB_CHROOT_DIR)?);

        let args_count: usize = lookup(jobenv::JOB_ARGS_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut args = Vec::with_capacity(args_count);
        for i in 0..args_count {
            args.push(require(&format!("{}{i}", jobenv::JOB_ARG_PREFIX))?);
        }

        let volumes_count: usize = lookup(jobenv::JOB_VOLUMES_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut volumes = Vec::with_capacity(volumes_count);
        for i in 0..volumes_count {
            volumes.push(require(&format!("{}{i}", jobenv::JOB_VOLUME_PREFIX))?);
        }

        let command = lookup(jobenv::JOB_COMMAND);
        if phase == Phase::Execute && command.is_none() {
            bail!("execute phase without {}", jobenv::JOB_COMMAND);
        }

        let network_ready_fd = match lookup(jobenv::NETWORK_READY_FD) {
            Some(raw) => Some(
                raw.parse::<i32>()
                    .with_context(|| format!("bad {}={raw:?}", jobenv::NETWORK_READY_FD))?,
            ),
            None => None,
        };

        Ok(InitContext {
            job_id,
            phase,
            chroot_dir,
            command,
            args,
            volumes,
            volumes_dir: lookup(jobenv::JOBLET_VOLUMES_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/opt/joblet/volumes")),
            runtime_path: lookup(jobenv::JOB_RUNTIME_PATH).map(PathBuf::from),
            uploads_data: lookup(jobenv::JOB_UPLOADS_DATA),
            working_dir: lookup(jobenv::JOB_WORKING_DIR),
            network_ready_fd,
        })
    }

    /// Directory the command runs in, inside the chroot. Relative paths
    /// hang off the workspace.
    pub fn command_cwd(&self) -> PathBuf {
        match self.working_dir.as_deref() {
            None => PathBuf::from("/work"),
            Some(dir) if dir.starts_with('/') => PathBuf::from(dir),
            Some(dir) => Path::new("/work").join(dir),
        }
    }
}

/// The environment handed to the user command: the inherited environ
/// minus engine control variables, overlaid with the runtime's variables,
/// with a usable `PATH` guaranteed.
pub fn build_user_env(
    inherited: impl Iterator<Item = (String, String)>,
    runtime_env: Option<&BTreeMap<String, String>>,
) -> Vec<(String, String)> {
    let mut map: BTreeMap<String, String> = inherited
        .filter(|(k, _)| !jobenv::is_control_var(k))
        .collect();
    if let Some(extra) = runtime_env {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }
    map.entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());
    map.into_iter().collect()
}

/// Resolve the user command: absolute path first, then `PATH` from the
/// built environment, then the conventional system directories.
pub fn resolve_command<F>(command: &str, path_var: Option<&str>, exists: F) -> Result<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    let direct = Path::new(command);
    if direct.is_absolute() {
        if exists(direct) {
            return Ok(direct.to_path_buf());
        }
        bail!("command {command:?} does not exist");
    }
    if let Some(path) = path_var {
        for dir in path.split(':').filter(|d| !d.is_empty()) {
            let candidate = Path::new(dir).join(command);
            if exists(&candidate) {
                return Ok(candidate);
            }
        }
    }
    for dir in FALLBACK_PATH_DIRS {
        let candidate = Path::new(dir).join(command);
        if exists(&candidate) {
            return Ok(candidate);
        }
    }
    bail!("command {command:?} not found")
}

#[cfg(target_os = "linux")]
pub use linux::run;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::ffi::CString;
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::os::unix::ffi::OsStrExt;
    use std::sync::Arc;

    use crate::platform::{LinuxPlatform, MountRequest, Platform};
    use crate::runtime::{MANIFEST_FILE, ResolvedRuntime, RuntimeManifest};
    use crate::upload::{UploadManager, decode_manifest};
    use crate::workspace::build_mount_plan;

    /// Entry point for `JOBLET_MODE=init`. On success the process image
    /// is replaced (execute) or the process exits (upload); an `Err`
    /// return means the job must fail before the user command ran.
    pub fn run() -> Result<std::convert::Infallible> {
        let ctx = InitContext::from_env()?;
        let platform = Arc::new(LinuxPlatform::new());

        // Host paths are still visible: the mount namespace is a copy
        // until the pivot below.
        let runtime = match &ctx.runtime_path {
            Some(dir) => {
                let raw = platform.read_file(&dir.join(MANIFEST_FILE))?;
                Some(ResolvedRuntime {
                    dir: dir.clone(),
                    manifest: RuntimeManifest::parse(&raw)?,
                })
            }
            None => None,
        };

        let plan = build_mount_plan(
            &ctx.chroot_dir,
            &ctx.volumes_dir,
            &ctx.volumes,
            runtime.as_ref(),
        );
        for request in &plan {
            platform.mount(request)?;
        }
        enter_chroot(platform.as_ref(), &ctx.chroot_dir)?;

        match ctx.phase {
            Phase::Upload => {
                let data = ctx
                    .uploads_data
                    .as_deref()
                    .context("upload phase without manifest data")?;
                let uploads = decode_manifest(data)?;
                UploadManager::new(platform.clone()).apply(Path::new("/work"), &uploads)?;
                std::process::exit(0);
            }
            Phase::Execute => {
                wait_network_ready(ctx.network_ready_fd)?;

                let env = build_user_env(std::env::vars(), runtime.as_ref().map(|r| r.environment()));
                let cwd = ctx.command_cwd();
                if platform.is_dir(&cwd) {
                    nix::unistd::chdir(&cwd)
                        .with_context(|| format!("chdir {}", cwd.display()))?;
                }

                let command = ctx
                    .command
                    .as_deref()
                    .context("execute phase without a command")?;
                let path_var = env
                    .iter()
                    .find(|(k, _)| k == "PATH")
                    .map(|(_, v)| v.clone());
                let resolved = resolve_command(command, path_var.as_deref(), |p| p.exists())?;
                platform.exec(&resolved, &ctx.args, &env)
            }
        }
    }

    /// Make the tree our root: bind it over itself so it is a mount
    /// point, pivot, then lazily drop the old root.
    fn enter_chroot(platform: &dyn Platform, root: &Path) -> Result<()> {
        platform.mount(&MountRequest::bind(root, root).recursive())?;
        let put_old = root.join(".oldroot");
        platform.mkdir_all(&put_old)?;

        let new_c = CString::new(root.as_os_str().as_bytes()).context("chroot path")?;
        let old_c = CString::new(put_old.as_os_str().as_bytes()).context("oldroot path")?;
        // SAFETY: both paths are valid NUL-terminated strings.
        let rc = unsafe { libc::syscall(libc::SYS_pivot_root, new_c.as_ptr(), old_c.as_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("pivot_root");
        }
        nix::unistd::chdir("/").context("chdir / after pivot")?;
        platform.unmount(Path::new("/.oldroot"))?;
        platform.rmdir(Path::new("/.oldroot"))?;
        Ok(())
    }

    /// Block until the parent signals the interface is up. EOF without a
    /// byte means the parent gave up; the job must not run half-wired.
    fn wait_network_ready(fd: Option<i32>) -> Result<()> {
        let Some(fd) = fd else {
            return Ok(());
        };
        // SAFETY: the coordinator mapped the pipe read end to this fd.
        let mut pipe = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut byte = [0u8; 1];
        let n = pipe
            .read(&mut byte)
            .context("read network-ready pipe")?;
        if n == 0 {
            bail!("network setup did not complete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("JOB_PHASE".to_string(), "execute".to_string());
        env.insert("JOB_ID".to_string(), "j-1".to_string());
        env.insert(
            "JOB_CHROOT_DIR".to_string(),
            "/opt/joblet/jobs/j-1".to_string(),
        );
        env.insert("JOB_COMMAND".to_string(), "echo".to_string());
        env
    }

    fn parse(env: &HashMap<String, String>) -> Result<InitContext> {
        InitContext::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn execute_context_parses_args_and_volumes() {
        let mut env = base_env();
        env.insert("JOB_ARGS_COUNT".to_string(), "2".to_string());
        env.insert("JOB_ARG_0".to_string(), "hello".to_string());
        env.insert("JOB_ARG_1".to_string(), "world".to_string());
        env.insert("JOB_VOLUMES_COUNT".to_string(), "1".to_string());
        env.insert("JOB_VOLUME_0".to_string(), "data".to_string());
        env.insert("NETWORK_READY_FD".to_string(), "3".to_string());

        let ctx = parse(&env).expect("parse");
        assert_eq!(ctx.phase, Phase::Execute);
        assert_eq!(ctx.args, vec!["hello", "world"]);
        assert_eq!(ctx.volumes, vec!["data"]);
        assert_eq!(ctx.network_ready_fd, Some(3));
        assert_eq!(ctx.command_cwd(), PathBuf::from("/work"));
    }

    #[test]
    fn execute_without_command_is_rejected() {
        let mut env = base_env();
        env.remove("JOB_COMMAND");
        assert!(parse(&env).is_err());
    }

    #[test]
    fn upload_phase_needs_no_command() {
        let mut env = base_env();
        env.insert("JOB_PHASE".to_string(), "upload".to_string());
        env.remove("JOB_COMMAND");
        env.insert("JOB_UPLOADS_DATA".to_string(), "W10=".to_string());
        let ctx = parse(&env).expect("parse");
        assert_eq!(ctx.phase, Phase::Upload);
        assert_eq!(ctx.uploads_data.as_deref(), Some("W10="));
    }

    #[test]
    fn missing_arg_index_is_an_error() {
        let mut env = base_env();
        env.insert("JOB_ARGS_COUNT".to_string(), "1".to_string());
        assert!(parse(&env).is_err());
    }

    #[test]
    fn working_dir_resolution() {
        let mut env = base_env();
        env.insert("JOB_WORKING_DIR".to_string(), "sub/dir".to_string());
        assert_eq!(parse(&env).expect("parse").command_cwd(), PathBuf::from("/work/sub/dir"));
        env.insert("JOB_WORKING_DIR".to_string(), "/volumes/data".to_string());
        assert_eq!(parse(&env).expect("parse").command_cwd(), PathBuf::from("/volumes/data"));
    }

    #[test]
    fn user_env_strips_control_vars_and_applies_runtime() {
        let inherited = vec![
            ("JOB_ID".to_string(), "j".to_string()),
            ("JOBLET_MODE".to_string(), "init".to_string()),
            ("APP_FLAG".to_string(), "on".to_string()),
        ];
        let mut runtime_env = BTreeMap::new();
        runtime_env.insert("PATH".to_string(), "/rt/bin".to_string());
        let env = build_user_env(inherited.into_iter(), Some(&runtime_env));
        let map: BTreeMap<_, _> = env.into_iter().collect();
        assert!(!map.contains_key("JOB_ID"));
        assert!(!map.contains_key("JOBLET_MODE"));
        assert_eq!(map.get("APP_FLAG").map(String::as_str), Some("on"));
        assert_eq!(map.get("PATH").map(String::as_str), Some("/rt/bin"));
    }

    #[test]
    fn user_env_defaults_path() {
        let env = build_user_env(std::iter::empty(), None);
        let map: BTreeMap<_, _> = env.into_iter().collect();
        assert_eq!(map.get("PATH").map(String::as_str), Some(DEFAULT_PATH));
    }

    #[test]
    fn command_resolution_order() {
        let exists = |p: &Path| {
            matches!(
                p.to_str(),
                Some("/custom/bin/tool" | "/usr/bin/cat" | "/abs/prog")
            )
        };
        assert_eq!(
            resolve_command("/abs/prog", None, exists).expect("absolute"),
            PathBuf::from("/abs/prog")
        );
        assert!(resolve_command("/abs/missing", None, exists).is_err());
        assert_eq!(
            resolve_command("tool", Some("/custom/bin:/other"), exists).expect("path"),
            PathBuf::from("/custom/bin/tool")
        );
        // Not on the provided PATH, found in the fallback directories.
        assert_eq!(
            resolve_command("cat", Some("/custom/bin"), exists).expect("fallback"),
            PathBuf::from("/usr/bin/cat")
        );
        assert!(resolve_command("nope", None, exists).is_err());
    }
}
