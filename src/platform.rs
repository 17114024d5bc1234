//! Thin OS shim.
//!
//! Every other module reaches the operating system only through the
//! [`Platform`] trait, so resource managers and the cleanup coordinator can
//! be exercised in tests against an in-memory fake. The Linux
//! implementation spawns namespaced children with `clone3(2)` (placing
//! them directly into a cgroup via `CLONE_INTO_CGROUP`) and plain children
//! with `std::process::Command` in a fresh process group.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
#[cfg(not(target_os = "linux"))]
use anyhow::{Context, bail};

/// Signals the engine sends. The numeric mapping stays in this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    Term,
    Int,
    Kill,
}

impl Sig {
    pub fn raw(self) -> i32 {
        match self {
            Sig::Term => libc::SIGTERM,
            Sig::Int => libc::SIGINT,
            Sig::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Sig::Term => "SIGTERM",
            Sig::Int => "SIGINT",
            Sig::Kill => "SIGKILL",
        };
        f.write_str(name)
    }
}

/// How a child left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    Signal(i32),
}

impl Exit {
    /// Exit code for the job record: signal deaths count as failures.
    pub fn code_or(&self, fallback: i32) -> i32 {
        match self {
            Exit::Code(c) => *c,
            Exit::Signal(_) => fallback,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Exit::Code(0))
    }
}

/// Which namespaces to clone the child into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceSpec {
    pub pid: bool,
    pub mount: bool,
    pub ipc: bool,
    pub uts: bool,
    pub cgroup: bool,
    pub net: bool,
}

impl NamespaceSpec {
    /// The isolation set every non-CI job gets; `net` is dropped for
    /// jobs that asked for no network namespace.
    pub fn full(net: bool) -> NamespaceSpec {
        NamespaceSpec {
            pid: true,
            mount: true,
            ipc: true,
            uts: true,
            cgroup: true,
            net,
        }
    }
}

/// Everything needed to start one child process.
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Complete child environment; nothing is inherited.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// `Some` = namespaced clone3 spawn; `None` = plain spawn.
    pub namespaces: Option<NamespaceSpec>,
    /// Cgroup directory the child is placed into at clone time.
    pub into_cgroup: Option<PathBuf>,
    /// File descriptor mapped to fd 3 in the child (network ready pipe).
    pub extra_fd: Option<std::os::fd::OwnedFd>,
    /// Plain spawns only: run the child in its own process group.
    pub new_process_group: bool,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>) -> SpawnSpec {
        SpawnSpec {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            namespaces: None,
            into_cgroup: None,
            extra_fd: None,
            new_process_group: false,
        }
    }
}

/// A started child: its pid plus the read ends of its output pipes.
pub struct SpawnedChild {
    pub pid: u32,
    pub stdout: Box<dyn std::io::Read + Send>,
    pub stderr: Box<dyn std::io::Read + Send>,
}

/// One mount operation, host-side or inside the init branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub data: Option<String>,
    pub bind: bool,
    pub recursive: bool,
    pub readonly: bool,
    pub remount: bool,
    /// MS_PRIVATE|MS_REC on the target, used once on `/` before the
    /// chroot mounts so nothing propagates back to the host.
    pub make_rprivate: bool,
}

impl MountRequest {
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> MountRequest {
        MountRequest {
            source: Some(source.into()),
            target: target.into(),
            fstype: None,
            data: None,
            bind: true,
            recursive: false,
            readonly: false,
            remount: false,
            make_rprivate: false,
        }
    }

    pub fn filesystem(fstype: &str, target: impl Into<PathBuf>) -> MountRequest {
        MountRequest {
            source: None,
            target: target.into(),
            fstype: Some(fstype.to_string()),
            data: None,
            bind: false,
            recursive: false,
            readonly: false,
            remount: false,
            make_rprivate: false,
        }
    }

    pub fn rprivate_root() -> MountRequest {
        MountRequest {
            source: None,
            target: PathBuf::from("/"),
            fstype: None,
            data: None,
            bind: false,
            recursive: true,
            readonly: false,
            remount: false,
            make_rprivate: true,
        }
    }

    pub fn read_only(mut self) -> MountRequest {
        self.readonly = true;
        self
    }

    pub fn recursive(mut self) -> MountRequest {
        self.recursive = true;
        self
    }

    /// The remount pass that turns an existing bind read-only.
    pub fn remount_readonly(target: impl Into<PathBuf>) -> MountRequest {
        MountRequest {
            source: None,
            target: target.into(),
            fstype: None,
            data: None,
            bind: true,
            recursive: false,
            readonly: true,
            remount: true,
            make_rprivate: false,
        }
    }

    pub fn with_data(mut self, data: &str) -> MountRequest {
        self.data = Some(data.to_string());
        self
    }
}

/// Captured output of a helper command (`ip(8)`, `git`).
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// The OS verbs the engine needs. Object-safe so components can share an
/// `Arc<dyn Platform>`.
pub trait Platform: Send + Sync {
    // Processes.
    fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild>;
    /// Blocking reap of a direct child.
    fn wait(&self, pid: u32) -> Result<Exit>;
    /// Non-blocking reap; `None` while the child is still running.
    fn try_wait(&self, pid: u32) -> Result<Option<Exit>>;
    /// Deliver a signal; a process that is already gone is success.
    fn kill(&self, pid: u32, sig: Sig) -> Result<()>;
    /// Deliver a signal to the whole process group. The negative-pid
    /// convention stays inside the shim.
    fn kill_process_group(&self, pid: u32, sig: Sig) -> Result<()>;
    fn process_alive(&self, pid: u32) -> bool;
    /// Replace the current process image. Returns only on failure.
    fn exec(
        &self,
        program: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<std::convert::Infallible>;

    // Filesystem.
    fn path_exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn copy_file(&self, src: &Path, dst: &Path, mode: u32) -> Result<()>;
    fn mkdir_all(&self, path: &Path) -> Result<()>;
    fn remove_all(&self, path: &Path) -> Result<()>;
    /// Non-recursive directory removal (cgroupfs only supports rmdir);
    /// an already-absent directory is success.
    fn rmdir(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;
    fn file_mode(&self, path: &Path) -> Result<u32>;
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
    fn read_link(&self, path: &Path) -> Result<PathBuf>;
    fn is_symlink(&self, path: &Path) -> bool;

    // Mounts and devices.
    fn mount(&self, req: &MountRequest) -> Result<()>;
    /// Lazy-detach unmount, the tolerant teardown form.
    fn unmount(&self, target: &Path) -> Result<()>;
    fn mknod_char(&self, path: &Path, mode: u32, major: u64, minor: u64) -> Result<()>;

    // Misc.
    fn getenv(&self, key: &str) -> Option<String>;
    fn current_exe(&self) -> Result<PathBuf>;
    fn lookup_path(&self, name: &str) -> Option<PathBuf>;
    /// Run a helper to completion, capturing its output.
    fn run_command(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
    /// Same, with an explicit environment (setup scripts).
    fn run_command_env(
        &self,
        program: &str,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<CommandOutput>;
}

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use anyhow::Context;
    use std::ffi::CString;
    use std::os::fd::AsRawFd;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::sys::stat::{Mode, SFlag, makedev, mknod};
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::Pid;

    const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

    /// Argument block for clone3(2).
    #[repr(C)]
    #[derive(Default)]
    struct CloneArgs {
        flags: u64,
        pidfd: u64,
        child_tid: u64,
        parent_tid: u64,
        exit_signal: u64,
        stack: u64,
        stack_size: u64,
        tls: u64,
        set_tid: u64,
        set_tid_size: u64,
        cgroup: u64,
    }

    pub struct LinuxPlatform;

    impl LinuxPlatform {
        pub fn new() -> LinuxPlatform {
            LinuxPlatform
        }

        fn clone_flags(ns: &NamespaceSpec) -> u64 {
            let mut flags: u64 = 0;
            if ns.pid {
                flags |= libc::CLONE_NEWPID as u64;
            }
            if ns.mount {
                flags |= libc::CLONE_NEWNS as u64;
            }
            if ns.ipc {
                flags |= libc::CLONE_NEWIPC as u64;
            }
            if ns.uts {
                flags |= libc::CLONE_NEWUTS as u64;
            }
            if ns.cgroup {
                flags |= libc::CLONE_NEWCGROUP as u64;
            }
            if ns.net {
                flags |= libc::CLONE_NEWNET as u64;
            }
            flags
        }

        /// clone3 spawn. All allocation happens before the clone: after
        /// fork in a threaded process only async-signal-safe calls are
        /// allowed in the child, so argv/envp are prepared up front.
        fn spawn_namespaced(&self, spec: SpawnSpec, ns: NamespaceSpec) -> Result<SpawnedChild> {
            let program_c = CString::new(spec.program.as_os_str().as_bytes())
                .context("program path contains NUL")?;
            let mut argv_c: Vec<CString> = Vec::with_capacity(spec.args.len() + 1);
            argv_c.push(program_c.clone());
            for arg in &spec.args {
                argv_c.push(CString::new(arg.as_bytes()).context("argument contains NUL")?);
            }
            let envp_c: Vec<CString> = spec
                .env
                .iter()
                .map(|(k, v)| CString::new(format!("{k}={v}")))
                .collect::<std::result::Result<_, _>>()
                .context("environment entry contains NUL")?;
            let cwd_c = match &spec.cwd {
                Some(p) => Some(
                    CString::new(p.as_os_str().as_bytes()).context("cwd contains NUL")?,
                ),
                None => None,
            };

            let mut argv_ptrs: Vec<*const libc::c_char> =
                argv_c.iter().map(|s| s.as_ptr()).collect();
            argv_ptrs.push(std::ptr::null());
            let mut envp_ptrs: Vec<*const libc::c_char> =
                envp_c.iter().map(|s| s.as_ptr()).collect();
            envp_ptrs.push(std::ptr::null());

            let (stdout_r, stdout_w) = nix::unistd::pipe().context("stdout pipe")?;
            let (stderr_r, stderr_w) = nix::unistd::pipe().context("stderr pipe")?;
            let devnull = std::fs::File::open("/dev/null").context("open /dev/null")?;

            let cgroup_fd: Option<std::fs::File> = match &spec.into_cgroup {
                Some(path) => {
                    let fd = std::fs::File::options()
                        .read(true)
                        .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
                        .open(path)
                        .with_context(|| format!("open cgroup dir {}", path.display()))?;
                    Some(fd)
                }
                None => None,
            };

            let mut flags = Self::clone_flags(&ns);
            let mut args = CloneArgs {
                exit_signal: libc::SIGCHLD as u64,
                ..CloneArgs::default()
            };
            if let Some(fd) = &cgroup_fd {
                flags |= CLONE_INTO_CGROUP;
                args.cgroup = fd.as_raw_fd() as u64;
            }
            args.flags = flags;

            // SAFETY: clone3 with a valid argument block; the child calls
            // only dup2/chdir/execve/_exit, all async-signal-safe.
            let pid = unsafe {
                libc::syscall(
                    libc::SYS_clone3,
                    &args as *const CloneArgs,
                    std::mem::size_of::<CloneArgs>(),
                )
            };
            match pid {
                -1 => {
                    let err = std::io::Error::last_os_error();
                    Err(err).context("clone3")
                }
                0 => {
                    // Child.
                    unsafe {
                        libc::dup2(devnull.as_raw_fd(), 0);
                        libc::dup2(stdout_w.as_raw_fd(), 1);
                        libc::dup2(stderr_w.as_raw_fd(), 2);
                        if let Some(fd) = &spec.extra_fd {
                            libc::dup2(fd.as_raw_fd(), 3);
                        }
                        // Parent-side descriptors must not leak into the job.
                        libc::close(stdout_r.as_raw_fd());
                        libc::close(stderr_r.as_raw_fd());
                        if let Some(fd) = &cgroup_fd {
                            libc::close(fd.as_raw_fd());
                        }
                        if let Some(cwd) = &cwd_c {
                            libc::chdir(cwd.as_ptr());
                        }
                        libc::execve(program_c.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                        libc::_exit(127);
                    }
                }
                pid => {
                    drop(stdout_w);
                    drop(stderr_w);
                    drop(spec.extra_fd);
                    drop(cgroup_fd);
                    Ok(SpawnedChild {
                        pid: pid as u32,
                        stdout: Box::new(std::fs::File::from(stdout_r)),
                        stderr: Box::new(std::fs::File::from(stderr_r)),
                    })
                }
            }
        }

        fn spawn_plain(&self, spec: SpawnSpec) -> Result<SpawnedChild> {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .env_clear()
                .envs(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            if let Some(cwd) = &spec.cwd {
                cmd.current_dir(cwd);
            }
            if spec.new_process_group {
                cmd.process_group(0);
            }
            let mut child = cmd
                .spawn()
                .with_context(|| format!("spawn {}", spec.program.display()))?;
            let stdout = child.stdout.take().expect("stdout piped");
            let stderr = child.stderr.take().expect("stderr piped");
            let pid = child.id();
            // The handle is dropped without waiting; reaping goes through
            // waitpid so namespaced and plain children share one path.
            Ok(SpawnedChild {
                pid,
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            })
        }

        fn signal(sig: Sig) -> Signal {
            match sig {
                Sig::Term => Signal::SIGTERM,
                Sig::Int => Signal::SIGINT,
                Sig::Kill => Signal::SIGKILL,
            }
        }
    }

    impl Default for LinuxPlatform {
        fn default() -> Self {
            LinuxPlatform::new()
        }
    }

    impl Platform for LinuxPlatform {
        fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild> {
            match spec.namespaces {
                Some(ns) => self.spawn_namespaced(spec, ns),
                None => self.spawn_plain(spec),
            }
        }

        fn wait(&self, pid: u32) -> Result<Exit> {
            loop {
                match waitpid(Pid::from_raw(pid as i32), None) {
                    Ok(WaitStatus::Exited(_, code)) => return Ok(Exit::Code(code)),
                    Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(Exit::Signal(sig as i32)),
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(e).context("waitpid"),
                }
            }
        }

        fn try_wait(&self, pid: u32) -> Result<Option<Exit>> {
            match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => Ok(Some(Exit::Code(code))),
                Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(Exit::Signal(sig as i32))),
                Ok(WaitStatus::StillAlive) => Ok(None),
                Ok(_) => Ok(None),
                Err(nix::errno::Errno::EINTR) => Ok(None),
                Err(e) => Err(e).context("waitpid WNOHANG"),
            }
        }

        fn kill(&self, pid: u32, sig: Sig) -> Result<()> {
            match kill(Pid::from_raw(pid as i32), Self::signal(sig)) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(e).with_context(|| format!("kill pid {pid}")),
            }
        }

        fn kill_process_group(&self, pid: u32, sig: Sig) -> Result<()> {
            match killpg(Pid::from_raw(pid as i32), Self::signal(sig)) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(e).with_context(|| format!("killpg pgid {pid}")),
            }
        }

        fn process_alive(&self, pid: u32) -> bool {
            kill(Pid::from_raw(pid as i32), None).is_ok()
        }

        fn exec(
            &self,
            program: &Path,
            args: &[String],
            env: &[(String, String)],
        ) -> Result<std::convert::Infallible> {
            let program_c = CString::new(program.as_os_str().as_bytes())
                .context("program path contains NUL")?;
            let mut argv: Vec<CString> = vec![program_c.clone()];
            for arg in args {
                argv.push(CString::new(arg.as_bytes()).context("argument contains NUL")?);
            }
            let envp: Vec<CString> = env
                .iter()
                .map(|(k, v)| CString::new(format!("{k}={v}")))
                .collect::<std::result::Result<_, _>>()
                .context("environment entry contains NUL")?;
            let e = nix::unistd::execve(&program_c, &argv, &envp)
                .expect_err("execve returned without error");
            Err(e).with_context(|| format!("execve {}", program.display()))
        }

        fn path_exists(&self, path: &Path) -> bool {
            path.exists()
        }

        fn is_dir(&self, path: &Path) -> bool {
            path.is_dir()
        }

        fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
            std::fs::read(path).with_context(|| format!("read {}", path.display()))
        }

        fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
            std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))
        }

        fn copy_file(&self, src: &Path, dst: &Path, mode: u32) -> Result<()> {
            std::fs::copy(src, dst)
                .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
            std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", dst.display()))
        }

        fn mkdir_all(&self, path: &Path) -> Result<()> {
            std::fs::create_dir_all(path).with_context(|| format!("mkdir -p {}", path.display()))
        }

        fn remove_all(&self, path: &Path) -> Result<()> {
            match std::fs::remove_dir_all(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("rm -r {}", path.display())),
            }
        }

        fn rmdir(&self, path: &Path) -> Result<()> {
            match std::fs::remove_dir(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("rmdir {}", path.display())),
            }
        }

        fn rename(&self, from: &Path, to: &Path) -> Result<()> {
            std::fs::rename(from, to)
                .with_context(|| format!("rename {} to {}", from.display(), to.display()))
        }

        fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
            let mut entries = Vec::new();
            for entry in
                std::fs::read_dir(path).with_context(|| format!("read dir {}", path.display()))?
            {
                entries.push(entry?.path());
            }
            entries.sort();
            Ok(entries)
        }

        fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", path.display()))
        }

        fn file_mode(&self, path: &Path) -> Result<u32> {
            let meta = std::fs::metadata(path)
                .with_context(|| format!("stat {}", path.display()))?;
            Ok(meta.permissions().mode() & 0o7777)
        }

        fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
            std::os::unix::fs::symlink(target, link)
                .with_context(|| format!("symlink {} -> {}", link.display(), target.display()))
        }

        fn read_link(&self, path: &Path) -> Result<PathBuf> {
            std::fs::read_link(path).with_context(|| format!("readlink {}", path.display()))
        }

        fn is_symlink(&self, path: &Path) -> bool {
            path.symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
        }

        fn mount(&self, req: &MountRequest) -> Result<()> {
            let mut flags = MsFlags::empty();
            if req.make_rprivate {
                flags |= MsFlags::MS_PRIVATE | MsFlags::MS_REC;
            }
            if req.bind {
                flags |= MsFlags::MS_BIND;
            }
            if req.recursive {
                flags |= MsFlags::MS_REC;
            }
            if req.readonly {
                flags |= MsFlags::MS_RDONLY;
            }
            if req.remount {
                flags |= MsFlags::MS_REMOUNT;
            }
            mount(
                req.source.as_deref(),
                req.target.as_path(),
                req.fstype.as_deref(),
                flags,
                req.data.as_deref(),
            )
            .with_context(|| format!("mount {}", req.target.display()))
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            match umount2(target, MntFlags::MNT_DETACH) {
                Ok(()) => Ok(()),
                // Not mounted or already gone is fine during teardown.
                Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
                Err(e) => Err(e).with_context(|| format!("umount {}", target.display())),
            }
        }

        fn mknod_char(&self, path: &Path, mode: u32, major: u64, minor: u64) -> Result<()> {
            match mknod(
                path,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(mode),
                makedev(major, minor),
            ) {
                Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
                Err(e) => Err(e).with_context(|| format!("mknod {}", path.display())),
            }
        }

        fn getenv(&self, key: &str) -> Option<String> {
            std::env::var(key).ok()
        }

        fn current_exe(&self) -> Result<PathBuf> {
            std::env::current_exe().context("resolve current exe")
        }

        fn lookup_path(&self, name: &str) -> Option<PathBuf> {
            if name.contains('/') {
                let p = PathBuf::from(name);
                return p.exists().then_some(p);
            }
            let path_var = std::env::var("PATH").unwrap_or_default();
            for dir in path_var.split(':').filter(|d| !d.is_empty()) {
                let candidate = Path::new(dir).join(name);
                if candidate.exists() {
                    return Some(candidate);
                }
            }
            None
        }

        fn run_command(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            let output = Command::new(program)
                .args(args)
                .output()
                .with_context(|| format!("run {program}"))?;
            Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }

        fn run_command_env(
            &self,
            program: &str,
            args: &[&str],
            env: &[(String, String)],
        ) -> Result<CommandOutput> {
            let output = Command::new(program)
                .args(args)
                .env_clear()
                .envs(env.iter().map(|(k, v)| (k.clone(), v.clone())))
                .output()
                .with_context(|| format!("run {program}"))?;
            Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

/// Portability stub: compiles on non-Linux hosts so tooling works, but
/// every isolation verb fails at runtime.
#[cfg(not(target_os = "linux"))]
pub struct StubPlatform;

#[cfg(not(target_os = "linux"))]
impl Platform for StubPlatform {
    fn spawn(&self, _spec: SpawnSpec) -> Result<SpawnedChild> {
        bail!("isolated job execution requires Linux")
    }
    fn wait(&self, _pid: u32) -> Result<Exit> {
        bail!("isolated job execution requires Linux")
    }
    fn try_wait(&self, _pid: u32) -> Result<Option<Exit>> {
        bail!("isolated job execution requires Linux")
    }
    fn kill(&self, _pid: u32, _sig: Sig) -> Result<()> {
        bail!("isolated job execution requires Linux")
    }
    fn kill_process_group(&self, _pid: u32, _sig: Sig) -> Result<()> {
        bail!("isolated job execution requires Linux")
    }
    fn process_alive(&self, _pid: u32) -> bool {
        false
    }
    fn exec(
        &self,
        _program: &Path,
        _args: &[String],
        _env: &[(String, String)],
    ) -> Result<std::convert::Infallible> {
        bail!("isolated job execution requires Linux")
    }
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).with_context(|| format!("read {}", path.display()))
    }
    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))
    }
    fn copy_file(&self, _src: &Path, _dst: &Path, _mode: u32) -> Result<()> {
        bail!("isolated job execution requires Linux")
    }
    fn mkdir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).with_context(|| format!("mkdir -p {}", path.display()))
    }
    fn remove_all(&self, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("rm -r {}", path.display())),
        }
    }
    fn rmdir(&self, path: &Path) -> Result<()> {
        match std::fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("rmdir {}", path.display())),
        }
    }
    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)
            .with_context(|| format!("rename {} to {}", from.display(), to.display()))
    }
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in
            std::fs::read_dir(path).with_context(|| format!("read dir {}", path.display()))?
        {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }
    fn set_mode(&self, _path: &Path, _mode: u32) -> Result<()> {
        bail!("isolated job execution requires Linux")
    }
    fn file_mode(&self, _path: &Path) -> Result<u32> {
        bail!("isolated job execution requires Linux")
    }
    fn symlink(&self, _target: &Path, _link: &Path) -> Result<()> {
        bail!("isolated job execution requires Linux")
    }
    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        std::fs::read_link(path).with_context(|| format!("readlink {}", path.display()))
    }
    fn is_symlink(&self, path: &Path) -> bool {
        path.symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }
    fn mount(&self, _req: &MountRequest) -> Result<()> {
        bail!("isolated job execution requires Linux")
    }
    fn unmount(&self, _target: &Path) -> Result<()> {
        bail!("isolated job execution requires Linux")
    }
    fn mknod_char(&self, _path: &Path, _mode: u32, _major: u64, _minor: u64) -> Result<()> {
        bail!("isolated job execution requires Linux")
    }
    fn getenv(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
    fn current_exe(&self) -> Result<PathBuf> {
        std::env::current_exe().context("resolve current exe")
    }
    fn lookup_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
    fn run_command(&self, _program: &str, _args: &[&str]) -> Result<CommandOutput> {
        bail!("isolated job execution requires Linux")
    }
    fn run_command_env(
        &self,
        _program: &str,
        _args: &[&str],
        _env: &[(String, String)],
    ) -> Result<CommandOutput> {
        bail!("isolated job execution requires Linux")
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory platform fake for resource-manager and cleanup tests.

    use super::*;
    use anyhow::bail;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FakeOp {
        Spawn(PathBuf),
        Kill(u32, i32),
        KillGroup(u32, i32),
        Mount(PathBuf),
        Unmount(PathBuf),
        Mknod(PathBuf),
        RemoveAll(PathBuf),
        Rename(PathBuf, PathBuf),
        Command(String, Vec<String>),
    }

    /// Records every side-effecting verb; file contents live in a map.
    #[derive(Default)]
    pub struct FakePlatform {
        pub ops: Mutex<Vec<FakeOp>>,
        pub files: Mutex<HashMap<PathBuf, Vec<u8>>>,
        pub dirs: Mutex<HashSet<PathBuf>>,
        pub alive: Mutex<HashSet<u32>>,
        next_pid: AtomicU32,
        /// Commands (program name) that should fail.
        pub failing_commands: Mutex<HashSet<String>>,
    }

    impl FakePlatform {
        pub fn new() -> FakePlatform {
            FakePlatform {
                next_pid: AtomicU32::new(1000),
                ..FakePlatform::default()
            }
        }

        pub fn ops(&self) -> Vec<FakeOp> {
            self.ops.lock().expect("ops lock").clone()
        }

        pub fn record(&self, op: FakeOp) {
            self.ops.lock().expect("ops lock").push(op);
        }

        pub fn add_dir(&self, path: impl Into<PathBuf>) {
            self.dirs.lock().expect("dirs lock").insert(path.into());
        }

        pub fn add_file(&self, path: impl Into<PathBuf>, contents: &[u8]) {
            self.files
                .lock()
                .expect("files lock")
                .insert(path.into(), contents.to_vec());
        }

        pub fn mark_alive(&self, pid: u32) {
            self.alive.lock().expect("alive lock").insert(pid);
        }

        pub fn fail_command(&self, program: &str) {
            self.failing_commands
                .lock()
                .expect("failing lock")
                .insert(program.to_string());
        }

        pub fn commands_run(&self) -> Vec<(String, Vec<String>)> {
            self.ops()
                .into_iter()
                .filter_map(|op| match op {
                    FakeOp::Command(p, a) => Some((p, a)),
                    _ => None,
                })
                .collect()
        }
    }

    impl Platform for FakePlatform {
        fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild> {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.record(FakeOp::Spawn(spec.program.clone()));
            self.mark_alive(pid);
            Ok(SpawnedChild {
                pid,
                stdout: Box::new(std::io::empty()),
                stderr: Box::new(std::io::empty()),
            })
        }

        fn wait(&self, pid: u32) -> Result<Exit> {
            self.alive.lock().expect("alive lock").remove(&pid);
            Ok(Exit::Code(0))
        }

        fn try_wait(&self, pid: u32) -> Result<Option<Exit>> {
            if self.alive.lock().expect("alive lock").contains(&pid) {
                Ok(None)
            } else {
                Ok(Some(Exit::Code(0)))
            }
        }

        fn kill(&self, pid: u32, sig: Sig) -> Result<()> {
            self.record(FakeOp::Kill(pid, sig.raw()));
            if sig == Sig::Kill {
                self.alive.lock().expect("alive lock").remove(&pid);
            }
            Ok(())
        }

        fn kill_process_group(&self, pid: u32, sig: Sig) -> Result<()> {
            self.record(FakeOp::KillGroup(pid, sig.raw()));
            if sig == Sig::Kill {
                self.alive.lock().expect("alive lock").remove(&pid);
            }
            Ok(())
        }

        fn process_alive(&self, pid: u32) -> bool {
            self.alive.lock().expect("alive lock").contains(&pid)
        }

        fn exec(
            &self,
            _program: &Path,
            _args: &[String],
            _env: &[(String, String)],
        ) -> Result<std::convert::Infallible> {
            bail!("exec is not supported by the fake platform")
        }

        fn path_exists(&self, path: &Path) -> bool {
            self.files.lock().expect("files lock").contains_key(path)
                || self.dirs.lock().expect("dirs lock").contains(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.dirs.lock().expect("dirs lock").contains(path)
        }

        fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
            self.files
                .lock()
                .expect("files lock")
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such file {}", path.display()))
        }

        fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
            self.files
                .lock()
                .expect("files lock")
                .insert(path.to_path_buf(), contents.to_vec());
            Ok(())
        }

        fn copy_file(&self, src: &Path, dst: &Path, _mode: u32) -> Result<()> {
            let data = self.read_file(src)?;
            self.write_file(dst, &data)
        }

        fn mkdir_all(&self, path: &Path) -> Result<()> {
            self.add_dir(path);
            Ok(())
        }

        fn remove_all(&self, path: &Path) -> Result<()> {
            self.record(FakeOp::RemoveAll(path.to_path_buf()));
            self.dirs.lock().expect("dirs lock").remove(path);
            self.files
                .lock()
                .expect("files lock")
                .retain(|p, _| !p.starts_with(path));
            Ok(())
        }

        fn rmdir(&self, path: &Path) -> Result<()> {
            self.record(FakeOp::RemoveAll(path.to_path_buf()));
            self.dirs.lock().expect("dirs lock").remove(path);
            Ok(())
        }

        fn rename(&self, from: &Path, to: &Path) -> Result<()> {
            self.record(FakeOp::Rename(from.to_path_buf(), to.to_path_buf()));
            let mut dirs = self.dirs.lock().expect("dirs lock");
            let nested_dirs: Vec<PathBuf> = dirs
                .iter()
                .filter(|p| *p != from && p.starts_with(from))
                .cloned()
                .collect();
            for p in nested_dirs {
                if let Ok(rel) = p.strip_prefix(from) {
                    dirs.remove(&p);
                    dirs.insert(to.join(rel));
                }
            }
            if dirs.remove(from) {
                dirs.insert(to.to_path_buf());
            }
            drop(dirs);

            let mut files = self.files.lock().expect("files lock");
            let nested_files: Vec<PathBuf> = files
                .keys()
                .filter(|p| p.starts_with(from))
                .cloned()
                .collect();
            for p in nested_files {
                if let Ok(rel) = p.strip_prefix(from) {
                    if let Some(data) = files.remove(&p) {
                        files.insert(to.join(rel), data);
                    }
                }
            }
            Ok(())
        }

        fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
            let dirs = self.dirs.lock().expect("dirs lock");
            let files = self.files.lock().expect("files lock");
            let mut out: Vec<PathBuf> = dirs
                .iter()
                .chain(files.keys())
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect();
            out.sort();
            out.dedup();
            Ok(out)
        }

        fn set_mode(&self, _path: &Path, _mode: u32) -> Result<()> {
            Ok(())
        }

        fn file_mode(&self, _path: &Path) -> Result<u32> {
            Ok(0o644)
        }

        fn symlink(&self, _target: &Path, link: &Path) -> Result<()> {
            self.add_file(link, b"");
            Ok(())
        }

        fn read_link(&self, path: &Path) -> Result<PathBuf> {
            bail!("not a symlink: {}", path.display())
        }

        fn is_symlink(&self, _path: &Path) -> bool {
            false
        }

        fn mount(&self, req: &MountRequest) -> Result<()> {
            self.record(FakeOp::Mount(req.target.clone()));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.record(FakeOp::Unmount(target.to_path_buf()));
            Ok(())
        }

        fn mknod_char(&self, path: &Path, _mode: u32, _major: u64, _minor: u64) -> Result<()> {
            self.record(FakeOp::Mknod(path.to_path_buf()));
            Ok(())
        }

        fn getenv(&self, _key: &str) -> Option<String> {
            None
        }

        fn current_exe(&self) -> Result<PathBuf> {
            Ok(PathBuf::from("/usr/local/bin/joblet"))
        }

        fn lookup_path(&self, name: &str) -> Option<PathBuf> {
            Some(PathBuf::from("/usr/bin").join(name))
        }

        fn run_command(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            self.record(FakeOp::Command(
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            let failing = self.failing_commands.lock().expect("failing lock");
            let status = if failing.contains(program) { 1 } else { 0 };
            Ok(CommandOutput {
                status,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }

        fn run_command_env(
            &self,
            program: &str,
            args: &[&str],
            _env: &[(String, String)],
        ) -> Result<CommandOutput> {
            self.run_command(program, args)
        }
    }
}
