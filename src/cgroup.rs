//! cgroup v2 lifecycle for jobs.
//!
//! Layout: `<cgroup_base>/joblet/job-<uuid>/` holds the limit files;
//! the executing process sits in the nested `job-<uuid>/proc/` subgroup so
//! the parent group's controllers can be adjusted without touching the
//! group the process itself occupies.
//!
//! Controller files are only ever written when the controller appears in
//! the root `cgroup.subtree_control`; writing an un-enabled controller
//! file is an error the kernel reports confusingly late, so the enabled
//! set is checked first and cached.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::config::JobletConfig;
use crate::job::Limits;
use crate::platform::Platform;

/// cpu.max period in microseconds; quota scales off this.
const CPU_PERIOD_US: u64 = 100_000;

pub struct CgroupManager {
    platform: Arc<dyn Platform>,
    cgroup_base: PathBuf,
    root: PathBuf,
    enabled: Mutex<Option<HashSet<String>>>,
}

impl CgroupManager {
    pub fn new(platform: Arc<dyn Platform>, config: &JobletConfig) -> CgroupManager {
        CgroupManager {
            platform,
            cgroup_base: config.cgroup_base.clone(),
            root: config.cgroup_root(),
            enabled: Mutex::new(None),
        }
    }

    /// Create the daemon subtree and delegate the controllers we use into
    /// it. Idempotent; called lazily before the first job group.
    fn ensure_root(&self) -> Result<HashSet<String>> {
        let mut cache = self.enabled.lock().expect("enabled lock");
        if let Some(set) = cache.as_ref() {
            return Ok(set.clone());
        }

        let controllers_file = self.cgroup_base.join("cgroup.controllers");
        let available: HashSet<String> = String::from_utf8_lossy(
            &self
                .platform
                .read_file(&controllers_file)
                .context("read root cgroup.controllers")?,
        )
        .split_whitespace()
        .map(str::to_string)
        .collect();

        let wanted: Vec<&str> = ["cpu", "memory", "io", "cpuset"]
            .into_iter()
            .filter(|c| available.contains(*c))
            .collect();
        if wanted.is_empty() {
            bail!(
                "no usable cgroup v2 controllers at {}",
                self.cgroup_base.display()
            );
        }

        self.platform.mkdir_all(&self.root)?;
        let enable_line = wanted
            .iter()
            .map(|c| format!("+{c}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.platform.write_file(
            &self.cgroup_base.join("cgroup.subtree_control"),
            enable_line.as_bytes(),
        )?;
        self.platform
            .write_file(&self.root.join("cgroup.subtree_control"), enable_line.as_bytes())?;

        let set: HashSet<String> = wanted.into_iter().map(str::to_string).collect();
        *cache = Some(set.clone());
        Ok(set)
    }

    /// Create the job group with its limit files and the nested `proc/`
    /// subgroup the child is cloned into.
    pub fn create(&self, path: &Path, limits: &Limits) -> Result<()> {
        let enabled = self.ensure_root()?;
        self.platform
            .mkdir_all(path)
            .with_context(|| format!("create cgroup {}", path.display()))?;

        // Delegate into the job group so the proc/ subgroup can carry the
        // cpuset mirror.
        let delegate = enabled
            .iter()
            .map(|c| format!("+{c}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.platform
            .write_file(&path.join("cgroup.subtree_control"), delegate.as_bytes())?;
        self.platform.mkdir_all(&Self::proc_subgroup(path))?;

        if limits.cpu_percent > 0 && enabled.contains("cpu") {
            let quota = u64::from(limits.cpu_percent) * CPU_PERIOD_US / 100;
            self.platform.write_file(
                &path.join("cpu.max"),
                format!("{quota} {CPU_PERIOD_US}").as_bytes(),
            )?;
        }
        if limits.memory_mb > 0 && enabled.contains("memory") {
            let bytes = limits.memory_mb * 1024 * 1024;
            self.platform
                .write_file(&path.join("memory.max"), bytes.to_string().as_bytes())?;
        }
        if limits.io_bps > 0 && enabled.contains("io") {
            self.apply_io_limit(path, limits.io_bps)?;
        }
        if !limits.cpu_cores.is_empty() {
            self.set_cpu_cores(path, &limits.cpu_cores)?;
        }
        debug!(cgroup = %path.display(), "cgroup created");
        Ok(())
    }

    /// Write `io.max` for every block device that exposes a major:minor.
    /// A host with no block devices gets no IO limit rather than an error.
    fn apply_io_limit(&self, path: &Path, bps: u64) -> Result<()> {
        let mut lines = Vec::new();
        if let Ok(entries) = self.platform.read_dir(Path::new("/sys/block")) {
            for entry in entries {
                let dev_file = entry.join("dev");
                let Ok(raw) = self.platform.read_file(&dev_file) else {
                    continue;
                };
                let id = String::from_utf8_lossy(&raw).trim().to_string();
                if id.contains(':') {
                    lines.push(format!("{id} rbps={bps} wbps={bps}"));
                }
            }
        }
        for line in lines {
            // Virtual devices reject io.max; skip them rather than fail
            // the whole job setup.
            if let Err(e) = self.platform.write_file(&path.join("io.max"), line.as_bytes()) {
                warn!(cgroup = %path.display(), error = %e, "io.max write skipped");
            }
        }
        Ok(())
    }

    /// Pin the group to specific cores, mirrored into `proc/` so the
    /// process group inherits the affinity.
    pub fn set_cpu_cores(&self, path: &Path, cores: &[u32]) -> Result<()> {
        let enabled = self.ensure_root()?;
        if !enabled.contains("cpuset") {
            bail!("cpuset controller is not enabled");
        }
        let list = cores
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.platform
            .write_file(&path.join("cpuset.cpus"), list.as_bytes())?;
        let proc = Self::proc_subgroup(path);
        if self.platform.is_dir(&proc) {
            self.platform
                .write_file(&proc.join("cpuset.cpus"), list.as_bytes())?;
        }
        Ok(())
    }

    /// The subgroup the child process is placed into at clone time.
    pub fn proc_subgroup(path: &Path) -> PathBuf {
        path.join("proc")
    }

    /// Remove the job's cgroup directories. The kernel refuses while any
    /// process remains, so termination must have completed first. Absent
    /// directories are success.
    pub fn cleanup(&self, path: &Path) -> Result<()> {
        if !self.platform.is_dir(path) && !self.platform.path_exists(path) {
            return Ok(());
        }
        self.platform.rmdir(&Self::proc_subgroup(path))?;
        self.platform.rmdir(path)?;
        debug!(cgroup = %path.display(), "cgroup removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;

    fn manager(platform: Arc<FakePlatform>) -> CgroupManager {
        platform.add_file(
            "/sys/fs/cgroup/cgroup.controllers",
            b"cpuset cpu io memory hugetlb pids\n",
        );
        CgroupManager::new(platform, &JobletConfig::default())
    }

    #[test]
    fn create_writes_limit_files_and_proc_subgroup() {
        let platform = Arc::new(FakePlatform::new());
        let mgr = manager(platform.clone());
        let path = PathBuf::from("/sys/fs/cgroup/joblet/job-a1");
        let limits = Limits {
            cpu_percent: 150,
            cpu_cores: vec![0, 2],
            memory_mb: 512,
            io_bps: 0,
        };
        mgr.create(&path, &limits).expect("create");

        let files = platform.files.lock().expect("files");
        assert_eq!(
            files.get(&path.join("cpu.max")).map(|v| v.as_slice()),
            Some(b"150000 100000".as_slice())
        );
        assert_eq!(
            files.get(&path.join("memory.max")).map(|v| v.as_slice()),
            Some(b"536870912".as_slice())
        );
        assert_eq!(
            files.get(&path.join("cpuset.cpus")).map(|v| v.as_slice()),
            Some(b"0,2".as_slice())
        );
        assert_eq!(
            files
                .get(&path.join("proc/cpuset.cpus"))
                .map(|v| v.as_slice()),
            Some(b"0,2".as_slice())
        );
        drop(files);
        assert!(platform.is_dir(&path.join("proc")));
    }

    #[test]
    fn unlimited_fields_write_nothing() {
        let platform = Arc::new(FakePlatform::new());
        let mgr = manager(platform.clone());
        let path = PathBuf::from("/sys/fs/cgroup/joblet/job-a2");
        mgr.create(&path, &Limits::default()).expect("create");
        let files = platform.files.lock().expect("files");
        assert!(!files.contains_key(&path.join("cpu.max")));
        assert!(!files.contains_key(&path.join("memory.max")));
    }

    #[test]
    fn controllers_missing_from_root_are_never_written() {
        let platform = Arc::new(FakePlatform::new());
        // Root exposes only cpu: memory.max must not be written.
        platform.add_file("/sys/fs/cgroup/cgroup.controllers", b"cpu\n");
        let mgr = CgroupManager::new(platform.clone(), &JobletConfig::default());
        let path = PathBuf::from("/sys/fs/cgroup/joblet/job-a3");
        let limits = Limits {
            cpu_percent: 50,
            memory_mb: 64,
            ..Limits::default()
        };
        mgr.create(&path, &limits).expect("create");
        let files = platform.files.lock().expect("files");
        assert!(files.contains_key(&path.join("cpu.max")));
        assert!(!files.contains_key(&path.join("memory.max")));
    }

    #[test]
    fn cleanup_tolerates_absent_directory() {
        let platform = Arc::new(FakePlatform::new());
        let mgr = manager(platform);
        mgr.cleanup(Path::new("/sys/fs/cgroup/joblet/job-gone"))
            .expect("cleanup of missing cgroup");
    }
}
