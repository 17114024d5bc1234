//! Runtime installation: download or clone, sniff, build, publish.
//!
//! Source packages run their `setup.sh` inside a throwaway *builder
//! chroot*: host `/usr /lib /lib64 /bin /sbin` bind-mounted read-only,
//! `/etc` and `/var` as writable copies so package-manager scratch never
//! touches the host, fresh pseudo-filesystems, and an empty writable
//! `/opt/joblet/runtimes` — the host `/opt` is never visible. After a
//! clean exit the built tree is copied out and renamed into the
//! versioned layout; the manifest's `version` field is forced to the
//! requested package version (setup scripts like to write the language
//! version there instead).
//!
//! Nothing is ever published on failure: the chroot is unmounted in
//! reverse order (lazily; failures are logged, not fatal) and the
//! scratch tree removed.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::config::JobletConfig;
use crate::error::{Error, Result};
use crate::platform::{MountRequest, Platform, SpawnSpec};
use crate::runtime::registry::RegistryClient;
use crate::runtime::{MANIFEST_FILE, RuntimeCatalog, RuntimeManifest, RuntimeSpecifier};

/// Line-buffered progress sink for install logs.
pub type Progress<'a> = &'a mut dyn FnMut(&str);

/// What an install call produced.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub already_installed: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum PackageKind {
    /// `runtime.yml` at the root; copy as-is.
    Prebuilt,
    /// A setup script that must run in the builder chroot.
    Source { script: String },
}

pub struct RuntimeInstaller {
    platform: Arc<dyn Platform>,
    config: JobletConfig,
    registry: RegistryClient,
    catalog: Arc<RuntimeCatalog>,
}

impl RuntimeInstaller {
    pub fn new(
        platform: Arc<dyn Platform>,
        config: &JobletConfig,
        catalog: Arc<RuntimeCatalog>,
    ) -> RuntimeInstaller {
        RuntimeInstaller {
            platform,
            registry: RegistryClient::new(config.registry_url.clone()),
            config: config.clone(),
            catalog,
        }
    }

    /// Install `<name>[@version|@latest]` from the registry. The registry
    /// is authoritative: a miss is an error, never a fallback.
    pub fn install_from_registry(
        &self,
        spec_str: &str,
        force: bool,
        progress: Progress<'_>,
    ) -> Result<InstallOutcome> {
        let spec = RuntimeSpecifier::parse(spec_str)?;
        let index = self
            .registry
            .fetch_index()
            .map_err(|e| Error::RuntimeInstall(format!("{e:#}")))?;
        let entry = index.resolve(&spec.name, spec.version.as_deref())?;
        progress(&format!("resolved {} to {}@{}", spec, entry.name, entry.version));

        if !force && self.catalog.is_installed(&entry.name, &entry.version) {
            progress(&format!("{}@{} is already installed", entry.name, entry.version));
            return Ok(InstallOutcome {
                path: self.catalog.install_path(&entry.name, &entry.version),
                name: entry.name,
                version: entry.version,
                already_installed: true,
            });
        }

        let scratch = tempfile::Builder::new()
            .prefix("joblet-install-")
            .tempdir()
            .map_err(|e| Error::RuntimeInstall(format!("create scratch dir: {e}")))?;
        let archive = scratch.path().join("runtime.tar.gz");
        progress(&format!("downloading {}", entry.download_url));
        self.registry
            .download_verified(&entry, &archive)
            .map_err(|e| Error::RuntimeInstall(format!("{e:#}")))?;
        progress("checksum verified");

        let source_dir = scratch.path().join("src");
        extract_archive(&archive, &source_dir)
            .map_err(|e| Error::RuntimeInstall(format!("{e:#}")))?;

        let outcome = self
            .install_tree(&entry.name, &entry.version, &source_dir, scratch.path(), progress)
            .map_err(|e| Error::RuntimeInstall(format!("{e:#}")))?;
        info!(runtime = %entry.name, version = %entry.version, "runtime installed");
        Ok(outcome)
    }

    /// Install straight from a git repository. Published into the same
    /// `<name>/<version>/` layout as registry installs; host-path mounts
    /// in the resulting manifest are materialized under `isolated/`.
    pub fn install_from_github(
        &self,
        spec_str: &str,
        repo: &str,
        branch: Option<&str>,
        subdir: Option<&str>,
        force: bool,
        progress: Progress<'_>,
    ) -> Result<InstallOutcome> {
        let spec = RuntimeSpecifier::parse(spec_str)?;
        let version = match spec.version.as_deref() {
            Some("latest") | None => branch.unwrap_or("main").to_string(),
            Some(v) => v.to_string(),
        };

        if !force && self.catalog.is_installed(&spec.name, &version) {
            progress(&format!("{}@{version} is already installed", spec.name));
            return Ok(InstallOutcome {
                path: self.catalog.install_path(&spec.name, &version),
                name: spec.name,
                version,
                already_installed: true,
            });
        }

        let scratch = tempfile::Builder::new()
            .prefix("joblet-install-")
            .tempdir()
            .map_err(|e| Error::RuntimeInstall(format!("create scratch dir: {e}")))?;
        let checkout = scratch.path().join("repo");

        let mut args = vec!["clone", "--depth", "1"];
        if let Some(b) = branch {
            args.extend_from_slice(&["--branch", b]);
        }
        let checkout_str = checkout.display().to_string();
        args.push(repo);
        args.push(&checkout_str);
        progress(&format!("cloning {repo}"));
        let out = self
            .platform
            .run_command("git", &args)
            .map_err(|e| Error::RuntimeInstall(format!("{e:#}")))?;
        if !out.success() {
            return Err(Error::RuntimeInstall(format!(
                "git clone {repo} failed: {}",
                out.stderr_text().trim()
            )));
        }

        let source_dir = match subdir {
            Some(sub) => checkout.join(sub),
            None => checkout,
        };
        if !self.platform.is_dir(&source_dir) {
            return Err(Error::RuntimeInstall(format!(
                "runtime path {} not found in {repo}",
                source_dir.display()
            )));
        }

        let outcome = self
            .install_tree(&spec.name, &version, &source_dir, scratch.path(), progress)
            .map_err(|e| Error::RuntimeInstall(format!("{e:#}")))?;
        self.isolate_host_mounts(&outcome.path)
            .map_err(|e| Error::RuntimeInstall(format!("{e:#}")))?;
        info!(runtime = %spec.name, version = %version, repo, "runtime installed from git");
        Ok(outcome)
    }

    /// Shared tail of both entry points: sniff the tree, build if it is
    /// a source package, publish atomically.
    fn install_tree(
        &self,
        name: &str,
        version: &str,
        source_dir: &Path,
        scratch: &Path,
        progress: Progress<'_>,
    ) -> anyhow::Result<InstallOutcome> {
        let staged = match detect_package(self.platform.as_ref(), source_dir)? {
            PackageKind::Prebuilt => {
                progress("pre-built package, copying");
                source_dir.to_path_buf()
            }
            PackageKind::Source { script } => {
                progress(&format!("source package, running {script} in builder chroot"));
                self.build_in_chroot(name, version, source_dir, &script, scratch, progress)?
            }
        };

        let path = self.publish(&staged, name, version)?;
        progress(&format!("published {}", path.display()));
        Ok(InstallOutcome {
            name: name.to_string(),
            version: version.to_string(),
            path,
            already_installed: false,
        })
    }

    fn build_in_chroot(
        &self,
        name: &str,
        version: &str,
        source_dir: &Path,
        script: &str,
        scratch: &Path,
        progress: Progress<'_>,
    ) -> anyhow::Result<PathBuf> {
        let mut chroot = BuilderChroot::create(self.platform.clone(), scratch)?;
        let result = (|| {
            chroot.mount_build_dir(source_dir)?;
            chroot.run_setup(name, version, script, progress)?;
            let built = chroot.output_dir(name);
            if !self.platform.is_dir(&built) {
                bail!("setup script did not produce /opt/joblet/runtimes/{name}");
            }
            // Copy out of the chroot before the mounts go away.
            let collected = scratch.join("built");
            copy_tree(self.platform.as_ref(), &built, &collected, false)?;
            Ok(collected)
        })();
        chroot.teardown();
        result
    }

    /// Atomic publish via the tmp-rename trick: the staged tree is
    /// copied next to its final home and renamed into place, so the
    /// nested `<name>/<version>` layout never moves a directory into
    /// itself and readers never see a half-written runtime.
    fn publish(&self, staged: &Path, name: &str, version: &str) -> anyhow::Result<PathBuf> {
        let manifest_path = staged.join(MANIFEST_FILE);
        let raw = self
            .platform
            .read_file(&manifest_path)
            .context("built runtime has no runtime.yml")?;
        let mut manifest = RuntimeManifest::parse(&raw)?;

        let name_dir = self.config.runtimes_dir.join(name);
        self.platform.mkdir_all(&name_dir)?;
        let tmp = name_dir.join(format!(".staging-{version}"));
        self.platform.remove_all(&tmp)?;
        copy_tree(self.platform.as_ref(), staged, &tmp, false)?;

        // Setup scripts tend to write the language version here; the
        // catalog is keyed by the package version.
        if manifest.version != version {
            debug!(
                runtime = name,
                wrote = %manifest.version,
                fixed = version,
                "correcting manifest version"
            );
        }
        manifest.version = version.to_string();
        manifest.name = name.to_string();
        self.platform
            .write_file(&tmp.join(MANIFEST_FILE), manifest.to_yaml()?.as_bytes())?;

        let final_dir = name_dir.join(version);
        self.platform.remove_all(&final_dir)?;
        self.platform.rename(&tmp, &final_dir)?;
        Ok(final_dir)
    }

    /// Post-install cleanup: any manifest mount whose source is an
    /// absolute host path is copied into `isolated/<rel>` inside the
    /// runtime directory and the manifest rewritten, so job chroots
    /// never bind host paths at run time.
    pub fn isolate_host_mounts(&self, runtime_dir: &Path) -> anyhow::Result<()> {
        let manifest_path = runtime_dir.join(MANIFEST_FILE);
        let raw = self.platform.read_file(&manifest_path)?;
        let mut manifest = RuntimeManifest::parse(&raw)?;

        let mut rewritten = false;
        for mount in &mut manifest.mounts {
            if !mount.source.starts_with('/') {
                continue;
            }
            let rel = mount.source.trim_start_matches('/').to_string();
            let isolated_rel = format!("isolated/{rel}");
            let dest = runtime_dir.join(&isolated_rel);
            copy_tree(
                self.platform.as_ref(),
                Path::new(&mount.source),
                &dest,
                true,
            )
            .with_context(|| format!("materialize {}", mount.source))?;
            debug!(source = %mount.source, to = %isolated_rel, "host mount isolated");
            mount.source = isolated_rel;
            rewritten = true;
        }
        if rewritten {
            self.platform
                .write_file(&manifest_path, manifest.to_yaml()?.as_bytes())?;
        }
        Ok(())
    }
}

/// The throwaway chroot setup scripts build inside.
struct BuilderChroot {
    platform: Arc<dyn Platform>,
    root: PathBuf,
    /// In mount order; teardown walks it in reverse.
    mounts: Vec<PathBuf>,
}

impl BuilderChroot {
    fn create(platform: Arc<dyn Platform>, scratch: &Path) -> anyhow::Result<BuilderChroot> {
        let root = scratch.join("chroot");
        platform.mkdir_all(&root)?;
        let mut chroot = BuilderChroot {
            platform: platform.clone(),
            root: root.clone(),
            mounts: Vec::new(),
        };

        // Toolchain directories, read-only. On merged-usr hosts some of
        // these are symlinks; those are recreated verbatim instead.
        for dir in ["/usr", "/lib", "/lib64", "/bin", "/sbin"] {
            let host = Path::new(dir);
            if !platform.path_exists(host) {
                continue;
            }
            let target = root.join(&dir[1..]);
            if platform.is_symlink(host) {
                let link_target = platform.read_link(host)?;
                platform.symlink(&link_target, &target)?;
            } else {
                platform.mkdir_all(&target)?;
                platform.mount(&MountRequest::bind(host, &target).recursive())?;
                platform.mount(&MountRequest::remount_readonly(&target))?;
                chroot.mounts.push(target);
            }
        }

        // Writable copies, not binds: package managers scribble here.
        for dir in ["/etc", "/var"] {
            let host = Path::new(dir);
            if platform.is_dir(host) {
                copy_tree(platform.as_ref(), host, &root.join(&dir[1..]), true)?;
            }
        }

        chroot.mount_fs("proc", "proc", None)?;
        let sys = root.join("sys");
        platform.mkdir_all(&sys)?;
        platform.mount(&MountRequest::bind("/sys", &sys).recursive())?;
        chroot.mounts.push(sys);

        chroot.mount_fs("tmpfs", "dev", Some("mode=0755"))?;
        for (node, minor) in [("null", 3), ("zero", 5), ("random", 8), ("urandom", 9)] {
            platform.mknod_char(&root.join("dev").join(node), 0o666, 1, minor)?;
        }
        chroot.mount_fs("devpts", "dev/pts", Some("newinstance,ptmxmode=0666"))?;
        chroot.mount_fs("tmpfs", "tmp", None)?;

        // The build target; host /opt stays invisible.
        platform.mkdir_all(&root.join("opt/joblet/runtimes"))?;
        Ok(chroot)
    }

    fn mount_fs(&mut self, fstype: &str, rel: &str, data: Option<&str>) -> anyhow::Result<()> {
        let target = self.root.join(rel);
        self.platform.mkdir_all(&target)?;
        let mut req = MountRequest::filesystem(fstype, &target);
        if let Some(d) = data {
            req = req.with_data(d);
        }
        self.platform.mount(&req)?;
        self.mounts.push(target);
        Ok(())
    }

    /// Expose the extracted source tree at `/build` (read-write: builds
    /// compile in place).
    fn mount_build_dir(&mut self, source_dir: &Path) -> anyhow::Result<()> {
        let target = self.root.join("build");
        self.platform.mkdir_all(&target)?;
        self.platform
            .mount(&MountRequest::bind(source_dir, &target).recursive())?;
        self.mounts.push(target);
        Ok(())
    }

    fn output_dir(&self, name: &str) -> PathBuf {
        self.root.join("opt/joblet/runtimes").join(name)
    }

    /// Run the setup script chroot'd, streaming its output line-buffered
    /// through the progress callback.
    fn run_setup(
        &self,
        name: &str,
        version: &str,
        script: &str,
        progress: Progress<'_>,
    ) -> anyhow::Result<()> {
        let chroot_bin = self
            .platform
            .lookup_path("chroot")
            .context("chroot(8) not found on PATH")?;
        let epoch = chrono::Utc::now().timestamp();
        let env = vec![
            ("RUNTIME_SPEC".to_string(), name.to_string()),
            ("RUNTIME_VERSION".to_string(), version.to_string()),
            ("RUNTIME_DIR".to_string(), "/opt/joblet/runtimes".to_string()),
            ("BUILD_ID".to_string(), format!("install-{epoch}")),
            ("JOBLET_CHROOT".to_string(), "true".to_string()),
            ("HOME".to_string(), "/tmp".to_string()),
            (
                "PATH".to_string(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ),
        ];

        let child = self.platform.spawn(SpawnSpec {
            program: chroot_bin,
            args: vec![
                self.root.display().to_string(),
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("cd /build && sh ./{script}"),
            ],
            env,
            cwd: None,
            namespaces: None,
            into_cgroup: None,
            extra_fd: None,
            new_process_group: true,
        })?;
        let pid = child.pid;

        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        let stdout_pump = spawn_line_pump(child.stdout, tx.clone());
        let stderr_pump = spawn_line_pump(child.stderr, tx);
        for line in rx.iter() {
            progress(&line);
        }
        let _ = stdout_pump.join();
        let _ = stderr_pump.join();

        let exit = self.platform.wait(pid)?;
        if !exit.success() {
            bail!("setup script {script} failed with {exit:?}");
        }
        Ok(())
    }

    /// Reverse-order lazy unmount; failures are logged and skipped. The
    /// scratch tree itself is removed by its owner.
    fn teardown(&self) {
        for target in self.mounts.iter().rev() {
            if let Err(e) = self.platform.unmount(target) {
                warn!(target = %target.display(), error = %e, "builder chroot unmount failed");
            }
        }
    }
}

fn spawn_line_pump(
    mut reader: Box<dyn Read + Send>,
    tx: crossbeam_channel::Sender<String>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut pending = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for &b in &buf[..n] {
                        if b == b'\n' {
                            let line = String::from_utf8_lossy(&pending).into_owned();
                            let _ = tx.send(line);
                            pending.clear();
                        } else {
                            pending.push(b);
                        }
                    }
                }
            }
        }
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
        }
    })
}

/// Decide what kind of package an extracted tree is.
fn detect_package(platform: &dyn Platform, dir: &Path) -> anyhow::Result<PackageKind> {
    if platform.path_exists(&dir.join(MANIFEST_FILE)) {
        return Ok(PackageKind::Prebuilt);
    }
    let platform_script = format!(
        "setup-{}-{}.sh",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    for script in [platform_script.as_str(), "setup.sh"] {
        if platform.path_exists(&dir.join(script)) {
            return Ok(PackageKind::Source {
                script: script.to_string(),
            });
        }
    }
    bail!(
        "{} is neither a pre-built runtime (runtime.yml) nor a source package (setup.sh)",
        dir.display()
    )
}

/// Recursive copy through the shim. `lenient` skips unreadable entries
/// (needed for `/etc` and `/var`, which hold sockets and locked files).
fn copy_tree(platform: &dyn Platform, src: &Path, dst: &Path, lenient: bool) -> anyhow::Result<()> {
    if platform.is_symlink(src) {
        let target = platform.read_link(src)?;
        if let Some(parent) = dst.parent() {
            platform.mkdir_all(parent)?;
        }
        platform.symlink(&target, dst)?;
        return Ok(());
    }
    if platform.is_dir(src) {
        platform.mkdir_all(dst)?;
        let entries = match platform.read_dir(src) {
            Ok(entries) => entries,
            Err(e) if lenient => {
                debug!(dir = %src.display(), error = %e, "skipping unreadable directory");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for entry in entries {
            let Some(file_name) = entry.file_name() else {
                continue;
            };
            copy_tree(platform, &entry, &dst.join(file_name), lenient)?;
        }
        return Ok(());
    }
    match platform.read_file(src) {
        Ok(data) => {
            if let Some(parent) = dst.parent() {
                platform.mkdir_all(parent)?;
            }
            platform.write_file(dst, &data)?;
            if let Ok(mode) = platform.file_mode(src) {
                let _ = platform.set_mode(dst, mode);
            }
            Ok(())
        }
        Err(e) if lenient => {
            debug!(file = %src.display(), error = %e, "skipping unreadable file");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Extract a gzip'd tar into `dest`. When every entry shares one
/// top-level directory that prefix is stripped, so archives built either
/// way produce the same tree. Entries that would escape `dest` are
/// rejected.
pub fn extract_archive(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    // Pass 1: is there a single common top-level directory?
    let file = std::fs::File::open(archive)
        .with_context(|| format!("open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut common: Option<std::ffi::OsString> = None;
    let mut uniform = true;
    let mut any = false;
    for entry in tar.entries().context("read archive")? {
        let entry = entry.context("read archive entry")?;
        let path = entry.path().context("entry path")?.into_owned();
        let Some(Component::Normal(first)) = path.components().next() else {
            uniform = false;
            continue;
        };
        any = true;
        match &common {
            None => common = Some(first.to_os_string()),
            Some(prefix) if prefix == first => {}
            Some(_) => uniform = false,
        }
    }
    let strip = any && uniform && common.is_some();

    // Pass 2: unpack with sanitized, possibly stripped paths.
    let file = std::fs::File::open(archive)
        .with_context(|| format!("open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    std::fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    for entry in tar.entries().context("read archive")? {
        let mut entry = entry.context("read archive entry")?;
        let path = entry.path().context("entry path")?.into_owned();
        let mut components = path.components();
        if strip {
            components.next();
        }
        let mut rel = PathBuf::new();
        for component in components {
            match component {
                Component::Normal(part) => rel.push(part),
                Component::CurDir => {}
                _ => bail!("archive entry {} escapes the target", path.display()),
            }
        }
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("unpack {}", target.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;

    const MANIFEST: &str = "\
name: demo
version: \"0.0.0-dev\"
mounts:
  - source: bin
    target: /usr/local/demo
";

    fn installer(platform: Arc<FakePlatform>) -> RuntimeInstaller {
        let config = JobletConfig::default();
        let catalog = Arc::new(RuntimeCatalog::new(platform.clone(), &config));
        RuntimeInstaller::new(platform, &config, catalog)
    }

    fn write_tar_gz(entries: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let gz = flate2::write::GzEncoder::new(
            file.reopen().expect("reopen"),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(gz);
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            let name = header.as_old_mut().name.as_mut();
            let bytes = path.as_bytes();
            name[..bytes.len()].copy_from_slice(bytes);
            header.set_cksum();
            builder
                .append(&header, contents.as_bytes())
                .expect("append");
        }
        builder.into_inner().expect("finish tar").finish().expect("finish gz");
        file
    }

    fn read_tree(dir: &Path) -> Vec<String> {
        let mut out = Vec::new();
        for entry in walkdir(dir) {
            out.push(
                entry
                    .strip_prefix(dir)
                    .expect("under dir")
                    .display()
                    .to_string(),
            );
        }
        out.sort();
        out
    }

    fn walkdir(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let p = entry.path();
                if p.is_dir() {
                    files.extend(walkdir(&p));
                } else {
                    files.push(p);
                }
            }
        }
        files
    }

    #[test]
    fn extraction_strips_a_single_common_prefix() {
        let archive = write_tar_gz(&[
            ("pkg-1.0/runtime.yml", MANIFEST),
            ("pkg-1.0/bin/demo", "#!/bin/sh\n"),
        ]);
        let dest = tempfile::tempdir().expect("tempdir");
        extract_archive(archive.path(), dest.path()).expect("extract");
        assert_eq!(read_tree(dest.path()), vec!["bin/demo", "runtime.yml"]);
    }

    #[test]
    fn extraction_without_common_prefix_is_verbatim() {
        let archive = write_tar_gz(&[("runtime.yml", MANIFEST), ("bin/demo", "x")]);
        let dest = tempfile::tempdir().expect("tempdir");
        extract_archive(archive.path(), dest.path()).expect("extract");
        assert_eq!(read_tree(dest.path()), vec!["bin/demo", "runtime.yml"]);
    }

    #[test]
    fn prefixed_and_stripped_archives_extract_identically() {
        let plain = write_tar_gz(&[("runtime.yml", MANIFEST), ("bin/demo", "x")]);
        let prefixed = write_tar_gz(&[("top/runtime.yml", MANIFEST), ("top/bin/demo", "x")]);
        let d1 = tempfile::tempdir().expect("tempdir");
        let d2 = tempfile::tempdir().expect("tempdir");
        extract_archive(plain.path(), d1.path()).expect("extract");
        extract_archive(prefixed.path(), d2.path()).expect("extract");
        assert_eq!(read_tree(d1.path()), read_tree(d2.path()));
    }

    #[test]
    fn hostile_archive_entries_are_rejected() {
        let archive = write_tar_gz(&[("../escape", "x")]);
        let dest = tempfile::tempdir().expect("tempdir");
        assert!(extract_archive(archive.path(), dest.path()).is_err());
    }

    #[test]
    fn package_sniffing() {
        let platform = FakePlatform::new();
        platform.add_file("/pkg/runtime.yml", b"");
        assert_eq!(
            detect_package(&platform, Path::new("/pkg")).expect("detect"),
            PackageKind::Prebuilt
        );

        let platform = FakePlatform::new();
        platform.add_file("/pkg/setup.sh", b"");
        assert_eq!(
            detect_package(&platform, Path::new("/pkg")).expect("detect"),
            PackageKind::Source {
                script: "setup.sh".to_string()
            }
        );

        let platform = FakePlatform::new();
        let specific = format!(
            "setup-{}-{}.sh",
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        platform.add_file(format!("/pkg/{specific}"), b"");
        platform.add_file("/pkg/setup.sh", b"");
        // The platform-specific script wins over the generic one.
        assert_eq!(
            detect_package(&platform, Path::new("/pkg")).expect("detect"),
            PackageKind::Source { script: specific }
        );

        let platform = FakePlatform::new();
        platform.add_dir("/pkg");
        assert!(detect_package(&platform, Path::new("/pkg")).is_err());
    }

    #[test]
    fn publish_fixes_the_manifest_version() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_dir("/staged");
        platform.add_file("/staged/runtime.yml", MANIFEST.as_bytes());
        platform.add_file("/staged/bin/demo", b"#!/bin/sh\n");
        let installer = installer(platform.clone());

        let path = installer
            .publish(Path::new("/staged"), "demo", "1.2.3")
            .expect("publish");
        assert_eq!(path, PathBuf::from("/opt/joblet/runtimes/demo/1.2.3"));
        let raw = platform
            .read_file(&path.join("runtime.yml"))
            .expect("manifest");
        let manifest = RuntimeManifest::parse(&raw).expect("parse");
        // The script wrote 0.0.0-dev; the package version wins.
        assert_eq!(manifest.version, "1.2.3");
        assert_eq!(manifest.name, "demo");
    }

    #[test]
    fn isolate_rewrites_absolute_mount_sources() {
        let platform = Arc::new(FakePlatform::new());
        let dir = Path::new("/opt/joblet/runtimes/py/1.0.0");
        let manifest = "\
name: py
version: \"1.0.0\"
mounts:
  - source: /usr/lib/python3.11
    target: /usr/lib/python3.11
  - source: python
    target: /usr/local/python
";
        platform.add_dir(dir);
        platform.add_file(dir.join("runtime.yml"), manifest.as_bytes());
        platform.add_dir("/usr/lib/python3.11");
        platform.add_file("/usr/lib/python3.11/os.py", b"pass");
        let installer = installer(platform.clone());

        installer.isolate_host_mounts(dir).expect("isolate");

        let raw = platform.read_file(&dir.join("runtime.yml")).expect("manifest");
        let rewritten = RuntimeManifest::parse(&raw).expect("parse");
        assert_eq!(rewritten.mounts[0].source, "isolated/usr/lib/python3.11");
        // Relative sources stay untouched.
        assert_eq!(rewritten.mounts[1].source, "python");
        assert!(
            platform.path_exists(&dir.join("isolated/usr/lib/python3.11/os.py")),
            "host tree materialized inside the runtime dir"
        );
    }

    #[test]
    fn copy_tree_copies_nested_files() {
        let platform = FakePlatform::new();
        platform.add_dir("/src");
        platform.add_dir("/src/sub");
        platform.add_file("/src/a.txt", b"a");
        platform.add_file("/src/sub/b.txt", b"b");
        copy_tree(&platform, Path::new("/src"), Path::new("/dst"), false).expect("copy");
        assert_eq!(platform.read_file(Path::new("/dst/a.txt")).expect("a"), b"a");
        assert_eq!(
            platform.read_file(Path::new("/dst/sub/b.txt")).expect("b"),
            b"b"
        );
    }
}
