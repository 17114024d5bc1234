//! Language runtimes: the on-disk catalog and its manifest model.
//!
//! A runtime lives at `<runtimes_dir>/<name>/<version>/` and carries a
//! `runtime.yml` describing which of its subtrees are mounted (read-only)
//! into job chroots and which environment variables jobs inherit. The
//! directory is append-only once published; re-installation replaces the
//! versioned directory wholesale.

pub mod installer;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::JobletConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;

pub const MANIFEST_FILE: &str = "runtime.yml";

/// A runtime reference of the form `<name>[@<version>|@latest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpecifier {
    pub name: String,
    /// `None` and `Some("latest")` both mean "newest".
    pub version: Option<String>,
}

impl RuntimeSpecifier {
    pub fn parse(s: &str) -> Result<RuntimeSpecifier> {
        let (name, version) = match s.split_once('@') {
            Some((n, v)) => (n, Some(v.to_string())),
            None => (s, None),
        };
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::validation_field(
                "runtime",
                format!("bad runtime reference {s:?}"),
            ));
        }
        if let Some(v) = version.as_deref()
            && v.is_empty()
        {
            return Err(Error::validation_field(
                "runtime",
                format!("empty version in runtime reference {s:?}"),
            ));
        }
        Ok(RuntimeSpecifier {
            name: name.to_string(),
            version,
        })
    }

    pub fn wants_latest(&self) -> bool {
        matches!(self.version.as_deref(), None | Some("latest"))
    }
}

impl fmt::Display for RuntimeSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// `runtime.yml`: authored by setup scripts, rewritten by the installer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub mounts: Vec<ManifestMount>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// One mount from the runtime directory into the job chroot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestMount {
    /// Path inside the runtime directory (or, before the post-install
    /// rewrite, an absolute host path).
    pub source: String,
    /// Target inside the chroot.
    pub target: String,
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

fn default_readonly() -> bool {
    true
}

impl RuntimeManifest {
    pub fn parse(raw: &[u8]) -> anyhow::Result<RuntimeManifest> {
        serde_yaml::from_slice(raw).context("parse runtime.yml")
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("serialize runtime.yml")
    }
}

/// A runtime resolved against the catalog, ready to be mounted.
#[derive(Debug, Clone)]
pub struct ResolvedRuntime {
    pub dir: PathBuf,
    pub manifest: RuntimeManifest,
}

impl ResolvedRuntime {
    pub fn mounts(&self) -> &[ManifestMount] {
        &self.manifest.mounts
    }

    /// Manifest sources are relative to the runtime directory; absolute
    /// sources only appear transiently before the isolation rewrite.
    pub fn resolve_source(&self, source: &str) -> PathBuf {
        let p = Path::new(source);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.dir.join(source)
        }
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.manifest.environment
    }
}

/// An installed `<name>/<version>` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledRuntime {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

/// Read-side view of the on-disk catalog.
pub struct RuntimeCatalog {
    platform: Arc<dyn Platform>,
    runtimes_dir: PathBuf,
}

impl RuntimeCatalog {
    pub fn new(platform: Arc<dyn Platform>, config: &JobletConfig) -> RuntimeCatalog {
        RuntimeCatalog {
            platform,
            runtimes_dir: config.runtimes_dir.clone(),
        }
    }

    pub fn install_path(&self, name: &str, version: &str) -> PathBuf {
        self.runtimes_dir.join(name).join(version)
    }

    pub fn is_installed(&self, name: &str, version: &str) -> bool {
        self.platform
            .path_exists(&self.install_path(name, version).join(MANIFEST_FILE))
    }

    /// Resolve a reference to a concrete installed version; `@latest`
    /// (or a bare name) picks the newest by semver, falling back to
    /// lexicographic order for versions that do not parse.
    pub fn resolve(&self, spec: &RuntimeSpecifier) -> Result<ResolvedRuntime> {
        let version = match spec.version.as_deref() {
            Some(v) if v != "latest" => v.to_string(),
            _ => self.latest_version(&spec.name)?,
        };
        let dir = self.install_path(&spec.name, &version);
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = self
            .platform
            .read_file(&manifest_path)
            .map_err(|_| Error::not_found("runtime", spec.to_string()))?;
        let manifest = RuntimeManifest::parse(&raw)
            .map_err(|e| Error::RuntimeInstall(format!("invalid manifest for {spec}: {e:#}")))?;
        Ok(ResolvedRuntime { dir, manifest })
    }

    fn latest_version(&self, name: &str) -> Result<String> {
        let versions = self.installed_versions(name);
        pick_latest(&versions).ok_or_else(|| Error::not_found("runtime", name.to_string()))
    }

    fn installed_versions(&self, name: &str) -> Vec<String> {
        let dir = self.runtimes_dir.join(name);
        let Ok(entries) = self.platform.read_dir(&dir) else {
            return Vec::new();
        };
        entries
            .into_iter()
            .filter(|p| self.platform.path_exists(&p.join(MANIFEST_FILE)))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect()
    }

    pub fn list(&self) -> Vec<InstalledRuntime> {
        let Ok(names) = self.platform.read_dir(&self.runtimes_dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for name_dir in names {
            let Some(name) = name_dir.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            for version in self.installed_versions(&name) {
                out.push(InstalledRuntime {
                    path: self.install_path(&name, &version),
                    name: name.clone(),
                    version,
                });
            }
        }
        out
    }

    /// Remove one version, or every version when the reference names
    /// none. The name directory goes too once empty.
    pub fn remove(&self, reference: &str) -> Result<()> {
        let spec = RuntimeSpecifier::parse(reference)?;
        let name_dir = self.runtimes_dir.join(&spec.name);
        if !self.platform.is_dir(&name_dir) {
            return Err(Error::not_found("runtime", spec.to_string()));
        }
        match spec.version.as_deref() {
            None | Some("latest") => self
                .platform
                .remove_all(&name_dir)
                .map_err(|e| Error::Cleanup(format!("{e:#}"))),
            Some(version) => {
                let dir = self.install_path(&spec.name, version);
                if !self.platform.is_dir(&dir) {
                    return Err(Error::not_found("runtime", spec.to_string()));
                }
                self.platform
                    .remove_all(&dir)
                    .map_err(|e| Error::Cleanup(format!("{e:#}")))?;
                if self
                    .platform
                    .read_dir(&name_dir)
                    .map(|v| v.is_empty())
                    .unwrap_or(false)
                {
                    let _ = self.platform.remove_all(&name_dir);
                }
                Ok(())
            }
        }
    }
}

/// Newest version: semver order when both sides parse, lexicographic
/// otherwise (so `1.10.0` beats `1.9.0` but odd tags still resolve).
pub fn pick_latest(versions: &[String]) -> Option<String> {
    versions
        .iter()
        .max_by(|a, b| match (semver::Version::parse(a), semver::Version::parse(b)) {
            (Ok(va), Ok(vb)) => va.cmp(&vb),
            (Ok(_), Err(_)) => std::cmp::Ordering::Greater,
            (Err(_), Ok(_)) => std::cmp::Ordering::Less,
            (Err(_), Err(_)) => a.cmp(b),
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;

    const MANIFEST: &str = "\
name: python-3.11-ml
version: \"3.11.9\"
mounts:
  - source: python
    target: /usr/local/python
environment:
  PATH: /usr/local/python/bin:/usr/bin:/bin
";

    fn catalog_with(platform: Arc<FakePlatform>) -> RuntimeCatalog {
        RuntimeCatalog::new(platform, &JobletConfig::default())
    }

    #[test]
    fn specifier_parsing() {
        let spec = RuntimeSpecifier::parse("python-3.11-ml@3.11.9").expect("parse");
        assert_eq!(spec.name, "python-3.11-ml");
        assert_eq!(spec.version.as_deref(), Some("3.11.9"));
        assert!(!spec.wants_latest());

        assert!(RuntimeSpecifier::parse("python@latest").expect("parse").wants_latest());
        assert!(RuntimeSpecifier::parse("python").expect("parse").wants_latest());
        assert!(RuntimeSpecifier::parse("").is_err());
        assert!(RuntimeSpecifier::parse("bad/name").is_err());
        assert!(RuntimeSpecifier::parse("python@").is_err());
    }

    #[test]
    fn manifest_defaults_mounts_to_readonly() {
        let manifest = RuntimeManifest::parse(MANIFEST.as_bytes()).expect("parse");
        assert_eq!(manifest.version, "3.11.9");
        assert_eq!(manifest.mounts.len(), 1);
        assert!(manifest.mounts[0].readonly);
        assert_eq!(
            manifest.environment.get("PATH").map(String::as_str),
            Some("/usr/local/python/bin:/usr/bin:/bin")
        );
    }

    #[test]
    fn resolve_latest_prefers_semver_max() {
        let platform = Arc::new(FakePlatform::new());
        for version in ["3.9.1", "3.11.9", "3.10.2"] {
            let dir = PathBuf::from("/opt/joblet/runtimes/python-3.11-ml").join(version);
            platform.add_dir(&dir);
            platform.add_file(dir.join("runtime.yml"), MANIFEST.as_bytes());
        }
        let catalog = catalog_with(platform);
        let spec = RuntimeSpecifier::parse("python-3.11-ml@latest").expect("parse");
        let resolved = catalog.resolve(&spec).expect("resolve");
        assert!(resolved.dir.ends_with("python-3.11-ml/3.11.9"));
    }

    #[test]
    fn resolve_unknown_runtime_is_not_found() {
        let catalog = catalog_with(Arc::new(FakePlatform::new()));
        let spec = RuntimeSpecifier::parse("ghost").expect("parse");
        let err = catalog.resolve(&spec).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn resolve_source_keeps_absolute_paths() {
        let rt = ResolvedRuntime {
            dir: PathBuf::from("/opt/joblet/runtimes/py/1.0.0"),
            manifest: RuntimeManifest::parse(MANIFEST.as_bytes()).expect("parse"),
        };
        assert_eq!(
            rt.resolve_source("python"),
            PathBuf::from("/opt/joblet/runtimes/py/1.0.0/python")
        );
        assert_eq!(
            rt.resolve_source("/usr/lib/python3.11"),
            PathBuf::from("/usr/lib/python3.11")
        );
    }

    #[test]
    fn pick_latest_orders_numerically() {
        let versions = vec!["1.9.0".to_string(), "1.10.0".to_string(), "1.2.3".to_string()];
        assert_eq!(pick_latest(&versions).as_deref(), Some("1.10.0"));
        assert_eq!(pick_latest(&[]), None);
    }
}
