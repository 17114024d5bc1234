//! Runtime registry client: index fetch, version resolution, verified
//! download.
//!
//! The registry is the only source for `install_from_registry`; a runtime
//! it does not list is a hard error, never a fallback to other sources.
//! Archives are streamed to disk with the digest computed incrementally,
//! and a mismatch fails before anything touches the runtimes directory.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::runtime::pick_latest;

/// One installable package in the registry index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub version: String,
    pub download_url: String,
    /// `sha256:<hex>` (the bare hex form is accepted too).
    pub checksum: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryIndex {
    #[serde(default)]
    pub runtimes: Vec<RegistryEntry>,
}

impl RegistryIndex {
    /// Select the entry for `name` at `version` (`None`/`latest` picks
    /// the newest semver). A miss is [`Error::NotInRegistry`].
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Result<RegistryEntry> {
        let candidates: Vec<&RegistryEntry> =
            self.runtimes.iter().filter(|e| e.name == name).collect();
        let spec_display = || match version {
            Some(v) => format!("{name}@{v}"),
            None => name.to_string(),
        };
        if candidates.is_empty() {
            return Err(Error::NotInRegistry {
                spec: spec_display(),
            });
        }
        match version {
            Some(v) if v != "latest" => candidates
                .into_iter()
                .find(|e| e.version == v)
                .cloned()
                .ok_or_else(|| Error::NotInRegistry {
                    spec: spec_display(),
                }),
            _ => {
                let versions: Vec<String> =
                    candidates.iter().map(|e| e.version.clone()).collect();
                let latest = pick_latest(&versions).expect("non-empty candidate set");
                Ok(candidates
                    .into_iter()
                    .find(|e| e.version == latest)
                    .cloned()
                    .expect("latest came from the candidate set"))
            }
        }
    }
}

pub struct RegistryClient {
    index_url: String,
    agent: ureq::Agent,
}

impl RegistryClient {
    pub fn new(index_url: impl Into<String>) -> RegistryClient {
        RegistryClient {
            index_url: index_url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(std::time::Duration::from_secs(120))
                .build(),
        }
    }

    pub fn fetch_index(&self) -> anyhow::Result<RegistryIndex> {
        let index = self
            .agent
            .get(&self.index_url)
            .call()
            .with_context(|| format!("fetch registry index {}", self.index_url))?
            .into_json()
            .context("parse registry index")?;
        Ok(index)
    }

    /// Stream the archive to `dest`, hashing as it goes. On checksum or
    /// size mismatch the partial file is removed and nothing else has
    /// been touched.
    pub fn download_verified(&self, entry: &RegistryEntry, dest: &Path) -> anyhow::Result<()> {
        debug!(url = %entry.download_url, "downloading runtime archive");
        let response = self
            .agent
            .get(&entry.download_url)
            .call()
            .with_context(|| format!("download {}", entry.download_url))?;

        let mut reader = response.into_reader();
        let mut file = std::fs::File::create(dest)
            .with_context(|| format!("create {}", dest.display()))?;
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).context("read archive stream")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .with_context(|| format!("write {}", dest.display()))?;
            total += n as u64;
        }
        drop(file);

        let digest = hex::encode(hasher.finalize());
        let expected = expected_hex(&entry.checksum);
        if !digest.eq_ignore_ascii_case(expected) {
            let _ = std::fs::remove_file(dest);
            bail!(
                "checksum mismatch for {}: got sha256:{digest}, expected {}",
                entry.name,
                entry.checksum
            );
        }
        if entry.size > 0 && total != entry.size {
            let _ = std::fs::remove_file(dest);
            bail!(
                "size mismatch for {}: got {total} bytes, expected {}",
                entry.name,
                entry.size
            );
        }
        Ok(())
    }
}

/// Accepts `sha256:<hex>` or bare hex.
fn expected_hex(checksum: &str) -> &str {
    checksum.strip_prefix("sha256:").unwrap_or(checksum)
}

/// Digest a local file the same way the download path does.
pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).context("hash file")?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, version: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            version: version.to_string(),
            download_url: format!("https://registry.test/{name}-{version}.tar.gz"),
            checksum: "sha256:00".to_string(),
            size: 0,
        }
    }

    fn index() -> RegistryIndex {
        RegistryIndex {
            runtimes: vec![
                entry("python-3.11-ml", "3.11.4"),
                entry("python-3.11-ml", "3.11.9"),
                entry("node-20", "20.11.0"),
            ],
        }
    }

    #[test]
    fn resolve_exact_version() {
        let e = index()
            .resolve("python-3.11-ml", Some("3.11.4"))
            .expect("resolve");
        assert_eq!(e.version, "3.11.4");
    }

    #[test]
    fn resolve_latest_picks_newest_semver() {
        let e = index()
            .resolve("python-3.11-ml", Some("latest"))
            .expect("resolve");
        assert_eq!(e.version, "3.11.9");
        let e = index().resolve("python-3.11-ml", None).expect("resolve");
        assert_eq!(e.version, "3.11.9");
    }

    #[test]
    fn missing_entries_are_registry_misses() {
        let err = index().resolve("ruby", None).unwrap_err();
        assert_eq!(err.code(), "registry_miss");
        let err = index()
            .resolve("python-3.11-ml", Some("9.9.9"))
            .unwrap_err();
        assert_eq!(err.code(), "registry_miss");
    }

    #[test]
    fn checksum_prefix_is_optional() {
        assert_eq!(expected_hex("sha256:abcd"), "abcd");
        assert_eq!(expected_hex("abcd"), "abcd");
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(b"hello world").expect("write");
        let digest = sha256_file(f.path()).expect("digest");
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn index_parses_from_json() {
        let raw = r#"{"runtimes":[{"name":"go-1.22","version":"1.22.3","download_url":"https://x/go.tar.gz","checksum":"sha256:aa","size":123}]}"#;
        let index: RegistryIndex = serde_json::from_str(raw).expect("parse");
        assert_eq!(index.runtimes.len(), 1);
        assert_eq!(index.runtimes[0].size, 123);
    }
}
