//! File uploads into the job workspace.
//!
//! Two delivery modes: scheduled jobs get their files written into the
//! workspace at submission time (pre-staged); immediate jobs carry the
//! manifest across the fork boundary as base64 JSON in
//! `JOB_UPLOADS_DATA`, decoded and materialized by the upload-phase child
//! inside the chroot.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

use crate::job::FileUpload;
use crate::platform::Platform;

/// Serialize the manifest for the `JOB_UPLOADS_DATA` environment slot.
pub fn encode_manifest(uploads: &[FileUpload]) -> Result<String> {
    let json = serde_json::to_vec(uploads).context("serialize upload manifest")?;
    Ok(BASE64.encode(json))
}

/// Inverse of [`encode_manifest`]; run by the upload-phase child.
pub fn decode_manifest(data: &str) -> Result<Vec<FileUpload>> {
    let json = BASE64.decode(data).context("decode upload manifest")?;
    serde_json::from_slice(&json).context("parse upload manifest")
}

pub fn total_bytes(uploads: &[FileUpload]) -> u64 {
    uploads.iter().map(|u| u.content.len() as u64).sum()
}

/// Upload paths are workspace-relative: no absolute paths, no parent
/// escapes, nothing empty.
fn sanitize(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    if path.is_empty() || p.is_absolute() {
        bail!("bad upload path {path:?}");
    }
    let mut clean = PathBuf::new();
    for component in p.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => bail!("upload path {path:?} escapes the workspace"),
        }
    }
    if clean.as_os_str().is_empty() {
        bail!("bad upload path {path:?}");
    }
    Ok(clean)
}

pub struct UploadManager {
    platform: Arc<dyn Platform>,
}

impl UploadManager {
    pub fn new(platform: Arc<dyn Platform>) -> UploadManager {
        UploadManager { platform }
    }

    /// Enforce the byte budget derived from the job's memory limit
    /// (unlimited jobs accept anything).
    pub fn check_budget(&self, uploads: &[FileUpload], memory_mb: u64) -> Result<()> {
        if memory_mb == 0 {
            return Ok(());
        }
        let budget = memory_mb * 1024 * 1024;
        let total = total_bytes(uploads);
        if total > budget {
            bail!("uploads total {total} bytes, exceeding the {budget}-byte job memory budget");
        }
        Ok(())
    }

    /// Write every upload under `dest`, creating parents as needed.
    /// Used both host-side (pre-staging) and inside the chroot (upload
    /// phase): the destination root is the only difference.
    pub fn apply(&self, dest: &Path, uploads: &[FileUpload]) -> Result<()> {
        for upload in uploads {
            let rel = sanitize(&upload.path)?;
            let target = dest.join(&rel);
            if upload.is_directory {
                self.platform.mkdir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    self.platform.mkdir_all(parent)?;
                }
                self.platform.write_file(&target, &upload.content)?;
            }
            if upload.mode != 0 {
                self.platform.set_mode(&target, upload.mode)?;
            }
        }
        debug!(count = uploads.len(), dest = %dest.display(), "uploads written");
        Ok(())
    }

    /// Pre-staging for scheduled jobs: budget check, then a direct write
    /// into the workspace so the scheduler holds references only.
    pub fn prestage(&self, work_dir: &Path, uploads: &[FileUpload], memory_mb: u64) -> Result<()> {
        self.check_budget(uploads, memory_mb)?;
        self.apply(work_dir, uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;

    fn upload(path: &str, content: &[u8]) -> FileUpload {
        FileUpload {
            path: path.to_string(),
            content: content.to_vec(),
            mode: 0o644,
            is_directory: false,
        }
    }

    #[test]
    fn manifest_roundtrip() {
        let uploads = vec![
            upload("main.py", b"print('hi')"),
            FileUpload {
                path: "data".to_string(),
                content: Vec::new(),
                mode: 0o755,
                is_directory: true,
            },
        ];
        let encoded = encode_manifest(&uploads).expect("encode");
        let decoded = decode_manifest(&encoded).expect("decode");
        assert_eq!(decoded, uploads);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_manifest("not-base64!").is_err());
        let not_json = BASE64.encode(b"[{broken");
        assert!(decode_manifest(&not_json).is_err());
    }

    #[test]
    fn apply_writes_files_and_dirs() {
        let platform = Arc::new(FakePlatform::new());
        let mgr = UploadManager::new(platform.clone());
        let uploads = vec![
            upload("src/main.py", b"print('hi')"),
            FileUpload {
                path: "out".to_string(),
                content: Vec::new(),
                mode: 0o755,
                is_directory: true,
            },
        ];
        mgr.apply(Path::new("/work"), &uploads).expect("apply");
        assert_eq!(
            platform.read_file(Path::new("/work/src/main.py")).expect("read"),
            b"print('hi')"
        );
        assert!(platform.is_dir(Path::new("/work/out")));
    }

    #[test]
    fn escapes_are_rejected() {
        let platform = Arc::new(FakePlatform::new());
        let mgr = UploadManager::new(platform);
        for path in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            let err = mgr.apply(Path::new("/work"), &[upload(path, b"x")]);
            assert!(err.is_err(), "path {path:?} should be rejected");
        }
        // Harmless ./ prefixes are normalized, not rejected.
        assert_eq!(sanitize("./a/b").expect("sanitize"), PathBuf::from("a/b"));
    }

    #[test]
    fn budget_is_enforced() {
        let platform = Arc::new(FakePlatform::new());
        let mgr = UploadManager::new(platform);
        let big = vec![upload("big.bin", &vec![0u8; 2 * 1024 * 1024])];
        assert!(mgr.check_budget(&big, 1).is_err());
        assert!(mgr.check_budget(&big, 4).is_ok());
        // memory_mb == 0 means unlimited.
        assert!(mgr.check_budget(&big, 0).is_ok());
    }
}
