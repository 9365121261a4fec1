// Upload directory: one stored scan per case id

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::errors::UploadError;
use crate::core::types::CaseId;
use crate::services::scan_decoder::ScanFormat;

/// Extensions a stored scan may carry; every upload is saved under one of these
pub const SCAN_EXTENSIONS: [&str; 5] = ["dcm", "dicom", "png", "tif", "tiff"];

/// Scans received through the upload step, stored as `<case id>.<ext>`.
///
/// Storing a case replaces any earlier scan of that case, whatever its
/// extension, so a case id resolves to exactly one file.
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Case id and canonical file name for a client-supplied file name.
    ///
    /// Only the final path component is kept and the extension is lowercased.
    pub fn accept_name(file_name: &str) -> Result<(CaseId, String), UploadError> {
        let invalid = || UploadError::InvalidFileName(file_name.to_string());
        let name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(invalid)?;
        ScanFormat::from_path(Path::new(name))?;

        let path = Path::new(name);
        let case_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(CaseId::parse)
            .ok_or_else(invalid)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(invalid)?;

        let canonical = format!("{}.{}", case_id, ext);
        Ok((case_id, canonical))
    }

    /// Write an uploaded scan, removing earlier uploads of the same case
    pub async fn store(&self, file_name: &str, bytes: &[u8]) -> Result<(CaseId, PathBuf), UploadError> {
        let (case_id, canonical) = Self::accept_name(file_name)?;
        let target = self.root.join(&canonical);

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| UploadError::Io {
                path: self.root.clone(),
                source,
            })?;

        for ext in SCAN_EXTENSIONS {
            let stale = self.root.join(format!("{}.{}", case_id, ext));
            if stale == target {
                continue;
            }
            match tokio::fs::remove_file(&stale).await {
                Ok(()) => info!(case_id = %case_id, "Replaced earlier upload {}", stale.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(UploadError::Io { path: stale, source }),
            }
        }

        tokio::fs::write(&target, bytes)
            .await
            .map_err(|source| UploadError::Io {
                path: target.clone(),
                source,
            })?;
        debug!(case_id = %case_id, "Stored upload at {} ({} bytes)", target.display(), bytes.len());
        Ok((case_id, target))
    }

    /// Path of the stored scan for a case, if one was uploaded
    pub async fn resolve(&self, case_id: &CaseId) -> Option<PathBuf> {
        for ext in SCAN_EXTENSIONS {
            let candidate = self.root.join(format!("{}.{}", case_id, ext));
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reupload_with_other_extension_replaces_scan() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadStore::new(dir.path());

        let (case_id, first) = uploads.store("case.dcm", b"dicom bytes").await.unwrap();
        assert_eq!(uploads.resolve(&case_id).await, Some(first.clone()));

        let (same_case, second) = uploads.store("case.png", b"png bytes").await.unwrap();
        assert_eq!(same_case, case_id);
        assert!(!first.exists());
        assert_eq!(uploads.resolve(&case_id).await, Some(second.clone()));
        assert_eq!(std::fs::read(&second).unwrap(), b"png bytes");
    }

    #[tokio::test]
    async fn test_same_extension_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadStore::new(dir.path());

        uploads.store("scan_9.dcm", b"old").await.unwrap();
        let (_, path) = uploads.store("scan_9.dcm", b"new").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_resolve_missing_case() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadStore::new(dir.path());
        assert_eq!(uploads.resolve(&CaseId::new("absent")).await, None);
    }

    #[test]
    fn test_accept_name() {
        let (case_id, canonical) = UploadStore::accept_name("../../etc/10007.DCM").unwrap();
        assert_eq!(case_id.as_str(), "10007");
        assert_eq!(canonical, "10007.dcm");

        assert!(matches!(
            UploadStore::accept_name("notes.txt"),
            Err(UploadError::Format(_))
        ));
        assert!(UploadStore::accept_name("").is_err());
    }
}
