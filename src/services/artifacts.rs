// Keyed raster store: the hand-off contract between pipeline stages

use dashmap::DashMap;
use image::{GrayImage, RgbImage};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::errors::{ArtifactError, ArtifactResult};
use crate::core::types::{ArtifactHandle, ArtifactKind, CaseId};
use crate::utils::image_ops::{decode_gray_png, decode_rgb_png, encode_gray_png, encode_rgb_png};

/// PNG artifacts addressed by `(case id, kind)`.
///
/// Writes overwrite by fixed name with no locking; the last writer wins.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, case_id: &CaseId, kind: ArtifactKind, png_bytes: &[u8]) -> ArtifactResult<ArtifactHandle>;

    fn get(&self, case_id: &CaseId, kind: ArtifactKind) -> ArtifactResult<Vec<u8>>;

    fn exists(&self, case_id: &CaseId, kind: ArtifactKind) -> bool;

    fn put_gray(&self, case_id: &CaseId, kind: ArtifactKind, img: &GrayImage) -> ArtifactResult<ArtifactHandle> {
        let bytes = encode_gray_png(img).map_err(|source| ArtifactError::Encoding { kind, source })?;
        self.put(case_id, kind, &bytes)
    }

    fn put_rgb(&self, case_id: &CaseId, kind: ArtifactKind, img: &RgbImage) -> ArtifactResult<ArtifactHandle> {
        let bytes = encode_rgb_png(img).map_err(|source| ArtifactError::Encoding { kind, source })?;
        self.put(case_id, kind, &bytes)
    }

    fn get_gray(&self, case_id: &CaseId, kind: ArtifactKind) -> ArtifactResult<GrayImage> {
        let bytes = self.get(case_id, kind)?;
        decode_gray_png(&bytes).map_err(|source| ArtifactError::Encoding { kind, source })
    }

    fn get_rgb(&self, case_id: &CaseId, kind: ArtifactKind) -> ArtifactResult<RgbImage> {
        let bytes = self.get(case_id, kind)?;
        decode_rgb_png(&bytes).map_err(|source| ArtifactError::Encoding { kind, source })
    }
}

/// Artifacts laid out under a root directory (`image/`, `mask/`, `heatmap/`, `draw/`)
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, case_id: &CaseId, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir()).join(kind.file_name(case_id))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, case_id: &CaseId, kind: ArtifactKind, png_bytes: &[u8]) -> ArtifactResult<ArtifactHandle> {
        let dir = self.root.join(kind.dir());
        std::fs::create_dir_all(&dir).map_err(|source| ArtifactError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = self.path_for(case_id, kind);
        std::fs::write(&path, png_bytes).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("Wrote {} artifact ({} bytes) to {}", kind, png_bytes.len(), path.display());
        Ok(ArtifactHandle::new(kind, case_id))
    }

    fn get(&self, case_id: &CaseId, kind: ArtifactKind) -> ArtifactResult<Vec<u8>> {
        let path = self.path_for(case_id, kind);
        std::fs::read(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ArtifactError::NotFound {
                case_id: case_id.clone(),
                kind,
            },
            _ => ArtifactError::Io { path, source },
        })
    }

    fn exists(&self, case_id: &CaseId, kind: ArtifactKind) -> bool {
        self.path_for(case_id, kind).is_file()
    }
}

/// In-process store keyed by the same naming convention as the filesystem store
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, case_id: &CaseId, kind: ArtifactKind, png_bytes: &[u8]) -> ArtifactResult<ArtifactHandle> {
        self.entries.insert(kind.key(case_id), png_bytes.to_vec());
        Ok(ArtifactHandle::new(kind, case_id))
    }

    fn get(&self, case_id: &CaseId, kind: ArtifactKind) -> ArtifactResult<Vec<u8>> {
        self.entries
            .get(&kind.key(case_id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ArtifactError::NotFound {
                case_id: case_id.clone(),
                kind,
            })
    }

    fn exists(&self, case_id: &CaseId, kind: ArtifactKind) -> bool {
        self.entries.contains_key(&kind.key(case_id))
    }
}
