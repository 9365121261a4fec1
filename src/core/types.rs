// Domain types shared across stages

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::core::errors::DecodeError;

/// Stable identifier for one diagnostic run: the scan file name without its extension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the case id from a scan path (`/x/y/scan_001.dcm` -> `scan_001`)
    pub fn from_scan_path(path: &Path) -> Result<Self, DecodeError> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(|s| Self(s.to_string()))
            .ok_or_else(|| DecodeError::InvalidCaseId(path.to_path_buf()))
    }

    /// Validate an externally supplied id (HTTP requests) so it cannot escape the store
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && !raw.contains(['/', '\\'])
            && !raw.contains('\0');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raster artifact kinds, each with a fixed naming convention per case id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Preview,
    Mask,
    Heatmap,
    Overlay,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Preview,
        ArtifactKind::Mask,
        ArtifactKind::Heatmap,
        ArtifactKind::Overlay,
    ];

    /// Directory the artifact lives in, relative to the store root
    pub fn dir(&self) -> &'static str {
        match self {
            ArtifactKind::Preview => "image",
            ArtifactKind::Mask => "mask",
            ArtifactKind::Heatmap => "heatmap",
            ArtifactKind::Overlay => "draw",
        }
    }

    pub fn file_name(&self, case_id: &CaseId) -> String {
        match self {
            ArtifactKind::Preview | ArtifactKind::Overlay => format!("{}.png", case_id),
            ArtifactKind::Mask => format!("{}_mask.png", case_id),
            ArtifactKind::Heatmap => format!("{}_heatmap.png", case_id),
        }
    }

    /// Store-relative key, e.g. `mask/scan_001_mask.png`
    pub fn key(&self, case_id: &CaseId) -> String {
        format!("{}/{}", self.dir(), self.file_name(case_id))
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::Preview => "preview",
            ArtifactKind::Mask => "mask",
            ArtifactKind::Heatmap => "heatmap",
            ArtifactKind::Overlay => "overlay",
        })
    }
}

/// Reference to a persisted artifact, resolvable purely through the naming convention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub kind: ArtifactKind,
    pub key: String,
}

impl ArtifactHandle {
    pub fn new(kind: ArtifactKind, case_id: &CaseId) -> Self {
        Self {
            kind,
            key: kind.key(case_id),
        }
    }
}

/// Orchestrator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Preprocessing,
    Inferring,
    Postprocessing,
    ExtractingFeatures,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }

    /// Legal forward transitions; `Failed` is reachable from any non-terminal state
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Idle, Preprocessing)
            | (Preprocessing, Inferring)
            | (Inferring, Postprocessing)
            | (Postprocessing, ExtractingFeatures)
            | (ExtractingFeatures, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Marks whether a feature set came from real inference or the fallback policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Real,
    Fallback,
}

/// Geometric and photometric descriptors of the dominant tumor region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSet {
    /// Enclosed contour area in px²
    pub area: f64,
    /// Closed contour arc length in px
    pub perimeter: f64,
    /// |major - minor| of the fitted ellipse; smaller is rounder. Not a [0, 1] circularity ratio.
    pub shape_descriptor: f64,
    pub gray_mean: f64,
    pub gray_std: f64,
    pub provenance: Provenance,
}

impl FeatureSet {
    /// Zeroed feature set emitted by the synthetic fallback policy
    pub fn fallback() -> Self {
        Self {
            area: 0.0,
            perimeter: 0.0,
            shape_descriptor: 0.0,
            gray_mean: 0.0,
            gray_std: 0.0,
            provenance: Provenance::Fallback,
        }
    }
}

/// Feature extraction result: either features or the distinguished no-tumor marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeatureOutcome {
    Tumor {
        #[serde(flatten)]
        features: FeatureSet,
    },
    NoTumor,
}

impl FeatureOutcome {
    pub fn features(&self) -> Option<&FeatureSet> {
        match self {
            FeatureOutcome::Tumor { features } => Some(features),
            FeatureOutcome::NoTumor => None,
        }
    }

    pub fn is_no_tumor(&self) -> bool {
        matches!(self, FeatureOutcome::NoTumor)
    }
}

/// Caller-facing result of one successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisReport {
    pub case_id: CaseId,
    pub preview: ArtifactHandle,
    pub overlay: ArtifactHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heatmap: Option<ArtifactHandle>,
    pub outcome: FeatureOutcome,
    pub processing_time_ms: f64,
}

/// One progress event delivered to a progress sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub percentage: u8,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_case_id_from_path() {
        let id = CaseId::from_scan_path(&PathBuf::from("/data/ct/10007.dcm")).unwrap();
        assert_eq!(id.as_str(), "10007");

        assert!(CaseId::from_scan_path(&PathBuf::from("/")).is_err());
    }

    #[test]
    fn test_case_id_parse_rejects_traversal() {
        assert!(CaseId::parse("scan_01").is_some());
        assert!(CaseId::parse("../etc").is_none());
        assert!(CaseId::parse("..").is_none());
        assert!(CaseId::parse("").is_none());
    }

    #[test]
    fn test_artifact_naming_convention() {
        let id = CaseId::new("p1");
        assert_eq!(ArtifactKind::Preview.key(&id), "image/p1.png");
        assert_eq!(ArtifactKind::Mask.key(&id), "mask/p1_mask.png");
        assert_eq!(ArtifactKind::Heatmap.key(&id), "heatmap/p1_heatmap.png");
        assert_eq!(ArtifactKind::Overlay.key(&id), "draw/p1.png");
    }

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(Preprocessing));
        assert!(Inferring.can_transition_to(Failed));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Preprocessing.can_transition_to(Postprocessing));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(FeatureOutcome::NoTumor).unwrap();
        assert_eq!(json["status"], "no_tumor");

        let json = serde_json::to_value(FeatureOutcome::Tumor {
            features: FeatureSet::fallback(),
        })
        .unwrap();
        assert_eq!(json["status"], "tumor");
        assert_eq!(json["provenance"], "fallback");
        assert_eq!(json["shapeDescriptor"], 0.0);
    }
}
