// Error taxonomy for the diagnostic pipeline
//
// Using thiserror for ergonomic error definitions with:
// - Context preservation (case id and pipeline state on every run failure)
// - Type-safe error matching
// - Source error chaining

use std::path::PathBuf;
use thiserror::Error;

use crate::core::types::{ArtifactKind, CaseId, PipelineState};

/// Scan decoding errors (unreadable or unsupported input)
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Failed to read scan {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unsupported scan format: {0}")]
    UnsupportedFormat(String),

    #[error("Cannot derive a case id from {0}")]
    InvalidCaseId(PathBuf),

    #[error("DICOM parsing failed: {0}")]
    Dicom(String),

    #[error("Unsupported pixel data: {0}")]
    UnsupportedPixelData(String),

    #[error("Raster decoding failed: {0}")]
    Raster(#[from] image::ImageError),

    #[error("Invalid slice dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },
}

/// Forward pass errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("ONNX inference failed: {0}")]
    Runtime(#[from] ort::Error),

    #[error("Model expects {expected}x{expected} input, got {width}x{height}")]
    InputShape {
        expected: usize,
        width: usize,
        height: usize,
    },

    #[error("Model output has {actual} elements, expected {expected}")]
    OutputShape { expected: usize, actual: usize },

    #[error("Model output contains non-finite values")]
    NonFinite,

    #[error("Tensor construction failed: {0}")]
    Tensor(#[from] ndarray::ShapeError),
}

/// Artifact store read/write errors (the IO class of the taxonomy)
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifact {kind} for case {case_id} not found")]
    NotFound { case_id: CaseId, kind: ArtifactKind },

    #[error("Artifact I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Artifact {kind} encoding failed: {source}")]
    Encoding {
        kind: ArtifactKind,
        source: image::ImageError,
    },
}

/// Dimension mismatch between two stages' rasters
#[derive(Debug, Error)]
#[error("{context}: expected {expected_width}x{expected_height}, got {actual_width}x{actual_height}")]
pub struct ShapeMismatchError {
    pub context: &'static str,
    pub expected_width: u32,
    pub expected_height: u32,
    pub actual_width: u32,
    pub actual_height: u32,
}

impl ShapeMismatchError {
    pub fn check(context: &'static str, expected: (u32, u32), actual: (u32, u32)) -> Result<(), Self> {
        if expected == actual {
            return Ok(());
        }
        Err(Self {
            context,
            expected_width: expected.0,
            expected_height: expected.1,
            actual_width: actual.0,
            actual_height: actual.1,
        })
    }
}

/// Model store errors (loading or swapping a model)
#[derive(Debug, Error)]
pub enum ModelStoreError {
    #[error("Failed to read model file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Model file {path} is too small ({size} bytes)")]
    Truncated { path: PathBuf, size: usize },

    #[error("Failed to build ONNX session: {0}")]
    Session(String),
}

/// Scan intake errors (the upload step)
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid upload file name '{0}'")]
    InvalidFileName(String),

    #[error(transparent)]
    Format(#[from] DecodeError),

    #[error("Upload I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failure of a single stage, before case/stage context is attached
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),

    #[error("Blocking task failed: {0}")]
    TaskJoin(String),
}

/// Pipeline run errors, always carrying the case id and the state that failed
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[{case_id}] {state}: scan decoding failed: {source}")]
    Decode {
        case_id: CaseId,
        state: PipelineState,
        #[source]
        source: DecodeError,
    },

    #[error("[{case_id}] {state}: no segmentation model available")]
    ModelUnavailable {
        case_id: CaseId,
        state: PipelineState,
    },

    #[error("[{case_id}] {state}: inference failed: {source}")]
    Inference {
        case_id: CaseId,
        state: PipelineState,
        #[source]
        source: InferenceError,
    },

    #[error("[{case_id}] {state}: artifact I/O failed: {source}")]
    Io {
        case_id: CaseId,
        state: PipelineState,
        #[source]
        source: ArtifactError,
    },

    #[error("[{case_id}] {state}: shape mismatch: {source}")]
    ShapeMismatch {
        case_id: CaseId,
        state: PipelineState,
        #[source]
        source: ShapeMismatchError,
    },

    #[error("[{case_id}] {state}: task join failed: {message}")]
    TaskJoin {
        case_id: CaseId,
        state: PipelineState,
        message: String,
    },
}

impl PipelineError {
    pub fn case_id(&self) -> &CaseId {
        match self {
            Self::Decode { case_id, .. }
            | Self::ModelUnavailable { case_id, .. }
            | Self::Inference { case_id, .. }
            | Self::Io { case_id, .. }
            | Self::ShapeMismatch { case_id, .. }
            | Self::TaskJoin { case_id, .. } => case_id,
        }
    }

    pub fn state(&self) -> PipelineState {
        match self {
            Self::Decode { state, .. }
            | Self::ModelUnavailable { state, .. }
            | Self::Inference { state, .. }
            | Self::Io { state, .. }
            | Self::ShapeMismatch { state, .. }
            | Self::TaskJoin { state, .. } => *state,
        }
    }

    /// Short machine-readable class name, used by the HTTP layer and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "DecodeError",
            Self::ModelUnavailable { .. } => "ModelUnavailableError",
            Self::Inference { .. } => "InferenceError",
            Self::Io { .. } => "IOError",
            Self::ShapeMismatch { .. } => "ShapeMismatchError",
            Self::TaskJoin { .. } => "TaskJoinError",
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid model config: {0}")]
    InvalidModelConfig(String),

    #[error("Unknown fallback policy '{0}' (expected 'strict' or 'synthetic')")]
    UnknownFallbackPolicy(String),

    #[error("Pool size must be > 0, got {0}")]
    InvalidPoolSize(usize),

    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),

    #[error("Environment variable parsing failed: {0}")]
    EnvVarError(String),
}

// Convenience type aliases for Results
pub type DecodeResult<T> = Result<T, DecodeError>;
pub type InferenceResult<T> = Result<T, InferenceError>;
pub type ArtifactResult<T> = Result<T, ArtifactError>;
pub type StageResult<T> = Result<T, StageError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Helper trait for attaching run context to stage errors
pub trait ErrorContext<T> {
    fn in_stage(self, case_id: &CaseId, state: PipelineState) -> PipelineResult<T>;
}

impl StageError {
    pub fn with_context(self, case_id: &CaseId, state: PipelineState) -> PipelineError {
        let case_id = case_id.clone();
        match self {
            StageError::Decode(source) => PipelineError::Decode { case_id, state, source },
            StageError::Inference(source) => PipelineError::Inference { case_id, state, source },
            StageError::Artifact(source) => PipelineError::Io { case_id, state, source },
            StageError::ShapeMismatch(source) => {
                PipelineError::ShapeMismatch { case_id, state, source }
            }
            StageError::TaskJoin(message) => PipelineError::TaskJoin { case_id, state, message },
        }
    }
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<StageError>,
{
    fn in_stage(self, case_id: &CaseId, state: PipelineState) -> PipelineResult<T> {
        self.map_err(|e| e.into().with_context(case_id, state))
    }
}
