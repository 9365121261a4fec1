pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{Config, FallbackPolicy};
pub use errors::{
    ArtifactError, ConfigError, DecodeError, ErrorContext, InferenceError, ModelStoreError,
    PipelineError, ShapeMismatchError, StageError, UploadError,
};
pub use types::{
    ArtifactHandle, ArtifactKind, CaseId, DiagnosisReport, FeatureOutcome, FeatureSet,
    PipelineState, ProgressEvent, Provenance,
};
