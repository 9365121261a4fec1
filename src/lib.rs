// Library exports for the CT diagnostic pipeline
//
// Decode -> normalize -> segment -> contour overlay -> feature extraction

// Core modules
pub mod core;
pub mod orchestration;
pub mod phases;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::{Config, FallbackPolicy},
    errors::{
        ArtifactError, ConfigError, DecodeError, InferenceError, ModelStoreError, PipelineError,
        ShapeMismatchError, StageError, UploadError,
    },
    types::{
        ArtifactHandle, ArtifactKind, CaseId, DiagnosisReport, FeatureOutcome, FeatureSet,
        PipelineState, ProgressEvent, Provenance,
    },
};

pub use orchestration::PipelineOrchestrator;

pub use services::{
    ArtifactStore, BroadcastProgress, FsArtifactStore, MemoryArtifactStore, ModelStore,
    OnnxSegmentationModel, ProgressSink, ScanDecoder, SegmentationModel, TracingProgress,
};

pub use utils::{png_data_url_async, Metrics};
