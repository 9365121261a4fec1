pub mod artifacts;
pub mod model_store;
pub mod onnx_builder; // Shared ONNX session builder and session pool
pub mod progress;
pub mod scan_decoder;
pub mod segmentation;
pub mod uploads;

// Re-export commonly used services
pub use artifacts::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use model_store::{ModelStatus, ModelStore};
pub use progress::{
    BroadcastProgress, CaseProgress, NullProgress, ProgressSink, RecordingProgress, TeeProgress,
    TracingProgress,
};
pub use scan_decoder::{RawSlice, ScanDecoder};
pub use segmentation::{OnnxSegmentationModel, SegmentationModel};
pub use uploads::UploadStore;
