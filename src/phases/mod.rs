pub mod features;
pub mod inference;
pub mod postprocess;
pub mod preprocess;

pub use features::FeatureExtractor;
pub use inference::{InferenceOutput, InferenceStage};
pub use postprocess::{OverlayOutput, OverlayStage};
pub use preprocess::{Normalizer, PreprocessOutput};
