// Inference: one forward pass, dual-policy binarization, mask and heatmap artifacts

use image::{GrayImage, Luma};
use ndarray::{Array2, Array4};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::core::errors::StageResult;
use crate::core::types::{ArtifactHandle, ArtifactKind, CaseId};
use crate::services::artifacts::ArtifactStore;
use crate::services::segmentation::SegmentationModel;
use crate::utils::image_ops::apply_jet_colormap;

/// Probability threshold used when the model output looks like probabilities
pub const BINARY_THRESHOLD: f32 = 0.5;

/// Output of the inference stage
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub mask: ArtifactHandle,
    /// Absent only for the synthetic fallback
    pub heatmap: Option<ArtifactHandle>,
    pub positive_pixels: usize,
}

/// Binarize a model output map to a 0/255 mask.
///
/// If the map maximum is at most 1.0 it is read as probabilities and values
/// `>= 0.5` are positive; otherwise (already-labelled output) any nonzero value is.
pub fn binarize(map: &Array2<f32>) -> GrayImage {
    let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let probabilistic = max <= 1.0;

    let (height, width) = map.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let v = map[[y as usize, x as usize]];
        let positive = if probabilistic { v >= BINARY_THRESHOLD } else { v != 0.0 };
        Luma([if positive { 255 } else { 0 }])
    })
}

/// Scale the raw map to 8 bits (clamped to [0, 1] first); input to the jet colormap
pub fn probability_to_u8(map: &Array2<f32>) -> GrayImage {
    let (height, width) = map.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let v = map[[y as usize, x as usize]].clamp(0.0, 1.0);
        Luma([(v * 255.0) as u8])
    })
}

pub fn count_positive(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

/// Inference stage
pub struct InferenceStage {
    store: Arc<dyn ArtifactStore>,
}

impl InferenceStage {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, tensor, model), fields(case_id = %case_id, model = model.name()))]
    pub fn execute(
        &self,
        case_id: &CaseId,
        tensor: &Array4<f32>,
        model: &dyn SegmentationModel,
    ) -> StageResult<InferenceOutput> {
        let start = std::time::Instant::now();
        let map = model.forward(tensor)?;
        debug!(
            "Forward pass completed in {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        let mask = binarize(&map);
        let positive_pixels = count_positive(&mask);
        let mask_handle = self.store.put_gray(case_id, ArtifactKind::Mask, &mask)?;

        let heatmap = apply_jet_colormap(&probability_to_u8(&map));
        let heatmap_handle = self.store.put_rgb(case_id, ArtifactKind::Heatmap, &heatmap)?;

        debug!("Mask has {} positive pixels", positive_pixels);
        Ok(InferenceOutput {
            mask: mask_handle,
            heatmap: Some(heatmap_handle),
            positive_pixels,
        })
    }

    /// Synthetic fallback: all-zero mask of the case's dimensions, no heatmap
    #[instrument(skip(self), fields(case_id = %case_id))]
    pub fn write_stub_mask(&self, case_id: &CaseId, dimensions: (u32, u32)) -> StageResult<InferenceOutput> {
        warn!("No segmentation model loaded; writing a synthetic all-zero mask");
        let mask = GrayImage::new(dimensions.0, dimensions.1);
        let mask_handle = self.store.put_gray(case_id, ArtifactKind::Mask, &mask)?;
        Ok(InferenceOutput {
            mask: mask_handle,
            heatmap: None,
            positive_pixels: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{InferenceError, StageError};
    use crate::services::artifacts::MemoryArtifactStore;
    use crate::services::segmentation::tests::FixedModel;
    use ndarray::array;

    #[test]
    fn test_binarize_probability_branch() {
        let map = array![[0.999, 0.5], [0.4999, 0.0]];
        let mask = binarize(&map);
        assert_eq!(mask.get_pixel(0, 0)[0], 255);
        assert_eq!(mask.get_pixel(1, 0)[0], 255);
        assert_eq!(mask.get_pixel(0, 1)[0], 0);
        assert_eq!(mask.get_pixel(1, 1)[0], 0);
    }

    #[test]
    fn test_binarize_boundary_max_uses_threshold() {
        let map = array![[1.0, 0.3]];
        let mask = binarize(&map);
        assert_eq!(mask.get_pixel(0, 0)[0], 255);
        assert_eq!(mask.get_pixel(1, 0)[0], 0);
    }

    #[test]
    fn test_binarize_label_branch() {
        let map = array![[5.0, 0.3], [0.0, -2.0]];
        let mask = binarize(&map);
        assert_eq!(mask.get_pixel(0, 0)[0], 255);
        assert_eq!(mask.get_pixel(1, 0)[0], 255);
        assert_eq!(mask.get_pixel(0, 1)[0], 0);
        assert_eq!(mask.get_pixel(1, 1)[0], 255);
    }

    #[test]
    fn test_execute_writes_mask_and_heatmap() {
        let store = Arc::new(MemoryArtifactStore::new());
        let stage = InferenceStage::new(store.clone());
        let case_id = CaseId::new("inf");
        let model = FixedModel {
            map: Array2::from_shape_fn((4, 4), |(y, x)| if x == y { 0.9 } else { 0.1 }),
        };

        let output = stage
            .execute(&case_id, &Array4::zeros((1, 1, 4, 4)), &model)
            .unwrap();
        assert_eq!(output.positive_pixels, 4);
        assert_eq!(output.heatmap.unwrap().key, "heatmap/inf_heatmap.png");

        let mask = store.get_gray(&case_id, ArtifactKind::Mask).unwrap();
        assert_eq!(mask.dimensions(), (4, 4));
        assert_eq!(mask.get_pixel(2, 2)[0], 255);
        let heatmap = store.get_rgb(&case_id, ArtifactKind::Heatmap).unwrap();
        assert_eq!(heatmap.dimensions(), (4, 4));
    }

    #[test]
    fn test_shape_mismatch_is_inference_error() {
        let store = Arc::new(MemoryArtifactStore::new());
        let stage = InferenceStage::new(store.clone());
        let model = FixedModel {
            map: Array2::zeros((8, 8)),
        };
        let err = stage
            .execute(&CaseId::new("bad"), &Array4::zeros((1, 1, 4, 4)), &model)
            .unwrap_err();
        assert!(matches!(err, StageError::Inference(InferenceError::InputShape { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_stub_mask_is_empty() {
        let store = Arc::new(MemoryArtifactStore::new());
        let stage = InferenceStage::new(store.clone());
        let case_id = CaseId::new("stub");
        let output = stage.write_stub_mask(&case_id, (6, 3)).unwrap();
        assert!(output.heatmap.is_none());

        let mask = store.get_gray(&case_id, ArtifactKind::Mask).unwrap();
        assert_eq!(mask.dimensions(), (6, 3));
        assert_eq!(count_positive(&mask), 0);
    }
}
