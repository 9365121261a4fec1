// Preprocessing: decode, window, normalize, emit the model tensor and the preview raster

use image::{GrayImage, Luma};
use ndarray::{Array2, Array4, ArrayView2, Axis};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::errors::StageResult;
use crate::core::types::{ArtifactHandle, ArtifactKind, CaseId};
use crate::services::artifacts::ArtifactStore;
use crate::services::scan_decoder::{RawSlice, ScanDecoder};

/// Lower bound of the soft-tissue intensity window (HU)
pub const WINDOW_MIN: f32 = -200.0;
/// Upper bound of the soft-tissue intensity window (HU)
pub const WINDOW_MAX: f32 = 300.0;

/// Output of the preprocessing stage
#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    /// Model-ready tensor `[1, 1, H, W]`; lives only until inference
    pub tensor: Array4<f32>,
    pub preview: ArtifactHandle,
    /// (width, height) shared by every raster of this case
    pub dimensions: (u32, u32),
}

/// Clip to the window, then min-max scale to [0, 1].
///
/// A constant slice (max == min after clipping) is returned as clipped, so no NaN is produced.
pub fn normalize_window(raw: &Array2<f32>) -> Array2<f32> {
    let clipped = raw.mapv(|v| v.clamp(WINDOW_MIN, WINDOW_MAX));

    let (min, max) = clipped
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if max <= min {
        return clipped;
    }

    let range = max - min;
    clipped.mapv(|v| (v - min) / range)
}

/// Shape a normalized slice into `[1, 1, H, W]`
pub fn to_model_tensor(normalized: Array2<f32>) -> Array4<f32> {
    normalized.insert_axis(Axis(0)).insert_axis(Axis(0))
}

/// Map a raw intensity to 8 bits through the display window
fn window_to_u8(v: f32) -> u8 {
    let t = (v.clamp(WINDOW_MIN, WINDOW_MAX) - WINDOW_MIN) / (WINDOW_MAX - WINDOW_MIN);
    (t * 255.0).round() as u8
}

/// Display orientation of a `(1, H, W)` slice stack: swap the outer axes, rotate 90°
/// clockwise, flip horizontally, drop the singleton axis.
///
/// The composition maps pixel (x, y) back onto (x, y), so the preview stays
/// pixel-aligned with the mask and the raw slice.
fn reorient(raw: &Array2<f32>) -> ArrayView2<'_, f32> {
    let mut view = raw.view().insert_axis(Axis(0)); // (z, y, x)
    view.swap_axes(0, 2); // (x, y, z)

    // rot90(k = -1) over the first two axes: transpose then reverse the second
    view.swap_axes(0, 1); // (y, x, z)
    view.invert_axis(Axis(1));

    // fliplr
    view.invert_axis(Axis(1));

    view.index_axis_move(Axis(2), 0)
}

/// 8-bit preview raster of the raw slice
pub fn preview_raster(raw: &Array2<f32>) -> GrayImage {
    let oriented = reorient(raw);
    let (height, width) = oriented.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([window_to_u8(oriented[[y as usize, x as usize]])])
    })
}

/// Normalizer stage
pub struct Normalizer {
    decoder: ScanDecoder,
    store: Arc<dyn ArtifactStore>,
}

impl Normalizer {
    pub fn new(decoder: ScanDecoder, store: Arc<dyn ArtifactStore>) -> Self {
        Self { decoder, store }
    }

    /// Decode the scan, persist the preview, and return the model tensor
    #[instrument(skip(self), fields(case_id = %case_id))]
    pub fn execute(&self, case_id: &CaseId, scan_path: &Path) -> StageResult<PreprocessOutput> {
        let raw: RawSlice = self.decoder.decode(scan_path)?;
        let dimensions = raw.dimensions();

        let normalized = normalize_window(&raw.data);
        let tensor = to_model_tensor(normalized);

        let preview = self
            .store
            .put_gray(case_id, ArtifactKind::Preview, &preview_raster(&raw.data))?;

        debug!(
            "Preprocessed {}x{} slice, preview at {}",
            dimensions.0, dimensions.1, preview.key
        );
        Ok(PreprocessOutput {
            tensor,
            preview,
            dimensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::artifacts::MemoryArtifactStore;
    use crate::services::scan_decoder::tests::write_test_dicom;
    use ndarray::array;

    #[test]
    fn test_normalized_range() {
        let raw = array![[-1000.0, -200.0, 0.0], [50.0, 300.0, 3000.0]];
        let norm = normalize_window(&raw);
        assert!(norm.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(norm[[0, 0]], 0.0);
        assert_eq!(norm[[1, 2]], 1.0);
        assert!((norm[[0, 2]] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_constant_input_unchanged() {
        let zeros = Array2::<f32>::zeros((4, 4));
        let norm = normalize_window(&zeros);
        assert_eq!(norm, zeros);
        assert!(norm.iter().all(|v| !v.is_nan()));

        // Constant after clipping: every value clips to the window floor
        let air = Array2::<f32>::from_elem((3, 3), -1000.0);
        let norm = normalize_window(&air);
        assert!(norm.iter().all(|&v| v == WINDOW_MIN));
    }

    #[test]
    fn test_tensor_shape() {
        let tensor = to_model_tensor(Array2::<f32>::zeros((5, 7)));
        assert_eq!(tensor.shape(), &[1, 1, 5, 7]);
    }

    #[test]
    fn test_reorientation_keeps_pixel_alignment() {
        let raw = Array2::from_shape_fn((3, 4), |(y, x)| (y * 10 + x) as f32);
        let oriented = reorient(&raw);
        assert_eq!(oriented.dim(), (3, 4));
        assert_eq!(oriented, raw.view());
    }

    #[test]
    fn test_preview_windowing() {
        let raw = array![[-1000.0, 300.0], [50.0, -200.0]];
        let preview = preview_raster(&raw);
        assert_eq!(preview.dimensions(), (2, 2));
        assert_eq!(preview.get_pixel(0, 0)[0], 0);
        assert_eq!(preview.get_pixel(1, 0)[0], 255);
        assert_eq!(preview.get_pixel(0, 1)[0], 128);
        assert_eq!(preview.get_pixel(1, 1)[0], 0);
    }

    #[test]
    fn test_preview_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idem.dcm");
        let stored: Vec<i16> = (0..64).map(|i| (i * 37 % 1500) as i16).collect();
        write_test_dicom(&path, 8, 8, &stored, "1", "-1024");

        let store = Arc::new(MemoryArtifactStore::new());
        let normalizer = Normalizer::new(ScanDecoder::new(0), store.clone());
        let case_id = CaseId::new("idem");

        normalizer.execute(&case_id, &path).unwrap();
        let first = store.get(&case_id, ArtifactKind::Preview).unwrap();
        let output = normalizer.execute(&case_id, &path).unwrap();
        let second = store.get(&case_id, ArtifactKind::Preview).unwrap();

        assert_eq!(first, second);
        assert_eq!(output.dimensions, (8, 8));
        assert_eq!(output.preview.key, "image/idem.png");
        assert!(output.tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_unreadable_scan_is_decode_error() {
        let store = Arc::new(MemoryArtifactStore::new());
        let normalizer = Normalizer::new(ScanDecoder::new(0), store.clone());
        let err = normalizer
            .execute(&CaseId::new("x"), Path::new("/nonexistent/x.dcm"))
            .unwrap_err();
        assert!(matches!(err, crate::core::errors::StageError::Decode(_)));
        assert!(store.is_empty());
    }
}
