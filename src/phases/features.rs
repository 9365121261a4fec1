// Feature extraction: dominant-contour geometry and gray-level statistics

use image::GrayImage;
use imageproc::contours::Contour;
use ndarray::Array2;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::errors::{ShapeMismatchError, StageResult};
use crate::core::types::{ArtifactKind, CaseId, FeatureOutcome, FeatureSet, Provenance};
use crate::phases::postprocess::external_contours;
use crate::services::artifacts::ArtifactStore;
use crate::services::scan_decoder::ScanDecoder;
use crate::utils::geometry::{closed_arc_length, fit_ellipse, polygon_area, round4};

/// Largest-area contour; on equal areas the earliest one wins
pub fn dominant_contour(contours: &[Contour<i32>]) -> Option<&Contour<i32>> {
    let mut best: Option<(&Contour<i32>, f64)> = None;
    for contour in contours {
        let area = polygon_area(&contour.points);
        match best {
            Some((_, best_area)) if area <= best_area => {}
            _ => best = Some((contour, area)),
        }
    }
    best.map(|(contour, _)| contour)
}

/// (area, perimeter, shape descriptor) of one contour, rounded to 4 decimals
pub fn contour_geometry(contour: &Contour<i32>) -> (f64, f64, f64) {
    let area = polygon_area(&contour.points);
    let perimeter = closed_arc_length(&contour.points);
    let shape_descriptor = fit_ellipse(&contour.points)
        .map(|e| (e.major_axis - e.minor_axis).abs())
        .unwrap_or(0.0);
    (round4(area), round4(perimeter), round4(shape_descriptor))
}

/// Mean and population standard deviation of `raw` over mask-positive pixels
pub fn gray_statistics(raw: &Array2<f32>, mask: &GrayImage) -> Option<(f64, f64)> {
    // Welford's running mean and M2
    let mut count = 0usize;
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        let v = raw[[y as usize, x as usize]] as f64;
        count += 1;
        let delta = v - mean;
        mean += delta / count as f64;
        m2 += delta * (v - mean);
    }
    if count == 0 {
        return None;
    }

    let std = (m2 / count as f64).sqrt();
    Some((round4(mean), round4(std)))
}

/// Features of a raw slice under its mask; an empty mask is the no-tumor outcome
pub fn extract_features(raw: &Array2<f32>, mask: &GrayImage) -> Result<FeatureOutcome, ShapeMismatchError> {
    let (height, width) = raw.dim();
    ShapeMismatchError::check("mask vs raw slice", (width as u32, height as u32), mask.dimensions())?;

    let Some((gray_mean, gray_std)) = gray_statistics(raw, mask) else {
        return Ok(FeatureOutcome::NoTumor);
    };

    let contours = external_contours(mask);
    let (area, perimeter, shape_descriptor) = dominant_contour(&contours)
        .map(contour_geometry)
        .unwrap_or((0.0, 0.0, 0.0));

    Ok(FeatureOutcome::Tumor {
        features: FeatureSet {
            area,
            perimeter,
            shape_descriptor,
            gray_mean,
            gray_std,
            provenance: Provenance::Real,
        },
    })
}

/// Feature extraction stage
pub struct FeatureExtractor {
    decoder: ScanDecoder,
    store: Arc<dyn ArtifactStore>,
}

impl FeatureExtractor {
    pub fn new(decoder: ScanDecoder, store: Arc<dyn ArtifactStore>) -> Self {
        Self { decoder, store }
    }

    /// Re-decode the raw scan and measure it under the persisted mask
    #[instrument(skip(self), fields(case_id = %case_id))]
    pub fn execute(&self, case_id: &CaseId, scan_path: &Path) -> StageResult<FeatureOutcome> {
        let mask = self.store.get_gray(case_id, ArtifactKind::Mask)?;
        let raw = self.decoder.decode(scan_path)?;
        let outcome = extract_features(&raw.data, &mask)?;

        match outcome.features() {
            Some(f) => debug!(
                "Features: area={} perimeter={} shape={} mean={} std={}",
                f.area, f.perimeter, f.shape_descriptor, f.gray_mean, f.gray_std
            ),
            None => debug!("Mask is empty, no tumor"),
        }
        Ok(outcome)
    }
}
