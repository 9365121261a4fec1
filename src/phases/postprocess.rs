// Postprocessing: external contours of the mask drawn onto the preview

use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::errors::{ArtifactError, ShapeMismatchError, StageResult};
use crate::core::types::{ArtifactHandle, ArtifactKind, CaseId};
use crate::services::artifacts::ArtifactStore;
use crate::utils::image_ops::encode_rgb_png;

/// Contour stroke color
pub const CONTOUR_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Contour stroke width in pixels
pub const CONTOUR_THICKNESS: u32 = 2;

/// Output of the postprocessing stage
#[derive(Debug, Clone)]
pub struct OverlayOutput {
    pub overlay: ArtifactHandle,
    pub contour_count: usize,
}

/// Outer borders of top-level foreground components (holes and nested islands skipped),
/// in extraction order
pub fn external_contours(mask: &GrayImage) -> Vec<Contour<i32>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .collect()
}

/// Brush offsets for a stroke of `thickness` pixels centred on the path
fn brush_offsets(thickness: u32) -> std::ops::Range<i32> {
    let brush = thickness.max(1) as i32;
    let start = -(brush / 2);
    start..start + brush
}

/// Draw closed contours with a square brush of `thickness` pixels centred on each point
pub fn draw_contours(canvas: &mut RgbImage, contours: &[Contour<i32>], color: Rgb<u8>, thickness: u32) {
    let brush = thickness.max(1);
    let offsets = brush_offsets(thickness);
    for contour in contours {
        let points = &contour.points;
        match points.len() {
            0 => {}
            1 => {
                let p = points[0];
                let rect = Rect::at(p.x + offsets.start, p.y + offsets.start).of_size(brush, brush);
                draw_filled_rect_mut(canvas, rect, color);
            }
            n => {
                for i in 0..n {
                    let a = points[i];
                    let b = points[(i + 1) % n];
                    for dy in offsets.clone() {
                        for dx in offsets.clone() {
                            draw_line_segment_mut(
                                canvas,
                                ((a.x + dx) as f32, (a.y + dy) as f32),
                                ((b.x + dx) as f32, (b.y + dy) as f32),
                                color,
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Contour & overlay stage
pub struct OverlayStage {
    store: Arc<dyn ArtifactStore>,
}

impl OverlayStage {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Read preview and mask by case id, draw the mask outline, persist the overlay
    #[instrument(skip(self), fields(case_id = %case_id))]
    pub fn execute(&self, case_id: &CaseId) -> StageResult<OverlayOutput> {
        let preview = self.store.get_gray(case_id, ArtifactKind::Preview)?;
        let mask = self.store.get_gray(case_id, ArtifactKind::Mask)?;
        ShapeMismatchError::check("mask vs preview", preview.dimensions(), mask.dimensions())?;

        let contours = external_contours(&mask);
        let mut overlay = DynamicImage::ImageLuma8(preview).to_rgb8();
        draw_contours(&mut overlay, &contours, CONTOUR_COLOR, CONTOUR_THICKNESS);

        let overlay_png = encode_rgb_png(&overlay).map_err(|source| ArtifactError::Encoding {
            kind: ArtifactKind::Overlay,
            source,
        })?;
        let handle = self.store.put(case_id, ArtifactKind::Overlay, &overlay_png)?;

        debug!("Drew {} external contours", contours.len());
        Ok(OverlayOutput {
            overlay: handle,
            contour_count: contours.len(),
        })
    }
}
