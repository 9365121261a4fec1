pub mod geometry;
pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use geometry::{closed_arc_length, fit_ellipse, polygon_area, round4, Ellipse};
pub use image_ops::{
    apply_jet_colormap, decode_gray_png, decode_rgb_png, encode_gray_png, encode_rgb_png,
    png_data_url_async,
};
pub use metrics::Metrics;
