use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use image::{GrayImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Encode a single-channel raster as PNG (lossless, deterministic for identical pixels)
pub fn encode_gray_png(img: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

/// Encode a three-channel raster as PNG
pub fn encode_rgb_png(img: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

/// Decode PNG bytes into a single-channel raster
pub fn decode_gray_png(bytes: &[u8]) -> Result<GrayImage, image::ImageError> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_luma8())
}

/// Decode PNG bytes into a three-channel raster
pub fn decode_rgb_png(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_rgb8())
}

/// Asynchronously encode PNG bytes as a `data:` URL using spawn_blocking.
///
/// Base64 of a 512x512 overlay is ~1 MB of work; keep it off the async runtime.
pub async fn png_data_url_async(png_bytes: Vec<u8>) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(&png_bytes)
        )
    })
    .await
    .context("Failed to spawn blocking task for data URL encoding")
}

/// Jet false-color map (blue = low, red = high) for an 8-bit intensity
pub fn jet_color(value: u8) -> Rgb<u8> {
    let v = value as f32 / 255.0;
    let channel = |offset: f32| -> u8 {
        let c = (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Apply the jet map to a grayscale raster
pub fn apply_jet_colormap(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        jet_color(gray.get_pixel(x, y)[0])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_gray_png_round_trip_is_exact() {
        let img = GrayImage::from_fn(17, 9, |x, y| Luma([((x * 13 + y * 7) % 256) as u8]));
        let bytes = encode_gray_png(&img).unwrap();
        let decoded = decode_gray_png(&bytes).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet_color(0), Rgb([0, 0, 128]));
        assert_eq!(jet_color(255), Rgb([128, 0, 0]));
        let mid = jet_color(128);
        assert!(mid[1] > 250, "mid-scale should be green-dominant: {:?}", mid);
    }

    #[tokio::test]
    async fn test_data_url_prefix() {
        let img = RgbImage::from_pixel(2, 2, Rgb([0, 255, 0]));
        let bytes = encode_rgb_png(&img).unwrap();
        let url = png_data_url_async(bytes).await.unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }
}
