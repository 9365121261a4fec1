// Scan intake: DICOM and grayscale raster slices decoded to raw intensities

use dicom_core::value::Value;
use dicom_dictionary_std::tags;
use dicom_object::{open_file, DefaultDicomObject};
use image::DynamicImage;
use ndarray::Array2;
use std::path::Path;
use tracing::{debug, instrument};

use crate::core::errors::{DecodeError, DecodeResult};

/// One decoded 2D slice in raw intensity units (Hounsfield units for CT DICOM)
#[derive(Debug, Clone, PartialEq)]
pub struct RawSlice {
    /// Row-major intensities, shape (height, width)
    pub data: Array2<f32>,
}

impl RawSlice {
    pub fn new(data: Array2<f32>) -> DecodeResult<Self> {
        let (height, width) = data.dim();
        if width == 0 || height == 0 {
            return Err(DecodeError::InvalidDimensions { width, height });
        }
        Ok(Self { data })
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width() as u32, self.height() as u32)
    }
}

/// Scan container formats accepted at intake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFormat {
    Dicom,
    Raster,
}

impl ScanFormat {
    pub fn from_path(path: &Path) -> DecodeResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "dcm" | "dicom" => Ok(ScanFormat::Dicom),
            "png" | "tif" | "tiff" => Ok(ScanFormat::Raster),
            "" => Err(DecodeError::UnsupportedFormat(format!(
                "{} has no file extension",
                path.display()
            ))),
            other => Err(DecodeError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Decoder settings
#[derive(Debug, Clone, Copy)]
pub struct ScanDecoder {
    /// Added to stored raster values to recover signed intensities
    pub raster_intercept: i32,
}

impl ScanDecoder {
    pub fn new(raster_intercept: i32) -> Self {
        Self { raster_intercept }
    }

    /// Decode the first slice of a scan file
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn decode(&self, path: &Path) -> DecodeResult<RawSlice> {
        if !path.is_file() {
            return Err(DecodeError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scan file not found"),
            });
        }

        let slice = match ScanFormat::from_path(path)? {
            ScanFormat::Dicom => decode_dicom(path)?,
            ScanFormat::Raster => decode_raster(path, self.raster_intercept)?,
        };
        debug!("Decoded {}x{} slice", slice.width(), slice.height());
        Ok(slice)
    }
}

fn dicom_err(e: impl std::fmt::Display) -> DecodeError {
    DecodeError::Dicom(e.to_string())
}

fn read_u16(obj: &DefaultDicomObject, tag: dicom_core::Tag) -> DecodeResult<u16> {
    obj.element(tag)
        .map_err(dicom_err)?
        .to_int::<u16>()
        .map_err(dicom_err)
}

fn read_optional_f64(obj: &DefaultDicomObject, tag: dicom_core::Tag) -> DecodeResult<Option<f64>> {
    match obj.element_opt(tag).map_err(dicom_err)? {
        Some(element) => element.to_float64().map(Some).map_err(dicom_err),
        None => Ok(None),
    }
}

fn decode_dicom(path: &Path) -> DecodeResult<RawSlice> {
    let obj = open_file(path).map_err(dicom_err)?;

    let rows = read_u16(&obj, tags::ROWS)? as usize;
    let cols = read_u16(&obj, tags::COLUMNS)? as usize;
    let bits_allocated = read_u16(&obj, tags::BITS_ALLOCATED)?;
    let bits_stored = match obj.element_opt(tags::BITS_STORED).map_err(dicom_err)? {
        Some(element) => element.to_int::<u16>().map_err(dicom_err)?,
        None => bits_allocated,
    };
    let signed = match obj.element_opt(tags::PIXEL_REPRESENTATION).map_err(dicom_err)? {
        Some(element) => element.to_int::<u16>().map_err(dicom_err)? == 1,
        None => false,
    };
    let samples = match obj.element_opt(tags::SAMPLES_PER_PIXEL).map_err(dicom_err)? {
        Some(element) => element.to_int::<u16>().map_err(dicom_err)?,
        None => 1,
    };
    if samples != 1 {
        return Err(DecodeError::UnsupportedPixelData(format!(
            "{} samples per pixel (only single-channel slices are supported)",
            samples
        )));
    }

    let slope = read_optional_f64(&obj, tags::RESCALE_SLOPE)?.unwrap_or(1.0);
    let intercept = read_optional_f64(&obj, tags::RESCALE_INTERCEPT)?.unwrap_or(0.0);

    let pixel_data = obj.element(tags::PIXEL_DATA).map_err(dicom_err)?;
    if let Value::PixelSequence(_) = pixel_data.value() {
        return Err(DecodeError::UnsupportedPixelData(
            "encapsulated (compressed) pixel data".to_string(),
        ));
    }
    let bytes = pixel_data.to_bytes().map_err(dicom_err)?;

    let n = rows * cols;
    let values: Vec<f64> = match bits_allocated {
        8 => {
            let frame = bytes.get(..n).ok_or_else(|| short_pixel_data(n, bytes.len()))?;
            frame
                .iter()
                .map(|&b| if signed { b as i8 as f64 } else { b as f64 })
                .collect()
        }
        16 => {
            let frame = bytes
                .get(..n * 2)
                .ok_or_else(|| short_pixel_data(n * 2, bytes.len()))?;
            let shift = 16u32.saturating_sub(bits_stored.clamp(1, 16) as u32);
            frame
                .chunks_exact(2)
                .map(|pair| {
                    let raw = u16::from_le_bytes([pair[0], pair[1]]);
                    if signed {
                        // Sign-extend from bits_stored
                        (((raw << shift) as i16) >> shift) as f64
                    } else {
                        raw as f64
                    }
                })
                .collect()
        }
        other => {
            return Err(DecodeError::UnsupportedPixelData(format!(
                "{} bits allocated",
                other
            )))
        }
    };

    let data = Array2::from_shape_vec(
        (rows, cols),
        values.into_iter().map(|v| (v * slope + intercept) as f32).collect(),
    )
    .map_err(dicom_err)?;
    RawSlice::new(data)
}

fn short_pixel_data(expected: usize, actual: usize) -> DecodeError {
    DecodeError::Dicom(format!(
        "pixel data holds {} bytes, first frame needs {}",
        actual, expected
    ))
}

fn decode_raster(path: &Path, intercept: i32) -> DecodeResult<RawSlice> {
    let img = image::open(path)?;
    let (width, height) = (img.width() as usize, img.height() as usize);
    let offset = intercept as f32;

    let values: Vec<f32> = match img {
        DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(|v| v as f32 + offset).collect(),
        DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(|v| v as f32 + offset).collect(),
        other => other
            .to_luma8()
            .into_raw()
            .into_iter()
            .map(|v| v as f32 + offset)
            .collect(),
    };

    let data = Array2::from_shape_vec((height, width), values)
        .map_err(|_| DecodeError::InvalidDimensions { width, height })?;
    RawSlice::new(data)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use image::{ImageBuffer, Luma};
    use std::path::PathBuf;

    /// Write a single-frame 16-bit signed CT slice with the given rescale parameters
    pub(crate) fn write_test_dicom(
        path: &Path,
        width: usize,
        height: usize,
        stored: &[i16],
        slope: &str,
        intercept: &str,
    ) {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(height as u16)));
        obj.put(DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(width as u16)));
        obj.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)));
        obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)));
        obj.put(DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)));
        obj.put(DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)));
        obj.put(DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(1_u16)));
        obj.put(DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from("MONOCHROME2"),
        ));
        obj.put(DataElement::new(tags::RESCALE_SLOPE, VR::DS, PrimitiveValue::from(slope)));
        obj.put(DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, PrimitiveValue::from(intercept)));

        let bytes: Vec<u8> = stored.iter().flat_map(|v| v.to_le_bytes()).collect();
        obj.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(bytes)));

        let file_obj = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax("1.2.840.10008.1.2.1")
                    .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
                    .media_storage_sop_instance_uid("1.2.826.0.1.3680043.2.1125.1"),
            )
            .unwrap();
        file_obj.write_to_file(path).unwrap();
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ScanFormat::from_path(Path::new("a/10007.DCM")).unwrap(), ScanFormat::Dicom);
        assert_eq!(ScanFormat::from_path(Path::new("x.tiff")).unwrap(), ScanFormat::Raster);
        assert!(matches!(
            ScanFormat::from_path(Path::new("scan.jpg")),
            Err(DecodeError::UnsupportedFormat(_))
        ));
        assert!(ScanFormat::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn test_missing_file_is_decode_error() {
        let decoder = ScanDecoder::new(-1024);
        let err = decoder.decode(&PathBuf::from("/nonexistent/scan.dcm")).unwrap_err();
        assert!(matches!(err, DecodeError::Io { .. }));
    }

    #[test]
    fn test_dicom_rescale_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("case.dcm");
        // stored 0 and 1100 with intercept -1024 -> -1024 HU and 76 HU
        write_test_dicom(&path, 2, 2, &[0, 1100, -5, 24], "1", "-1024");

        let slice = ScanDecoder::new(0).decode(&path).unwrap();
        assert_eq!(slice.dimensions(), (2, 2));
        assert_eq!(slice.data[[0, 0]], -1024.0);
        assert_eq!(slice.data[[0, 1]], 76.0);
        assert_eq!(slice.data[[1, 0]], -1029.0);
        assert_eq!(slice.data[[1, 1]], -1000.0);
    }

    #[test]
    fn test_raster_intercept_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slice.png");
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(3, 2, |x, y| Luma([(x + y * 3) as u16 * 100]));
        img.save(&path).unwrap();

        let slice = ScanDecoder::new(-1024).decode(&path).unwrap();
        assert_eq!(slice.width(), 3);
        assert_eq!(slice.height(), 2);
        assert_eq!(slice.data[[0, 0]], -1024.0);
        assert_eq!(slice.data[[1, 2]], 500.0 - 1024.0);
    }

    #[test]
    fn test_garbage_dicom_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.dcm");
        std::fs::write(&path, b"not a dicom file").unwrap();
        let err = ScanDecoder::new(0).decode(&path).unwrap_err();
        assert!(matches!(err, DecodeError::Dicom(_)));
    }
}
