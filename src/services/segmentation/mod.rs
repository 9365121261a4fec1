// Segmentation model abstraction and the ONNX Runtime implementation

use ndarray::{Array2, Array4};
use ort::session::Session;
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::core::config::ModelConfig;
use crate::core::errors::{InferenceError, InferenceResult, ModelStoreError};
use crate::services::onnx_builder::{self, SessionPool};

/// A loaded single-channel segmentation network.
///
/// Implementations are shared read-only across concurrent runs.
pub trait SegmentationModel: Send + Sync {
    /// Human-readable model name (file stem for ONNX models)
    fn name(&self) -> &str;

    /// Execution backend label
    fn backend(&self) -> &str;

    /// Fixed spatial resolution S of the `[1, 1, S, S]` input contract
    fn input_size(&self) -> usize;

    /// One forward pass: `[1, 1, H, W]` tensor in, `H x W` probability-like map out
    fn forward(&self, tensor: &Array4<f32>) -> InferenceResult<Array2<f32>>;
}

/// Reject tensors that do not match the `[1, 1, S, S]` contract
pub fn check_input_shape(tensor: &Array4<f32>, size: usize) -> InferenceResult<()> {
    let shape = tensor.shape();
    if shape[0] != 1 || shape[1] != 1 || shape[2] != size || shape[3] != size {
        return Err(InferenceError::InputShape {
            expected: size,
            width: shape[3],
            height: shape[2],
        });
    }
    Ok(())
}

/// Reshape a flat model output into an `S x S` map, rejecting size mismatches and NaN/inf
pub fn output_to_map(data: &[f32], size: usize) -> InferenceResult<Array2<f32>> {
    if data.len() != size * size {
        return Err(InferenceError::OutputShape {
            expected: size * size,
            actual: data.len(),
        });
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::NonFinite);
    }
    Ok(Array2::from_shape_vec((size, size), data.to_vec())?)
}

// Anything smaller is a Git LFS pointer or a truncated download
const MIN_MODEL_BYTES: usize = 100;

/// U-Net style segmentation model served from a pool of ONNX Runtime sessions
pub struct OnnxSegmentationModel {
    name: String,
    backend: String,
    input_name: String,
    output_name: String,
    input_size: usize,
    session_pool: SessionPool,
}

impl OnnxSegmentationModel {
    /// Load an ONNX file and build `config.onnx_pool_size` sessions for it
    #[instrument(skip(config), fields(path = %path.display(), pool = config.onnx_pool_size))]
    pub fn load(path: &Path, config: &ModelConfig) -> Result<Self, ModelStoreError> {
        let model_bytes = std::fs::read(path).map_err(|source| ModelStoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if model_bytes.len() < MIN_MODEL_BYTES {
            return Err(ModelStoreError::Truncated {
                path: path.to_path_buf(),
                size: model_bytes.len(),
            });
        }
        info!(
            "Loaded segmentation model ({:.1} MB)",
            model_bytes.len() as f64 / 1_048_576.0
        );
        debug!(
            "Model header bytes: {:02x} {:02x} {:02x} {:02x}",
            model_bytes[0], model_bytes[1], model_bytes[2], model_bytes[3]
        );

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("segmentation")
            .to_string();

        let pool_size = config.onnx_pool_size.max(1);
        let forced = config.inference_backend.as_deref();
        let mut sessions: Vec<Session> = Vec::with_capacity(pool_size);
        let mut backend = String::from("CPU");
        for _ in 0..pool_size {
            let (device, session) =
                onnx_builder::build_session_with_acceleration(&model_bytes, &name, forced)
                    .map_err(|e| ModelStoreError::Session(format!("{:#}", e)))?;
            backend = device;
            sessions.push(session);
        }

        let model = Self {
            name,
            backend,
            input_name: config.input_name.clone(),
            output_name: config.output_name.clone(),
            input_size: config.input_size,
            session_pool: SessionPool::new(sessions),
        };

        let warmup_start = std::time::Instant::now();
        model
            .warmup()
            .map_err(|e| ModelStoreError::Session(format!("warmup inference failed: {}", e)))?;
        info!(
            "✓ Segmentation model '{}' ready on {} ({} sessions, warmup {:.2}ms)",
            model.name,
            model.backend,
            model.session_pool.capacity(),
            warmup_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(model)
    }

    /// Run one dummy pass so the first real request does not pay graph initialization
    fn warmup(&self) -> InferenceResult<()> {
        let dummy = Array4::<f32>::zeros((1, 1, self.input_size, self.input_size));
        self.forward(&dummy).map(|_| ())
    }
}

impl SegmentationModel for OnnxSegmentationModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        &self.backend
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn forward(&self, tensor: &Array4<f32>) -> InferenceResult<Array2<f32>> {
        check_input_shape(tensor, self.input_size)?;
        let input_value = ort::value::Value::from_array(tensor.to_owned())?;

        let data = self.session_pool.with_session(|session| -> InferenceResult<Vec<f32>> {
            let outputs = session.run(ort::inputs![self.input_name.as_str() => input_value])?;
            let (_shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
            Ok(data.to_vec())
        })?;

        output_to_map(&data, self.input_size)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Returns the input slice unchanged (a normalized slice is already a [0, 1] map)
    pub(crate) struct IdentityModel {
        pub size: usize,
    }

    impl SegmentationModel for IdentityModel {
        fn name(&self) -> &str {
            "identity"
        }

        fn backend(&self) -> &str {
            "test"
        }

        fn input_size(&self) -> usize {
            self.size
        }

        fn forward(&self, tensor: &Array4<f32>) -> InferenceResult<Array2<f32>> {
            check_input_shape(tensor, self.size)?;
            let map = tensor.index_axis(ndarray::Axis(0), 0).index_axis(ndarray::Axis(0), 0).to_owned();
            Ok(map)
        }
    }

    /// Returns a fixed map regardless of input
    pub(crate) struct FixedModel {
        pub map: Array2<f32>,
    }

    impl SegmentationModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn backend(&self) -> &str {
            "test"
        }

        fn input_size(&self) -> usize {
            self.map.nrows()
        }

        fn forward(&self, tensor: &Array4<f32>) -> InferenceResult<Array2<f32>> {
            check_input_shape(tensor, self.map.nrows())?;
            Ok(self.map.clone())
        }
    }

    #[test]
    fn test_input_shape_contract() {
        let ok = Array4::<f32>::zeros((1, 1, 8, 8));
        assert!(check_input_shape(&ok, 8).is_ok());

        let wrong = Array4::<f32>::zeros((1, 1, 8, 6));
        let err = check_input_shape(&wrong, 8).unwrap_err();
        assert!(matches!(err, InferenceError::InputShape { expected: 8, width: 6, height: 8 }));
    }

    #[test]
    fn test_output_validation() {
        assert!(output_to_map(&[0.0; 16], 4).is_ok());
        assert!(matches!(
            output_to_map(&[0.0; 15], 4),
            Err(InferenceError::OutputShape { expected: 16, actual: 15 })
        ));
        let mut data = vec![0.0; 4];
        data[2] = f32::NAN;
        assert!(matches!(output_to_map(&data, 2), Err(InferenceError::NonFinite)));
    }

    #[test]
    fn test_missing_model_file() {
        let config = crate::core::config::Config::default().model;
        let result = OnnxSegmentationModel::load(Path::new("/nonexistent/unet.onnx"), &config);
        assert!(matches!(result, Err(ModelStoreError::Read { .. })));
    }

    #[test]
    fn test_truncated_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub.onnx");
        std::fs::write(&path, b"version https://git-lfs").unwrap();
        let config = crate::core::config::Config::default().model;
        let result = OnnxSegmentationModel::load(&path, &config);
        assert!(matches!(result, Err(ModelStoreError::Truncated { size: 23, .. })));
    }
}
