// Shared ONNX Runtime session builder with automatic hardware acceleration detection

use anyhow::{Context, Result};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Calculate optimal thread count for ONNX Runtime CPU inference.
///
/// Using all cores hurts on Windows because of thread synchronization overhead,
/// so it is capped at 6 there.
///
/// Reference: https://github.com/microsoft/onnxruntime/issues/3713
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

// Import acceleration providers based on features
#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

#[cfg(feature = "xnnpack")]
use ort::execution_providers::XNNPACKExecutionProvider;

/// Fixed-capacity pool of ONNX sessions.
///
/// `Session::run` needs `&mut`, so every concurrent forward pass takes its own
/// session. `acquire` blocks until one is free.
pub struct SessionPool {
    sessions: Mutex<VecDeque<Session>>,
    available: Condvar,
    capacity: usize,
    in_use: AtomicUsize,
}

impl SessionPool {
    pub fn new(sessions: Vec<Session>) -> Self {
        let capacity = sessions.len();
        Self {
            sessions: Mutex::new(sessions.into()),
            available: Condvar::new(),
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get number of idle sessions
    pub fn available(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Acquire a session from the pool (blocks while all sessions are busy)
    pub fn acquire(&self) -> Session {
        let mut sessions = self.sessions.lock();
        loop {
            if let Some(session) = sessions.pop_front() {
                self.in_use.fetch_add(1, Ordering::SeqCst);
                return session;
            }
            self.available.wait(&mut sessions);
        }
    }

    /// Release a session back to the pool
    pub fn release(&self, session: Session) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.sessions.lock().push_back(session);
        self.available.notify_one();
    }

    /// Run `f` on a pooled session and return the session afterwards
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.acquire();
        let result = f(&mut session);
        self.release(session);
        result
    }
}

fn commit_session(
    provider: ExecutionProviderDispatch,
    level: GraphOptimizationLevel,
    model_bytes: &[u8],
) -> Result<Session> {
    let session = Session::builder()
        .and_then(|b| b.with_execution_providers([provider]))
        .and_then(|b| b.with_optimization_level(level))
        .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
        .and_then(|b| b.with_inter_threads(1))
        .and_then(|b| b.commit_from_memory(model_bytes))?;
    Ok(session)
}

/// Build ONNX Runtime session with automatic hardware acceleration detection
///
/// Tries acceleration providers in this order:
/// 1. TensorRT (NVIDIA GPUs, best performance)
/// 2. CUDA (NVIDIA GPUs)
/// 3. CoreML (Apple Silicon)
/// 4. DirectML (Windows GPU acceleration)
/// 5. OpenVINO (Intel CPU optimizations)
/// 6. XNNPACK (ARM CPU optimizations)
/// 7. CPU (fallback)
///
/// `forced_backend` (from `INFERENCE_BACKEND`) skips detection unless it is `AUTO`.
///
/// # Returns
/// (backend_name, Session)
pub fn build_session_with_acceleration(
    model_bytes: &[u8],
    model_name: &str,
    forced_backend: Option<&str>,
) -> Result<(String, Session)> {
    let model_size_mb = model_bytes.len() as f32 / 1_048_576.0;

    if let Some(forced) = forced_backend {
        if !forced.is_empty() && !forced.eq_ignore_ascii_case("auto") {
            info!("INFERENCE_BACKEND={}, forcing specific backend for {}", forced, model_name);
            return try_forced_backend(forced, model_bytes, model_name, model_size_mb);
        }
    }

    // Only attempt providers that are compiled in via Cargo features

    #[cfg(feature = "tensorrt")]
    {
        let provider = TensorRTExecutionProvider::default().build();
        if let Ok(session) = commit_session(provider, GraphOptimizationLevel::Level3, model_bytes) {
            info!("✓ Using TensorRT acceleration for {}", model_name);
            return Ok(("TensorRT".to_string(), session));
        }
    }

    #[cfg(feature = "cuda")]
    {
        let provider = CUDAExecutionProvider::default().build();
        if let Ok(session) = commit_session(provider, GraphOptimizationLevel::Level3, model_bytes) {
            info!("✓ Using CUDA acceleration for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
    }

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    {
        let provider = CoreMLExecutionProvider::default().build();
        if let Ok(session) = commit_session(provider, GraphOptimizationLevel::Level3, model_bytes) {
            info!("✓ Using CoreML acceleration for {}", model_name);
            return Ok(("CoreML".to_string(), session));
        }
    }

    #[cfg(all(target_os = "windows", feature = "directml"))]
    {
        // DirectML needs sequential execution, no memory pattern and Level1 optimization
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([DirectMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_parallel_execution(false))
            .and_then(|b| b.with_memory_pattern(false))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("✓ Using DirectML acceleration for {}", model_name);
            return Ok(("DirectML".to_string(), session));
        }
    }

    #[cfg(feature = "openvino")]
    {
        let provider = OpenVINOExecutionProvider::default().with_device_type("CPU").build();
        if let Ok(session) = commit_session(provider, GraphOptimizationLevel::Level3, model_bytes) {
            info!("✓ Using OpenVINO acceleration for {}", model_name);
            return Ok(("OpenVINO-CPU".to_string(), session));
        }
    }

    #[cfg(feature = "xnnpack")]
    {
        let provider = XNNPACKExecutionProvider::default().build();
        if let Ok(session) = commit_session(provider, GraphOptimizationLevel::Level3, model_bytes) {
            info!("✓ Using XNNPACK acceleration for {}", model_name);
            return Ok(("XNNPACK".to_string(), session));
        }
    }

    // Final fallback: Pure CPU (no acceleration)
    let session = commit_session(
        CPUExecutionProvider::default().build(),
        GraphOptimizationLevel::Level3,
        model_bytes,
    )
    .with_context(|| {
        format!(
            "Failed to load {} ONNX model from memory ({:.1} MB). \
            This usually indicates:\n  \
            1. Model file corruption during transfer\n  \
            2. ONNX Runtime version/platform mismatch\n  \
            3. Model exported with an incompatible opset version",
            model_name, model_size_mb
        )
    })?;

    warn!("⚠️  Using CPU-only inference for {} (no GPU acceleration available)", model_name);
    Ok(("CPU".to_string(), session))
}

/// Try to force a specific backend (for testing/debugging)
fn try_forced_backend(
    backend: &str,
    model_bytes: &[u8],
    model_name: &str,
    model_size_mb: f32,
) -> Result<(String, Session)> {
    let (label, provider): (&str, ExecutionProviderDispatch) =
        match backend.to_lowercase().as_str() {
            #[cfg(feature = "cuda")]
            "cuda" => ("CUDA", CUDAExecutionProvider::default().build()),

            #[cfg(feature = "tensorrt")]
            "tensorrt" => ("TensorRT", TensorRTExecutionProvider::default().build()),

            #[cfg(feature = "openvino")]
            "openvino" => (
                "OpenVINO-CPU",
                OpenVINOExecutionProvider::default().with_device_type("CPU").build(),
            ),

            #[cfg(feature = "xnnpack")]
            "xnnpack" => ("XNNPACK", XNNPACKExecutionProvider::default().build()),

            "cpu" => ("CPU", CPUExecutionProvider::default().build()),

            _ => {
                warn!(
                    "Unknown backend '{}', falling back to auto-detection for {}",
                    backend, model_name
                );
                return build_session_with_acceleration(model_bytes, model_name, None);
            }
        };

    let session = commit_session(provider, GraphOptimizationLevel::Level3, model_bytes)
        .with_context(|| {
            format!("Failed to load {} ({:.1} MB) with {}", model_name, model_size_mb, label)
        })?;
    info!("✓ Forced {} backend for {}", label, model_name);
    Ok((label.to_string(), session))
}
