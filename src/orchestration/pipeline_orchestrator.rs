// Pipeline Orchestrator: sequences the stages of one diagnostic run

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::core::config::{Config, FallbackPolicy};
use crate::core::errors::{ErrorContext, PipelineError, PipelineResult, StageError, StageResult};
use crate::core::types::{
    ArtifactHandle, ArtifactKind, CaseId, DiagnosisReport, FeatureOutcome, FeatureSet,
    PipelineState, ProgressEvent,
};
use crate::phases::{FeatureExtractor, InferenceStage, Normalizer, OverlayStage};
use crate::services::artifacts::ArtifactStore;
use crate::services::progress::ProgressSink;
use crate::services::scan_decoder::ScanDecoder;
use crate::services::segmentation::SegmentationModel;
use crate::utils::metrics::Metrics;

/// Run a blocking stage on the blocking pool
async fn blocking<T, F>(f: F) -> StageResult<T>
where
    F: FnOnce() -> StageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StageError::TaskJoin(e.to_string()))?
}

/// State and progress bookkeeping for one run
struct RunTracker<'a> {
    case_id: CaseId,
    state: PipelineState,
    sink: &'a dyn ProgressSink,
    metrics: &'a Metrics,
    stage_start: Instant,
}

impl<'a> RunTracker<'a> {
    fn new(case_id: CaseId, sink: &'a dyn ProgressSink, metrics: &'a Metrics) -> Self {
        Self {
            case_id,
            state: PipelineState::Idle,
            sink,
            metrics,
            stage_start: Instant::now(),
        }
    }

    fn emit(&self, percentage: u8, message: &str) {
        self.sink.report(
            &self.case_id,
            ProgressEvent {
                percentage,
                message: message.to_string(),
            },
        );
    }

    /// Move to `next`, recording how long the previous stage took
    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        self.metrics
            .record_stage_duration(self.state, self.stage_start.elapsed());
        self.state = next;
        self.stage_start = Instant::now();
    }

    /// Attach case/state context to a stage result, failing the run on error
    fn check<T>(&mut self, result: StageResult<T>) -> PipelineResult<T> {
        result.in_stage(&self.case_id, self.state).map_err(|e| self.fail(e))
    }

    fn fail(&mut self, err: PipelineError) -> PipelineError {
        error!(case_id = %self.case_id, state = %self.state, "Diagnosis failed: {}", err);
        self.metrics.record_run_failed(err.kind());
        self.state = PipelineState::Failed;
        err
    }
}

/// Sequences Normalizer -> Inference -> Overlay -> Feature extraction for one case.
///
/// Holds no per-run state: each `run` depends only on its scan path, model
/// snapshot and progress sink.
pub struct PipelineOrchestrator {
    store: Arc<dyn ArtifactStore>,
    normalizer: Arc<Normalizer>,
    inference: Arc<InferenceStage>,
    overlay: Arc<OverlayStage>,
    features: Arc<FeatureExtractor>,
    policy: FallbackPolicy,
    metrics: Metrics,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        decoder: ScanDecoder,
        policy: FallbackPolicy,
        metrics: Metrics,
    ) -> Self {
        if policy == FallbackPolicy::Synthetic {
            warn!(
                "Synthetic fallback policy enabled: runs without a model produce zeroed features tagged 'fallback'"
            );
        }

        Self {
            normalizer: Arc::new(Normalizer::new(decoder, Arc::clone(&store))),
            inference: Arc::new(InferenceStage::new(Arc::clone(&store))),
            overlay: Arc::new(OverlayStage::new(Arc::clone(&store))),
            features: Arc::new(FeatureExtractor::new(decoder, Arc::clone(&store))),
            store,
            policy,
            metrics,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn ArtifactStore>, metrics: Metrics) -> Self {
        Self::new(
            store,
            ScanDecoder::new(config.pipeline.raster_intercept),
            config.fallback_policy(),
            metrics,
        )
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run the full pipeline for one scan.
    ///
    /// `model` is the snapshot taken by the caller; it is never re-read during the run.
    #[instrument(skip(self, model, sink), fields(scan = %scan_path.display()))]
    pub async fn run(
        &self,
        scan_path: &Path,
        model: Option<Arc<dyn SegmentationModel>>,
        sink: &dyn ProgressSink,
    ) -> PipelineResult<DiagnosisReport> {
        let run_start = Instant::now();
        self.metrics.record_run_started();

        let case_id = case_id_for(scan_path, &self.metrics)?;
        let mut tracker = RunTracker::new(case_id.clone(), sink, &self.metrics);
        info!(case_id = %case_id, "Starting diagnosis");

        // Preprocessing
        tracker.advance(PipelineState::Preprocessing);
        tracker.emit(10, "Preparing analysis");
        let normalizer = Arc::clone(&self.normalizer);
        let (id, path) = (case_id.clone(), scan_path.to_path_buf());
        let preprocessed = tracker.check(blocking(move || normalizer.execute(&id, &path)).await)?;
        tracker.emit(20, "Image preprocessed");

        // Inferring
        tracker.advance(PipelineState::Inferring);
        tracker.emit(40, "Running model inference");
        let fallback = model.is_none();
        let inferred = match model {
            Some(model) => {
                let inference = Arc::clone(&self.inference);
                let id = case_id.clone();
                let tensor = preprocessed.tensor;
                tracker.check(blocking(move || inference.execute(&id, &tensor, &*model)).await)?
            }
            None if self.policy == FallbackPolicy::Synthetic => {
                self.metrics.record_fallback_run();
                let inference = Arc::clone(&self.inference);
                let id = case_id.clone();
                let dimensions = preprocessed.dimensions;
                tracker.check(blocking(move || inference.write_stub_mask(&id, dimensions)).await)?
            }
            None => {
                return Err(tracker.fail(PipelineError::ModelUnavailable {
                    case_id: case_id.clone(),
                    state: PipelineState::Inferring,
                }));
            }
        };

        // Postprocessing
        tracker.advance(PipelineState::Postprocessing);
        tracker.emit(70, "Generating contours");
        let overlay_stage = Arc::clone(&self.overlay);
        let id = case_id.clone();
        let overlay = tracker.check(blocking(move || overlay_stage.execute(&id)).await)?;

        // ExtractingFeatures
        tracker.advance(PipelineState::ExtractingFeatures);
        tracker.emit(90, "Extracting features");
        let outcome = if fallback {
            warn!(case_id = %case_id, "Reporting zeroed fallback features (no model loaded)");
            FeatureOutcome::Tumor {
                features: FeatureSet::fallback(),
            }
        } else {
            let extractor = Arc::clone(&self.features);
            let (id, path) = (case_id.clone(), scan_path.to_path_buf());
            tracker.check(blocking(move || extractor.execute(&id, &path)).await)?
        };

        tracker.advance(PipelineState::Complete);
        tracker.emit(100, "Diagnosis complete");

        let elapsed = run_start.elapsed();
        self.metrics.record_run_succeeded(elapsed, outcome.is_no_tumor());
        info!(
            case_id = %case_id,
            contours = overlay.contour_count,
            no_tumor = outcome.is_no_tumor(),
            "✓ Diagnosis complete in {:.2}ms",
            elapsed.as_secs_f64() * 1000.0
        );

        Ok(DiagnosisReport {
            case_id,
            preview: preprocessed.preview,
            overlay: overlay.overlay,
            heatmap: inferred.heatmap,
            outcome,
            processing_time_ms: elapsed.as_secs_f64() * 1000.0,
        })
    }

    /// Preprocessing only: decode the scan and persist its preview (the upload step)
    #[instrument(skip(self), fields(scan = %scan_path.display()))]
    pub async fn preprocess_only(&self, scan_path: &Path) -> PipelineResult<(CaseId, ArtifactHandle)> {
        let case_id = case_id_for(scan_path, &self.metrics)?;
        let normalizer = Arc::clone(&self.normalizer);
        let (id, path) = (case_id.clone(), scan_path.to_path_buf());
        let output = blocking(move || normalizer.execute(&id, &path))
            .await
            .in_stage(&case_id, PipelineState::Preprocessing)?;
        Ok((case_id, output.preview))
    }

    /// Whether a case already has its preview (i.e. was uploaded and preprocessed)
    pub fn has_preview(&self, case_id: &CaseId) -> bool {
        self.store.exists(case_id, ArtifactKind::Preview)
    }
}

fn case_id_for(scan_path: &Path, metrics: &Metrics) -> PipelineResult<CaseId> {
    CaseId::from_scan_path(scan_path).map_err(|source| {
        metrics.record_run_failed("DecodeError");
        PipelineError::Decode {
            case_id: CaseId::new(scan_path.to_string_lossy()),
            state: PipelineState::Preprocessing,
            source,
        }
    })
}
