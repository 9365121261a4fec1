// Hot-swappable holder for the active segmentation model

use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, instrument, warn};

use crate::core::config::ModelConfig;
use crate::core::errors::ModelStoreError;
use crate::services::segmentation::{OnnxSegmentationModel, SegmentationModel};

struct LoadedModel {
    model: Arc<dyn SegmentationModel>,
    source: Option<PathBuf>,
    loaded_at: SystemTime,
}

/// Reported by `GET /model`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub loaded: bool,
    pub name: Option<String>,
    pub backend: Option<String>,
    pub input_size: Option<usize>,
    pub source: Option<PathBuf>,
    pub loaded_at_unix: Option<u64>,
}

/// Atomically replaceable model cell.
///
/// Runs take an `Arc` snapshot through [`ModelStore::current`] and keep it for
/// their whole lifetime; swapping or unloading only affects later runs.
pub struct ModelStore {
    config: ModelConfig,
    slot: RwLock<Option<LoadedModel>>,
}

impl ModelStore {
    /// Empty store; nothing is loaded until `load_from_path` or `swap`
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            slot: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Snapshot of the active model, if any
    pub fn current(&self) -> Option<Arc<dyn SegmentationModel>> {
        self.slot.read().as_ref().map(|loaded| Arc::clone(&loaded.model))
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Build ONNX sessions for `path` and make it the active model.
    ///
    /// Blocking (reads the file and initializes every session); call from
    /// `spawn_blocking` inside async code. On failure the previous model stays active.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load_from_path(&self, path: &Path) -> Result<Arc<dyn SegmentationModel>, ModelStoreError> {
        let model: Arc<dyn SegmentationModel> =
            Arc::new(OnnxSegmentationModel::load(path, &self.config)?);
        self.install(Arc::clone(&model), Some(path.to_path_buf()));
        Ok(model)
    }

    /// Load from the configured `MODEL_PATH`
    pub fn load_configured(&self) -> Result<Arc<dyn SegmentationModel>, ModelStoreError> {
        let path = self.config.model_path.clone();
        self.load_from_path(&path)
    }

    /// Replace the active model with an already constructed one
    pub fn swap(&self, model: Arc<dyn SegmentationModel>) -> Option<Arc<dyn SegmentationModel>> {
        self.install(model, None)
    }

    /// Drop the active model; later runs see no model
    pub fn unload(&self) -> Option<Arc<dyn SegmentationModel>> {
        let previous = self.slot.write().take();
        match &previous {
            Some(loaded) => info!("Unloaded segmentation model '{}'", loaded.model.name()),
            None => warn!("Unload requested but no segmentation model is loaded"),
        }
        previous.map(|loaded| loaded.model)
    }

    pub fn status(&self) -> ModelStatus {
        let slot = self.slot.read();
        match slot.as_ref() {
            Some(loaded) => ModelStatus {
                loaded: true,
                name: Some(loaded.model.name().to_string()),
                backend: Some(loaded.model.backend().to_string()),
                input_size: Some(loaded.model.input_size()),
                source: loaded.source.clone(),
                loaded_at_unix: loaded
                    .loaded_at
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_secs()),
            },
            None => ModelStatus {
                loaded: false,
                name: None,
                backend: None,
                input_size: None,
                source: None,
                loaded_at_unix: None,
            },
        }
    }

    fn install(
        &self,
        model: Arc<dyn SegmentationModel>,
        source: Option<PathBuf>,
    ) -> Option<Arc<dyn SegmentationModel>> {
        info!(
            "Activating segmentation model '{}' ({}, input {}x{})",
            model.name(),
            model.backend(),
            model.input_size(),
            model.input_size()
        );
        let previous = self.slot.write().replace(LoadedModel {
            model,
            source,
            loaded_at: SystemTime::now(),
        });
        previous.map(|loaded| loaded.model)
    }
}
