//! Diagnose a single scan from the command line
//! Run with: cargo run --release --bin diagnose -- <scan.dcm> [model.onnx]

use anyhow::Result;
use ct_diagnosis::{
    services::{FsArtifactStore, ModelStore, TracingProgress},
    utils::Metrics,
    Config, PipelineOrchestrator,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("ct_diagnosis=info,ort=off")
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(scan_path) = args.get(1).map(PathBuf::from) else {
        eprintln!("Usage: {} <scan> [model.onnx]", args[0]);
        std::process::exit(2);
    };
    if !scan_path.exists() {
        eprintln!("Scan not found: {}", scan_path.display());
        std::process::exit(1);
    }

    let mut config = Config::new()?;
    if let Some(model_path) = args.get(2) {
        config.model.model_path = PathBuf::from(model_path);
    }

    info!("Loading model: {}", config.model.model_path.display());
    let models = ModelStore::new(config.model.clone());
    if let Err(e) = models.load_configured() {
        if config.model.require_model || args.len() > 2 {
            return Err(e.into());
        }
        warn!("No model loaded ({}); following the {:?} policy", e, config.fallback_policy());
    }

    let artifact_dir: &Path = config.artifact_dir();
    info!("Artifacts: {}", artifact_dir.display());
    let store = Arc::new(FsArtifactStore::new(artifact_dir));
    let orchestrator = PipelineOrchestrator::from_config(&config, store, Metrics::new());

    let report = orchestrator
        .run(&scan_path, models.current(), &TracingProgress)
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
