use crate::core::errors::ConfigError;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    /// Public base URL used when building artifact links
    pub public_url: Option<String>,
    pub max_upload_mb: usize,
}

/// Segmentation model configuration
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub input_name: String,
    pub output_name: String,
    /// Fixed spatial resolution of the model contract (S in [1, 1, S, S])
    pub input_size: usize,
    pub inference_backend: Option<String>,
    /// Number of ONNX sessions (controls concurrent forward passes)
    pub onnx_pool_size: usize,
    /// Load the model at startup; a missing file is only fatal when this is set
    pub require_model: bool,
}

/// What the orchestrator does when no model reference is available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Fail the run with ModelUnavailable
    Strict,
    /// Write a stub mask and a zeroed feature set tagged `fallback`
    Synthetic,
}

impl FromStr for FallbackPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(FallbackPolicy::Strict),
            "synthetic" => Ok(FallbackPolicy::Synthetic),
            other => Err(ConfigError::UnknownFallbackPolicy(other.to_string())),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fallback_policy: FallbackPolicy,
    /// Added to stored values of grayscale raster scans to recover signed intensities
    pub raster_intercept: i32,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub artifact_dir: PathBuf,
    pub upload_dir: PathBuf,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let fallback_policy = match env::var("MODEL_FALLBACK_POLICY") {
            Ok(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => FallbackPolicy::Strict,
        };

        Ok(Self {
            server: ServerConfig {
                port: parse_env("SERVER_PORT")?.unwrap_or(5003),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
                public_url: env::var("PUBLIC_URL")
                    .ok()
                    .map(|s| s.trim_end_matches('/').to_string())
                    .filter(|s| !s.is_empty()),
                max_upload_mb: parse_env("MAX_UPLOAD_MB")?.unwrap_or(50),
            },
            model: ModelConfig {
                model_path: env::var("MODEL_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("models/unet.onnx")),
                input_name: env::var("MODEL_INPUT_NAME").unwrap_or_else(|_| "input".to_string()),
                output_name: env::var("MODEL_OUTPUT_NAME")
                    .unwrap_or_else(|_| "output".to_string()),
                input_size: parse_env("MODEL_INPUT_SIZE")?.unwrap_or(512),
                inference_backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
                onnx_pool_size: parse_env("ONNX_POOL_SIZE")?.unwrap_or_else(|| {
                    // max(half the cores, 2); each session holds its own copy of the weights
                    std::cmp::max(num_cpus::get() / 2, 2)
                }),
                require_model: parse_env("REQUIRE_MODEL")?.unwrap_or(false),
            },
            pipeline: PipelineConfig {
                fallback_policy,
                raster_intercept: parse_env("RASTER_INTERCEPT")?.unwrap_or(-1024),
            },
            storage: StorageConfig {
                artifact_dir: env::var("ARTIFACT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("tmp")),
                upload_dir: env::var("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("uploads")),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(16..=4096).contains(&self.model.input_size) {
            return Err(ConfigError::InvalidModelConfig(format!(
                "input_size must be between 16 and 4096, got {}",
                self.model.input_size
            )));
        }

        if self.model.input_name.trim().is_empty() || self.model.output_name.trim().is_empty() {
            return Err(ConfigError::InvalidModelConfig(
                "model input/output tensor names must not be empty".to_string(),
            ));
        }

        if self.model.onnx_pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(self.model.onnx_pool_size));
        }

        for dir in [&self.storage.artifact_dir, &self.storage.upload_dir] {
            check_parent_exists(dir)?;
        }

        if self.server.max_upload_mb == 0 {
            return Err(ConfigError::EnvVarError(
                "MAX_UPLOAD_MB must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.pipeline.fallback_policy
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.storage.artifact_dir
    }

    pub fn upload_dir(&self) -> &Path {
        &self.storage.upload_dir
    }

    /// Base URL for artifact links (`PUBLIC_URL` or `http://host:port`)
    pub fn public_url(&self) -> String {
        self.server
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port))
    }
}

impl Default for Config {
    /// Defaults without reading the environment (tests and embedding)
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 5003,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
                public_url: None,
                max_upload_mb: 50,
            },
            model: ModelConfig {
                model_path: PathBuf::from("models/unet.onnx"),
                input_name: "input".to_string(),
                output_name: "output".to_string(),
                input_size: 512,
                inference_backend: None,
                onnx_pool_size: 2,
                require_model: false,
            },
            pipeline: PipelineConfig {
                fallback_policy: FallbackPolicy::Strict,
                raster_intercept: -1024,
            },
            storage: StorageConfig {
                artifact_dir: PathBuf::from("tmp"),
                upload_dir: PathBuf::from("uploads"),
            },
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarError(format!("{}={} is not valid", key, raw))),
        _ => Ok(None),
    }
}

fn check_parent_exists(dir: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = dir.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(ConfigError::InvalidStoragePath(format!(
                "Parent directory does not exist: {}",
                parent.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fallback_policy(), FallbackPolicy::Strict);
    }

    #[test]
    fn test_fallback_policy_parsing() {
        assert_eq!("strict".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::Strict);
        assert_eq!(" Synthetic ".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::Synthetic);
        assert!("mock".parse::<FallbackPolicy>().is_err());
    }

    #[test]
    fn test_invalid_pool_size_rejected() {
        let mut config = Config::default();
        config.model.onnx_pool_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPoolSize(0))));
    }

    #[test]
    fn test_public_url_default() {
        let config = Config::default();
        assert_eq!(config.public_url(), "http://127.0.0.1:5003");
    }
}
