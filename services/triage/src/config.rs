use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the triage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Upload API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Artifact directories
    #[serde(default)]
    pub storage: StorageConfig,
    /// Inference worker configuration
    #[serde(default)]
    pub inference: InferenceConfig,
    /// Triage policy configuration
    #[serde(default)]
    pub triage: TriageConfig,
    /// Downstream task API configuration
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Install the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Upload API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Largest accepted image in bytes (10 MiB default)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Temporary and permanent artifact locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for in-flight uploads
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Directory for kept, annotated detections
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

/// External inference worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Worker executable
    #[serde(default = "default_worker_program")]
    pub program: String,
    /// Worker arguments; `{model}`, `{input}` and `{output}` are substituted per call
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    /// Trained model weights
    #[serde(default = "default_model_path")]
    pub model_path: String,
    /// Pretrained model used when `model_path` does not exist
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    /// Worker timeout in seconds
    #[serde(default = "default_worker_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum concurrently running workers
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Triage policy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TriageConfig {
    /// Confidence that must be strictly exceeded to keep an image
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

/// Downstream task API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Create tasks for kept detections
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Task API base URL
    #[serde(default = "default_notifier_base_url")]
    pub base_url: String,
    /// Task creation path
    #[serde(default = "default_notifier_path")]
    pub path: String,
    /// User id sent as `requestUserId`
    #[serde(default = "default_request_user_id")]
    pub request_user_id: String,
    /// Request timeout in seconds
    #[serde(default = "default_notifier_timeout_secs")]
    pub timeout_secs: u64,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// Default value functions
fn default_service_name() -> String {
    "litterwatch-triage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024 // 10MiB
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_worker_program() -> String {
    "python3".to_string()
}

fn default_worker_args() -> Vec<String> {
    [
        "detect_image.py",
        "--model",
        "{model}",
        "--image",
        "{input}",
        "--output",
        "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_model_path() -> String {
    "runs/garbage_detection/taco_model/weights/best.pt".to_string()
}

fn default_fallback_model() -> String {
    "yolov8n.pt".to_string()
}

fn default_worker_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent() -> usize {
    1
}

fn default_threshold() -> f64 {
    0.4
}

fn default_notifier_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_notifier_path() -> String {
    "/api/requests".to_string()
}

fn default_request_user_id() -> String {
    "000000000000000000000001".to_string()
}

fn default_notifier_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/triage").required(false))
            .add_source(config::File::with_name("/etc/litterwatch/triage").required(false))
            // Override with environment variables
            // TRIAGE__API__PORT -> api.port
            .add_source(
                config::Environment::with_prefix("TRIAGE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("api.cors_origins")
                    .with_list_parse_key("inference.args"),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.api.max_upload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_upload_bytes".to_string(),
                message: "Upload limit must be greater than 0".to_string(),
            });
        }

        if self.storage.temp_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("storage.temp_dir".to_string()));
        }
        if self.storage.results_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.results_dir".to_string(),
            ));
        }
        if self.storage.temp_dir == self.storage.results_dir {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.results_dir".to_string(),
                message: "Temporary and results directories must differ".to_string(),
            });
        }

        if self.inference.program.is_empty() {
            return Err(ConfigValidationError::MissingField("inference.program".to_string()));
        }
        if !self.inference.args.iter().any(|a| a.contains("{input}")) {
            return Err(ConfigValidationError::InvalidValue {
                field: "inference.args".to_string(),
                message: "Arguments must reference the {input} image".to_string(),
            });
        }
        if self.inference.max_concurrent == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "inference.max_concurrent".to_string(),
                message: "At least one worker slot is required".to_string(),
            });
        }
        if self.inference.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "inference.timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.triage.threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "triage.threshold".to_string(),
                message: "Threshold must be within [0, 1]".to_string(),
            });
        }

        if self.notifier.enabled && self.notifier.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField("notifier.base_url".to_string()));
        }

        Ok(())
    }

    /// Get worker timeout as Duration
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.inference.timeout_secs)
    }
}

impl InferenceConfig {
    /// Model reference handed to the worker.
    ///
    /// Falls back to the pretrained model when the trained weights are absent.
    pub fn resolve_model(&self) -> String {
        if Path::new(&self.model_path).exists() {
            self.model_path.clone()
        } else {
            tracing::warn!(
                model_path = %self.model_path,
                fallback = %self.fallback_model,
                "Trained model not found, using pretrained model"
            );
            self.fallback_model.clone()
        }
    }
}

impl NotifierConfig {
    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Full task creation URL
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            max_upload_bytes: default_max_upload_bytes(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            results_dir: default_results_dir(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: default_worker_args(),
            model_path: default_model_path(),
            fallback_model: default_fallback_model(),
            timeout_secs: default_worker_timeout_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_notifier_base_url(),
            path: default_notifier_path(),
            request_user_id: default_request_user_id(),
            timeout_secs: default_notifier_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            api: ApiConfig::default(),
            storage: StorageConfig::default(),
            inference: InferenceConfig::default(),
            triage: TriageConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}
