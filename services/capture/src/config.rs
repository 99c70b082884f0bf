//! Configuration management for the capture agent.
//!
//! Everything here is read once at startup; the agent does not reconfigure
//! itself at runtime.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the capture agent.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Device identity
    pub device: DeviceConfig,

    /// Upload server configuration
    pub server: ServerConfig,

    /// Wireless network credentials
    #[serde(default)]
    pub wifi: WifiConfig,

    /// Capture schedule and frame source
    #[serde(default)]
    pub capture: ScheduleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identity.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Identifier used in logs and upload filenames
    pub device_id: String,
}

/// Upload server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Upload endpoint (e.g., "http://192.168.1.20:3000/upload")
    pub upload_url: String,

    /// Upload request timeout in seconds; must outlast server-side detection
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connectivity probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Wireless credentials.
#[derive(Clone, Default, Deserialize)]
pub struct WifiConfig {
    #[serde(default)]
    pub ssid: String,

    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for WifiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiConfig")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Latest still written to disk by the camera daemon
    File,
    /// JPEG snapshot served by the camera over HTTP
    Http,
}

/// Capture schedule and frame source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Fixed capture period in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Resolution of the due-check in milliseconds
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Frame source kind
    #[serde(default = "default_source")]
    pub source: SourceKind,

    /// Still image path for the file source
    #[serde(default = "default_frame_path")]
    pub path: PathBuf,

    /// Snapshot URL for the http source
    #[serde(default)]
    pub url: Option<String>,

    /// Content type attached to uploaded frames
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_request_timeout() -> u64 {
    150
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_interval_ms() -> u64 {
    10_000
}
fn default_poll_ms() -> u64 {
    100
}
fn default_source() -> SourceKind {
    SourceKind::File
}
fn default_frame_path() -> PathBuf {
    PathBuf::from("/tmp/litterwatch/latest.jpg")
}
fn default_content_type() -> String {
    "image/jpeg".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            poll_ms: default_poll_ms(),
            source: default_source(),
            path: default_frame_path(),
            url: None,
            content_type: default_content_type(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CaptureConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Device config (/etc/litterwatch/capture.toml)
    /// 3. Environment variables (prefixed with CAPTURE__)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("/etc/litterwatch/capture").required(false))
            // e.g., CAPTURE__SERVER__UPLOAD_URL
            .add_source(
                Environment::with_prefix("CAPTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.device.device_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "device.device_id".to_string(),
            ));
        }

        if self.server.upload_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "server.upload_url".to_string(),
            ));
        }
        if !self.server.upload_url.starts_with("http://")
            && !self.server.upload_url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.upload_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.capture.interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.interval_ms".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }
        if self.capture.poll_ms == 0 || self.capture.poll_ms > self.capture.interval_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.poll_ms".to_string(),
                message: "Poll resolution must be within (0, interval_ms]".to_string(),
            });
        }

        match self.capture.source {
            SourceKind::File if self.capture.path.as_os_str().is_empty() => {
                return Err(ConfigValidationError::MissingField("capture.path".to_string()));
            }
            SourceKind::Http if self.capture.url.as_deref().unwrap_or("").is_empty() => {
                return Err(ConfigValidationError::MissingField("capture.url".to_string()));
            }
            _ => {}
        }

        Ok(())
    }
}

impl ServerConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get probe timeout as Duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl ScheduleConfig {
    /// Get capture period as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get poll resolution as Duration.
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> CaptureConfig {
        CaptureConfig {
            device: DeviceConfig {
                device_id: "esp32cam-01".to_string(),
            },
            server: ServerConfig {
                upload_url: "http://192.168.1.20:3000/upload".to_string(),
                request_timeout_secs: default_request_timeout(),
                probe_timeout_ms: 2000,
            },
            wifi: WifiConfig {
                ssid: "park-net".to_string(),
                password: "hunter2".to_string(),
            },
            capture: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.interval(), Duration::from_secs(10));
        assert_eq!(config.capture.poll(), Duration::from_millis(100));
    }

    #[test]
    fn test_default_upload_timeout_outlasts_detection() {
        // Server-side detection may take up to 120 s before responding
        let config = create_test_config();
        assert!(config.server.request_timeout() > Duration::from_secs(120));
    }

    #[test]
    fn test_missing_upload_url() {
        let mut config = create_test_config();
        config.server.upload_url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_upload_url() {
        let mut config = create_test_config();
        config.server.upload_url = "ftp://server/upload".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_device_id() {
        let mut config = create_test_config();
        config.device.device_id = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_poll_longer_than_interval() {
        let mut config = create_test_config();
        config.capture.interval_ms = 50;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_http_source_requires_url() {
        let mut config = create_test_config();
        config.capture.source = SourceKind::Http;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));

        config.capture.url = Some("http://camera.local/capture".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wifi_password_redacted() {
        let config = create_test_config();
        let rendered = format!("{:?}", config.wifi);
        assert!(rendered.contains("park-net"));
        assert!(!rendered.contains("hunter2"));
    }
}
