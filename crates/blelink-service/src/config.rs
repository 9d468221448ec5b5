//! Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Radio defaults applied when a request omits them.
    pub ble: BleConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// This checks:
    /// - Server bind address is `host:port` with a non-zero port
    /// - Scan timeout is 1-30 seconds and connect timeout is 1-60 seconds
    /// - Stream interval is at least 50 ms and the stream buffer is non-zero
    ///
    /// # Example
    ///
    /// ```
    /// use blelink_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.ble.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError::new("server.bind", "bind address cannot be empty"));
            return errors;
        }

        match self.bind.rsplit_once(':') {
            None => errors.push(ValidationError::new(
                "server.bind",
                format!(
                    "invalid bind address '{}': expected format 'host:port'",
                    self.bind
                ),
            )),
            Some((_, port)) => match port.parse::<u16>() {
                Ok(0) => errors.push(ValidationError::new("server.bind", "port cannot be 0")),
                Ok(_) => {}
                Err(_) => errors.push(ValidationError::new(
                    "server.bind",
                    format!("invalid port '{}': must be a number 1-65535", port),
                )),
            },
        }

        errors
    }
}

/// Minimum scan timeout in seconds.
pub const MIN_SCAN_TIMEOUT_SECS: f64 = 1.0;
/// Maximum scan timeout in seconds.
pub const MAX_SCAN_TIMEOUT_SECS: f64 = 30.0;
/// Minimum connect timeout in seconds.
pub const MIN_CONNECT_TIMEOUT_SECS: f64 = 1.0;
/// Maximum connect timeout in seconds.
pub const MAX_CONNECT_TIMEOUT_SECS: f64 = 60.0;
/// Minimum streaming interval in milliseconds.
pub const MIN_STREAM_INTERVAL_MS: u64 = 50;

/// Radio defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Scan duration when a request gives none.
    pub scan_timeout_secs: f64,
    /// Connect timeout when a request gives none.
    pub connect_timeout_secs: f64,
    /// Streaming interval when a request gives none.
    pub stream_interval_ms: u64,
    /// Batches buffered per stream before the poller waits on the socket.
    pub stream_buffer: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 5.0,
            connect_timeout_secs: 10.0,
            stream_interval_ms: 250,
            stream_buffer: 16,
        }
    }
}

impl BleConfig {
    /// Default scan duration.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.scan_timeout_secs)
    }

    /// Default connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    /// Validate radio defaults.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(MIN_SCAN_TIMEOUT_SECS..=MAX_SCAN_TIMEOUT_SECS).contains(&self.scan_timeout_secs) {
            errors.push(ValidationError::new(
                "ble.scan_timeout_secs",
                format!(
                    "scan timeout {} is out of range ({}-{} seconds)",
                    self.scan_timeout_secs, MIN_SCAN_TIMEOUT_SECS, MAX_SCAN_TIMEOUT_SECS
                ),
            ));
        }

        if !(MIN_CONNECT_TIMEOUT_SECS..=MAX_CONNECT_TIMEOUT_SECS).contains(&self.connect_timeout_secs)
        {
            errors.push(ValidationError::new(
                "ble.connect_timeout_secs",
                format!(
                    "connect timeout {} is out of range ({}-{} seconds)",
                    self.connect_timeout_secs, MIN_CONNECT_TIMEOUT_SECS, MAX_CONNECT_TIMEOUT_SECS
                ),
            ));
        }

        if self.stream_interval_ms < MIN_STREAM_INTERVAL_MS {
            errors.push(ValidationError::new(
                "ble.stream_interval_ms",
                format!(
                    "stream interval {} is too short (minimum {} ms)",
                    self.stream_interval_ms, MIN_STREAM_INTERVAL_MS
                ),
            ));
        }

        if self.stream_buffer == 0 {
            errors.push(ValidationError::new(
                "ble.stream_buffer",
                "stream buffer must be greater than 0",
            ));
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `ble.stream_buffer`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blelink")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.ble.scan_timeout_secs, 5.0);
        assert_eq!(config.ble.connect_timeout_secs, 10.0);
        assert_eq!(config.ble.stream_interval_ms, 250);
        assert_eq!(config.ble.stream_buffer, 16);
    }

    #[test]
    fn test_ble_config_durations() {
        let config = BleConfig {
            scan_timeout_secs: 2.5,
            ..Default::default()
        };
        assert_eq!(config.scan_timeout(), Duration::from_millis(2500));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [ble]
            stream_interval_ms = 100
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.ble.stream_interval_ms, 100);
        assert_eq!(config.ble.scan_timeout_secs, 5.0);
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9000"

            [ble]
            scan_timeout_secs = 8.0
            connect_timeout_secs = 20.0
            stream_interval_ms = 500
            stream_buffer = 4
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.ble.scan_timeout_secs, 8.0);
        assert_eq!(config.ble.connect_timeout_secs, 20.0);
        assert_eq!(config.ble.stream_interval_ms, 500);
        assert_eq!(config.ble.stream_buffer, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("server.toml");

        let config = Config {
            server: ServerConfig {
                bind: "0.0.0.0:9090".to_string(),
            },
            ble: BleConfig {
                scan_timeout_secs: 3.0,
                connect_timeout_secs: 15.0,
                stream_interval_ms: 75,
                stream_buffer: 8,
            },
        };

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();

        assert_eq!(loaded.server.bind, "0.0.0.0:9090");
        assert_eq!(loaded.ble.scan_timeout_secs, 3.0);
        assert_eq!(loaded.ble.connect_timeout_secs, 15.0);
        assert_eq!(loaded.ble.stream_interval_ms, 75);
        assert_eq!(loaded.ble.stream_buffer, 8);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("blelink/server.toml"));
    }

    #[test]
    fn test_default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_server_bind_validation() {
        let cases = [
            ("", false),
            ("localhost", false),
            ("127.0.0.1:0", false),
            ("127.0.0.1:http", false),
            ("127.0.0.1:8080", true),
            ("[::1]:8080", true),
        ];
        for (bind, valid) in cases {
            let config = ServerConfig {
                bind: bind.to_string(),
            };
            assert_eq!(config.validate().is_empty(), valid, "bind = {bind:?}");
        }
    }

    #[test]
    fn test_ble_validation_collects_every_error() {
        let config = Config {
            ble: BleConfig {
                scan_timeout_secs: 0.5,
                connect_timeout_secs: 61.0,
                stream_interval_ms: 10,
                stream_buffer: 0,
            },
            ..Default::default()
        };

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation failure");
        };
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "ble.scan_timeout_secs",
                "ble.connect_timeout_secs",
                "ble.stream_interval_ms",
                "ble.stream_buffer"
            ]
        );
    }

    #[test]
    fn test_ble_validation_bounds_are_inclusive() {
        let config = BleConfig {
            scan_timeout_secs: 30.0,
            connect_timeout_secs: 1.0,
            stream_interval_ms: 50,
            stream_buffer: 1,
        };
        assert!(config.validate().is_empty());

        let nan = BleConfig {
            scan_timeout_secs: f64::NAN,
            ..Default::default()
        };
        assert_eq!(nan.validate().len(), 1);
    }

    #[test]
    fn test_config_validation_error_display() {
        let error = ConfigError::Validation(vec![
            ValidationError::new("server.bind", "port cannot be 0"),
            ValidationError::new("ble.stream_buffer", "stream buffer must be greater than 0"),
        ]);
        let display = error.to_string();
        assert!(display.starts_with("Configuration validation failed:"));
        assert!(display.contains("  - server.bind: port cannot be 0"));
        assert!(display.contains("  - ble.stream_buffer: stream buffer must be greater than 0"));
    }
}
