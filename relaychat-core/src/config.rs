use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
}

/// Default cap on one inbound WebSocket message: 100 MiB
pub const DEFAULT_MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 lets the OS pick a free port
    pub port: u16,
    /// Operator safety cap on one inbound WebSocket message, in bytes.
    /// Chat text is not length-checked below this cap.
    pub max_frame_bytes: usize,
    /// How long shutdown waits for the listener task after closing connections
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            shutdown_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON document holding the full message log
    pub messages_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            messages_path: PathBuf::from("messages.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay a message to live connections even when writing it to disk failed
    pub broadcast_on_persist_failure: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broadcast_on_persist_failure: true,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if path.exists() {
                builder = builder.add_source(File::from(path));
            }
        }

        // RELAYCHAT_SERVER__PORT, RELAYCHAT_STORAGE__MESSAGES_PATH, ...
        builder = builder.add_source(
            Environment::with_prefix("RELAYCHAT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Listening address for the WebSocket endpoint
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check for misconfigurations. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.max_frame_bytes == 0 {
            errors.push("server.max_frame_bytes must be greater than 0".to_string());
        }
        if self.storage.messages_path.as_os_str().is_empty() {
            errors.push("storage.messages_path must not be empty".to_string());
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format '{}' must be 'json' or 'pretty'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_frame_bytes, 100 * 1024 * 1024);
        assert_eq!(config.storage.messages_path, PathBuf::from("messages.json"));
        assert!(config.relay.broadcast_on_persist_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9001,
                ..ServerConfig::default()
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:9001");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = Config {
            server: ServerConfig {
                host: String::new(),
                max_frame_bytes: 0,
                ..ServerConfig::default()
            },
            storage: StorageConfig {
                messages_path: PathBuf::new(),
            },
            logging: LoggingConfig {
                level: "loud".to_string(),
                format: "xml".to_string(),
                file_path: None,
            },
            relay: RelayConfig::default(),
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_port_zero_is_allowed() {
        let config = Config {
            server: ServerConfig {
                port: 0,
                ..ServerConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9100\nstorage:\n  messages_path: /var/lib/relaychat/log.json\nrelay:\n  broadcast_on_persist_failure: false\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(
            config.storage.messages_path,
            PathBuf::from("/var/lib/relaychat/log.json")
        );
        assert!(!config.relay.broadcast_on_persist_failure);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.storage.messages_path, PathBuf::from("messages.json"));
    }
}
