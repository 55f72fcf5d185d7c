//! Configuration loading

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::Config;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "RELAYCHAT_CONFIG_PATH";

/// Load configuration from a config file and environment variables
///
/// Config file search order:
/// 1. `explicit` (the `--config` flag, which clap also fills from `RELAYCHAT_CONFIG_PATH`)
/// 2. ./config.yaml (current working directory)
/// 3. Fall back to environment variables only
///
/// Logging is not initialized yet when this runs, so progress goes to stderr.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config_path = resolve_config_path(explicit);

    let config = if let Some(path) = config_path {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file {} does not exist", path.display()));
        }
        eprintln!("Loading config from {}", path.display());
        Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", path.display()))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env()?
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let cwd = Path::new("config.yaml");
    if cwd.exists() {
        Some(cwd.to_path_buf())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let resolved = resolve_config_path(Some(Path::new("/etc/relaychat.yaml")));
        assert_eq!(resolved, Some(PathBuf::from("/etc/relaychat.yaml")));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.yaml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "logging:\n  format: xml\n").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }

    #[test]
    fn test_valid_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server:\n  port: 0\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 0);
    }
}
