//! Configuration Management
//!
//! Engine tuning knobs, loadable from a config file with sane defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Engine configuration. All fields optional in the file; unset fields take
/// the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Retry cap for transient provider errors.
    pub max_retries: u32,
    /// Base of the exponential backoff between retries.
    pub base_backoff_ms: u64,
    /// Global ceiling on in-flight API calls across all scopes.
    pub max_concurrent_calls: usize,
    /// How many scopes orchestrate concurrently.
    pub max_concurrent_scopes: usize,
    /// How many rows hydrate concurrently within one scope.
    pub hydration_concurrency: usize,
    /// Page size requested from list endpoints.
    pub page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 250,
            max_concurrent_calls: 32,
            max_concurrent_scopes: 8,
            hydration_concurrency: 4,
            page_size: 200,
        }
    }
}

impl EngineConfig {
    /// Get the default config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("qgcp").join("config.json"))
    }

    /// Load configuration from the given path, or the default location.
    /// A missing or unreadable file yields the defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::config_path() {
                Some(p) => p,
                None => return Self::default(),
            },
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!("Invalid config at {:?}, using defaults: {}", path, err);
                    Self::default()
                },
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_concurrent_calls, 32);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"maxRetries": 2, "baseBackoffMs": 100}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_backoff_ms, 100);
        assert_eq!(config.max_concurrent_scopes, 8);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = EngineConfig::load(Some(Path::new("/nonexistent/config.json")));
        assert_eq!(config.page_size, 200);
    }
}
