use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:9200";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FORCE_MERGE_TIMEOUT_SECS: u64 = 60 * 60;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_force_merge_timeout_secs() -> u64 {
    DEFAULT_FORCE_MERGE_TIMEOUT_SECS
}

/// Where the engine lives and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL, e.g. `"http://es-1:9200"`.
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Force-merge blocks until done, which can take far longer than any
    /// other request.
    #[serde(default = "default_force_merge_timeout_secs")]
    pub force_merge_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            url: DEFAULT_ENGINE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            force_merge_timeout_secs: DEFAULT_FORCE_MERGE_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    /// Load from `{config_dir}/engine.json`, or from `BATTER_ENGINE_URL` and
    /// `BATTER_ENGINE_TIMEOUT_SECS` when there is no usable file.
    pub fn load_or_default(config_dir: &Path) -> Self {
        let engine_json = config_dir.join("engine.json");

        if engine_json.exists() {
            match std::fs::read_to_string(&engine_json) {
                Ok(content) => match serde_json::from_str::<EngineConfig>(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded engine config: url={}", config.url);
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse engine.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read engine.json: {}, using defaults", e);
                }
            }
        }

        let config = Self::from_env();
        tracing::info!("No engine.json found, using url={}", config.url);
        config
    }

    pub fn from_env() -> Self {
        let url = std::env::var("BATTER_ENGINE_URL")
            .unwrap_or_else(|_| DEFAULT_ENGINE_URL.to_string());
        let timeout_secs = std::env::var("BATTER_ENGINE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|s: &u64| *s > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        EngineConfig {
            url,
            timeout_secs,
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn force_merge_timeout(&self) -> Duration {
        Duration::from_secs(self.force_merge_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        std::env::remove_var("BATTER_ENGINE_URL");
        std::env::remove_var("BATTER_ENGINE_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_load_or_default_no_file() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_or_default(temp_dir.path());

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.timeout(), Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_load_or_default_valid_file() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(temp_dir.path().join("engine.json")).unwrap();
        file.write_all(br#"{"url": "http://es-1:9200", "timeout_secs": 5}"#)
            .unwrap();

        let config = EngineConfig::load_or_default(temp_dir.path());

        assert_eq!(config.url, "http://es-1:9200");
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.force_merge_timeout_secs, DEFAULT_FORCE_MERGE_TIMEOUT_SECS);
    }

    #[test]
    #[serial]
    fn test_load_or_default_invalid_json_falls_back_to_env() {
        clear_env();
        std::env::set_var("BATTER_ENGINE_URL", "http://es-env:9200");
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("engine.json"), "invalid json").unwrap();

        let config = EngineConfig::load_or_default(temp_dir.path());

        assert_eq!(config.url, "http://es-env:9200");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_bad_timeout() {
        clear_env();
        std::env::set_var("BATTER_ENGINE_TIMEOUT_SECS", "0");
        assert_eq!(EngineConfig::from_env().timeout_secs, DEFAULT_TIMEOUT_SECS);
        clear_env();
    }
}
