//! Ambient configuration: the knobs in `plugin.toml` plus the filesystem
//! layout root. Parsed with `toml`, the same crate the recipe/prompt/model
//! descriptors use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config_loader::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrallConfig {
    pub loop_threshold: u32,
    pub loop_threshold_sessionless: u32,
    pub knock_threshold: u32,
    pub classification_ttl_days: u32,
    pub queue_timeout_seconds: f64,
    /// Budget for the action stage alone, summed with the queue and inference
    /// timeouts to derive a recipe run's overall wall-clock timeout (§5).
    pub action_timeout_seconds: f64,
    pub max_body_preview: usize,
    pub max_counter_entries: usize,
    pub reply_window_seconds: u64,
    pub prune_interval_seconds: u64,
    pub cockpit_url: Option<String>,
}

impl Default for ThrallConfig {
    fn default() -> Self {
        Self {
            loop_threshold: 2,
            loop_threshold_sessionless: 5,
            knock_threshold: 10,
            classification_ttl_days: 30,
            queue_timeout_seconds: 5.0,
            action_timeout_seconds: 10.0,
            max_body_preview: 2000,
            max_counter_entries: 10_000,
            reply_window_seconds: 1800,
            prune_interval_seconds: 3600,
            cockpit_url: None,
        }
    }
}

impl ThrallConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ThrallConfig =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(plugin_dir: &Path) -> Result<Self, ConfigError> {
        let path = plugin_dir.join("plugin.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_timeout_seconds <= 0.0 {
            return Err(ConfigError::ValidationError {
                field: "queue_timeout_seconds".into(),
                message: "must be positive".into(),
            });
        }
        if self.action_timeout_seconds <= 0.0 {
            return Err(ConfigError::ValidationError {
                field: "action_timeout_seconds".into(),
                message: "must be positive".into(),
            });
        }
        if let Some(url) = &self.cockpit_url {
            url::Url::parse(url).map_err(|e| ConfigError::ValidationError {
                field: "cockpit_url".into(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn breakers_dir(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir.join("breakers")
    }

    pub fn artifacts_dir(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir.join("artifacts")
    }

    pub fn reload_sentinel(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir.join("thrall.reload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configuration_surface() {
        let c = ThrallConfig::default();
        assert_eq!(c.loop_threshold, 2);
        assert_eq!(c.loop_threshold_sessionless, 5);
        assert_eq!(c.knock_threshold, 10);
        assert_eq!(c.classification_ttl_days, 30);
        assert_eq!(c.queue_timeout_seconds, 5.0);
        assert_eq!(c.action_timeout_seconds, 10.0);
        assert_eq!(c.max_body_preview, 2000);
        assert_eq!(c.max_counter_entries, 10_000);
        assert_eq!(c.reply_window_seconds, 1800);
        assert_eq!(c.prune_interval_seconds, 3600);
    }

    #[test]
    fn rejects_nonpositive_queue_timeout() {
        let err = ThrallConfig::from_toml_str("queue_timeout_seconds = 0.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn rejects_nonpositive_action_timeout() {
        let err = ThrallConfig::from_toml_str("action_timeout_seconds = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn rejects_malformed_cockpit_url() {
        let err = ThrallConfig::from_toml_str("cockpit_url = \"not a url\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn missing_plugin_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = ThrallConfig::load(dir.path()).unwrap();
        assert_eq!(c.loop_threshold, 2);
    }
}
