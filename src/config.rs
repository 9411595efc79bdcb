//! Ambient engine configuration: the small set of recognized keys governing
//! concurrency, timeouts, event history, and storage layout. CLI wiring and
//! config-file discovery are out of scope — this is just the recognized-keys
//! struct and its environment overlay.

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_concurrent_steps: usize,
    pub default_timeout_seconds: u64,
    pub max_event_history: usize,
    pub subscriber_cleanup_interval_seconds: u64,
    pub base_directory: std::path::PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 3,
            default_timeout_seconds: 300,
            max_event_history: 1000,
            subscriber_cleanup_interval_seconds: 300,
            base_directory: std::path::PathBuf::from("projects"),
        }
    }
}

impl EngineConfig {
    /// Overlays `WORKFLOW_MAX_CONCURRENT_STEPS`-style environment variables
    /// on top of the defaults; a key absent or unparseable from the
    /// environment falls back to its default rather than failing outright.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("WORKFLOW_MAX_CONCURRENT_STEPS") {
            config.max_concurrent_steps = value.parse().with_context(|| format!("invalid WORKFLOW_MAX_CONCURRENT_STEPS value: '{value}'"))?;
        }
        if let Ok(value) = std::env::var("WORKFLOW_DEFAULT_TIMEOUT_SECONDS") {
            config.default_timeout_seconds = value.parse().with_context(|| format!("invalid WORKFLOW_DEFAULT_TIMEOUT_SECONDS value: '{value}'"))?;
        }
        if let Ok(value) = std::env::var("WORKFLOW_MAX_EVENT_HISTORY") {
            config.max_event_history = value.parse().with_context(|| format!("invalid WORKFLOW_MAX_EVENT_HISTORY value: '{value}'"))?;
        }
        if let Ok(value) = std::env::var("WORKFLOW_SUBSCRIBER_CLEANUP_INTERVAL_SECONDS") {
            config.subscriber_cleanup_interval_seconds = value
                .parse()
                .with_context(|| format!("invalid WORKFLOW_SUBSCRIBER_CLEANUP_INTERVAL_SECONDS value: '{value}'"))?;
        }
        if let Ok(value) = std::env::var("WORKFLOW_BASE_DIRECTORY") {
            config.base_directory = std::path::PathBuf::from(value);
        }

        if config.max_concurrent_steps == 0 {
            bail_on_zero("max_concurrent_steps")?;
        }
        if config.default_timeout_seconds == 0 {
            bail_on_zero("default_timeout_seconds")?;
        }
        if config.subscriber_cleanup_interval_seconds == 0 {
            bail_on_zero("subscriber_cleanup_interval_seconds")?;
        }

        Ok(config)
    }
}

fn bail_on_zero(field: &str) -> Result<()> {
    anyhow::bail!("{field} must be at least 1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_recognized_key_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_steps, 3);
        assert_eq!(config.default_timeout_seconds, 300);
        assert_eq!(config.max_event_history, 1000);
        assert_eq!(config.subscriber_cleanup_interval_seconds, 300);
        assert_eq!(config.base_directory, std::path::PathBuf::from("projects"));
    }

    #[test]
    fn from_env_overlays_recognized_variables() {
        std::env::set_var("WORKFLOW_MAX_CONCURRENT_STEPS", "8");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.max_concurrent_steps, 8);
        std::env::remove_var("WORKFLOW_MAX_CONCURRENT_STEPS");
    }

    #[test]
    fn from_env_rejects_unparseable_value() {
        std::env::set_var("WORKFLOW_MAX_CONCURRENT_STEPS", "not-a-number");
        let result = EngineConfig::from_env();
        assert!(result.is_err());
        std::env::remove_var("WORKFLOW_MAX_CONCURRENT_STEPS");
    }
}
