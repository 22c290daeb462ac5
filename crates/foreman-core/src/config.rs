use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ForemanError, Result};

fn default_max_concurrent_dispatches() -> usize {
    8
}

fn default_context_ttl_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    600
}

fn default_approval_timeout_secs() -> u64 {
    3600
}

fn default_approvers() -> Vec<String> {
    vec!["financial_manager".to_string()]
}

fn default_event_capacity() -> usize {
    256
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Global cap on concurrently executing worker invocations.
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,

    /// Session contexts older than this are swept by the cleanup task.
    #[serde(default = "default_context_ttl_secs")]
    pub context_ttl_secs: u64,

    /// Interval between context cleanup sweeps.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Approval deadline used when a step declares no timeout of its own.
    #[serde(default = "default_approval_timeout_secs")]
    pub default_approval_timeout_secs: u64,

    /// Approver ids required when a step declares none.
    #[serde(default = "default_approvers")]
    pub default_approvers: Vec<String>,

    /// Broadcast buffer size for the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            context_ttl_secs: default_context_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            default_approval_timeout_secs: default_approval_timeout_secs(),
            default_approvers: default_approvers(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ForemanError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ForemanError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_dispatches, 8);
        assert_eq!(config.context_ttl_secs, 3600);
        assert_eq!(config.default_approvers, vec!["financial_manager"]);
    }

    #[test]
    fn load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        std::fs::write(&path, "max_concurrent_dispatches = 2\n").unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_dispatches, 2);
        // Unspecified fields fall back to defaults
        assert_eq!(config.cleanup_interval_secs, 600);
    }

    #[test]
    fn load_missing_file() {
        let result = OrchestratorConfig::load(Path::new("/nonexistent/foreman.toml"));
        assert!(matches!(result, Err(ForemanError::ConfigNotFound(_))));
    }

    #[test]
    fn load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        std::fs::write(&path, "max_concurrent_dispatches = \"two\"\n").unwrap();

        let result = OrchestratorConfig::load(&path);
        assert!(matches!(result, Err(ForemanError::Config(_))));
    }
}
