use serde::{Deserialize, Serialize};
use std::path::Path;
use woolsync_kernel::StateLimits;
use woolsync_persist::VersionControlConfig;

use crate::resolver::{StrategyRule, default_rules};

/// Errors from loading a [`SyncConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("strategy rule {0} has an empty pattern")]
    EmptyPattern(usize),
}

/// Engine settings. Every field has a default, so a config file only needs
/// to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub limits: StateLimits,
    /// How far ahead of the engine clock a timestamp may be before it is
    /// flagged as skewed.
    pub max_clock_skew_ms: u64,
    pub strategies: Vec<StrategyRule>,
    pub version_control: VersionControlConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            limits: StateLimits::default(),
            max_clock_skew_ms: 300_000,
            strategies: default_rules(),
            version_control: VersionControlConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(input)?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&input)
    }

    fn check(&self) -> Result<(), ConfigError> {
        match self.strategies.iter().position(|r| r.pattern.is_empty()) {
            Some(index) => Err(ConfigError::EmptyPattern(index)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ResolutionStrategy;

    #[test]
    fn empty_document_yields_defaults() {
        let config = SyncConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.limits.max_building_level, 1000);
        assert_eq!(config.version_control.default_branch, "main");
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let yaml = r#"
max_clock_skew_ms: 1000
limits:
  max_building_level: 50
strategies:
  - pattern: "buildings.*"
    strategy: manual
version_control:
  auto_snapshot_every: 10
"#;
        let config = SyncConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_clock_skew_ms, 1000);
        assert_eq!(config.limits.max_building_level, 50);
        assert_eq!(config.strategies.len(), 1);
        assert_eq!(config.strategies[0].strategy, ResolutionStrategy::Manual);
        assert_eq!(config.version_control.auto_snapshot_every, Some(10));
        assert_eq!(config.version_control.default_branch, "main");
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let yaml = "strategies:\n  - pattern: ''\n    strategy: array-merge\n";
        assert!(matches!(
            SyncConfig::from_yaml_str(yaml),
            Err(ConfigError::EmptyPattern(0))
        ));
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.yaml");
        std::fs::write(&path, "max_clock_skew_ms: 5\n").unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap().max_clock_skew_ms, 5);
    }
}
