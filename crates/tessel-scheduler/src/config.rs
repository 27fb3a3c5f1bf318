//! Scheduler configuration, loaded from TOML.
//!
//! ```toml
//! blocked_evals = "create"
//! plan_conflict = "refresh"
//! max_plan_attempts = 3
//! region = "global"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use tessel_state::DEFAULT_REGION;

use crate::error::{SchedulerError, SchedulerResult};

/// Whether an evaluation that could not place everything creates a
/// blocked follow-up evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedEvalPolicy {
    /// Failures are only reported on the evaluation itself.
    #[default]
    Disabled,
    Create,
}

/// What to do when the applier reports a commit-time conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Mark the evaluation failed.
    Fail,
    /// Re-read state and rerun the evaluation, up to `max_plan_attempts`.
    #[default]
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub blocked_evals: BlockedEvalPolicy,
    pub plan_conflict: ConflictPolicy,
    /// Total plan submissions allowed per evaluation.
    pub max_plan_attempts: u32,
    /// Region used for quota limits when a job does not name one.
    pub region: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            blocked_evals: BlockedEvalPolicy::default(),
            plan_conflict: ConflictPolicy::default(),
            max_plan_attempts: 5,
            region: DEFAULT_REGION.to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scheduler config {}", path.display()))?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn from_toml_str(content: &str) -> SchedulerResult<Self> {
        let config: SchedulerConfig =
            toml::from_str(content).map_err(|e| SchedulerError::Config(e.to_string()))?;
        if config.region.is_empty() {
            return Err(SchedulerError::Config("region must not be empty".to_string()));
        }
        Ok(config)
    }

    /// `max_plan_attempts`, never less than one.
    pub fn max_attempts(&self) -> u32 {
        self.max_plan_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.blocked_evals, BlockedEvalPolicy::Disabled);
        assert_eq!(config.plan_conflict, ConflictPolicy::Refresh);
        assert_eq!(config.max_plan_attempts, 5);
        assert_eq!(config.region, "global");
    }

    #[test]
    fn parse_partial_toml() {
        let config = SchedulerConfig::from_toml_str("blocked_evals = \"create\"\n").unwrap();
        assert_eq!(config.blocked_evals, BlockedEvalPolicy::Create);
        assert_eq!(config.plan_conflict, ConflictPolicy::Refresh);
        assert_eq!(config.max_plan_attempts, 5);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
            blocked_evals = "disabled"
            plan_conflict = "fail"
            max_plan_attempts = 0
            region = "eu"
        "#;
        let config = SchedulerConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.plan_conflict, ConflictPolicy::Fail);
        assert_eq!(config.region, "eu");
        assert_eq!(config.max_attempts(), 1);
    }

    #[test]
    fn rejects_bad_values() {
        let err = SchedulerConfig::from_toml_str("plan_conflict = \"retry\"").unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
        let err = SchedulerConfig::from_toml_str("region = \"\"").unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_plan_attempts = 2").unwrap();
        let config = SchedulerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_plan_attempts, 2);
    }

    #[test]
    fn toml_roundtrip() {
        let config = SchedulerConfig {
            blocked_evals: BlockedEvalPolicy::Create,
            ..SchedulerConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(SchedulerConfig::from_toml_str(&text).unwrap(), config);
    }
}
