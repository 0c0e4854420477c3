//! Engine configuration.

use serde::Deserialize;

use crate::error::{EngineResult, ExecutionError};

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `AGENTPILOT_ENGINE_`:
/// - `AGENTPILOT_ENGINE_DEFAULT_MAX_CONCURRENCY`: scatter bound when a step
///   declares none (default: 5)
/// - `AGENTPILOT_ENGINE_MAX_EXPRESSION_OPERATIONS`: rhai operation budget
///   per expression evaluation (default: 100000)
/// - `AGENTPILOT_ENGINE_FAIL_FAST_ACTIONS`: treat every provider error as
///   fatal instead of capturing it (default: false)
/// - `AGENTPILOT_ENGINE_MAX_STEP_CONCURRENCY`: independent steps of one
///   scope run at the same time (default: 16)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    #[serde(default = "default_max_expression_operations")]
    pub max_expression_operations: u64,

    #[serde(default)]
    pub fail_fast_actions: bool,

    #[serde(default = "default_max_step_concurrency")]
    pub max_step_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_max_expression_operations() -> u64 {
    100_000
}

fn default_max_step_concurrency() -> usize {
    16
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> EngineResult<Self> {
        envy::prefixed("AGENTPILOT_ENGINE_")
            .from_env::<EngineConfig>()
            .map_err(|e| ExecutionError::Config(e.to_string()))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: default_max_concurrency(),
            max_expression_operations: default_max_expression_operations(),
            fail_fast_actions: false,
            max_step_concurrency: default_max_step_concurrency(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_concurrency, 5);
        assert_eq!(config.max_expression_operations, 100_000);
        assert!(!config.fail_fast_actions);
        assert_eq!(config.max_step_concurrency, 16);
    }

    #[test]
    fn test_config_from_iter() {
        let vars = vec![
            ("FAIL_FAST_ACTIONS".to_string(), "true".to_string()),
            ("DEFAULT_MAX_CONCURRENCY".to_string(), "2".to_string()),
        ];
        let config: EngineConfig = envy::from_iter(vars).unwrap();
        assert!(config.fail_fast_actions);
        assert_eq!(config.default_max_concurrency, 2);
        assert_eq!(config.max_step_concurrency, 16);
    }
}
