//! Compiler configuration.

use serde::Deserialize;

use crate::error::CompileResult;

/// Compiler configuration loaded from environment variables.
///
/// Environment variables are prefixed with `AGENTPILOT_COMPILER_`:
/// - `AGENTPILOT_COMPILER_DEFAULT_MAX_RESULTS`: result cap injected into
///   source reads whose schema declares `max_results` (default: 100)
/// - `AGENTPILOT_COMPILER_DEFAULT_MAX_CONCURRENCY`: scatter bound when the
///   IR gives none (default: 5)
/// - `AGENTPILOT_COMPILER_DEDUP_KEY_DELIMITER`: composite key joiner (default: "|")
/// - `AGENTPILOT_COMPILER_VALIDATE_OUTPUT`: run the step graph validator on
///   every compiled workflow (default: true)
/// - `AGENTPILOT_COMPILER_AUTO_FIX`: apply mechanical repairs (default: true)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompilerConfig {
    #[serde(default = "default_max_results")]
    pub default_max_results: u64,

    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    #[serde(default = "default_delimiter")]
    pub dedup_key_delimiter: String,

    #[serde(default = "default_true")]
    pub validate_output: bool,

    #[serde(default = "default_true")]
    pub auto_fix: bool,
}

fn default_max_results() -> u64 {
    100
}

fn default_max_concurrency() -> usize {
    5
}

fn default_delimiter() -> String {
    "|".to_string()
}

fn default_true() -> bool {
    true
}

impl CompilerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> CompileResult<Self> {
        Ok(envy::prefixed("AGENTPILOT_COMPILER_").from_env::<CompilerConfig>()?)
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            default_max_results: default_max_results(),
            default_max_concurrency: default_max_concurrency(),
            dedup_key_delimiter: default_delimiter(),
            validate_output: true,
            auto_fix: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CompilerConfig::default();
        assert_eq!(config.default_max_results, 100);
        assert_eq!(config.default_max_concurrency, 5);
        assert_eq!(config.dedup_key_delimiter, "|");
        assert!(config.validate_output);
        assert!(config.auto_fix);
    }

    #[test]
    fn test_config_from_iter() {
        let vars = vec![
            ("DEFAULT_MAX_CONCURRENCY".to_string(), "3".to_string()),
            ("AUTO_FIX".to_string(), "false".to_string()),
        ];
        let config: CompilerConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.default_max_concurrency, 3);
        assert!(!config.auto_fix);
        assert_eq!(config.default_max_results, 100);
    }
}
