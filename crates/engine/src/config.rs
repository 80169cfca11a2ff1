//! Engine configuration, read from a TOML file.
//!
//! ```toml
//! [executor]
//! default_max_iterations = 3
//!
//! [validator]
//! unknown_conditions = "reject"   # or "allow"
//!
//! [dispatch]
//! max_retries = 3
//! retry_base_delay_ms = 100
//! ```
//!
//! Every section and key is optional. Unlike the definition documents, a
//! config file that fails to parse is an error, never a silent default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    EngineError, executor::ExecutorConfig, orchestrator::DispatchConfig,
    validator::ValidatorConfig,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub validator: ValidatorConfig,
    pub dispatch: DispatchConfig,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, EngineError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path`, falling back to defaults when the file does not exist.
    ///
    /// # Errors
    /// [`EngineError::ConfigRead`] if the file exists but cannot be read,
    /// [`EngineError::ConfigParse`] if it is not valid configuration.
    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(EngineError::ConfigRead { path: path.to_path_buf(), source });
            }
        };
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::UnknownConditionPolicy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(&tmp.path().join("stageflow.toml")).await.unwrap();
        assert_eq!(config.executor.default_max_iterations, 3);
        assert_eq!(config.validator.unknown_conditions, UnknownConditionPolicy::Reject);
        assert_eq!(config.dispatch.max_retries, 3);
    }

    #[tokio::test]
    async fn file_values_override_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stageflow.toml");
        tokio::fs::write(
            &path,
            r#"
[executor]
default_max_iterations = 5

[validator]
unknown_conditions = "allow"

[dispatch]
retry_base_delay_ms = 0
"#,
        )
        .await
        .unwrap();

        let config = EngineConfig::load(&path).await.unwrap();
        assert_eq!(config.executor.default_max_iterations, 5);
        assert_eq!(config.validator.unknown_conditions, UnknownConditionPolicy::Allow);
        assert_eq!(config.dispatch.max_retries, 3);
        assert_eq!(config.dispatch.retry_base_delay_ms, 0);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stageflow.toml");
        tokio::fs::write(&path, "this is not { valid toml !!!").await.unwrap();

        assert!(matches!(EngineConfig::load(&path).await, Err(EngineError::ConfigParse(_))));
    }

    #[test]
    fn unknown_section_is_rejected() {
        assert!(EngineConfig::from_toml_str("[executer]\ndefault_max_iterations = 2").is_err());
    }

    #[test]
    fn misspelled_key_inside_a_section_is_rejected() {
        for doc in [
            "[executor]\ndefault_max_iteration = 1",
            "[validator]\nunknown_condition = \"allow\"",
            "[dispatch]\nmax_retry = 0",
        ] {
            assert!(
                matches!(EngineConfig::from_toml_str(doc), Err(EngineError::ConfigParse(_))),
                "{doc} should not parse"
            );
        }
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.executor.default_max_iterations, 3);
    }
}
