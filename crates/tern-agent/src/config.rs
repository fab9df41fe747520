//! Engine configuration file support

use std::{fs, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tern_ai::{BoxedLlm, RetryConfig, RetryingLlm};

use crate::{
    agent::AgentConfig,
    condenser::{Condenser, LlmSummarizingCondenser, SummarizingConfig},
    error::{Error, Result},
};

/// Usage id under which the summarizing condenser reports its calls
pub const CONDENSER_USAGE_ID: &str = "condenser";

/// Configuration for one engine instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub agent: AgentConfig,
    pub condenser: CondenserSettings,
    pub delegation: DelegationConfig,
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondenserSettings {
    /// Attach a summarizing condenser to new conversations
    pub enabled: bool,
    pub max_size: usize,
    pub keep_first: usize,
    pub max_tokens: Option<usize>,
}

impl Default for CondenserSettings {
    fn default() -> Self {
        let summarizing = SummarizingConfig::default();
        Self {
            enabled: true,
            max_size: summarizing.max_size,
            keep_first: summarizing.keep_first,
            max_tokens: summarizing.max_tokens,
        }
    }
}

impl CondenserSettings {
    pub fn summarizing(&self) -> SummarizingConfig {
        SummarizingConfig {
            max_size: self.max_size,
            keep_first: self.keep_first,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Upper bound on live sub-agents per manager
    pub max_children: usize,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self { max_children: 5 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: Option<u64>,
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            return Err(Error::InvalidConfig(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.delegation.max_children == 0 {
            return Err(Error::InvalidConfig(
                "delegation.max_children must be at least 1".into(),
            ));
        }
        if self.llm.timeout_ms == Some(0) {
            return Err(Error::InvalidConfig("llm.timeout_ms must be positive".into()));
        }
        if self.llm.retry.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "llm.retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.condenser.enabled {
            self.condenser.summarizing().validate()?;
        }
        Ok(())
    }

    /// Wrap a model with the configured retry policy and timeout
    pub fn wrap_llm(&self, llm: BoxedLlm) -> BoxedLlm {
        let mut retrying = RetryingLlm::new(llm, self.llm.retry.clone());
        if let Some(ms) = self.llm.timeout_ms {
            retrying = retrying.with_timeout(Duration::from_millis(ms));
        }
        Arc::new(retrying)
    }

    /// The configured condenser, if enabled. Summaries are requested under
    /// [`CONDENSER_USAGE_ID`].
    pub fn build_condenser(&self, llm: &BoxedLlm) -> Result<Option<Arc<dyn Condenser>>> {
        if !self.condenser.enabled {
            return Ok(None);
        }
        let condenser = LlmSummarizingCondenser::new(
            llm.with_usage_id(CONDENSER_USAGE_ID),
            self.condenser.summarizing(),
        )?;
        Ok(Some(Arc::new(condenser)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLlm;
    use tern_ai::Llm;

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.condenser.enabled);
        assert_eq!(config.condenser.max_size, 120);
        assert_eq!(config.condenser.keep_first, 4);
        assert_eq!(config.delegation.max_children, 5);
        assert_eq!(config.agent.max_iterations, 500);
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
[agent]
max_iterations = 20
confirmation_mode = true

[condenser]
max_size = 40
keep_first = 2
max_tokens = 8000

[delegation]
max_children = 2

[llm]
timeout_ms = 30000

[llm.retry]
max_retries = 1
"#,
        )
        .unwrap();
        assert_eq!(config.agent.max_iterations, 20);
        assert!(config.agent.confirmation_mode);
        assert!(config.agent.stuck_detection);
        assert_eq!(config.condenser.summarizing().max_tokens, Some(8000));
        assert_eq!(config.delegation.max_children, 2);
        assert_eq!(config.llm.timeout_ms, Some(30000));
        assert_eq!(config.llm.retry.max_retries, 1);
    }

    #[test]
    fn test_condenser_invariant_enforced() {
        let err = EngineConfig::from_toml_str("[condenser]\nmax_size = 10\nkeep_first = 4\n")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        // Disabled condensers are not checked
        assert!(
            EngineConfig::from_toml_str(
                "[condenser]\nenabled = false\nmax_size = 10\nkeep_first = 4\n"
            )
            .is_ok()
        );
    }

    #[test]
    fn test_rejects_zero_bounds_and_bad_toml() {
        assert!(EngineConfig::from_toml_str("[agent]\nmax_iterations = 0\n").is_err());
        assert!(EngineConfig::from_toml_str("[delegation]\nmax_children = 0\n").is_err());
        assert!(EngineConfig::from_toml_str("[llm]\ntimeout_ms = 0\n").is_err());
        assert!(EngineConfig::from_toml_str("[agent\n").is_err());
    }

    #[test]
    fn test_toml_roundtrip_preserves_settings() {
        let mut config = EngineConfig::default();
        config.condenser.max_tokens = Some(1000);
        config.llm.timeout_ms = Some(500);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = EngineConfig::load("/nonexistent/tern/config.toml").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_build_condenser_respects_enabled() {
        let llm: BoxedLlm = Arc::new(ScriptedLlm::new());
        let config = EngineConfig::default();
        let condenser = config.build_condenser(&llm).unwrap().unwrap();
        assert!(condenser.handles_condensation_requests());

        let mut disabled = EngineConfig::default();
        disabled.condenser.enabled = false;
        assert!(disabled.build_condenser(&llm).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrap_llm_keeps_identity() {
        let scripted = ScriptedLlm::new();
        let config = EngineConfig::default();
        let wrapped = config.wrap_llm(Arc::new(scripted.clone()));
        assert_eq!(wrapped.model(), "scripted");
        let completion = wrapped
            .complete(&tern_ai::CompletionRequest::new(vec![]))
            .await
            .unwrap();
        assert_eq!(completion.id, "resp-default");
        assert_eq!(scripted.requests().len(), 1);
    }
}
