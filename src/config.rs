use serde::{Deserialize, Serialize};

use crate::agent::EndStrategy;
use crate::error::AgentError;
use crate::model::ModelSettings;

/// Serializable agent configuration, applied with [`crate::Agent::with_settings`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub name: Option<String>,
    /// Default retry budget for tools.
    pub retries: u32,
    /// Retry budget for result validation; falls back to `retries`.
    pub result_retries: Option<u32>,
    pub end_strategy: EndStrategy,
    /// Upper bound on tool calls running at once; `None` runs a step's calls
    /// all together.
    pub tool_concurrency: Option<usize>,
    pub model_settings: Option<ModelSettings>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: None,
            retries: 1,
            result_retries: None,
            end_strategy: EndStrategy::Early,
            tool_concurrency: None,
            model_settings: None,
        }
    }
}

impl AgentSettings {
    pub fn from_json_str(raw: &str) -> Result<Self, AgentError> {
        let settings: Self = serde_json::from_str(raw)
            .map_err(|err| AgentError::Config(format!("invalid agent settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.tool_concurrency == Some(0) {
            return Err(AgentError::Config(
                "tool_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
