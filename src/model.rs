use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::messages::{ModelMessage, ModelResponse, ToolArgs};
use crate::tools::ToolDefinition;
use crate::usage::Usage;

pub type ModelSettings = Map<String, Value>;

/// Tools and result shape for one step of a run.
#[derive(Clone, Debug, Default)]
pub struct ModelRequestParameters {
    pub function_tools: Vec<ToolDefinition>,
    pub allow_text_result: bool,
    pub result_tools: Vec<ToolDefinition>,
}

impl ModelRequestParameters {
    pub fn new(function_tools: Vec<ToolDefinition>) -> Self {
        Self {
            function_tools,
            allow_text_result: true,
            result_tools: Vec::new(),
        }
    }

    pub fn with_result_tools(mut self, result_tools: Vec<ToolDefinition>) -> Self {
        self.result_tools = result_tools;
        self
    }

    pub fn with_allow_text_result(mut self, allow: bool) -> Self {
        self.allow_text_result = allow;
        self
    }
}

/// One event of a streamed model response, as produced by an adapter.
///
/// `vendor_part_id` is whatever key the vendor uses to correlate fragments of
/// the same part; adapters that have none pass `None`.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelStreamEvent {
    TextDelta {
        vendor_part_id: Option<String>,
        content: String,
    },
    ToolCallDelta {
        vendor_part_id: Option<String>,
        tool_name: Option<String>,
        args: Option<ToolArgs>,
        tool_call_id: Option<String>,
    },
    ToolCall {
        vendor_part_id: Option<String>,
        tool_name: String,
        args: ToolArgs,
        tool_call_id: Option<String>,
    },
    /// Token usage reported so far for this request; summed by the run loop.
    Usage(Usage),
}

impl ModelStreamEvent {
    pub fn text(content: impl Into<String>) -> Self {
        ModelStreamEvent::TextDelta {
            vendor_part_id: None,
            content: content.into(),
        }
    }
}

pub type ModelEventStream =
    Pin<Box<dyn Stream<Item = Result<ModelStreamEvent, ModelError>> + Send>>;

/// A model backend. Each step of a run asks it for an [`AgentModel`]
/// configured with that step's tools.
#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    async fn agent_model(
        &self,
        params: ModelRequestParameters,
    ) -> Result<Box<dyn AgentModel>, ModelError>;
}

#[async_trait]
pub trait AgentModel: Send + Sync {
    async fn request(
        &self,
        messages: &[ModelMessage],
        settings: Option<&ModelSettings>,
    ) -> Result<(ModelResponse, Usage), ModelError>;

    async fn request_stream(
        &self,
        _messages: &[ModelMessage],
        _settings: Option<&ModelSettings>,
    ) -> Result<ModelEventStream, ModelError> {
        Err(ModelError::Unsupported(
            "streaming not supported".to_string(),
        ))
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("http error status: {status}")]
    HttpStatus { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timeout error")]
    Timeout,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
