//! A model backed by local closures.
//!
//! Useful for tests and demos: the closure sees the full message list and the
//! tools available for the step, and returns the response the "model" gives.
//! Token usage is estimated by counting words.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;

use crate::messages::{ModelMessage, ModelRequestPart, ModelResponse, ModelResponsePart};
use crate::model::{
    AgentModel, Model, ModelError, ModelEventStream, ModelRequestParameters, ModelSettings,
    ModelStreamEvent,
};
use crate::tools::ToolDefinition;
use crate::usage::Usage;

/// What the closure is told about the current step.
#[derive(Clone, Debug, Default)]
pub struct AgentInfo {
    pub function_tools: Vec<ToolDefinition>,
    pub allow_text_result: bool,
    pub result_tools: Vec<ToolDefinition>,
    pub model_settings: Option<ModelSettings>,
}

pub type FunctionDef = Arc<
    dyn Fn(Vec<ModelMessage>, AgentInfo) -> BoxFuture<'static, Result<ModelResponse, ModelError>>
        + Send
        + Sync,
>;

pub type StreamFunctionDef =
    Arc<dyn Fn(Vec<ModelMessage>, AgentInfo) -> Result<ModelEventStream, ModelError> + Send + Sync>;

#[derive(Clone)]
pub struct FunctionModel {
    name: String,
    function: Option<FunctionDef>,
    stream_function: Option<StreamFunctionDef>,
}

impl FunctionModel {
    pub fn new<Func, Fut>(func: Func) -> Self
    where
        Func: Fn(Vec<ModelMessage>, AgentInfo) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ModelResponse, ModelError>> + Send + 'static,
    {
        Self {
            name: "function".to_string(),
            function: Some(wrap_function(func)),
            stream_function: None,
        }
    }

    /// A model that only supports streamed requests.
    pub fn streaming<Func>(func: Func) -> Self
    where
        Func: Fn(Vec<ModelMessage>, AgentInfo) -> Result<ModelEventStream, ModelError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: "function".to_string(),
            function: None,
            stream_function: Some(Arc::new(func)),
        }
    }

    pub fn with_stream<Func>(mut self, func: Func) -> Self
    where
        Func: Fn(Vec<ModelMessage>, AgentInfo) -> Result<ModelEventStream, ModelError>
            + Send
            + Sync
            + 'static,
    {
        self.stream_function = Some(Arc::new(func));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

fn wrap_function<Func, Fut>(func: Func) -> FunctionDef
where
    Func: Fn(Vec<ModelMessage>, AgentInfo) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<ModelResponse, ModelError>> + Send + 'static,
{
    Arc::new(move |messages: Vec<ModelMessage>, info: AgentInfo| {
        Box::pin(func(messages, info)) as BoxFuture<'static, Result<ModelResponse, ModelError>>
    })
}

#[async_trait]
impl Model for FunctionModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn agent_model(
        &self,
        params: ModelRequestParameters,
    ) -> Result<Box<dyn AgentModel>, ModelError> {
        Ok(Box::new(FunctionAgentModel {
            model: self.clone(),
            info: AgentInfo {
                function_tools: params.function_tools,
                allow_text_result: params.allow_text_result,
                result_tools: params.result_tools,
                model_settings: None,
            },
        }))
    }
}

struct FunctionAgentModel {
    model: FunctionModel,
    info: AgentInfo,
}

impl FunctionAgentModel {
    fn info(&self, settings: Option<&ModelSettings>) -> AgentInfo {
        let mut info = self.info.clone();
        info.model_settings = settings.cloned();
        info
    }
}

#[async_trait]
impl AgentModel for FunctionAgentModel {
    async fn request(
        &self,
        messages: &[ModelMessage],
        settings: Option<&ModelSettings>,
    ) -> Result<(ModelResponse, Usage), ModelError> {
        let Some(function) = &self.model.function else {
            return Err(ModelError::Unsupported(format!(
                "model '{}' only supports streamed requests",
                self.model.name
            )));
        };
        let mut response = function(messages.to_vec(), self.info(settings)).await?;
        if response.model_name.is_none() {
            response.model_name = Some(self.model.name.clone());
        }

        let mut all = messages.to_vec();
        all.push(ModelMessage::Response(response.clone()));
        Ok((response, estimate_usage(&all)))
    }

    async fn request_stream(
        &self,
        messages: &[ModelMessage],
        settings: Option<&ModelSettings>,
    ) -> Result<ModelEventStream, ModelError> {
        let Some(stream_function) = &self.model.stream_function else {
            return Err(ModelError::Unsupported(format!(
                "model '{}' does not support streamed requests",
                self.model.name
            )));
        };
        let mut inner = stream_function(messages.to_vec(), self.info(settings))?;
        let request_tokens = estimate_usage(messages).request_tokens;

        let stream = try_stream! {
            let mut response_tokens = 0;
            while let Some(event) = inner.next().await {
                let event = event?;
                response_tokens += event_tokens(&event);
                yield event;
            }
            yield ModelStreamEvent::Usage(Usage::new(request_tokens, response_tokens));
        };
        Ok(Box::pin(stream))
    }
}

/// Rough token count: 50 for framing plus one per word of every message.
fn estimate_usage(messages: &[ModelMessage]) -> Usage {
    let mut request_tokens = 50;
    let mut response_tokens = 0;
    for message in messages {
        match message {
            ModelMessage::Request(request) => {
                for part in &request.parts {
                    request_tokens += match part {
                        ModelRequestPart::SystemPrompt(part) => estimate_string_tokens(&part.content),
                        ModelRequestPart::UserPrompt(part) => estimate_string_tokens(&part.content),
                        ModelRequestPart::ToolReturn(part) => {
                            estimate_string_tokens(&part.model_response_str())
                        }
                        ModelRequestPart::RetryPrompt(part) => {
                            estimate_string_tokens(&part.model_response())
                        }
                    };
                }
            }
            ModelMessage::Response(response) => {
                for part in &response.parts {
                    response_tokens += match part {
                        ModelResponsePart::Text(text) => estimate_string_tokens(&text.content),
                        ModelResponsePart::ToolCall(call) => {
                            1 + estimate_string_tokens(&call.args_as_json_str())
                        }
                    };
                }
            }
        }
    }
    Usage::new(request_tokens, response_tokens)
}

fn event_tokens(event: &ModelStreamEvent) -> u64 {
    match event {
        ModelStreamEvent::TextDelta { content, .. } => estimate_string_tokens(content),
        ModelStreamEvent::ToolCallDelta { args, .. } => args
            .as_ref()
            .map(|args| estimate_string_tokens(&args.as_json_str()))
            .unwrap_or(0),
        ModelStreamEvent::ToolCall { args, .. } => 1 + estimate_string_tokens(&args.as_json_str()),
        ModelStreamEvent::Usage(_) => 0,
    }
}

fn estimate_string_tokens(content: &str) -> u64 {
    content
        .split(|c: char| c.is_whitespace() || matches!(c, '"' | ',' | '.' | ':'))
        .filter(|word| !word.is_empty())
        .count() as u64
}
