#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::Mutex;

use rustic_agent::{
    AgentModel, Model, ModelError, ModelEventStream, ModelMessage, ModelRequestParameters,
    ModelResponse, ModelSettings, ModelStreamEvent, ToolArgs, Usage,
};

#[derive(Debug, Default)]
struct Feeds {
    batches: VecDeque<Vec<Result<ModelStreamEvent, ModelError>>>,
    requests: Vec<Vec<ModelMessage>>,
}

/// Streams one queued batch of events per request.
#[derive(Clone, Debug)]
pub struct StreamedModel {
    name: String,
    feeds: Arc<Mutex<Feeds>>,
}

impl StreamedModel {
    pub fn new(name: impl Into<String>, batches: Vec<Vec<ModelStreamEvent>>) -> Self {
        let batches = batches
            .into_iter()
            .map(|batch| batch.into_iter().map(Ok).collect())
            .collect();
        Self {
            name: name.into(),
            feeds: Arc::new(Mutex::new(Feeds {
                batches,
                ..Default::default()
            })),
        }
    }

    pub async fn push_batch(&self, batch: Vec<Result<ModelStreamEvent, ModelError>>) {
        self.feeds.lock().await.batches.push_back(batch);
    }

    pub async fn request_count(&self) -> usize {
        self.feeds.lock().await.requests.len()
    }

    pub async fn requests(&self) -> Vec<Vec<ModelMessage>> {
        self.feeds.lock().await.requests.clone()
    }
}

#[async_trait]
impl Model for StreamedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn agent_model(
        &self,
        _params: ModelRequestParameters,
    ) -> Result<Box<dyn AgentModel>, ModelError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl AgentModel for StreamedModel {
    async fn request(
        &self,
        _messages: &[ModelMessage],
        _settings: Option<&ModelSettings>,
    ) -> Result<(ModelResponse, Usage), ModelError> {
        Err(ModelError::Unsupported(
            "streamed model does not support buffered requests".to_string(),
        ))
    }

    async fn request_stream(
        &self,
        messages: &[ModelMessage],
        _settings: Option<&ModelSettings>,
    ) -> Result<ModelEventStream, ModelError> {
        let mut feeds = self.feeds.lock().await;
        feeds.requests.push(messages.to_vec());
        let batch = feeds.batches.pop_front().ok_or_else(|| {
            ModelError::Unsupported("streamed model has no queued batches".to_string())
        })?;
        Ok(Box::pin(stream::iter(batch)))
    }
}

pub fn text(content: &str) -> ModelStreamEvent {
    ModelStreamEvent::text(content)
}

pub fn tool_call(name: &str, args: &str, id: &str) -> ModelStreamEvent {
    ModelStreamEvent::ToolCall {
        vendor_part_id: Some(id.to_string()),
        tool_name: name.to_string(),
        args: ToolArgs::Json(args.to_string()),
        tool_call_id: Some(id.to_string()),
    }
}

/// A fragment of tool call arguments for the part keyed by `id`.
pub fn args_delta(id: &str, name: Option<&str>, args: &str) -> ModelStreamEvent {
    ModelStreamEvent::ToolCallDelta {
        vendor_part_id: Some(id.to_string()),
        tool_name: name.map(str::to_string),
        args: Some(ToolArgs::Json(args.to_string())),
        tool_call_id: name.map(|_| id.to_string()),
    }
}

pub fn usage(request_tokens: u64, response_tokens: u64) -> ModelStreamEvent {
    ModelStreamEvent::Usage(Usage::new(request_tokens, response_tokens))
}
