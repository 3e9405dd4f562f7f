#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use rustic_agent::{
    AgentModel, Model, ModelError, ModelMessage, ModelRequestParameters, ModelResponse,
    ModelSettings, Usage,
};

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<ModelResponse>,
    requests: Vec<Vec<ModelMessage>>,
    params: Vec<ModelRequestParameters>,
    settings: Vec<Option<ModelSettings>>,
}

/// Replays queued responses in order and records what each request saw.
#[derive(Clone, Debug)]
pub struct ScriptedModel {
    name: String,
    usage: Usage,
    script: Arc<Mutex<Script>>,
}

impl ScriptedModel {
    pub fn new(name: impl Into<String>, responses: Vec<ModelResponse>) -> Self {
        Self {
            name: name.into(),
            usage: Usage::new(10, 5),
            script: Arc::new(Mutex::new(Script {
                responses: VecDeque::from(responses),
                ..Default::default()
            })),
        }
    }

    /// Usage reported for every request.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub async fn push_response(&self, response: ModelResponse) {
        self.script.lock().await.responses.push_back(response);
    }

    pub async fn request_count(&self) -> usize {
        self.script.lock().await.requests.len()
    }

    pub async fn requests(&self) -> Vec<Vec<ModelMessage>> {
        self.script.lock().await.requests.clone()
    }

    pub async fn params(&self) -> Vec<ModelRequestParameters> {
        self.script.lock().await.params.clone()
    }

    pub async fn settings(&self) -> Vec<Option<ModelSettings>> {
        self.script.lock().await.settings.clone()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn agent_model(
        &self,
        params: ModelRequestParameters,
    ) -> Result<Box<dyn AgentModel>, ModelError> {
        self.script.lock().await.params.push(params);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl AgentModel for ScriptedModel {
    async fn request(
        &self,
        messages: &[ModelMessage],
        settings: Option<&ModelSettings>,
    ) -> Result<(ModelResponse, Usage), ModelError> {
        let mut script = self.script.lock().await;
        script.requests.push(messages.to_vec());
        script.settings.push(settings.cloned());
        let response = script.responses.pop_front().ok_or_else(|| {
            ModelError::Unsupported("scripted model has no queued responses".to_string())
        })?;
        Ok((response, self.usage.clone()))
    }
}
