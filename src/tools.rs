use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{AgentError, RetryTarget};
use crate::messages::{
    ModelMessage, RetryPromptPart, ToolCallPart, ToolReturnPart, ValidationErrorRecord,
};
use crate::model::Model;
use crate::schema::{CompiledSchema, json_parse_error};
use crate::usage::Usage;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Function,
    Result,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters_json_schema: Value,
    pub kind: ToolKind,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        parameters_json_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            parameters_json_schema,
            kind: ToolKind::Function,
        }
    }

    pub fn with_kind(mut self, kind: ToolKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Snapshot of the run handed to tools, prepare hooks, system prompt
/// functions and result validators. The run loop owns the live state.
pub struct RunContext<Deps> {
    pub run_id: String,
    pub deps: Arc<Deps>,
    pub model: Arc<dyn Model>,
    pub usage: Usage,
    pub prompt: Arc<str>,
    pub messages: Arc<Vec<ModelMessage>>,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    /// Retries already spent by the tool (or result) this context was built for.
    pub retry: u32,
    pub run_step: u64,
}

impl<Deps> Clone for RunContext<Deps> {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id.clone(),
            deps: Arc::clone(&self.deps),
            model: Arc::clone(&self.model),
            usage: self.usage.clone(),
            prompt: Arc::clone(&self.prompt),
            messages: Arc::clone(&self.messages),
            tool_name: self.tool_name.clone(),
            tool_call_id: self.tool_call_id.clone(),
            retry: self.retry,
            run_step: self.run_step,
        }
    }
}

impl<Deps> fmt::Debug for RunContext<Deps> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("model", &self.model.name())
            .field("usage", &self.usage)
            .field("messages", &self.messages.len())
            .field("tool_name", &self.tool_name)
            .field("tool_call_id", &self.tool_call_id)
            .field("retry", &self.retry)
            .field("run_step", &self.run_step)
            .finish_non_exhaustive()
    }
}

impl<Deps> RunContext<Deps> {
    pub fn for_tool_call(
        &self,
        tool_name: impl Into<String>,
        tool_call_id: Option<String>,
        retry: u32,
    ) -> Self {
        let mut ctx = self.clone();
        ctx.tool_name = Some(tool_name.into());
        ctx.tool_call_id = tool_call_id;
        ctx.retry = retry;
        ctx
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }
}

pub type PrepareFuture = BoxFuture<'static, Result<Option<ToolDefinition>, ToolError>>;

#[async_trait]
pub trait Tool<Deps>: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Per-tool retry budget; `None` uses the agent default.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Called before every model request. Returning `None` hides the tool for
    /// that step; returning a different definition replaces it.
    fn prepare(&self, _ctx: RunContext<Deps>, definition: ToolDefinition) -> PrepareFuture {
        Box::pin(async move { Ok(Some(definition)) })
    }

    async fn call(&self, ctx: RunContext<Deps>, args: Value) -> Result<Value, ToolError>;
}

type ToolHandler<Deps> =
    dyn Fn(RunContext<Deps>, Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

type PrepareHandler<Deps> = dyn Fn(RunContext<Deps>, ToolDefinition) -> PrepareFuture + Send + Sync;

pub struct FunctionTool<Deps> {
    definition: ToolDefinition,
    handler: Arc<ToolHandler<Deps>>,
    prepare: Option<Arc<PrepareHandler<Deps>>>,
    max_retries: Option<u32>,
}

impl<Deps> FunctionTool<Deps>
where
    Deps: Send + Sync + 'static,
{
    pub fn new<Args, Output, Func, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        func: Func,
    ) -> Result<Self, ToolError>
    where
        Args: DeserializeOwned + JsonSchema + Send + 'static,
        Output: Serialize + Send + 'static,
        Func: Fn(RunContext<Deps>, Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Output, ToolError>> + Send + 'static,
    {
        let schema = schemars::schema_for!(Args);
        let parameters_json_schema = serde_json::to_value(&schema).map_err(ToolError::Serde)?;

        let func = Arc::new(func);
        let handler = Arc::new(move |ctx: RunContext<Deps>, args: Value| {
            let parsed = serde_json::from_value(args).map_err(ToolError::InvalidArgs);
            let func = Arc::clone(&func);
            let fut = async move {
                let parsed = parsed?;
                let output = func(ctx, parsed).await?;
                let value = serde_json::to_value(output).map_err(ToolError::Serde)?;
                Ok(value)
            };
            Box::pin(fut) as BoxFuture<'static, Result<Value, ToolError>>
        });

        Ok(Self {
            definition: ToolDefinition::new(
                name,
                Some(description.into()),
                parameters_json_schema,
            ),
            handler,
            prepare: None,
            max_retries: None,
        })
    }

    /// Builds a tool from a hand-written parameter schema and an untyped handler.
    pub fn from_schema<Func, Fut>(
        name: impl Into<String>,
        description: Option<String>,
        parameters_json_schema: Value,
        func: Func,
    ) -> Self
    where
        Func: Fn(RunContext<Deps>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let handler = Arc::new(move |ctx: RunContext<Deps>, args: Value| {
            Box::pin(func(ctx, args)) as BoxFuture<'static, Result<Value, ToolError>>
        });
        Self {
            definition: ToolDefinition::new(name, description, parameters_json_schema),
            handler,
            prepare: None,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    pub fn with_prepare<Func, Fut>(mut self, func: Func) -> Self
    where
        Func: Fn(RunContext<Deps>, ToolDefinition) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<ToolDefinition>, ToolError>>
            + Send
            + 'static,
    {
        self.prepare = Some(Arc::new(
            move |ctx: RunContext<Deps>, definition: ToolDefinition| {
                Box::pin(func(ctx, definition)) as PrepareFuture
            },
        ));
        self
    }
}

#[async_trait]
impl<Deps> Tool<Deps> for FunctionTool<Deps>
where
    Deps: Send + Sync + 'static,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn prepare(&self, ctx: RunContext<Deps>, definition: ToolDefinition) -> PrepareFuture {
        match &self.prepare {
            Some(prepare) => prepare(ctx, definition),
            None => Box::pin(async move { Ok(Some(definition)) }),
        }
    }

    async fn call(&self, ctx: RunContext<Deps>, args: Value) -> Result<Value, ToolError> {
        (self.handler)(ctx, args).await
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    /// Asks the model to try again; the message is sent back as a retry prompt.
    #[error("model retry requested: {0}")]
    ModelRetry(String),
    #[error("invalid tool arguments: {0}")]
    InvalidArgs(serde_json::Error),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("serialization error: {0}")]
    Serde(serde_json::Error),
}

impl ToolError {
    pub fn retry(message: impl Into<String>) -> Self {
        ToolError::ModelRetry(message.into())
    }
}

/// What a single tool invocation produced, before the run loop folds it into
/// the run's retry counters.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Return(ToolReturnPart),
    Retry(RetryPromptPart),
}

/// A registered tool together with its compiled parameter schema.
pub(crate) struct ToolRunner<Deps> {
    tool: Arc<dyn Tool<Deps>>,
    schema: CompiledSchema,
}

impl<Deps> Clone for ToolRunner<Deps> {
    fn clone(&self) -> Self {
        Self {
            tool: Arc::clone(&self.tool),
            schema: self.schema.clone(),
        }
    }
}

impl<Deps> ToolRunner<Deps>
where
    Deps: Send + Sync + 'static,
{
    pub(crate) fn new(tool: Arc<dyn Tool<Deps>>) -> Result<Self, AgentError> {
        let definition = tool.definition();
        let schema = CompiledSchema::compile(&definition.parameters_json_schema)
            .map_err(|err| AgentError::Config(format!("tool '{}': {err}", definition.name)))?;
        Ok(Self { tool, schema })
    }

    pub(crate) fn tool(&self) -> &Arc<dyn Tool<Deps>> {
        &self.tool
    }

    pub(crate) fn max_retries(&self, default_retries: u32) -> u32 {
        self.tool.max_retries().unwrap_or(default_retries)
    }

    /// Decodes and validates the arguments, then calls the tool.
    ///
    /// `current_retry` is the number of retries this tool has already used in
    /// the run; a retry that would go past `max_retries` is fatal.
    pub(crate) async fn run(
        &self,
        call: &ToolCallPart,
        ctx: RunContext<Deps>,
        current_retry: u32,
        max_retries: u32,
    ) -> Result<ToolOutcome, AgentError> {
        let args = match call.args_as_value() {
            Ok(args) => args,
            Err(err) => {
                let record = json_parse_error(&call.args_as_json_str(), &err);
                let retry = RetryPromptPart::errors(vec![record]);
                return self.retry(call, retry, current_retry, max_retries);
            }
        };
        if let Err(errors) = self.schema.validate(&args) {
            let retry = RetryPromptPart::errors(errors);
            return self.retry(call, retry, current_retry, max_retries);
        }

        let ctx = ctx.for_tool_call(
            call.tool_name.clone(),
            call.tool_call_id.clone(),
            current_retry,
        );
        match self.tool.call(ctx, args).await {
            Ok(content) => Ok(ToolOutcome::Return(ToolReturnPart::new(
                call.tool_name.clone(),
                content,
                call.tool_call_id.clone(),
            ))),
            Err(ToolError::ModelRetry(message)) => {
                let retry = RetryPromptPart::text(message);
                self.retry(call, retry, current_retry, max_retries)
            }
            Err(ToolError::InvalidArgs(err)) => {
                let record = ValidationErrorRecord::new(Vec::new(), err.to_string(), "value_error");
                let retry = RetryPromptPart::errors(vec![record]);
                self.retry(call, retry, current_retry, max_retries)
            }
            Err(err) => Err(AgentError::Tool(err)),
        }
    }

    fn retry(
        &self,
        call: &ToolCallPart,
        part: RetryPromptPart,
        current_retry: u32,
        max_retries: u32,
    ) -> Result<ToolOutcome, AgentError> {
        if current_retry + 1 > max_retries {
            return Err(AgentError::RetriesExceeded {
                target: RetryTarget::Tool(call.tool_name.clone()),
                max_retries,
            });
        }
        Ok(ToolOutcome::Retry(
            part.for_call(call.tool_name.clone(), call.tool_call_id.clone()),
        ))
    }
}
