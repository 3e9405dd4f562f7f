use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AgentSettings;
use crate::error::{AgentError, RetryTarget};
use crate::instrumentation::{
    Instrumenter, ModelRequestInfo, ModelResponseInfo, NoopInstrumenter, RetryInfo, RunEndInfo,
    RunErrorInfo, RunStartInfo, ToolCallInfo,
};
use crate::messages::{
    ModelMessage, ModelRequest, ModelRequestPart, ModelResponse, ModelResponsePart,
    RetryPromptPart, SystemPromptPart, ToolCallPart, ToolReturnPart, UserPromptPart,
    messages_to_json,
};
use crate::model::{AgentModel, Model, ModelRequestParameters, ModelSettings};
use crate::result::{ResultSchema, ResultValidatorFn};
use crate::tools::{RunContext, Tool, ToolError, ToolOutcome, ToolRunner};
use crate::usage::{Usage, UsageLimits};

pub mod stream;

pub use stream::StreamedRunResult;

const PLAIN_TEXT_NOT_ALLOWED: &str =
    "Plain text responses are not permitted, please call one of the functions instead.";
const TOOL_NOT_EXECUTED: &str = "Tool not executed - a final result was already processed.";
const RESULT_TOOL_NOT_USED: &str = "Result tool not used - a final result was already processed.";
const FINAL_RESULT_PROCESSED: &str = "Final result processed.";
const EMPTY_RESPONSE: &str = "Received empty model response";

/// What happens to the other tool calls of a response that produced the final result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndStrategy {
    /// Skip them; each gets a canned tool return.
    #[default]
    Early,
    /// Run them anyway.
    Exhaustive,
}

pub type SystemPromptFn<Deps> =
    Arc<dyn Fn(RunContext<Deps>) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync>;

enum SystemPrompt<Deps> {
    Static(String),
    Function(SystemPromptFn<Deps>),
    /// Re-evaluated when a history containing its output is replayed.
    Dynamic {
        name: String,
        func: SystemPromptFn<Deps>,
    },
}

pub struct Agent<Deps, Output = String> {
    model: Arc<dyn Model>,
    name: Option<String>,
    system_prompts: Vec<SystemPrompt<Deps>>,
    tools: Vec<ToolRunner<Deps>>,
    result_schema: ResultSchema<Output>,
    result_validators: Vec<ResultValidatorFn<Deps, Output>>,
    retries: u32,
    result_retries: Option<u32>,
    end_strategy: EndStrategy,
    tool_concurrency: Option<usize>,
    model_settings: Option<ModelSettings>,
    instrumenter: Arc<dyn Instrumenter>,
}

impl<Deps> Agent<Deps, String>
where
    Deps: Send + Sync + 'static,
{
    /// An agent whose result is the model's plain text.
    pub fn new(model: Arc<dyn Model>) -> Self {
        Self::with_result_schema(model, ResultSchema::text())
    }
}

impl<Deps, Output> Agent<Deps, Output>
where
    Deps: Send + Sync + 'static,
    Output: DeserializeOwned + Send + 'static,
{
    pub fn with_result_schema(model: Arc<dyn Model>, result_schema: ResultSchema<Output>) -> Self {
        Self {
            model,
            name: None,
            system_prompts: Vec::new(),
            tools: Vec::new(),
            result_schema,
            result_validators: Vec::new(),
            retries: 1,
            result_retries: None,
            end_strategy: EndStrategy::Early,
            tool_concurrency: None,
            model_settings: None,
            instrumenter: Arc::new(NoopInstrumenter),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompts.push(SystemPrompt::Static(prompt.into()));
        self
    }

    pub fn system_prompt_fn<Func, Fut>(mut self, func: Func) -> Self
    where
        Func: Fn(RunContext<Deps>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        self.system_prompts
            .push(SystemPrompt::Function(boxed_prompt_fn(func)));
        self
    }

    /// A system prompt recomputed whenever a history carrying it is passed
    /// back into a run.
    pub fn dynamic_system_prompt<Func, Fut>(mut self, name: impl Into<String>, func: Func) -> Self
    where
        Func: Fn(RunContext<Deps>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        self.system_prompts.push(SystemPrompt::Dynamic {
            name: name.into(),
            func: boxed_prompt_fn(func),
        });
        self
    }

    pub fn result_validator<Func, Fut>(mut self, func: Func) -> Self
    where
        Func: Fn(RunContext<Deps>, Output) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Output, ToolError>> + Send + 'static,
    {
        self.result_validators.push(Arc::new(
            move |ctx: RunContext<Deps>, output: Output| {
                Box::pin(func(ctx, output)) as BoxFuture<'static, Result<Output, ToolError>>
            },
        ));
        self
    }

    /// Default retry budget for tools that don't set their own.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn result_retries(mut self, retries: u32) -> Self {
        self.result_retries = Some(retries);
        self
    }

    pub fn end_strategy(mut self, end_strategy: EndStrategy) -> Self {
        self.end_strategy = end_strategy;
        self
    }

    pub fn tool_concurrency(mut self, limit: usize) -> Self {
        self.tool_concurrency = Some(limit.max(1));
        self
    }

    pub fn model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = Some(settings);
        self
    }

    pub fn instrumenter(mut self, instrumenter: Arc<dyn Instrumenter>) -> Self {
        self.instrumenter = instrumenter;
        self
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Result<Self, AgentError> {
        settings.validate()?;
        if settings.name.is_some() {
            self.name = settings.name;
        }
        self.retries = settings.retries;
        self.result_retries = settings.result_retries;
        self.end_strategy = settings.end_strategy;
        self.tool_concurrency = settings.tool_concurrency;
        if settings.model_settings.is_some() {
            self.model_settings = settings.model_settings;
        }
        Ok(self)
    }

    pub fn tool(&mut self, tool: impl Tool<Deps> + 'static) -> Result<(), AgentError> {
        let name = tool.definition().name;
        if self.runner(&name).is_some() || self.result_schema.is_result_tool(&name) {
            return Err(AgentError::Config(format!("tool name conflicts: '{name}'")));
        }
        self.tools.push(ToolRunner::new(Arc::new(tool))?);
        Ok(())
    }

    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub async fn run(&self, input: RunInput<Deps>) -> Result<AgentRunResult<Output>, AgentError> {
        let mut state = self.new_state(input);
        match self.run_steps(&mut state).await {
            Ok(data) => {
                self.report_end(&state);
                Ok(state.into_result(data))
            }
            Err(err) => {
                self.report_error(&state, &err);
                Err(err)
            }
        }
    }

    async fn run_steps(&self, state: &mut RunState<Deps>) -> Result<Output, AgentError> {
        self.start_messages(state).await?;
        self.report_start(state, false);
        loop {
            let step = self.prepare_step(state).await?;
            state.usage_limits.check_before_request(&state.usage)?;
            self.report_request(state, &step, false);

            let started = Instant::now();
            let (mut response, request_usage) = step
                .model
                .request(&state.messages, state.model_settings.as_ref())
                .await?;
            if response.model_name.is_none() {
                response.model_name = Some(self.model.name().to_string());
            }
            state.usage.incr(&request_usage, 1);
            state.usage_limits.check_tokens(&state.usage)?;
            state.messages.push(ModelMessage::Response(response.clone()));
            self.report_response(state, &response, started, false);

            if let Some(data) = self.handle_response(state, &response, &step.tool_names).await? {
                return Ok(data);
            }
        }
    }

    fn new_state(&self, input: RunInput<Deps>) -> RunState<Deps> {
        let RunInput {
            prompt,
            message_history,
            deps,
            usage_limits,
            model_settings,
            run_id,
        } = input;
        RunState {
            run_id: run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            deps: Arc::new(deps),
            prompt: Arc::from(prompt),
            new_message_index: message_history.len(),
            messages: message_history,
            usage: Usage::default(),
            usage_limits,
            model_settings: merge_settings(self.model_settings.as_ref(), model_settings),
            tool_retries: HashMap::new(),
            result_retries: 0,
            run_step: 0,
            started: Instant::now(),
        }
    }

    /// System prompts are only sent at the start of a conversation; a replayed
    /// history keeps its own, with dynamic ones recomputed.
    async fn start_messages(&self, state: &mut RunState<Deps>) -> Result<(), AgentError> {
        let user_prompt = ModelRequestPart::UserPrompt(UserPromptPart::new(&*state.prompt));
        if state.messages.is_empty() {
            let mut parts = Vec::with_capacity(self.system_prompts.len() + 1);
            for prompt in &self.system_prompts {
                let part = match prompt {
                    SystemPrompt::Static(content) => SystemPromptPart::new(content.clone()),
                    SystemPrompt::Function(func) => {
                        SystemPromptPart::new(func(state.context(&self.model)).await?)
                    }
                    SystemPrompt::Dynamic { name, func } => SystemPromptPart {
                        content: func(state.context(&self.model)).await?,
                        dynamic_ref: Some(name.clone()),
                    },
                };
                parts.push(ModelRequestPart::SystemPrompt(part));
            }
            parts.push(user_prompt);
            state.messages.push(ModelMessage::Request(ModelRequest::new(parts)));
        } else {
            self.refresh_dynamic_prompts(state).await?;
            state
                .messages
                .push(ModelMessage::Request(ModelRequest::new(vec![user_prompt])));
        }
        Ok(())
    }

    async fn refresh_dynamic_prompts(&self, state: &mut RunState<Deps>) -> Result<(), AgentError> {
        let mut stale = Vec::new();
        for (message_index, message) in state.messages.iter().enumerate() {
            let ModelMessage::Request(request) = message else {
                continue;
            };
            for (part_index, part) in request.parts.iter().enumerate() {
                if let ModelRequestPart::SystemPrompt(prompt) = part
                    && let Some(dynamic_ref) = &prompt.dynamic_ref
                    && let Some(func) = self.dynamic_prompt(dynamic_ref)
                {
                    stale.push((message_index, part_index, func));
                }
            }
        }

        for (message_index, part_index, func) in stale {
            let content = func(state.context(&self.model)).await?;
            if let Some(ModelMessage::Request(request)) = state.messages.get_mut(message_index)
                && let Some(ModelRequestPart::SystemPrompt(prompt)) =
                    request.parts.get_mut(part_index)
            {
                prompt.content = content;
            }
        }
        Ok(())
    }

    fn dynamic_prompt(&self, dynamic_ref: &str) -> Option<SystemPromptFn<Deps>> {
        self.system_prompts.iter().find_map(|prompt| match prompt {
            SystemPrompt::Dynamic { name, func } if name == dynamic_ref => Some(Arc::clone(func)),
            _ => None,
        })
    }

    /// Starts a step: runs prepare hooks and asks the model for a per-step
    /// agent model configured with the surviving tools.
    async fn prepare_step(&self, state: &mut RunState<Deps>) -> Result<Step, AgentError> {
        state.run_step += 1;
        let ctx = state.context(&self.model);
        let mut function_tools = Vec::with_capacity(self.tools.len());
        for runner in &self.tools {
            let definition = runner.tool().definition();
            let name = definition.name.clone();
            match runner.tool().prepare(ctx.clone(), definition).await? {
                Some(prepared) => function_tools.push(prepared),
                None => debug!(tool = name.as_str(), step = state.run_step, "tool hidden for step"),
            }
        }
        let tool_names = function_tools.iter().map(|def| def.name.clone()).collect();
        let params = ModelRequestParameters::new(function_tools)
            .with_allow_text_result(self.result_schema.allow_text_result())
            .with_result_tools(self.result_schema.tool_defs());
        let tool_count = params.function_tools.len();
        let model = self.model.agent_model(params).await?;
        Ok(Step {
            model,
            tool_names,
            tool_count,
        })
    }

    /// Classifies a buffered response. Returns the final result, or `None`
    /// after appending the request that answers the response.
    async fn handle_response(
        &self,
        state: &mut RunState<Deps>,
        response: &ModelResponse,
        tool_names: &[String],
    ) -> Result<Option<Output>, AgentError> {
        let calls = response.tool_calls();
        if !calls.is_empty() {
            return self.handle_tool_calls(state, &calls, tool_names).await;
        }

        let texts: Vec<&str> = response
            .parts
            .iter()
            .filter_map(|part| match part {
                ModelResponsePart::Text(text) if text.has_content() => Some(text.content.as_str()),
                _ => None,
            })
            .collect();
        if texts.is_empty() {
            return Err(AgentError::UnexpectedModelBehavior(EMPTY_RESPONSE.to_string()));
        }

        let retry = if self.result_schema.allow_text_result() {
            let candidate = self.result_schema.validate_text(&texts.join("\n\n"));
            match self.validate_result(state, candidate, None).await? {
                Validated::Valid(data) => return Ok(Some(data)),
                Validated::Retry(retry) => retry,
            }
        } else {
            RetryPromptPart::text(PLAIN_TEXT_NOT_ALLOWED)
        };
        let part = self.record_result_retry(state, retry)?;
        state
            .messages
            .push(ModelMessage::Request(ModelRequest::new(vec![part])));
        Ok(None)
    }

    async fn handle_tool_calls(
        &self,
        state: &mut RunState<Deps>,
        calls: &[ToolCallPart],
        tool_names: &[String],
    ) -> Result<Option<Output>, AgentError> {
        let mut slots: Vec<Option<ModelRequestPart>> = vec![None; calls.len()];
        let mut final_result = None;
        let mut result_index = None;
        if let Some((index, call)) = self.result_schema.find_tool(calls) {
            result_index = Some(index);
            let candidate = self.result_schema.validate(call);
            match self.validate_result(state, candidate, Some(call)).await? {
                Validated::Valid(data) => {
                    final_result = Some(data);
                    slots[index] = Some(tool_return(call, FINAL_RESULT_PROCESSED));
                }
                Validated::Retry(retry) => {
                    slots[index] = Some(self.record_result_retry(state, retry)?);
                }
            }
        }

        let parts = self
            .answer_tool_calls(
                state,
                calls,
                tool_names,
                slots,
                result_index,
                final_result.is_some(),
                false,
            )
            .await?;
        if !parts.is_empty() {
            state
                .messages
                .push(ModelMessage::Request(ModelRequest::new(parts)));
        }
        Ok(final_result)
    }

    /// Fills in a part for every call other than the result call, running
    /// function tools as one bounded batch. Parts come back in call order.
    ///
    /// With `detached` the batch runs on its own task so it completes even if
    /// the caller stops polling.
    #[allow(clippy::too_many_arguments)]
    async fn answer_tool_calls(
        &self,
        state: &mut RunState<Deps>,
        calls: &[ToolCallPart],
        tool_names: &[String],
        mut slots: Vec<Option<ModelRequestPart>>,
        result_index: Option<usize>,
        has_final: bool,
        detached: bool,
    ) -> Result<Vec<ModelRequestPart>, AgentError> {
        let mut jobs = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            if Some(index) == result_index {
                continue;
            }
            if self.result_schema.is_result_tool(&call.tool_name) {
                if has_final {
                    slots[index] = Some(tool_return(call, RESULT_TOOL_NOT_USED));
                }
                continue;
            }

            let runner = tool_names
                .iter()
                .any(|name| *name == call.tool_name)
                .then(|| self.runner(&call.tool_name))
                .flatten();
            match runner {
                Some(_) if has_final && self.end_strategy == EndStrategy::Early => {
                    debug!(tool = call.tool_name.as_str(), "skipping tool after final result");
                    slots[index] = Some(tool_return(call, TOOL_NOT_EXECUTED));
                }
                Some(runner) => {
                    let retry = state
                        .tool_retries
                        .get(&call.tool_name)
                        .copied()
                        .unwrap_or(0);
                    self.instrumenter.on_tool_call(&ToolCallInfo {
                        run_id: state.run_id.clone(),
                        tool_name: call.tool_name.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        retry,
                    });
                    jobs.push(ToolJob {
                        index,
                        call: call.clone(),
                        runner: runner.clone(),
                        retry,
                        max_retries: runner.max_retries(self.retries),
                    });
                }
                None => {
                    warn!(tool = call.tool_name.as_str(), "model called an unknown tool");
                    let retry = RetryPromptPart::text(self.unknown_tool_message(
                        &call.tool_name,
                        tool_names,
                    ))
                    .for_call(call.tool_name.clone(), call.tool_call_id.clone());
                    slots[index] = Some(self.record_result_retry(state, retry)?);
                }
            }
        }

        if !jobs.is_empty() {
            let ctx = state.context(&self.model);
            let limit = self.tool_concurrency;
            let dispatched = if detached {
                tokio::spawn(dispatch_tools(jobs, ctx, limit))
                    .await
                    .map_err(|err| {
                        AgentError::Tool(ToolError::Execution(format!(
                            "tool dispatch task failed: {err}"
                        )))
                    })?
            } else {
                dispatch_tools(jobs, ctx, limit).await
            };
            for call in dispatched {
                let index = call.index;
                slots[index] = Some(self.fold_tool_outcome(state, call)?);
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Folds one invocation outcome into the run's per-tool retry counters.
    fn fold_tool_outcome(
        &self,
        state: &mut RunState<Deps>,
        dispatched: DispatchedCall,
    ) -> Result<ModelRequestPart, AgentError> {
        let DispatchedCall {
            tool_name,
            tool_call_id,
            max_retries,
            outcome,
            ..
        } = dispatched;
        match outcome? {
            ToolOutcome::Return(part) => {
                state.tool_retries.remove(&tool_name);
                Ok(ModelRequestPart::ToolReturn(part))
            }
            ToolOutcome::Retry(part) => {
                let count = state.tool_retries.entry(tool_name.clone()).or_insert(0);
                *count += 1;
                let retry = *count;
                self.instrumenter.on_retry(&RetryInfo {
                    run_id: state.run_id.clone(),
                    target: RetryTarget::Tool(tool_name.clone()),
                    tool_call_id,
                    retry,
                    max_retries,
                });
                if retry > max_retries {
                    return Err(AgentError::RetriesExceeded {
                        target: RetryTarget::Tool(tool_name),
                        max_retries,
                    });
                }
                Ok(ModelRequestPart::RetryPrompt(part))
            }
        }
    }

    /// Runs the result validators over a decoded candidate.
    async fn validate_result(
        &self,
        state: &RunState<Deps>,
        candidate: Result<Output, RetryPromptPart>,
        call: Option<&ToolCallPart>,
    ) -> Result<Validated<Output>, AgentError> {
        let mut data = match candidate {
            Ok(data) => data,
            Err(retry) => return Ok(Validated::Retry(retry)),
        };
        let mut ctx = state.context(&self.model).with_retry(state.result_retries);
        if let Some(call) = call {
            ctx.tool_name = Some(call.tool_name.clone());
            ctx.tool_call_id = call.tool_call_id.clone();
        }
        for validator in &self.result_validators {
            match validator(ctx.clone(), data).await {
                Ok(validated) => data = validated,
                Err(ToolError::ModelRetry(message)) => {
                    let mut retry = RetryPromptPart::text(message);
                    if let Some(call) = call {
                        retry = retry.for_call(call.tool_name.clone(), call.tool_call_id.clone());
                    }
                    return Ok(Validated::Retry(retry));
                }
                Err(err) => return Err(AgentError::Tool(err)),
            }
        }
        Ok(Validated::Valid(data))
    }

    fn record_result_retry(
        &self,
        state: &mut RunState<Deps>,
        retry: RetryPromptPart,
    ) -> Result<ModelRequestPart, AgentError> {
        state.result_retries += 1;
        let max_retries = self.max_result_retries();
        self.instrumenter.on_retry(&RetryInfo {
            run_id: state.run_id.clone(),
            target: RetryTarget::Result,
            tool_call_id: retry.tool_call_id.clone(),
            retry: state.result_retries,
            max_retries,
        });
        if state.result_retries > max_retries {
            return Err(AgentError::RetriesExceeded {
                target: RetryTarget::Result,
                max_retries,
            });
        }
        Ok(ModelRequestPart::RetryPrompt(retry))
    }

    fn max_result_retries(&self) -> u32 {
        self.result_retries.unwrap_or(self.retries)
    }

    fn runner(&self, name: &str) -> Option<&ToolRunner<Deps>> {
        self.tools
            .iter()
            .find(|runner| runner.tool().definition().name == name)
    }

    fn unknown_tool_message(&self, name: &str, tool_names: &[String]) -> String {
        let mut names = tool_names.to_vec();
        names.extend(
            self.result_schema
                .tool_defs()
                .into_iter()
                .map(|def| def.name),
        );
        if names.is_empty() {
            format!("Unknown tool name: '{name}'. No tools available.")
        } else {
            format!(
                "Unknown tool name: '{name}'. Available tools: {}",
                names.join(", ")
            )
        }
    }

    fn report_start(&self, state: &RunState<Deps>, streaming: bool) {
        self.instrumenter.on_run_start(&RunStartInfo {
            run_id: state.run_id.clone(),
            model_name: self.model.name().to_string(),
            message_count: state.messages.len(),
            tool_count: self.tools.len(),
            result_tools: self.result_schema.tool_defs().len(),
            allow_text_result: self.result_schema.allow_text_result(),
            streaming,
            usage_limits: state.usage_limits.clone(),
        });
    }

    fn report_request(&self, state: &RunState<Deps>, step: &Step, streaming: bool) {
        self.instrumenter.on_model_request(&ModelRequestInfo {
            run_id: state.run_id.clone(),
            model_name: self.model.name().to_string(),
            step: state.run_step,
            message_count: state.messages.len(),
            tool_count: step.tool_count,
            streaming,
        });
    }

    fn report_response(
        &self,
        state: &RunState<Deps>,
        response: &ModelResponse,
        started: Instant,
        streaming: bool,
    ) {
        let tool_calls = response.tool_calls().len();
        self.instrumenter.on_model_response(&ModelResponseInfo {
            run_id: state.run_id.clone(),
            model_name: self.model.name().to_string(),
            step: state.run_step,
            usage: state.usage.clone(),
            text_parts: response.parts.len() - tool_calls,
            tool_calls,
            duration: started.elapsed(),
            streaming,
        });
    }

    fn report_end(&self, state: &RunState<Deps>) {
        self.instrumenter.on_run_end(&RunEndInfo {
            run_id: state.run_id.clone(),
            model_name: self.model.name().to_string(),
            usage: state.usage.clone(),
            message_count: state.messages.len(),
            duration: state.started.elapsed(),
        });
    }

    fn report_error(&self, state: &RunState<Deps>, err: &AgentError) {
        self.instrumenter.on_run_error(&RunErrorInfo {
            run_id: state.run_id.clone(),
            model_name: self.model.name().to_string(),
            error: err.to_string(),
            usage: state.usage.clone(),
            duration: state.started.elapsed(),
        });
    }
}

fn boxed_prompt_fn<Deps, Func, Fut>(func: Func) -> SystemPromptFn<Deps>
where
    Func: Fn(RunContext<Deps>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ToolError>> + Send + 'static,
{
    Arc::new(move |ctx: RunContext<Deps>| {
        Box::pin(func(ctx)) as BoxFuture<'static, Result<String, ToolError>>
    })
}

fn merge_settings(
    base: Option<&ModelSettings>,
    overrides: Option<ModelSettings>,
) -> Option<ModelSettings> {
    match (base, overrides) {
        (None, None) => None,
        (Some(base), None) => Some(base.clone()),
        (None, Some(overrides)) => Some(overrides),
        (Some(base), Some(overrides)) => {
            let mut merged = base.clone();
            merged.extend(overrides);
            Some(merged)
        }
    }
}

fn tool_return(call: &ToolCallPart, content: &str) -> ModelRequestPart {
    ModelRequestPart::ToolReturn(ToolReturnPart::new(
        call.tool_name.clone(),
        serde_json::Value::String(content.to_string()),
        call.tool_call_id.clone(),
    ))
}

enum Validated<Output> {
    Valid(Output),
    Retry(RetryPromptPart),
}

struct Step {
    model: Box<dyn AgentModel>,
    tool_names: Vec<String>,
    tool_count: usize,
}

struct ToolJob<Deps> {
    index: usize,
    call: ToolCallPart,
    runner: ToolRunner<Deps>,
    retry: u32,
    max_retries: u32,
}

struct DispatchedCall {
    index: usize,
    tool_name: String,
    tool_call_id: Option<String>,
    max_retries: u32,
    outcome: Result<ToolOutcome, AgentError>,
}

/// Runs a step's tool calls with at most `limit` in flight, returning the
/// outcomes sorted back into call order.
async fn dispatch_tools<Deps>(
    jobs: Vec<ToolJob<Deps>>,
    ctx: RunContext<Deps>,
    limit: Option<usize>,
) -> Vec<DispatchedCall>
where
    Deps: Send + Sync + 'static,
{
    let limit = limit.unwrap_or(jobs.len()).max(1);
    let pending = jobs.into_iter().map(|job| {
        let ctx = ctx.clone();
        async move {
            let outcome = job
                .runner
                .run(&job.call, ctx, job.retry, job.max_retries)
                .await;
            DispatchedCall {
                index: job.index,
                tool_name: job.call.tool_name,
                tool_call_id: job.call.tool_call_id,
                max_retries: job.max_retries,
                outcome,
            }
        }
    });
    let mut dispatched: Vec<DispatchedCall> =
        futures::stream::iter(pending).buffer_unordered(limit).collect().await;
    dispatched.sort_by_key(|call| call.index);
    dispatched
}

/// Live state of one run. Only the run loop mutates it; everything else sees
/// [`RunContext`] snapshots.
struct RunState<Deps> {
    run_id: String,
    deps: Arc<Deps>,
    prompt: Arc<str>,
    messages: Vec<ModelMessage>,
    new_message_index: usize,
    usage: Usage,
    usage_limits: UsageLimits,
    model_settings: Option<ModelSettings>,
    tool_retries: HashMap<String, u32>,
    result_retries: u32,
    run_step: u64,
    started: Instant,
}

impl<Deps> RunState<Deps> {
    fn context(&self, model: &Arc<dyn Model>) -> RunContext<Deps> {
        RunContext {
            run_id: self.run_id.clone(),
            deps: Arc::clone(&self.deps),
            model: Arc::clone(model),
            usage: self.usage.clone(),
            prompt: Arc::clone(&self.prompt),
            messages: Arc::new(self.messages.clone()),
            tool_name: None,
            tool_call_id: None,
            retry: 0,
            run_step: self.run_step,
        }
    }

    fn into_result<Output>(self, data: Output) -> AgentRunResult<Output> {
        AgentRunResult {
            data,
            usage: self.usage,
            messages: self.messages,
            new_message_index: self.new_message_index,
            run_id: self.run_id,
        }
    }
}

pub struct RunInput<Deps> {
    pub prompt: String,
    pub message_history: Vec<ModelMessage>,
    pub deps: Deps,
    pub usage_limits: UsageLimits,
    /// Merged over the agent's model settings for this run only.
    pub model_settings: Option<ModelSettings>,
    pub run_id: Option<String>,
}

impl<Deps> RunInput<Deps> {
    pub fn new(prompt: impl Into<String>, deps: Deps) -> Self {
        Self {
            prompt: prompt.into(),
            message_history: Vec::new(),
            deps,
            usage_limits: UsageLimits::default(),
            model_settings: None,
            run_id: None,
        }
    }

    pub fn builder(deps: Deps) -> RunInputBuilder<Deps> {
        RunInputBuilder {
            input: RunInput::new(String::new(), deps),
        }
    }
}

pub struct RunInputBuilder<Deps> {
    input: RunInput<Deps>,
}

impl<Deps> RunInputBuilder<Deps> {
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.input.prompt = prompt.into();
        self
    }

    pub fn message_history(mut self, history: Vec<ModelMessage>) -> Self {
        self.input.message_history = history;
        self
    }

    pub fn usage_limits(mut self, limits: UsageLimits) -> Self {
        self.input.usage_limits = limits;
        self
    }

    pub fn model_settings(mut self, settings: ModelSettings) -> Self {
        self.input.model_settings = Some(settings);
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.input.run_id = Some(run_id.into());
        self
    }

    pub fn build(self) -> RunInput<Deps> {
        self.input
    }
}

#[derive(Clone, Debug)]
pub struct AgentRunResult<Output> {
    pub data: Output,
    pub usage: Usage,
    pub messages: Vec<ModelMessage>,
    /// Where this run's messages start in `messages`; earlier ones came from
    /// the supplied history.
    pub new_message_index: usize,
    pub run_id: String,
}

impl<Output> AgentRunResult<Output> {
    pub fn all_messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    pub fn new_messages(&self) -> &[ModelMessage] {
        &self.messages[self.new_message_index.min(self.messages.len())..]
    }

    pub fn all_messages_json(&self) -> Result<String, serde_json::Error> {
        messages_to_json(&self.messages)
    }

    pub fn new_messages_json(&self) -> Result<String, serde_json::Error> {
        messages_to_json(self.new_messages())
    }
}
