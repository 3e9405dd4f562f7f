//! Streaming runs.
//!
//! The run loop reads the model's event feed through a [`PartsManager`] until
//! a part appears that decides the run: text when plain text is an acceptable
//! result, or a call to a result tool. From then on the caller drives the
//! rest of the feed through [`StreamedRunResult`]. Responses that never
//! produce such a part are drained and handled exactly like buffered ones.

use std::time::Instant;

use async_stream::try_stream;
use futures::StreamExt;
use futures::stream::Stream;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    Agent, EMPTY_RESPONSE, FINAL_RESULT_PROCESSED, RunInput, RunState, Validated, tool_return,
};
use crate::error::AgentError;
use crate::messages::{
    ModelMessage, ModelRequest, ModelResponse, ModelResponsePart, RetryPromptPart, ToolCallPart,
    messages_to_json,
};
use crate::model::{ModelEventStream, ModelStreamEvent};
use crate::parts_manager::{PartDelta, PartEvent, PartsManager};
use crate::usage::Usage;

impl<Deps, Output> Agent<Deps, Output>
where
    Deps: Send + Sync + 'static,
    Output: DeserializeOwned + Clone + Send + 'static,
{
    /// Runs until the final result starts streaming and returns a cursor over
    /// the rest of it.
    pub async fn run_stream(
        &self,
        input: RunInput<Deps>,
    ) -> Result<StreamedRunResult<'_, Deps, Output>, AgentError> {
        let mut state = self.new_state(input);
        match self.stream_until_decisive(&mut state).await {
            Ok((events, decisive)) => Ok(StreamedRunResult {
                agent: self,
                state,
                events,
                decisive,
                drained: false,
                completed: false,
                data: None,
            }),
            Err(err) => {
                self.report_error(&state, &err);
                Err(err)
            }
        }
    }

    async fn stream_until_decisive(
        &self,
        state: &mut RunState<Deps>,
    ) -> Result<(ModelEventStream, Decisive), AgentError> {
        self.start_messages(state).await?;
        self.report_start(state, true);
        loop {
            let step = self.prepare_step(state).await?;
            state.usage_limits.check_before_request(&state.usage)?;
            self.report_request(state, &step, true);

            let started = Instant::now();
            let mut events = step
                .model
                .request_stream(&state.messages, state.model_settings.as_ref())
                .await?;
            state.usage.incr(&Usage::default(), 1);

            let mut parts = PartsManager::new();
            let mut request_usage = Usage::default();
            while let Some(event) = events.next().await {
                let Some(part_event) = apply_stream_event(&mut parts, &mut request_usage, event?)?
                else {
                    continue;
                };
                let index = part_event.index();
                if self.is_decisive(parts.part(index).as_ref()) {
                    debug!(index, step = state.run_step, "final result started streaming");
                    let decisive = Decisive {
                        parts,
                        request_usage,
                        index,
                        tool_names: step.tool_names,
                        started,
                    };
                    return Ok((events, decisive));
                }
            }

            let response = self.record_streamed_response(state, &parts, &request_usage, started)?;
            if response.parts.is_empty() {
                return Err(AgentError::UnexpectedModelBehavior(
                    EMPTY_RESPONSE.to_string(),
                ));
            }
            if self
                .handle_response(state, &response, &step.tool_names)
                .await?
                .is_some()
            {
                return Err(AgentError::UnexpectedModelBehavior(
                    "final result produced outside of a streamed result part".to_string(),
                ));
            }
        }
    }

    fn is_decisive(&self, part: Option<&ModelResponsePart>) -> bool {
        match part {
            Some(ModelResponsePart::Text(_)) => self.result_schema.allow_text_result(),
            Some(ModelResponsePart::ToolCall(call)) => {
                self.result_schema.is_result_tool(&call.tool_name)
            }
            None => false,
        }
    }

    fn record_streamed_response(
        &self,
        state: &mut RunState<Deps>,
        parts: &PartsManager,
        request_usage: &Usage,
        started: Instant,
    ) -> Result<ModelResponse, AgentError> {
        state.usage += request_usage;
        state.usage_limits.check_tokens(&state.usage)?;
        let response = ModelResponse::new(parts.get_parts(), Some(self.model.name().to_string()));
        state.messages.push(ModelMessage::Response(response.clone()));
        self.report_response(state, &response, started, true);
        Ok(response)
    }

    /// Closes out a fully drained decisive response: validates the result,
    /// answers the remaining tool calls and appends everything to history.
    /// No retry can be issued at this point, so an invalid result is fatal.
    async fn finish_streamed(
        &self,
        state: &mut RunState<Deps>,
        decisive: &Decisive,
    ) -> Result<Output, AgentError> {
        let response = self.record_streamed_response(
            state,
            &decisive.parts,
            &decisive.request_usage,
            decisive.started,
        )?;
        let calls = response.tool_calls();
        let mut slots = vec![None; calls.len()];

        let (data, result_index) = match decisive.parts.part(decisive.index) {
            Some(ModelResponsePart::ToolCall(_)) => {
                // The earliest result call wins, as in a buffered run, even if
                // a later one completed first while streaming.
                let Some((index, call)) = self.result_schema.find_tool(&calls) else {
                    return Err(AgentError::UnexpectedModelBehavior(
                        "streamed result call was replaced by another tool call".to_string(),
                    ));
                };
                let candidate = self.result_schema.validate(call);
                let data = self.require_valid(state, candidate, Some(call)).await?;
                (data, Some(index))
            }
            _ => {
                let candidate = self.result_schema.validate_text(&joined_text(&response.parts));
                (self.require_valid(state, candidate, None).await?, None)
            }
        };
        if let Some(index) = result_index {
            slots[index] = Some(tool_return(&calls[index], FINAL_RESULT_PROCESSED));
        }

        let parts = self
            .answer_tool_calls(
                state,
                &calls,
                &decisive.tool_names,
                slots,
                result_index,
                true,
                true,
            )
            .await?;
        if !parts.is_empty() {
            state
                .messages
                .push(ModelMessage::Request(ModelRequest::new(parts)));
        }
        Ok(data)
    }

    async fn require_valid(
        &self,
        state: &RunState<Deps>,
        candidate: Result<Output, RetryPromptPart>,
        call: Option<&ToolCallPart>,
    ) -> Result<Output, AgentError> {
        match self.validate_result(state, candidate, call).await? {
            Validated::Valid(data) => Ok(data),
            Validated::Retry(retry) => Err(AgentError::ResultValidation(retry.model_response())),
        }
    }
}

/// The response being streamed once its deciding part has been seen.
struct Decisive {
    parts: PartsManager,
    request_usage: Usage,
    /// Index of the deciding part.
    index: usize,
    tool_names: Vec<String>,
    started: Instant,
}

enum Pulled {
    Event(PartEvent),
    Quiet,
    Done,
}

/// Cursor over a run whose final result is streaming.
///
/// Dropping it before the end issues no further model requests. Once the
/// feed is exhausted the response is added to the history and the other tool
/// calls of that response are answered.
pub struct StreamedRunResult<'a, Deps, Output> {
    agent: &'a Agent<Deps, Output>,
    state: RunState<Deps>,
    events: ModelEventStream,
    decisive: Decisive,
    drained: bool,
    completed: bool,
    data: Option<Output>,
}

impl<Deps, Output> StreamedRunResult<'_, Deps, Output>
where
    Deps: Send + Sync + 'static,
    Output: DeserializeOwned + Clone + Send + 'static,
{
    /// Text of the result as it arrives: each fragment when `delta` is set,
    /// otherwise the whole text so far.
    pub fn stream_text(
        &mut self,
        delta: bool,
    ) -> impl Stream<Item = Result<String, AgentError>> + '_ {
        try_stream! {
            if !self.is_text_result() {
                Err::<(), AgentError>(AgentError::Config(
                    "stream_text() requires a plain text result".to_string(),
                ))?;
            }
            let current = self.text();
            if !current.is_empty() {
                yield current;
            }
            loop {
                match self.pull().await? {
                    Pulled::Event(event) => match text_fragment(&event) {
                        Some(fragment) if !fragment.is_empty() => {
                            if delta {
                                yield fragment;
                            } else {
                                yield self.text();
                            }
                        }
                        _ => {}
                    },
                    Pulled::Quiet => {}
                    Pulled::Done => break,
                }
            }
            self.finish().await?;
        }
    }

    /// Successive decodings of the result, ending with the validated value.
    pub fn stream(&mut self) -> impl Stream<Item = Result<Output, AgentError>> + '_ {
        try_stream! {
            if self.data.is_none() {
                if let Some(candidate) = self.candidate() {
                    yield candidate;
                }
                loop {
                    match self.pull().await? {
                        Pulled::Event(event) => {
                            let candidate = if self.touches_result(&event) {
                                self.candidate()
                            } else {
                                None
                            };
                            if let Some(candidate) = candidate {
                                yield candidate;
                            }
                        }
                        Pulled::Quiet => {}
                        Pulled::Done => break,
                    }
                }
            }
            let data = self.finish().await?;
            yield data;
        }
    }

    /// Drains the feed and returns the validated result.
    pub async fn get(&mut self) -> Result<Output, AgentError> {
        self.finish().await
    }

    /// Run usage, including what the current response has reported so far.
    pub fn usage(&self) -> Usage {
        let mut usage = self.state.usage.clone();
        if !self.completed {
            usage += &self.decisive.request_usage;
        }
        usage
    }

    pub fn all_messages(&self) -> &[ModelMessage] {
        &self.state.messages
    }

    pub fn new_messages(&self) -> &[ModelMessage] {
        let start = self.state.new_message_index.min(self.state.messages.len());
        &self.state.messages[start..]
    }

    pub fn all_messages_json(&self) -> Result<String, serde_json::Error> {
        messages_to_json(&self.state.messages)
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn is_complete(&self) -> bool {
        self.data.is_some()
    }

    async fn finish(&mut self) -> Result<Output, AgentError> {
        if let Some(data) = &self.data {
            return Ok(data.clone());
        }
        if self.completed {
            return Err(AgentError::UnexpectedModelBehavior(
                "streamed run already failed".to_string(),
            ));
        }
        match self.complete().await {
            Ok(data) => {
                self.agent.report_end(&self.state);
                self.data = Some(data.clone());
                Ok(data)
            }
            Err(err) => {
                self.agent.report_error(&self.state, &err);
                Err(err)
            }
        }
    }

    async fn complete(&mut self) -> Result<Output, AgentError> {
        while !matches!(self.pull().await?, Pulled::Done) {}
        self.completed = true;
        self.agent
            .finish_streamed(&mut self.state, &self.decisive)
            .await
    }

    async fn pull(&mut self) -> Result<Pulled, AgentError> {
        if self.drained {
            return Ok(Pulled::Done);
        }
        let Some(event) = self.events.next().await else {
            self.drained = true;
            return Ok(Pulled::Done);
        };
        let decisive = &mut self.decisive;
        Ok(
            match apply_stream_event(&mut decisive.parts, &mut decisive.request_usage, event?)? {
                Some(event) => Pulled::Event(event),
                None => Pulled::Quiet,
            },
        )
    }

    fn is_text_result(&self) -> bool {
        matches!(
            self.decisive.parts.part(self.decisive.index),
            Some(ModelResponsePart::Text(_))
        )
    }

    fn text(&self) -> String {
        joined_text(&self.decisive.parts.get_parts())
    }

    fn touches_result(&self, event: &PartEvent) -> bool {
        if self.is_text_result() {
            text_fragment(event).is_some()
        } else {
            event.index() == self.decisive.index
        }
    }

    fn candidate(&self) -> Option<Output> {
        match self.decisive.parts.part(self.decisive.index)? {
            ModelResponsePart::Text(_) => self.agent.result_schema.validate_text(&self.text()).ok(),
            ModelResponsePart::ToolCall(call) => self.agent.result_schema.decode_partial(&call),
        }
    }
}

fn apply_stream_event(
    parts: &mut PartsManager,
    usage: &mut Usage,
    event: ModelStreamEvent,
) -> Result<Option<PartEvent>, AgentError> {
    Ok(match event {
        ModelStreamEvent::TextDelta {
            vendor_part_id,
            content,
        } => Some(parts.handle_text_delta(vendor_part_id.as_deref(), content)?),
        ModelStreamEvent::ToolCallDelta {
            vendor_part_id,
            tool_name,
            args,
            tool_call_id,
        } => parts.handle_tool_call_delta(vendor_part_id.as_deref(), tool_name, args, tool_call_id)?,
        ModelStreamEvent::ToolCall {
            vendor_part_id,
            tool_name,
            args,
            tool_call_id,
        } => Some(parts.handle_tool_call_part(
            vendor_part_id.as_deref(),
            tool_name,
            args,
            tool_call_id,
        )),
        ModelStreamEvent::Usage(delta) => {
            *usage += &delta;
            None
        }
    })
}

fn text_fragment(event: &PartEvent) -> Option<String> {
    match event {
        PartEvent::Start {
            part: ModelResponsePart::Text(text),
            ..
        } => Some(text.content.clone()),
        PartEvent::Delta {
            delta: PartDelta::Text { content_delta },
            ..
        } => Some(content_delta.clone()),
        _ => None,
    }
}

fn joined_text(parts: &[ModelResponsePart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            ModelResponsePart::Text(text) if text.has_content() => Some(text.content.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
