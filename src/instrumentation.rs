use std::time::Duration;

use crate::error::RetryTarget;
use crate::usage::{Usage, UsageLimits};

#[derive(Clone, Debug)]
pub struct RunStartInfo {
    pub run_id: String,
    pub model_name: String,
    pub message_count: usize,
    pub tool_count: usize,
    pub result_tools: usize,
    pub allow_text_result: bool,
    pub streaming: bool,
    pub usage_limits: UsageLimits,
}

#[derive(Clone, Debug)]
pub struct ModelRequestInfo {
    pub run_id: String,
    pub model_name: String,
    pub step: u64,
    pub message_count: usize,
    pub tool_count: usize,
    pub streaming: bool,
}

#[derive(Clone, Debug)]
pub struct ModelResponseInfo {
    pub run_id: String,
    pub model_name: String,
    pub step: u64,
    pub usage: Usage,
    pub text_parts: usize,
    pub tool_calls: usize,
    pub duration: Duration,
    pub streaming: bool,
}

#[derive(Clone, Debug)]
pub struct ToolCallInfo {
    pub run_id: String,
    pub tool_name: String,
    pub tool_call_id: Option<String>,
    pub retry: u32,
}

#[derive(Clone, Debug)]
pub struct RetryInfo {
    pub run_id: String,
    pub target: RetryTarget,
    pub tool_call_id: Option<String>,
    pub retry: u32,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct RunEndInfo {
    pub run_id: String,
    pub model_name: String,
    pub usage: Usage,
    pub message_count: usize,
    pub duration: Duration,
}

#[derive(Clone, Debug)]
pub struct RunErrorInfo {
    pub run_id: String,
    pub model_name: String,
    pub error: String,
    pub usage: Usage,
    pub duration: Duration,
}

pub trait Instrumenter: Send + Sync {
    fn on_run_start(&self, _info: &RunStartInfo) {}
    fn on_model_request(&self, _info: &ModelRequestInfo) {}
    fn on_model_response(&self, _info: &ModelResponseInfo) {}
    fn on_tool_call(&self, _info: &ToolCallInfo) {}
    fn on_retry(&self, _info: &RetryInfo) {}
    fn on_run_end(&self, _info: &RunEndInfo) {}
    fn on_run_error(&self, _info: &RunErrorInfo) {}
}

#[derive(Clone, Default)]
pub struct NoopInstrumenter;

impl Instrumenter for NoopInstrumenter {}

#[derive(Clone, Default)]
pub struct TracingInstrumenter;

impl Instrumenter for TracingInstrumenter {
    fn on_run_start(&self, info: &RunStartInfo) {
        tracing::info!(
            run_id = info.run_id.as_str(),
            model = info.model_name.as_str(),
            message_count = info.message_count,
            tool_count = info.tool_count,
            result_tools = info.result_tools,
            allow_text_result = info.allow_text_result,
            streaming = info.streaming,
            request_limit = ?info.usage_limits.request_limit,
            "run start"
        );
    }

    fn on_model_request(&self, info: &ModelRequestInfo) {
        tracing::info!(
            run_id = info.run_id.as_str(),
            model = info.model_name.as_str(),
            step = info.step,
            message_count = info.message_count,
            tool_count = info.tool_count,
            streaming = info.streaming,
            "model request"
        );
    }

    fn on_model_response(&self, info: &ModelResponseInfo) {
        tracing::info!(
            run_id = info.run_id.as_str(),
            model = info.model_name.as_str(),
            step = info.step,
            text_parts = info.text_parts,
            tool_calls = info.tool_calls,
            requests = info.usage.requests,
            request_tokens = info.usage.request_tokens,
            response_tokens = info.usage.response_tokens,
            duration_ms = info.duration.as_millis() as u64,
            streaming = info.streaming,
            "model response"
        );
    }

    fn on_tool_call(&self, info: &ToolCallInfo) {
        tracing::info!(
            run_id = info.run_id.as_str(),
            tool = info.tool_name.as_str(),
            tool_call_id = info.tool_call_id.as_deref().unwrap_or(""),
            retry = info.retry,
            "tool call"
        );
    }

    fn on_retry(&self, info: &RetryInfo) {
        tracing::warn!(
            run_id = info.run_id.as_str(),
            target = %info.target,
            tool_call_id = info.tool_call_id.as_deref().unwrap_or(""),
            retry = info.retry,
            max_retries = info.max_retries,
            "retry requested"
        );
    }

    fn on_run_end(&self, info: &RunEndInfo) {
        tracing::info!(
            run_id = info.run_id.as_str(),
            model = info.model_name.as_str(),
            requests = info.usage.requests,
            total_tokens = info.usage.total_tokens,
            message_count = info.message_count,
            duration_ms = info.duration.as_millis() as u64,
            "run end"
        );
    }

    fn on_run_error(&self, info: &RunErrorInfo) {
        tracing::warn!(
            run_id = info.run_id.as_str(),
            model = info.model_name.as_str(),
            error = info.error.as_str(),
            requests = info.usage.requests,
            duration_ms = info.duration.as_millis() as u64,
            "run error"
        );
    }
}
