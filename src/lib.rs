//! # Rustic Agent
//!
//! An agent execution runtime: a run loop that alternates model requests with
//! validated tool calls until a typed final result is produced, with usage
//! limits, retry accounting and streamed part reconciliation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rustic_agent::{Agent, FunctionModel, ModelResponse, RunInput};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let model = FunctionModel::new(|_messages, _info| async move {
//!     Ok(ModelResponse::from_text("Hello!"))
//! });
//! let agent = Agent::<()>::new(Arc::new(model)).system_prompt("You are a helpful assistant.");
//!
//! let result = agent.run(RunInput::new("Hi there", ())).await?;
//! println!("{}", result.data);
//! # Ok(())
//! # }
//! ```
//!
//! Typed results are produced through a result tool:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rustic_agent::{Agent, FunctionModel, ModelResponse, ResultSchema, RunInput, ToolCallPart};
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! #[derive(Deserialize, JsonSchema)]
//! struct Answer {
//!     answer: String,
//! }
//!
//! let model = FunctionModel::new(|_messages, _info| async move {
//!     Ok(ModelResponse::from_tool_call(ToolCallPart::new(
//!         "final_result",
//!         json!({"answer": "ok"}),
//!     )))
//! });
//! let schema = ResultSchema::<Answer>::tool("final_result", "The final answer")?;
//! let agent = Agent::<(), Answer>::with_result_schema(Arc::new(model), schema);
//! let result = agent.run(RunInput::new("Answer me", ())).await?;
//! assert_eq!(result.data.answer, "ok");
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Run loop** with tool calling, retries, end strategies and message history
//! - **Usage limits** on requests and tokens
//! - **Streaming** with incremental text and partial result access
//! - **Structured results** validated against JSON schema
//! - **Instrumentation hooks** with a `tracing` implementation

pub mod agent;
pub mod config;
pub mod error;
pub mod instrumentation;
pub mod messages;
pub mod model;
pub mod models;
pub mod parts_manager;
pub mod result;
mod schema;
pub mod tools;
pub mod usage;

pub use agent::{
    Agent, AgentRunResult, EndStrategy, RunInput, RunInputBuilder, StreamedRunResult,
    SystemPromptFn,
};
pub use config::AgentSettings;
pub use error::{AgentError, ErrorKind, RetryTarget};
pub use instrumentation::{Instrumenter, NoopInstrumenter, TracingInstrumenter};
pub use messages::{
    ModelMessage, ModelRequest, ModelRequestPart, ModelResponse, ModelResponsePart, RetryContent,
    RetryPromptPart, SystemPromptPart, TextPart, ToolArgs, ToolCallPart, ToolReturnPart,
    UserPromptPart, ValidationErrorRecord, messages_from_json, messages_to_json,
};
pub use model::{
    AgentModel, Model, ModelError, ModelEventStream, ModelRequestParameters, ModelSettings,
    ModelStreamEvent,
};
pub use models::{AgentInfo, FunctionModel};
pub use parts_manager::{PartDelta, PartEvent, PartsError, PartsManager};
pub use result::{
    DEFAULT_RESULT_TOOL_DESCRIPTION, DEFAULT_RESULT_TOOL_NAME, ResultSchema, ResultValidatorFn,
};
pub use tools::{
    FunctionTool, RunContext, Tool, ToolDefinition, ToolError, ToolKind, ToolOutcome,
};
pub use usage::{Usage, UsageError, UsageLimits};
