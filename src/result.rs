use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::error::AgentError;
use crate::messages::{RetryPromptPart, ToolCallPart, ValidationErrorRecord};
use crate::schema::{CompiledSchema, json_parse_error};
use crate::tools::{RunContext, ToolDefinition, ToolError, ToolKind};

pub const DEFAULT_RESULT_TOOL_NAME: &str = "final_result";
pub const DEFAULT_RESULT_TOOL_DESCRIPTION: &str =
    "The final response which ends this conversation";

/// Post-validation hook for the final result. May replace the value, or ask
/// the model to try again with [`ToolError::ModelRetry`].
pub type ResultValidatorFn<Deps, Output> = Arc<
    dyn Fn(RunContext<Deps>, Output) -> BoxFuture<'static, Result<Output, ToolError>>
        + Send
        + Sync,
>;

struct ResultTool {
    definition: ToolDefinition,
    schema: CompiledSchema,
    /// The value lives under `response` because the type's schema is not an object.
    wrapped: bool,
    /// Union member this tool produces; its args are tagged before decoding.
    variant: Option<String>,
}

/// Describes what counts as a final result and how to validate it.
pub struct ResultSchema<Output> {
    allow_text: bool,
    tools: Vec<ResultTool>,
    _output: PhantomData<fn() -> Output>,
}

impl<Output> fmt::Debug for ResultSchema<Output> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSchema")
            .field("allow_text", &self.allow_text)
            .field(
                "tools",
                &self
                    .tools
                    .iter()
                    .map(|tool| tool.definition.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<Output> ResultSchema<Output>
where
    Output: DeserializeOwned + Send + 'static,
{
    /// Plain text is the result; no result tools are offered.
    pub fn text() -> Self {
        Self {
            allow_text: true,
            tools: Vec::new(),
            _output: PhantomData,
        }
    }

    /// One result tool whose arguments decode into `Output`.
    pub fn tool(name: impl Into<String>, description: impl Into<String>) -> Result<Self, AgentError>
    where
        Output: JsonSchema,
    {
        let tool = build_tool::<Output>(name.into(), description.into(), None)?;
        Ok(Self {
            allow_text: false,
            tools: vec![tool],
            _output: PhantomData,
        })
    }

    /// Starts a union result: add members with [`ResultSchema::variant`].
    /// `Output` is expected to be an externally tagged enum.
    pub fn union() -> Self {
        Self {
            allow_text: false,
            tools: Vec::new(),
            _output: PhantomData,
        }
    }

    pub fn variant<T>(
        mut self,
        variant: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, AgentError>
    where
        T: JsonSchema,
    {
        let variant = variant.into();
        let name = format!("{DEFAULT_RESULT_TOOL_NAME}_{variant}");
        if self.tools.iter().any(|tool| tool.definition.name == name) {
            return Err(AgentError::Config(format!(
                "duplicate result variant '{variant}'"
            )));
        }
        let tool = build_tool::<T>(name, description.into(), Some(variant))?;
        self.tools.push(tool);
        Ok(self)
    }

    pub fn allow_text(mut self, allow: bool) -> Self {
        self.allow_text = allow;
        self
    }

    pub fn allow_text_result(&self) -> bool {
        self.allow_text
    }

    pub fn tool_defs(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn is_result_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|tool| tool.definition.name == name)
    }

    /// The first call naming a result tool, with its position in `calls`.
    pub fn find_tool<'a>(&self, calls: &'a [ToolCallPart]) -> Option<(usize, &'a ToolCallPart)> {
        calls
            .iter()
            .enumerate()
            .find(|(_, call)| self.is_result_tool(&call.tool_name))
    }

    pub fn validate(&self, call: &ToolCallPart) -> Result<Output, RetryPromptPart> {
        let addressed = |part: RetryPromptPart| {
            part.for_call(call.tool_name.clone(), call.tool_call_id.clone())
        };
        let Some(tool) = self
            .tools
            .iter()
            .find(|tool| tool.definition.name == call.tool_name)
        else {
            return Err(addressed(RetryPromptPart::text(format!(
                "Unknown result tool name: '{}'",
                call.tool_name
            ))));
        };

        let args = call.args_as_value().map_err(|err| {
            addressed(RetryPromptPart::errors(vec![json_parse_error(
                &call.args_as_json_str(),
                &err,
            )]))
        })?;
        tool.schema
            .validate(&args)
            .map_err(|errors| addressed(RetryPromptPart::errors(errors)))?;
        decode(tool, args).map_err(|err| {
            addressed(RetryPromptPart::errors(vec![ValidationErrorRecord::new(
                Vec::new(),
                err.to_string(),
                "value_error",
            )]))
        })
    }

    pub fn validate_text(&self, text: &str) -> Result<Output, RetryPromptPart> {
        if let Ok(value) = serde_json::from_value(Value::String(text.to_string())) {
            return Ok(value);
        }
        serde_json::from_str(text).map_err(|err| {
            RetryPromptPart::errors(vec![
                ValidationErrorRecord::new(Vec::new(), err.to_string(), "value_error")
                    .with_input(Value::String(text.to_string())),
            ])
        })
    }

    /// Best-effort decode of a call whose arguments may still be streaming.
    /// Returns `None` until the arguments form a value that decodes.
    pub(crate) fn decode_partial(&self, call: &ToolCallPart) -> Option<Output> {
        let tool = self
            .tools
            .iter()
            .find(|tool| tool.definition.name == call.tool_name)?;
        let args = call.args_as_value().ok()?;
        decode(tool, args).ok()
    }
}

fn decode<Output: DeserializeOwned>(
    tool: &ResultTool,
    args: Value,
) -> Result<Output, serde_json::Error> {
    let inner = if tool.wrapped {
        match args {
            Value::Object(mut map) => map.remove("response").unwrap_or(Value::Null),
            other => other,
        }
    } else {
        args
    };
    let value = match &tool.variant {
        Some(variant) => {
            let mut tagged = Map::new();
            tagged.insert(variant.clone(), inner);
            Value::Object(tagged)
        }
        None => inner,
    };
    serde_json::from_value(value)
}

fn build_tool<T: JsonSchema>(
    name: String,
    description: String,
    variant: Option<String>,
) -> Result<ResultTool, AgentError> {
    let schema = serde_json::to_value(schemars::schema_for!(T))
        .map_err(|err| AgentError::Config(format!("result schema for '{name}': {err}")))?;
    let (parameters, wrapped) = object_schema(schema);
    let compiled = CompiledSchema::compile(&parameters)
        .map_err(|err| AgentError::Config(format!("result tool '{name}': {err}")))?;
    let definition =
        ToolDefinition::new(name, Some(description), parameters).with_kind(ToolKind::Result);
    Ok(ResultTool {
        definition,
        schema: compiled,
        wrapped,
        variant,
    })
}

/// Tool parameters must be an object; anything else is nested under
/// `response`. Shared definitions stay at the root so `$ref`s still resolve.
fn object_schema(schema: Value) -> (Value, bool) {
    let is_object = schema.get("type").and_then(Value::as_str) == Some("object");
    if is_object {
        return (schema, false);
    }
    let Value::Object(mut inner) = schema else {
        return (
            json!({
                "type": "object",
                "properties": {"response": schema},
                "required": ["response"],
            }),
            true,
        );
    };
    let meta = inner.remove("$schema");
    let definitions = inner.remove("definitions");
    let mut outer = Map::new();
    if let Some(meta) = meta {
        outer.insert("$schema".to_string(), meta);
    }
    outer.insert("type".to_string(), json!("object"));
    outer.insert(
        "properties".to_string(),
        json!({"response": Value::Object(inner)}),
    );
    outer.insert("required".to_string(), json!(["response"]));
    if let Some(definitions) = definitions {
        outer.insert("definitions".to_string(), definitions);
    }
    (Value::Object(outer), true)
}
