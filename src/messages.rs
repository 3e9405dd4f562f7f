use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemPromptPart {
    pub content: String,
    /// Set when the prompt came from a dynamic system prompt function; such
    /// parts are recomputed when the history is replayed into a new run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_ref: Option<String>,
}

impl SystemPromptPart {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            dynamic_ref: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserPromptPart {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl UserPromptPart {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolReturnPart {
    pub tool_name: String,
    pub content: Value,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ToolReturnPart {
    pub fn new(tool_name: impl Into<String>, content: Value, tool_call_id: Option<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            content,
            tool_call_id,
            timestamp: Utc::now(),
        }
    }

    pub fn model_response_str(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// One validation failure reported back to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrorRecord {
    pub loc: Vec<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl ValidationErrorRecord {
    pub fn new(loc: Vec<String>, msg: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            loc,
            msg: msg.into(),
            kind: kind.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryContent {
    Text(String),
    Errors(Vec<ValidationErrorRecord>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPromptPart {
    pub content: RetryContent,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RetryPromptPart {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: RetryContent::Text(content.into()),
            tool_name: None,
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn errors(errors: Vec<ValidationErrorRecord>) -> Self {
        Self {
            content: RetryContent::Errors(errors),
            tool_name: None,
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_call(mut self, tool_name: impl Into<String>, tool_call_id: Option<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self.tool_call_id = tool_call_id;
        self
    }

    /// Text an adapter sends back to the model for this retry.
    pub fn model_response(&self) -> String {
        let description = match &self.content {
            RetryContent::Text(text) => text.clone(),
            RetryContent::Errors(errors) => {
                let rendered =
                    serde_json::to_string_pretty(errors).unwrap_or_else(|_| format!("{errors:?}"));
                format!("{} validation errors: {rendered}", errors.len())
            }
        };
        format!("{description}\n\nFix the errors and try again.")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part_kind", rename_all = "kebab-case")]
pub enum ModelRequestPart {
    SystemPrompt(SystemPromptPart),
    UserPrompt(UserPromptPart),
    ToolReturn(ToolReturnPart),
    RetryPrompt(RetryPromptPart),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub parts: Vec<ModelRequestPart>,
}

impl ModelRequest {
    pub fn new(parts: Vec<ModelRequestPart>) -> Self {
        Self { parts }
    }

    pub fn user_text_prompt(prompt: impl Into<String>) -> Self {
        Self {
            parts: vec![ModelRequestPart::UserPrompt(UserPromptPart::new(prompt))],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub content: String,
}

impl TextPart {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }
}

/// Tool call arguments, either as the raw JSON text the model produced or
/// already decoded into an object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArgs {
    Json(String),
    Dict(Map<String, Value>),
}

impl ToolArgs {
    pub fn as_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            ToolArgs::Json(raw) if raw.trim().is_empty() => Ok(Value::Object(Map::new())),
            ToolArgs::Json(raw) => serde_json::from_str(raw),
            ToolArgs::Dict(map) => Ok(Value::Object(map.clone())),
        }
    }

    pub fn as_json_str(&self) -> String {
        match self {
            ToolArgs::Json(raw) => raw.clone(),
            ToolArgs::Dict(map) => Value::Object(map.clone()).to_string(),
        }
    }
}

impl From<Value> for ToolArgs {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => ToolArgs::Dict(map),
            Value::String(raw) => ToolArgs::Json(raw),
            other => ToolArgs::Json(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub tool_name: String,
    pub args: ToolArgs,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl ToolCallPart {
    pub fn new(tool_name: impl Into<String>, args: impl Into<ToolArgs>) -> Self {
        Self {
            tool_name: tool_name.into(),
            args: args.into(),
            tool_call_id: None,
        }
    }

    pub fn with_id(mut self, tool_call_id: impl Into<String>) -> Self {
        self.tool_call_id = Some(tool_call_id.into());
        self
    }

    pub fn args_as_value(&self) -> Result<Value, serde_json::Error> {
        self.args.as_value()
    }

    pub fn args_as_json_str(&self) -> String {
        self.args.as_json_str()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part_kind", rename_all = "kebab-case")]
pub enum ModelResponsePart {
    Text(TextPart),
    ToolCall(ToolCallPart),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub parts: Vec<ModelResponsePart>,
    #[serde(default)]
    pub model_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ModelResponse {
    pub fn new(parts: Vec<ModelResponsePart>, model_name: Option<String>) -> Self {
        Self {
            parts,
            model_name,
            timestamp: Utc::now(),
        }
    }

    pub fn from_text(content: impl Into<String>) -> Self {
        Self::new(vec![ModelResponsePart::Text(TextPart::new(content))], None)
    }

    pub fn from_tool_call(call: ToolCallPart) -> Self {
        Self::new(vec![ModelResponsePart::ToolCall(call)], None)
    }

    pub fn text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|part| match part {
                ModelResponsePart::Text(text) => Some(text.content.as_str()),
                ModelResponsePart::ToolCall(_) => None,
            })
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n\n"))
        }
    }

    pub fn tool_calls(&self) -> Vec<ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ModelResponsePart::ToolCall(call) => Some(call.clone()),
                ModelResponsePart::Text(_) => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ModelMessage {
    Request(ModelRequest),
    Response(ModelResponse),
}

pub fn messages_to_json(messages: &[ModelMessage]) -> Result<String, serde_json::Error> {
    serde_json::to_string(messages)
}

pub fn messages_from_json(json: &str) -> Result<Vec<ModelMessage>, serde_json::Error> {
    serde_json::from_str(json)
}
