//! Reconciliation of streamed response fragments into response parts.
//!
//! Adapters feed every vendor event through a [`PartsManager`], which keeps the
//! single ordered list of parts for the response being streamed and reports
//! which part started or changed. The manager is a plain synchronous state
//! machine: replaying the same events always produces the same parts and the
//! same notifications.

use std::collections::HashMap;

use thiserror::Error;

use crate::messages::{ModelResponsePart, TextPart, ToolArgs, ToolCallPart};

#[derive(Clone, Debug, PartialEq)]
pub enum PartDelta {
    Text {
        content_delta: String,
    },
    ToolCall {
        tool_name_delta: Option<String>,
        args_delta: Option<ToolArgs>,
        tool_call_id: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum PartEvent {
    Start {
        index: usize,
        part: ModelResponsePart,
    },
    Delta {
        index: usize,
        delta: PartDelta,
    },
}

impl PartEvent {
    pub fn index(&self) -> usize {
        match self {
            PartEvent::Start { index, .. } | PartEvent::Delta { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartsError {
    #[error("cannot apply a text delta to the non-text part at index {index}")]
    TextDeltaOnNonText { index: usize },
    #[error("cannot apply a tool call delta to the non-tool-call part at index {index}")]
    ToolCallDeltaOnNonToolCall { index: usize },
    #[error("cannot mix raw JSON and keyed argument deltas for the part at index {index}")]
    MixedArgsDelta { index: usize },
    #[error("conflicting tool call id for the part at index {index}: {existing} then {new}")]
    ConflictingToolCallId {
        index: usize,
        existing: String,
        new: String,
    },
}

/// A tool call whose name or arguments have not arrived yet.
#[derive(Clone, Debug, Default, PartialEq)]
struct PartialToolCall {
    tool_name: Option<String>,
    args: Option<ToolArgs>,
    tool_call_id: Option<String>,
}

impl PartialToolCall {
    fn promote(&self) -> Option<ToolCallPart> {
        match (&self.tool_name, &self.args) {
            (Some(tool_name), Some(args)) => Some(ToolCallPart {
                tool_name: tool_name.clone(),
                args: args.clone(),
                tool_call_id: self.tool_call_id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum ManagedPart {
    Text(TextPart),
    ToolCall(ToolCallPart),
    Partial(PartialToolCall),
}

#[derive(Clone, Debug, Default)]
pub struct PartsManager {
    parts: Vec<ManagedPart>,
    vendor_part_ids: HashMap<String, usize>,
}

impl PartsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete parts in order; tool calls still missing a name or arguments
    /// are left out.
    pub fn get_parts(&self) -> Vec<ModelResponsePart> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ManagedPart::Text(text) => Some(ModelResponsePart::Text(text.clone())),
                ManagedPart::ToolCall(call) => Some(ModelResponsePart::ToolCall(call.clone())),
                ManagedPart::Partial(_) => None,
            })
            .collect()
    }

    /// The part at `index` if it is complete.
    pub fn part(&self, index: usize) -> Option<ModelResponsePart> {
        match self.parts.get(index)? {
            ManagedPart::Text(text) => Some(ModelResponsePart::Text(text.clone())),
            ManagedPart::ToolCall(call) => Some(ModelResponsePart::ToolCall(call.clone())),
            ManagedPart::Partial(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn handle_text_delta(
        &mut self,
        vendor_part_id: Option<&str>,
        content: impl Into<String>,
    ) -> Result<PartEvent, PartsError> {
        let content = content.into();
        let existing = match vendor_part_id {
            None => match self.parts.last() {
                Some(ManagedPart::Text(_)) => Some(self.parts.len() - 1),
                _ => None,
            },
            Some(id) => match self.vendor_part_ids.get(id) {
                Some(&index) => match &self.parts[index] {
                    ManagedPart::Text(_) => Some(index),
                    _ => return Err(PartsError::TextDeltaOnNonText { index }),
                },
                None => None,
            },
        };

        match existing {
            Some(index) => {
                if let ManagedPart::Text(text) = &mut self.parts[index] {
                    text.content.push_str(&content);
                }
                Ok(PartEvent::Delta {
                    index,
                    delta: PartDelta::Text {
                        content_delta: content,
                    },
                })
            }
            None => {
                let text = TextPart::new(content);
                let index = self.push(vendor_part_id, ManagedPart::Text(text.clone()));
                Ok(PartEvent::Start {
                    index,
                    part: ModelResponsePart::Text(text),
                })
            }
        }
    }

    /// Applies one tool call fragment. Returns `None` while the call is still
    /// missing its name or arguments.
    pub fn handle_tool_call_delta(
        &mut self,
        vendor_part_id: Option<&str>,
        tool_name: Option<String>,
        args: Option<ToolArgs>,
        tool_call_id: Option<String>,
    ) -> Result<Option<PartEvent>, PartsError> {
        let existing = match vendor_part_id {
            None => match self.parts.last() {
                Some(ManagedPart::ToolCall(_) | ManagedPart::Partial(_)) => {
                    Some(self.parts.len() - 1)
                }
                _ => None,
            },
            Some(id) => match self.vendor_part_ids.get(id) {
                Some(&index) => match &self.parts[index] {
                    ManagedPart::ToolCall(_) | ManagedPart::Partial(_) => Some(index),
                    ManagedPart::Text(_) => {
                        return Err(PartsError::ToolCallDeltaOnNonToolCall { index });
                    }
                },
                None => None,
            },
        };

        let Some(index) = existing else {
            let partial = PartialToolCall {
                tool_name,
                args,
                tool_call_id,
            };
            return Ok(match partial.promote() {
                Some(call) => {
                    let index = self.push(vendor_part_id, ManagedPart::ToolCall(call.clone()));
                    Some(PartEvent::Start {
                        index,
                        part: ModelResponsePart::ToolCall(call),
                    })
                }
                None => {
                    self.push(vendor_part_id, ManagedPart::Partial(partial));
                    None
                }
            });
        };

        match &mut self.parts[index] {
            ManagedPart::ToolCall(call) => {
                if let Some(name_delta) = &tool_name {
                    call.tool_name.push_str(name_delta);
                }
                if let Some(args_delta) = &args {
                    call.args = merge_args(index, Some(&call.args), args_delta)?;
                }
                call.tool_call_id = merge_call_id(index, call.tool_call_id.clone(), &tool_call_id)?;
                Ok(Some(PartEvent::Delta {
                    index,
                    delta: PartDelta::ToolCall {
                        tool_name_delta: tool_name,
                        args_delta: args,
                        tool_call_id,
                    },
                }))
            }
            ManagedPart::Partial(partial) => {
                if let Some(name_delta) = tool_name {
                    partial
                        .tool_name
                        .get_or_insert_with(String::new)
                        .push_str(&name_delta);
                }
                if let Some(args_delta) = &args {
                    partial.args = Some(merge_args(index, partial.args.as_ref(), args_delta)?);
                }
                partial.tool_call_id =
                    merge_call_id(index, partial.tool_call_id.clone(), &tool_call_id)?;

                match partial.promote() {
                    Some(call) => {
                        self.parts[index] = ManagedPart::ToolCall(call.clone());
                        Ok(Some(PartEvent::Start {
                            index,
                            part: ModelResponsePart::ToolCall(call),
                        }))
                    }
                    None => Ok(None),
                }
            }
            ManagedPart::Text(_) => Err(PartsError::ToolCallDeltaOnNonToolCall { index }),
        }
    }

    /// Registers a fully formed tool call. A known vendor id has its part
    /// replaced in place; otherwise the call is appended as a new part.
    pub fn handle_tool_call_part(
        &mut self,
        vendor_part_id: Option<&str>,
        tool_name: impl Into<String>,
        args: ToolArgs,
        tool_call_id: Option<String>,
    ) -> PartEvent {
        let call = ToolCallPart {
            tool_name: tool_name.into(),
            args,
            tool_call_id,
        };
        let known = vendor_part_id.and_then(|id| self.vendor_part_ids.get(id).copied());
        let index = match known {
            Some(index) => {
                self.parts[index] = ManagedPart::ToolCall(call.clone());
                index
            }
            None => self.push(vendor_part_id, ManagedPart::ToolCall(call.clone())),
        };
        PartEvent::Start {
            index,
            part: ModelResponsePart::ToolCall(call),
        }
    }

    fn push(&mut self, vendor_part_id: Option<&str>, part: ManagedPart) -> usize {
        let index = self.parts.len();
        self.parts.push(part);
        if let Some(id) = vendor_part_id {
            self.vendor_part_ids.insert(id.to_string(), index);
        }
        index
    }
}

fn merge_args(
    index: usize,
    existing: Option<&ToolArgs>,
    delta: &ToolArgs,
) -> Result<ToolArgs, PartsError> {
    match (existing, delta) {
        (None, delta) => Ok(delta.clone()),
        (Some(ToolArgs::Json(current)), ToolArgs::Json(fragment)) => {
            Ok(ToolArgs::Json(format!("{current}{fragment}")))
        }
        (Some(ToolArgs::Dict(current)), ToolArgs::Dict(fragment)) => {
            let mut merged = current.clone();
            for (key, value) in fragment {
                merged.insert(key.clone(), value.clone());
            }
            Ok(ToolArgs::Dict(merged))
        }
        _ => Err(PartsError::MixedArgsDelta { index }),
    }
}

fn merge_call_id(
    index: usize,
    existing: Option<String>,
    update: &Option<String>,
) -> Result<Option<String>, PartsError> {
    match (existing, update) {
        (Some(existing), Some(new)) if existing != *new => Err(PartsError::ConflictingToolCallId {
            index,
            existing,
            new: new.clone(),
        }),
        (Some(existing), _) => Ok(Some(existing)),
        (None, update) => Ok(update.clone()),
    }
}
