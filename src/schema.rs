use std::fmt;
use std::sync::Arc;

use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::messages::ValidationErrorRecord;

/// A parameter or result schema compiled once and shared between steps.
#[derive(Clone)]
pub(crate) struct CompiledSchema {
    schema: Value,
    compiled: Arc<JSONSchema>,
}

impl CompiledSchema {
    pub(crate) fn compile(schema: &Value) -> Result<Self, String> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|err| format!("invalid JSON schema: {err}"))?;
        Ok(Self {
            schema: schema.clone(),
            compiled: Arc::new(compiled),
        })
    }

    pub(crate) fn validate(&self, instance: &Value) -> Result<(), Vec<ValidationErrorRecord>> {
        match self.compiled.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors
                .map(|error| {
                    let kind = match &error.kind {
                        ValidationErrorKind::Type { .. } => "type_error",
                        ValidationErrorKind::Required { .. } => "missing",
                        ValidationErrorKind::AdditionalProperties { .. } => "extra_forbidden",
                        _ => "value_error",
                    };
                    let loc = error.instance_path.clone().into_vec();
                    ValidationErrorRecord::new(loc, error.to_string(), kind)
                        .with_input(error.instance.clone().into_owned())
                })
                .collect()),
        }
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Record for raw arguments that are not valid JSON, reported like a schema
/// mismatch.
pub(crate) fn json_parse_error(raw: &str, err: &serde_json::Error) -> ValidationErrorRecord {
    ValidationErrorRecord::new(Vec::new(), format!("Invalid JSON: {err}"), "json_invalid")
        .with_input(Value::String(raw.to_string()))
}
