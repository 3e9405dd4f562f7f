use std::fmt;

use thiserror::Error;

use crate::model::ModelError;
use crate::parts_manager::PartsError;
use crate::tools::ToolError;
use crate::usage::UsageError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryTarget {
    Tool(String),
    Result,
}

impl fmt::Display for RetryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryTarget::Tool(name) => write!(f, "tool '{name}'"),
            RetryTarget::Result => f.write_str("result validation"),
        }
    }
}

/// Coarse classification of a failed run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A usage limit or a retry budget was exhausted.
    ResourceExceeded,
    /// The model produced something the run cannot continue from.
    ModelBehavior,
    /// A tool, prompt function or validator raised an application error.
    Application,
    /// The model adapter itself failed.
    Model,
    Config,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("usage limit exceeded: {0}")]
    Usage(#[from] UsageError),
    #[error("exceeded maximum retries ({max_retries}) for {target}")]
    RetriesExceeded {
        target: RetryTarget,
        max_retries: u32,
    },
    #[error("unexpected model behavior: {0}")]
    UnexpectedModelBehavior(String),
    #[error("invalid streamed response: {0}")]
    Parts(#[from] PartsError),
    #[error("result validation failed: {0}")]
    ResultValidation(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Usage(_) | AgentError::RetriesExceeded { .. } => {
                ErrorKind::ResourceExceeded
            }
            AgentError::UnexpectedModelBehavior(_)
            | AgentError::Parts(_)
            | AgentError::ResultValidation(_) => ErrorKind::ModelBehavior,
            AgentError::Tool(_) => ErrorKind::Application,
            AgentError::Model(_) => ErrorKind::Model,
            AgentError::Config(_) => ErrorKind::Config,
        }
    }
}
