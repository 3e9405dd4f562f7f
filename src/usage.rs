use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request and token counters for a run (or for a single model request).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub requests: u64,
    pub request_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, u64>,
}

impl Usage {
    pub fn new(request_tokens: u64, response_tokens: u64) -> Self {
        Self {
            requests: 0,
            request_tokens,
            response_tokens,
            total_tokens: request_tokens + response_tokens,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: u64) -> Self {
        *self.details.entry(key.into()).or_insert(0) += value;
        self
    }

    /// Folds `other` into `self`, counting `requests` additional requests.
    pub fn incr(&mut self, other: &Usage, requests: u64) {
        self.requests += requests + other.requests;
        self.request_tokens += other.request_tokens;
        self.response_tokens += other.response_tokens;
        self.total_tokens += other.total_tokens;
        for (key, value) in &other.details {
            *self.details.entry(key.clone()).or_insert(0) += value;
        }
    }
}

impl AddAssign<&Usage> for Usage {
    fn add_assign(&mut self, rhs: &Usage) {
        self.incr(rhs, 0);
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(mut self, rhs: Usage) -> Usage {
        self += &rhs;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageLimits {
    pub request_limit: Option<u64>,
    pub request_tokens_limit: Option<u64>,
    pub response_tokens_limit: Option<u64>,
    pub total_tokens_limit: Option<u64>,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            request_limit: Some(50),
            request_tokens_limit: None,
            response_tokens_limit: None,
            total_tokens_limit: None,
        }
    }
}

impl UsageLimits {
    pub fn unlimited() -> Self {
        Self {
            request_limit: None,
            ..Default::default()
        }
    }

    pub fn has_token_limits(&self) -> bool {
        self.request_tokens_limit.is_some()
            || self.response_tokens_limit.is_some()
            || self.total_tokens_limit.is_some()
    }

    /// Called before a request is sent: fails if one more request would go
    /// over the request limit.
    pub fn check_before_request(&self, usage: &Usage) -> Result<(), UsageError> {
        if let Some(limit) = self.request_limit
            && usage.requests >= limit
        {
            return Err(UsageError::RequestLimitExceeded { limit });
        }
        Ok(())
    }

    pub fn check_tokens(&self, usage: &Usage) -> Result<(), UsageError> {
        if let Some(limit) = self.request_tokens_limit
            && usage.request_tokens > limit
        {
            return Err(UsageError::RequestTokensLimitExceeded {
                limit,
                used: usage.request_tokens,
            });
        }
        if let Some(limit) = self.response_tokens_limit
            && usage.response_tokens > limit
        {
            return Err(UsageError::ResponseTokensLimitExceeded {
                limit,
                used: usage.response_tokens,
            });
        }
        if let Some(limit) = self.total_tokens_limit
            && usage.total_tokens > limit
        {
            return Err(UsageError::TotalTokensLimitExceeded {
                limit,
                used: usage.total_tokens,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("the next request would exceed the request limit of {limit}")]
    RequestLimitExceeded { limit: u64 },
    #[error("exceeded the request tokens limit of {limit} (used {used})")]
    RequestTokensLimitExceeded { limit: u64, used: u64 },
    #[error("exceeded the response tokens limit of {limit} (used {used})")]
    ResponseTokensLimitExceeded { limit: u64, used: u64 },
    #[error("exceeded the total tokens limit of {limit} (used {used})")]
    TotalTokensLimitExceeded { limit: u64, used: u64 },
}
