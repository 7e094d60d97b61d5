//! Usage records: the immutable per-attempt log used for billing and quota accounting.

use crate::catalog::ModelDescriptor;
use crate::metering::{self, Cost, TokenUsage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Gateway endpoint that produced a record.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    ChatCompletions,
    Embeddings,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "chat_completions",
            Endpoint::Embeddings => "embeddings",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chat_completions" => Some(Endpoint::ChatCompletions),
            "embeddings" => Some(Endpoint::Embeddings),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to exactly one model, internal or external.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ModelRef {
    Internal(String),
    External(String),
}

impl ModelRef {
    pub fn id(&self) -> &str {
        match self {
            ModelRef::Internal(id) | ModelRef::External(id) => id,
        }
    }
}

impl From<&ModelDescriptor> for ModelRef {
    fn from(descriptor: &ModelDescriptor) -> Self {
        match descriptor {
            ModelDescriptor::Internal(m) => ModelRef::Internal(m.id.clone()),
            ModelDescriptor::External(m) => ModelRef::External(m.id.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { error: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// One dispatch attempt. Built once, appended once, never mutated.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageRecord {
    pub id: String,
    pub caller_id: String,
    pub request_id: String,
    pub endpoint: Endpoint,
    pub model: ModelRef,
    pub tokens: TokenUsage,
    pub cost: Cost,
    pub latency_ms: u64,
    pub outcome: Outcome,
    pub client: ClientMeta,
    pub created_at: DateTime<Utc>,
}

/// Everything known about an attempt before metering.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub caller_id: String,
    pub request_id: String,
    pub endpoint: Endpoint,
    pub client: ClientMeta,
}

impl UsageRecord {
    /// Meter an attempt. Cost is always derived from the descriptor's pricing rule.
    pub fn meter(
        ctx: &AttemptContext,
        descriptor: &ModelDescriptor,
        tokens: TokenUsage,
        latency_ms: u64,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            caller_id: ctx.caller_id.clone(),
            request_id: ctx.request_id.clone(),
            endpoint: ctx.endpoint,
            model: ModelRef::from(descriptor),
            tokens,
            cost: metering::cost(tokens, descriptor),
            latency_ms,
            outcome,
            client: ctx.client.clone(),
            created_at: Utc::now(),
        }
    }
}
