//! Request and response types for the gateway API.

use crate::catalog::Capability;
use crate::store::{SubscriptionStatus, UsageSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub app: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, alias = "maxTokens")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct UsageResponse {
    pub caller_id: String,
    pub period: UsagePeriod,
    pub summary: UsageSummary,
    pub ledger: LedgerView,
}

#[derive(Serialize)]
pub struct UsagePeriod {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct LedgerView {
    pub monthly_tokens: u64,
    /// `None` when the plan has no allowance.
    pub token_allowance: Option<u64>,
    pub credit_balance: i64,
    pub status: SubscriptionStatus,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Serialize)]
pub struct ModelInfo {
    /// Identifier callers pass as `model`.
    pub id: String,
    pub object: &'static str,
    pub catalog_id: String,
    pub owned_by: &'static str,
    pub capabilities: Vec<Capability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    pub pricing: ModelPricing,
}

/// Effective per-1000-token prices, markup included.
#[derive(Serialize)]
pub struct ModelPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}
