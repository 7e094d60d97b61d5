//! Persistence seams consumed by the gateway pipeline.
//!
//! Each collaborator is a small async trait so the pipeline can be wired against any durable
//! store. [`GatewayDb`] implements all of them on SQLite.

mod sqlite;
#[cfg(test)]
mod tests;

pub use sqlite::{hash_api_key, GatewayDb};

use crate::catalog::{ExternalModel, InternalModel};
use crate::usage::UsageRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Admission limits attached to a caller. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub requests_per_minute: Option<u32>,
    pub requests_per_day: Option<u32>,
    pub token_allowance: Option<u64>,
    /// Caller may keep going past the allowance while the credit balance is positive.
    pub pay_as_you_go: bool,
    /// Caller may route to their own external models.
    pub byom_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing ledger state for one caller.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub monthly_tokens: u64,
    /// Smallest currency unit.
    pub credit_balance: i64,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct UsageSummary {
    pub total_requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub by_model: Vec<ModelUsage>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelUsage {
    pub kind: String,
    pub model_id: String,
    pub requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// API-key authentication and plan lookup.
#[async_trait]
pub trait CallerDirectory: Send + Sync {
    async fn authenticate(&self, api_key: &str) -> Result<Option<String>, StoreError>;
    async fn get_plan(&self, caller_id: &str) -> Result<Plan, StoreError>;
}

/// Internal and external model catalogs.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Active internal model whose id or slug equals `key`.
    async fn find_internal_model(&self, key: &str) -> Result<Option<InternalModel>, StoreError>;
    /// Active external model owned by `owner_id` whose id or model name equals `key`.
    async fn find_external_model(
        &self,
        key: &str,
        owner_id: &str,
    ) -> Result<Option<ExternalModel>, StoreError>;
    async fn list_internal_models(&self) -> Result<Vec<InternalModel>, StoreError>;
    async fn list_external_models(&self, owner_id: &str) -> Result<Vec<ExternalModel>, StoreError>;
}

/// Per-caller billing ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_monthly_usage(&self, caller_id: &str) -> Result<LedgerSnapshot, StoreError>;
    /// Atomically add `delta_tokens` to the running monthly counter.
    async fn increment_monthly_usage(&self, caller_id: &str, delta_tokens: u64) -> Result<(), StoreError>;
}

/// Append-only usage record sink plus the reads admission and reporting need.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: &UsageRecord) -> Result<(), StoreError>;
    /// Number of records (any outcome) for `caller_id` created at or after `since`.
    async fn count_since(&self, caller_id: &str, since: DateTime<Utc>) -> Result<u64, StoreError>;
    async fn summarize(
        &self,
        caller_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, StoreError>;
}
