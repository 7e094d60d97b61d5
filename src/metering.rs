//! Token metering and cost calculation.
//!
//! Prices are per 1000 tokens. Internal models apply their markup, external models never do.
//! Every cost field is rounded to six decimal places before the total is summed.

use crate::catalog::{ModelDescriptor, PriceRule};
use serde::{Deserialize, Serialize};

/// Fractional digits kept on every cost field.
pub const COST_DECIMALS: i32 = 6;

/// Largest count accepted for a single token field. Two of them still sum inside an SQLite
/// INTEGER.
pub const MAX_TOKEN_COUNT: u64 = i64::MAX as u64 / 2;

/// Token counts for one dispatch attempt. `total` is always `prompt + completion`.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TokenUsage {
    prompt: u64,
    completion: u64,
    total: u64,
}

impl TokenUsage {
    /// Counts above [`MAX_TOKEN_COUNT`] are clamped to it.
    pub fn new(prompt: u64, completion: u64) -> Self {
        let prompt = prompt.min(MAX_TOKEN_COUNT);
        let completion = completion.min(MAX_TOKEN_COUNT);
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    /// `None` when either count exceeds [`MAX_TOKEN_COUNT`].
    pub fn checked(prompt: u64, completion: u64) -> Option<Self> {
        if prompt > MAX_TOKEN_COUNT || completion > MAX_TOKEN_COUNT {
            return None;
        }
        let total = prompt.checked_add(completion)?;
        Some(Self {
            prompt,
            completion,
            total,
        })
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn prompt(&self) -> u64 {
        self.prompt
    }

    pub fn completion(&self) -> u64 {
        self.completion
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Cost of one dispatch attempt in cents.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Cost {
    pub prompt: f64,
    pub completion: f64,
    pub total: f64,
}

/// Compute the cost of `usage` under the descriptor's pricing rule.
pub fn cost(usage: TokenUsage, descriptor: &ModelDescriptor) -> Cost {
    cost_with_rule(usage, descriptor.pricing())
}

pub fn cost_with_rule(usage: TokenUsage, rule: PriceRule) -> Cost {
    let factor = 1.0 + rule.markup_percent.max(0.0) / 100.0;
    let prompt = round_cost(usage.prompt() as f64 / 1000.0 * rule.prompt_per_1k.max(0.0) * factor);
    let completion =
        round_cost(usage.completion() as f64 / 1000.0 * rule.completion_per_1k.max(0.0) * factor);
    Cost {
        prompt,
        completion,
        total: round_cost(prompt + completion),
    }
}

pub fn round_cost(value: f64) -> f64 {
    let scale = 10f64.powi(COST_DECIMALS);
    let rounded = (value * scale).round() / scale;
    if rounded.is_finite() && rounded > 0.0 {
        rounded
    } else {
        0.0
    }
}
