//! Model catalog types.
//!
//! A resolved model is always one of two kinds:
//! - `Internal`: administered catalog entry served by the hosted provider, priced with markup
//! - `External`: a caller-registered BYOM endpoint, priced directly

use crate::dispatch::template::{RequestTemplate, ResponseMapping};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An operation a model can serve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Embed,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Chat => write!(f, "chat"),
            Capability::Embed => write!(f, "embed"),
        }
    }
}

/// Administered catalog entry served by the internal provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InternalModel {
    pub id: String,
    /// Human-readable key, e.g. `gpt-4o-mini`. Lookups accept either `id` or `slug`.
    pub slug: String,
    pub upstream_model: String,
    pub prompt_price_per_1k: f64,
    pub completion_price_per_1k: f64,
    pub markup_percent: f64,
    pub capabilities: Vec<Capability>,
    pub context_window: u32,
    pub active: bool,
}

/// Caller-registered model pointing at a provider the caller controls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalModel {
    pub id: String,
    pub owner_id: String,
    /// Declared model name, sent upstream and accepted as a lookup key.
    pub model_name: String,
    pub endpoint_url: String,
    /// Stored (encrypted) form of the upstream credential.
    pub credential: String,
    pub prompt_price_per_1k: f64,
    pub completion_price_per_1k: f64,
    #[serde(default)]
    pub request_template: Option<RequestTemplate>,
    #[serde(default)]
    pub response_mapping: Option<ResponseMapping>,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    pub capabilities: Vec<Capability>,
    pub active: bool,
}

/// Per-1000-token pricing rule. `markup_percent` is zero for external models.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceRule {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
    pub markup_percent: f64,
}

/// A concrete upstream model, resolved from a caller-supplied identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDescriptor {
    Internal(InternalModel),
    External(ExternalModel),
}

impl ModelDescriptor {
    pub fn id(&self) -> &str {
        match self {
            ModelDescriptor::Internal(m) => &m.id,
            ModelDescriptor::External(m) => &m.id,
        }
    }

    pub fn capabilities(&self) -> &[Capability] {
        match self {
            ModelDescriptor::Internal(m) => &m.capabilities,
            ModelDescriptor::External(m) => &m.capabilities,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub fn pricing(&self) -> PriceRule {
        match self {
            ModelDescriptor::Internal(m) => PriceRule {
                prompt_per_1k: m.prompt_price_per_1k,
                completion_per_1k: m.completion_price_per_1k,
                markup_percent: m.markup_percent,
            },
            ModelDescriptor::External(m) => PriceRule {
                prompt_per_1k: m.prompt_price_per_1k,
                completion_per_1k: m.completion_price_per_1k,
                markup_percent: 0.0,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelDescriptor::Internal(_) => "internal",
            ModelDescriptor::External(_) => "external",
        }
    }
}
