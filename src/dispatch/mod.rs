//! Provider dispatch: one call to whichever provider a [`ModelDescriptor`] designates.
//!
//! The internal provider speaks the OpenAI-compatible protocol natively. External (BYOM)
//! providers get request templating, custom headers and response field-mapping so both paths
//! return the same normalized shape. Calls are never retried here.

mod external;
mod internal;
pub mod template;

use crate::catalog::ModelDescriptor;
use crate::config::UpstreamConfig;
use crate::metering::{TokenUsage, MAX_TOKEN_COUNT};
use crate::secrets::CredentialDecryptor;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Upper bound on how much of an upstream error body is kept for diagnostics.
const ERROR_SNIPPET_CHARS: usize = 500;

/// Live request fields forwarded to a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchRequest {
    Chat {
        messages: Vec<Value>,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
    },
    Embed {
        input: Value,
    },
}

impl DispatchRequest {
    pub fn is_embedding(&self) -> bool {
        matches!(self, DispatchRequest::Embed { .. })
    }
}

/// Normalized provider response plus the tokens it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub body: Value,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    Transport,
    Status(u16),
    Timeout,
    InvalidResponse,
    Credential,
}

/// Terminal dispatch failure. `message` is for logs and the usage record only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError {
    pub kind: DispatchErrorKind,
    pub message: String,
}

impl DispatchError {
    pub fn new(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == DispatchErrorKind::Timeout
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(DispatchErrorKind::Timeout, format!("upstream timed out: {}", err))
        } else if err.is_decode() {
            Self::new(DispatchErrorKind::InvalidResponse, format!("unreadable upstream body: {}", err))
        } else {
            Self::new(DispatchErrorKind::Transport, format!("upstream request failed: {}", err))
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DispatchError {}

/// Connection details for the hosted internal provider.
#[derive(Debug, Clone)]
pub struct InternalProvider {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl From<&UpstreamConfig> for InternalProvider {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }
}

pub struct ProviderDispatcher {
    client: reqwest::Client,
    internal: InternalProvider,
    decryptor: Arc<dyn CredentialDecryptor>,
}

impl ProviderDispatcher {
    pub fn new(
        client: reqwest::Client,
        internal: InternalProvider,
        decryptor: Arc<dyn CredentialDecryptor>,
    ) -> Self {
        Self {
            client,
            internal,
            decryptor,
        }
    }

    /// Run one call. `model_alias` is the identifier the caller used and is echoed back as
    /// the response's `model`. `caller_id` is forwarded to the internal provider for tracing.
    pub async fn dispatch(
        &self,
        descriptor: &ModelDescriptor,
        model_alias: &str,
        caller_id: &str,
        request: &DispatchRequest,
    ) -> Result<Dispatched, DispatchError> {
        match descriptor {
            ModelDescriptor::Internal(model) => {
                internal::dispatch(&self.client, &self.internal, model, model_alias, caller_id, request)
                    .await
            }
            ModelDescriptor::External(model) => {
                external::dispatch(&self.client, self.decryptor.as_ref(), model, model_alias, request)
                    .await
            }
        }
    }
}

/// Send a prepared request and decode a JSON object body, mapping every failure mode.
async fn send_json(builder: reqwest::RequestBuilder) -> Result<Value, DispatchError> {
    let response = builder.send().await.map_err(DispatchError::from_reqwest)?;
    let status = response.status();
    let text = response.text().await.map_err(DispatchError::from_reqwest)?;

    if !status.is_success() {
        return Err(DispatchError::new(
            DispatchErrorKind::Status(status.as_u16()),
            format!("upstream returned {}: {}", status.as_u16(), snippet(&text)),
        ));
    }

    serde_json::from_str::<Value>(&text).map_err(|e| {
        DispatchError::new(
            DispatchErrorKind::InvalidResponse,
            format!("upstream body is not JSON ({}): {}", e, snippet(&text)),
        )
    })
}

fn snippet(text: &str) -> &str {
    match text.char_indices().nth(ERROR_SNIPPET_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Read prompt/completion counts from a usage block. Missing or non-numeric fields are 0.
/// A count that is non-finite or above [`MAX_TOKEN_COUNT`] makes the response invalid.
pub fn extract_usage(usage: Option<&Value>, embedding: bool) -> Result<TokenUsage, DispatchError> {
    let field = |names: &[&str]| -> Result<u64, DispatchError> {
        let Some((name, value)) = usage.and_then(|u| {
            names
                .iter()
                .find_map(|name| u.get(*name).map(|v| (*name, v)))
        }) else {
            return Ok(0);
        };
        let count = match value {
            Value::Number(n) => match n.as_u64() {
                Some(count) => Some(count),
                None => n.as_f64().and_then(|f| {
                    // Negative counts read as 0, fractions are truncated.
                    let f = f.max(0.0);
                    (f.is_finite() && f <= MAX_TOKEN_COUNT as f64).then_some(f as u64)
                }),
            },
            _ => return Ok(0),
        };
        count.filter(|c| *c <= MAX_TOKEN_COUNT).ok_or_else(|| {
            DispatchError::new(
                DispatchErrorKind::InvalidResponse,
                format!("upstream reported an implausible {}: {}", name, value),
            )
        })
    };

    let prompt = field(&["prompt_tokens", "promptTokens", "input_tokens", "inputTokens"])?;
    let completion = if embedding {
        0
    } else {
        field(&["completion_tokens", "completionTokens", "output_tokens", "outputTokens"])?
    };
    TokenUsage::checked(prompt, completion).ok_or_else(|| {
        DispatchError::new(DispatchErrorKind::InvalidResponse, "upstream token counts overflow")
    })
}

fn usage_value(usage: TokenUsage) -> Value {
    serde_json::json!({
        "prompt_tokens": usage.prompt(),
        "completion_tokens": usage.completion(),
        "total_tokens": usage.total(),
    })
}

/// Rewrite `model` on an object body to the caller-facing identifier.
fn rewrite_model(body: Value, model_alias: &str) -> Result<Value, DispatchError> {
    match body {
        Value::Object(mut map) => {
            map.insert("model".to_string(), Value::String(model_alias.to_string()));
            Ok(Value::Object(map))
        }
        other => Err(DispatchError::new(
            DispatchErrorKind::InvalidResponse,
            format!("upstream body is not an object: {}", snippet(&other.to_string())),
        )),
    }
}

fn object(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests;
