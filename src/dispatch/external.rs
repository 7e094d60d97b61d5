//! External (BYOM) provider: templated request, caller-declared headers, mapped response.

use super::template::{RequestTemplate, ResponseMapping};
use super::{
    extract_usage, object, rewrite_model, send_json, usage_value, DispatchError, DispatchErrorKind,
    DispatchRequest, Dispatched,
};
use crate::catalog::ExternalModel;
use crate::secrets::CredentialDecryptor;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

pub(super) async fn dispatch(
    client: &reqwest::Client,
    decryptor: &dyn CredentialDecryptor,
    model: &ExternalModel,
    model_alias: &str,
    request: &DispatchRequest,
) -> Result<Dispatched, DispatchError> {
    let credential = if model.credential.is_empty() {
        None
    } else {
        let plain = decryptor.decrypt(&model.credential).map_err(|e| {
            DispatchError::new(
                DispatchErrorKind::Credential,
                format!("credential for model {} unusable: {}", model.id, e),
            )
        })?;
        Some(plain)
    };

    let headers = build_headers(credential.as_deref(), &model.custom_headers);
    let body = build_body(model, request);

    let raw = send_json(client.post(&model.endpoint_url).headers(headers).json(&body)).await?;
    normalize(raw, model.response_mapping.as_ref(), model_alias, request.is_embedding())
}

/// Outbound headers. Custom headers never replace `content-type` or `authorization`.
pub(super) fn build_headers(credential: Option<&str>, custom: &BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(credential) = credential {
        match HeaderValue::from_str(&format!("Bearer {}", credential)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("Decrypted credential is not a valid header value, sending without auth"),
        }
    }

    for (name, value) in custom {
        let parsed = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        );
        match parsed {
            (Ok(name), _) if name == CONTENT_TYPE || name == AUTHORIZATION => {
                tracing::warn!(header = %name, "Ignoring custom header that would override a protected header");
            }
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Ignoring malformed custom header"),
        }
    }

    headers
}

/// Outbound body: the template overlaid with live fields, or a default body.
///
/// Sampling fields resolve as live value, then template value, then the default.
pub(super) fn build_body(model: &ExternalModel, request: &DispatchRequest) -> Value {
    let template = model.request_template.as_ref();
    let live = live_fields(model, template, request);

    match template {
        Some(template) => template.overlay(live),
        None => Value::Object(live),
    }
}

fn live_fields(
    model: &ExternalModel,
    template: Option<&RequestTemplate>,
    request: &DispatchRequest,
) -> Map<String, Value> {
    match request {
        DispatchRequest::Chat {
            messages,
            temperature,
            max_tokens,
        } => {
            let declared = |key: &str| template.and_then(|t| t.get(key)).cloned();
            let temperature = temperature
                .map(|t| json!(t))
                .or_else(|| declared("temperature"))
                .unwrap_or_else(|| json!(DEFAULT_TEMPERATURE));
            let max_tokens = max_tokens
                .map(|m| json!(m))
                .or_else(|| declared("max_tokens"))
                .unwrap_or_else(|| json!(DEFAULT_MAX_TOKENS));

            object([
                ("model", json!(model.model_name)),
                ("messages", Value::Array(messages.clone())),
                ("temperature", temperature),
                ("max_tokens", max_tokens),
            ])
        }
        DispatchRequest::Embed { input } => object([
            ("model", json!(model.model_name)),
            ("input", input.clone()),
        ]),
    }
}

/// Normalize a raw provider body into the gateway's response shape.
pub(super) fn normalize(
    raw: Value,
    mapping: Option<&ResponseMapping>,
    model_alias: &str,
    embedding: bool,
) -> Result<Dispatched, DispatchError> {
    let Some(mapping) = mapping else {
        let usage = extract_usage(raw.get("usage"), embedding)?;
        return Ok(Dispatched {
            body: rewrite_model(raw, model_alias)?,
            usage,
        });
    };

    let fields = mapping.extract(&raw);
    let usage = extract_usage(fields.usage.as_ref(), embedding)?;

    let (default_object, items_key) = if embedding {
        ("list", "data")
    } else {
        ("chat.completion", "choices")
    };
    let id = fields
        .id
        .unwrap_or_else(|| json!(format!("gen-{}", uuid::Uuid::new_v4())));
    let object_name = fields.object.unwrap_or_else(|| json!(default_object));
    let created = fields
        .created
        .unwrap_or_else(|| json!(chrono::Utc::now().timestamp()));

    let body = object([
        ("id", id),
        ("object", object_name),
        ("created", created),
        ("model", json!(model_alias)),
        (items_key, fields.choices.unwrap_or_else(|| json!([]))),
        ("usage", usage_value(usage)),
    ]);

    Ok(Dispatched {
        body: Value::Object(body),
        usage,
    })
}
