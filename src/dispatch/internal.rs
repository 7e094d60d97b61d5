//! Internal provider: OpenAI-compatible `/chat/completions` and `/embeddings`.

use super::{
    extract_usage, object, rewrite_model, send_json, DispatchError, DispatchRequest, Dispatched,
    InternalProvider,
};
use crate::catalog::InternalModel;
use serde_json::{json, Value};

pub(super) async fn dispatch(
    client: &reqwest::Client,
    provider: &InternalProvider,
    model: &InternalModel,
    model_alias: &str,
    caller_id: &str,
    request: &DispatchRequest,
) -> Result<Dispatched, DispatchError> {
    let (path, body) = match request {
        DispatchRequest::Chat {
            messages,
            temperature,
            max_tokens,
        } => {
            let mut body = object([
                ("model", json!(model.upstream_model)),
                ("messages", Value::Array(messages.clone())),
                ("user", json!(caller_id)),
            ]);
            if let Some(t) = temperature {
                body.insert("temperature".to_string(), json!(t));
            }
            if let Some(m) = max_tokens {
                body.insert("max_tokens".to_string(), json!(m));
            }
            ("chat/completions", Value::Object(body))
        }
        DispatchRequest::Embed { input } => (
            "embeddings",
            json!({
                "model": model.upstream_model,
                "input": input,
                "user": caller_id,
            }),
        ),
    };

    let mut builder = client
        .post(format!("{}/{}", provider.base_url, path))
        .header("Content-Type", "application/json");
    if let Some(key) = &provider.api_key {
        builder = builder.header("Authorization", format!("Bearer {}", key));
    }

    let raw = send_json(builder.json(&body)).await?;
    let usage = extract_usage(raw.get("usage"), request.is_embedding())?;

    Ok(Dispatched {
        body: rewrite_model(raw, model_alias)?,
        usage,
    })
}
