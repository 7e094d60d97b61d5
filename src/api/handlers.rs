//! HTTP handlers for the gateway API.

use super::types::*;
use super::AppState;
use crate::admission::RateLimitInfo;
use crate::catalog::{ExternalModel, InternalModel, ModelDescriptor};
use crate::dispatch::DispatchRequest;
use crate::error::GatewayError;
use crate::metering::{self, TokenUsage};
use crate::pipeline::GatewayRequest;
use crate::store::StoreError;
use crate::usage::ClientMeta;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const API_KEY_HEADER: &str = "x-api-key";
const MAX_REQUEST_ID_LEN: usize = 128;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

// ============================================================================
// Health and Models handlers
// ============================================================================

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app: "tollgate",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let response = match visible_models(&state, &headers).await {
        Ok(data) => Json(ModelsResponse { object: "list", data }).into_response(),
        Err(e) => e.into_response(),
    };
    finish(response, &request_id, None)
}

async fn visible_models(state: &AppState, headers: &HeaderMap) -> Result<Vec<ModelInfo>, GatewayError> {
    let caller_id = authenticate(state, headers).await?;
    let plan = state.gateway.plan(&caller_id).await?;

    let mut data: Vec<ModelInfo> = state
        .catalog
        .list_internal_models()
        .await
        .map_err(internal)?
        .into_iter()
        .map(internal_info)
        .collect();

    if plan.byom_enabled {
        let external = state.catalog.list_external_models(&caller_id).await.map_err(internal)?;
        data.extend(external.into_iter().map(external_info));
    }
    Ok(data)
}

fn internal_info(model: InternalModel) -> ModelInfo {
    let pricing = effective_pricing(&ModelDescriptor::Internal(model.clone()));
    ModelInfo {
        id: model.slug,
        object: "model",
        catalog_id: model.id,
        owned_by: "tollgate",
        capabilities: model.capabilities,
        context_window: Some(model.context_window),
        pricing,
    }
}

fn external_info(model: ExternalModel) -> ModelInfo {
    let pricing = effective_pricing(&ModelDescriptor::External(model.clone()));
    ModelInfo {
        id: model.model_name,
        object: "model",
        catalog_id: model.id,
        owned_by: "caller",
        capabilities: model.capabilities,
        context_window: None,
        pricing,
    }
}

/// Price of one thousand tokens each way, priced exactly as the meter would.
fn effective_pricing(descriptor: &ModelDescriptor) -> ModelPricing {
    let cost = metering::cost(TokenUsage::new(1000, 1000), descriptor);
    ModelPricing {
        prompt_per_1k: cost.prompt,
        completion_per_1k: cost.completion,
    }
}

// ============================================================================
// Metered endpoints
// ============================================================================

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request_id = request_id(&headers);
    let prepared = prepare_chat(&state, &headers, &request_id, body).await;
    run_pipeline(&state, &request_id, prepared).await
}

async fn prepare_chat(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<GatewayRequest, GatewayError> {
    let caller_id = authenticate(state, headers).await?;
    let Json(body) = body.map_err(invalid_body)?;

    if body.stream.unwrap_or(false) {
        return Err(GatewayError::StreamingUnsupported);
    }
    require_model(&body.model)?;
    if body.messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages must not be empty".to_string()));
    }

    Ok(GatewayRequest {
        caller_id,
        request_id: request_id.to_string(),
        client: client_meta(headers),
        model: body.model,
        payload: DispatchRequest::Chat {
            messages: body.messages,
            temperature: body.temperature,
            max_tokens: body.max_tokens,
        },
    })
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Response {
    let request_id = request_id(&headers);
    let prepared = prepare_embedding(&state, &headers, &request_id, body).await;
    run_pipeline(&state, &request_id, prepared).await
}

async fn prepare_embedding(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
    body: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Result<GatewayRequest, GatewayError> {
    let caller_id = authenticate(state, headers).await?;
    let Json(body) = body.map_err(invalid_body)?;
    require_model(&body.model)?;
    if body.input.is_null() {
        return Err(GatewayError::InvalidRequest("input is required".to_string()));
    }

    Ok(GatewayRequest {
        caller_id,
        request_id: request_id.to_string(),
        client: client_meta(headers),
        model: body.model,
        payload: DispatchRequest::Embed { input: body.input },
    })
}

async fn run_pipeline(
    state: &AppState,
    request_id: &str,
    prepared: Result<GatewayRequest, GatewayError>,
) -> Response {
    let request = match prepared {
        Ok(request) => request,
        Err(e) => return finish(e.into_response(), request_id, None),
    };

    let outcome = state.gateway.handle(request).await;
    let response = match outcome.result {
        Ok(completion) => Json(completion.body).into_response(),
        Err(e) => e.into_response(),
    };
    finish(response, request_id, outcome.rate_limit.as_ref())
}

// ============================================================================
// Usage reporting
// ============================================================================

pub async fn usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<UsageQuery>, QueryRejection>,
) -> Response {
    let request_id = request_id(&headers);
    let response = match usage_report(&state, &headers, query).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    };
    finish(response, &request_id, None)
}

async fn usage_report(
    state: &AppState,
    headers: &HeaderMap,
    query: Result<Query<UsageQuery>, QueryRejection>,
) -> Result<UsageResponse, GatewayError> {
    let caller_id = authenticate(state, headers).await?;
    let Query(query) = query.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    if let (Some(start), Some(end)) = (query.start, query.end) {
        if start >= end {
            return Err(GatewayError::InvalidRequest("start must be before end".to_string()));
        }
    }

    let plan = state.gateway.plan(&caller_id).await?;
    let summary = state
        .usage
        .summarize(&caller_id, query.start, query.end)
        .await
        .map_err(internal)?;
    let ledger = state.ledger.get_monthly_usage(&caller_id).await.map_err(internal)?;

    Ok(UsageResponse {
        caller_id,
        period: UsagePeriod {
            start: query.start,
            end: query.end,
        },
        summary,
        ledger: LedgerView {
            monthly_tokens: ledger.monthly_tokens,
            token_allowance: plan.token_allowance,
            credit_balance: ledger.credit_balance,
            status: ledger.status,
        },
    })
}

// ============================================================================
// Request helpers
// ============================================================================

/// Pull the API key from `Authorization: Bearer` or `x-api-key` and map it to a caller.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, GatewayError> {
    let api_key = api_key(headers).ok_or(GatewayError::Unauthorized)?;
    state.gateway.authenticate(api_key).await
}

pub fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .or_else(|| {
            headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|key| !key.is_empty())
        })
}

/// Honour a well-formed inbound `x-request-id`, otherwise mint one.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let ip = header_str("x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str("x-real-ip"))
        .map(str::to_string);

    ClientMeta {
        ip,
        user_agent: header_str(header::USER_AGENT.as_str()).map(str::to_string),
    }
}

fn require_model(model: &str) -> Result<(), GatewayError> {
    if model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("model is required".to_string()));
    }
    Ok(())
}

fn invalid_body(rejection: JsonRejection) -> GatewayError {
    GatewayError::InvalidRequest(rejection.body_text())
}

fn internal(error: StoreError) -> GatewayError {
    tracing::error!(error = %error, "Store read failed");
    GatewayError::Internal
}

/// Attach the correlation id and any rate-limit telemetry to an outgoing response.
fn finish(mut response: Response, request_id: &str, rate_limit: Option<&RateLimitInfo>) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Some(info) = rate_limit {
        headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(info.limit));
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(info.remaining));
        headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(info.reset_unix()));
    }
    response
}
