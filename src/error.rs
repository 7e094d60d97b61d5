//! Unified error handling for the gateway.
//!
//! Every rejected request maps to one variant with a status code, a machine-readable reason
//! code and a message safe to show the caller.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Caller-facing gateway error.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Missing or unknown API key.
    Unauthorized,
    /// Caller has no plan attached.
    Forbidden(String),
    /// Malformed request body or parameters.
    InvalidRequest(String),
    /// `stream: true` was requested.
    StreamingUnsupported,
    /// Sliding-window throughput limit hit.
    RateLimited {
        limit: u32,
        reset_at: DateTime<Utc>,
    },
    /// Daily request volume used up.
    DailyQuotaExceeded {
        limit: u32,
        used: u64,
        reset_at: DateTime<Utc>,
    },
    /// Monthly token allowance exhausted with no usable credit.
    AllowanceExceeded { allowance: u64, used: u64 },
    /// No model with this identifier is visible to the caller.
    ModelNotFound(String),
    /// Model exists but does not serve the requested operation.
    CapabilityMismatch { model: String, capability: String },
    /// Provider call failed. Details stay in the usage record.
    Upstream,
    /// Provider call exceeded its deadline.
    UpstreamTimeout,
    /// Storage or other internal failure. Details are only logged.
    Internal,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "Missing or invalid API key"),
            Self::Forbidden(msg) => write!(f, "{}", msg),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::StreamingUnsupported => write!(f, "Streaming responses are not supported"),
            Self::RateLimited { limit, .. } => {
                write!(f, "Rate limit of {} requests per minute exceeded", limit)
            }
            Self::DailyQuotaExceeded { limit, .. } => {
                write!(f, "Daily limit of {} requests reached", limit)
            }
            Self::AllowanceExceeded { allowance, .. } => write!(
                f,
                "Monthly token allowance of {} exhausted; upgrade the plan or add credit",
                allowance
            ),
            Self::ModelNotFound(model) => write!(f, "Model '{}' not found", model),
            Self::CapabilityMismatch { model, capability } => {
                write!(f, "Model '{}' does not support {}", model, capability)
            }
            Self::Upstream => write!(f, "The model provider failed to complete the request"),
            Self::UpstreamTimeout => write!(f, "The model provider timed out"),
            Self::Internal => write!(f, "Internal server error"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Error response structure for JSON serialization.
#[derive(Serialize)]
struct ErrorResponseBody {
    error: ErrorDetail,
}

#[derive(Serialize, Default)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capability: Option<String>,
}

impl GatewayError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::StreamingUnsupported => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::DailyQuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::AllowanceExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::CapabilityMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::Upstream => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidRequest(_) => "invalid_request",
            Self::StreamingUnsupported => "streaming_unsupported",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::DailyQuotaExceeded { .. } => "daily_quota_exceeded",
            Self::AllowanceExceeded { .. } => "allowance_exceeded",
            Self::ModelNotFound(_) => "model_not_found",
            Self::CapabilityMismatch { .. } => "capability_mismatch",
            Self::Upstream => "upstream_error",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::Internal => "internal_error",
        }
    }

    /// Reset instant for retryable admission errors.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RateLimited { reset_at, .. } | Self::DailyQuotaExceeded { reset_at, .. } => {
                Some(*reset_at)
            }
            _ => None,
        }
    }

    fn detail(&self) -> ErrorDetail {
        let base = ErrorDetail {
            message: self.to_string(),
            r#type: self.error_type(),
            ..ErrorDetail::default()
        };
        match self {
            Self::RateLimited { limit, reset_at } => ErrorDetail {
                limit: Some(u64::from(*limit)),
                reset_at: Some(reset_at.timestamp()),
                ..base
            },
            Self::DailyQuotaExceeded {
                limit,
                used,
                reset_at,
            } => ErrorDetail {
                limit: Some(u64::from(*limit)),
                used: Some(*used),
                reset_at: Some(reset_at.timestamp()),
                ..base
            },
            Self::AllowanceExceeded { allowance, used } => ErrorDetail {
                limit: Some(*allowance),
                used: Some(*used),
                ..base
            },
            Self::ModelNotFound(model) => ErrorDetail {
                model: Some(model.clone()),
                ..base
            },
            Self::CapabilityMismatch { model, capability } => ErrorDetail {
                model: Some(model.clone()),
                capability: Some(capability.clone()),
                ..base
            },
            _ => base,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self
            .reset_at()
            .map(|reset_at| crate::admission::retry_after(reset_at, Utc::now()));
        let mut response = (status, Json(ErrorResponseBody { error: self.detail() })).into_response();

        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
