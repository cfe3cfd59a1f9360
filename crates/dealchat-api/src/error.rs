//! API error types and JSON error response formatting.
//!
//! Every failure leaves the server as `{error, message}` with a matching
//! status code. Server-side failures are logged in full and answered with a
//! generic message.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use dealchat_chat::ChatError;
use dealchat_core::types::RateDecision;

pub const RATE_LIMIT_LIMIT: &str = "ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "ratelimit-reset";

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "forbidden").
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum ApiError {
    /// 401 - missing or unknown bearer token.
    Unauthorized(String),
    /// 400 - malformed request or invalid input.
    BadRequest(String),
    /// 400 - tool input that does not match the tool's contract.
    InvalidToolInput(String),
    /// 403 - resource owned by another user.
    Forbidden(String),
    /// 404 - resource does not exist.
    NotFound(String),
    /// 429 - request budget exhausted.
    RateLimited {
        limit: u64,
        remaining: u64,
        reset_secs: u64,
    },
    /// 500 - model or tool backend failed.
    Upstream { code: &'static str, detail: String },
    /// 500 - unexpected server error.
    Internal(String),
}

impl ApiError {
    /// Convert an orchestrator error, measuring rate-limit resets from `now`.
    pub fn from_chat(err: ChatError, now: DateTime<Utc>) -> Self {
        match err {
            ChatError::Unauthorized => ApiError::Unauthorized(err.to_string()),
            ChatError::RateLimited {
                limit,
                remaining,
                reset_at,
            } => {
                let decision = RateDecision {
                    allowed: false,
                    limit,
                    remaining,
                    reset_at,
                };
                ApiError::RateLimited {
                    limit,
                    remaining,
                    reset_secs: decision.seconds_to_reset(now),
                }
            }
            ChatError::InvalidInput(msg) => ApiError::BadRequest(msg),
            ChatError::InvalidToolInput(msg) => ApiError::InvalidToolInput(msg),
            ChatError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ChatError::Forbidden => ApiError::Forbidden(err.to_string()),
            ChatError::ModelUnavailable(detail) => ApiError::Upstream {
                code: "model_unavailable",
                detail,
            },
            ChatError::ToolExecutionFailed(detail) => ApiError::Upstream {
                code: "tool_execution_failed",
                detail,
            },
            ChatError::PersistenceFailed(detail) => ApiError::Internal(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            ApiError::InvalidToolInput(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_tool_input", msg, None)
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            ApiError::RateLimited {
                limit,
                remaining,
                reset_secs,
            } => {
                let body = ErrorBody {
                    error: "too_many_requests".to_string(),
                    message: format!("Rate limit exceeded, try again in {} seconds", reset_secs),
                    details: Some(serde_json::json!({
                        "limit": limit,
                        "remaining": remaining,
                        "resetSecs": reset_secs,
                    })),
                };
                let headers = [
                    (HeaderName::from_static(RATE_LIMIT_LIMIT), HeaderValue::from(limit)),
                    (HeaderName::from_static(RATE_LIMIT_REMAINING), HeaderValue::from(remaining)),
                    (HeaderName::from_static(RATE_LIMIT_RESET), HeaderValue::from(reset_secs)),
                ];
                return (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response();
            }
            ApiError::Upstream { code, detail } => {
                tracing::error!(code, error = %detail, "Upstream failure");
                let message = match code {
                    "model_unavailable" => "The model is unavailable, please try again",
                    _ => "The requested action failed",
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    code,
                    message.to_string(),
                    None,
                )
            }
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
            details,
        };

        (status, Json(body)).into_response()
    }
}
