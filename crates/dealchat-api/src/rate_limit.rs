//! Rate-limit middleware for conversation management routes.
//!
//! Uses the same fixed-window limiter as chat turns under a separate key
//! prefix, so list/create/rename/delete traffic has its own budget.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use dealchat_chat::{rate_subject, ChatError};
use dealchat_core::types::{Identity, RateWindow};

use crate::state::AppState;

const MANAGEMENT_KEY_PREFIX: &str = "api:conversations";

/// Network origin of a request: the first `x-forwarded-for` entry, or
/// `anon` when absent.
pub fn client_origin(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anon")
        .to_string()
}

/// Axum middleware enforcing the management-route budget.
pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let origin = client_origin(req.headers());
    let identity = req.extensions().get::<Identity>();
    let window = RateWindow::new(
        format!("{}:{}", MANAGEMENT_KEY_PREFIX, rate_subject(identity, &origin)),
        state.config.rate_limit.api_limit,
        state.config.rate_limit.api_window_ms,
    );

    let decision = state.limiter.check(&window).await;
    if decision.allowed {
        return next.run(req).await;
    }

    tracing::debug!(key = %window.key, "Management request rate limited");
    state
        .api_error(ChatError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        })
        .into_response()
}
