//! Application state shared across all route handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dealchat_chat::{ChatError, ChatOrchestrator, RateLimiter};
use dealchat_core::clock::Clock;
use dealchat_core::config::DealchatConfig;
use dealchat_core::types::Identity;

use crate::error::ApiError;

/// Shared application state. Cheap to clone; everything sits behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DealchatConfig>,
    pub orchestrator: Arc<ChatOrchestrator>,
    /// Limiter shared with the orchestrator, used for management routes.
    pub limiter: Arc<dyn RateLimiter>,
    pub clock: Arc<dyn Clock>,
    /// Bearer token to caller identity.
    pub tokens: Arc<HashMap<String, Identity>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: DealchatConfig,
        orchestrator: Arc<ChatOrchestrator>,
        limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
        tokens: HashMap<String, Identity>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
            limiter,
            clock,
            tokens: Arc::new(tokens),
            start_time: Instant::now(),
        }
    }

    /// Identity registered for `token`, if any.
    pub fn identity_for(&self, token: &str) -> Option<&Identity> {
        self.tokens.get(token)
    }

    /// Map an orchestrator error to a response, timing rate-limit resets
    /// against this state's clock.
    pub fn api_error(&self, err: ChatError) -> ApiError {
        ApiError::from_chat(err, self.clock.now())
    }
}
