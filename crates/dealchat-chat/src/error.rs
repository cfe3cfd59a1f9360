//! Error types for turn handling.

use chrono::{DateTime, Utc};
use dealchat_core::error::DealchatError;

/// Errors surfaced by the chat orchestrator and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("authentication required")]
    Unauthorized,
    #[error("rate limit exceeded: {remaining} of {limit} requests remaining")]
    RateLimited {
        limit: u64,
        remaining: u64,
        reset_at: DateTime<Utc>,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("conversation not found: {0}")]
    NotFound(uuid::Uuid),
    #[error("conversation belongs to another user")]
    Forbidden,
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("tool execution failed: {0}")]
    ToolExecutionFailed(String),
    #[error("invalid tool input: {0}")]
    InvalidToolInput(String),
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
}

impl From<DealchatError> for ChatError {
    fn from(err: DealchatError) -> Self {
        match err {
            DealchatError::ConversationNotFound(id) => ChatError::NotFound(id),
            other => ChatError::PersistenceFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[test]
    fn test_chat_error_display() {
        assert_eq!(ChatError::Unauthorized.to_string(), "authentication required");

        let err = ChatError::RateLimited {
            limit: 10,
            remaining: 0,
            reset_at: Utc.timestamp_millis_opt(60_000).unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "rate limit exceeded: 0 of 10 requests remaining"
        );

        let err = ChatError::InvalidInput("message cannot be empty".to_string());
        assert_eq!(err.to_string(), "invalid input: message cannot be empty");

        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            ChatError::NotFound(id).to_string(),
            "conversation not found: 550e8400-e29b-41d4-a716-446655440000"
        );

        assert_eq!(
            ChatError::Forbidden.to_string(),
            "conversation belongs to another user"
        );

        let err = ChatError::ModelUnavailable("HTTP 502".to_string());
        assert_eq!(err.to_string(), "model unavailable: HTTP 502");

        let err = ChatError::ToolExecutionFailed("db locked".to_string());
        assert_eq!(err.to_string(), "tool execution failed: db locked");

        let err = ChatError::InvalidToolInput("unknown field `foo`".to_string());
        assert_eq!(err.to_string(), "invalid tool input: unknown field `foo`");

        let err = ChatError::PersistenceFailed("disk full".to_string());
        assert_eq!(err.to_string(), "persistence failed: disk full");
    }

    #[test]
    fn test_from_storage_error() {
        let err: ChatError = DealchatError::Storage("connection lost".to_string()).into();
        assert!(matches!(err, ChatError::PersistenceFailed(_)));
        assert!(err.to_string().contains("connection lost"));
    }

    #[test]
    fn test_from_conversation_not_found() {
        let id = Uuid::new_v4();
        let err: ChatError = DealchatError::ConversationNotFound(id).into();
        assert!(matches!(err, ChatError::NotFound(found) if found == id));
    }
}
