use thiserror::Error;

/// Errors seen by a chat client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned {status} ({error}): {message}")]
    Status {
        status: u16,
        error: String,
        message: String,
    },

    #[error("rate limited: {remaining} of {limit} left, resets in {reset_secs}s")]
    RateLimited {
        limit: u64,
        remaining: u64,
        reset_secs: u64,
    },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("a turn is already in progress")]
    TurnInProgress,

    #[error("no tool proposal is awaiting confirmation")]
    NoProposal,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}
