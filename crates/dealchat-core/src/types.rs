use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identity
// =============================================================================

/// Opaque authenticated caller identity.
///
/// Ownership checks compare identities by value; nothing else about the
/// user is known to the chat core.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self(user_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Messages and conversations
// =============================================================================

/// Author of a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// A single persisted chat message. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at,
        }
    }
}

/// A conversation with its ordered message history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Sort messages by `created_at`. The sort is stable, so messages sharing a
    /// timestamp keep their insertion order.
    pub fn sort_messages(&mut self) {
        self.messages.sort_by_key(|m| m.created_at);
    }

    /// Content of the earliest message, if any.
    pub fn first_message(&self) -> Option<&Message> {
        self.messages.iter().min_by_key(|m| m.created_at)
    }
}

// =============================================================================
// Tool proposals
// =============================================================================

/// The model's structured request to invoke a tool. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolProposal {
    pub tool_name: String,
    pub input: BTreeMap<String, serde_json::Value>,
}

/// The human's approve/reject answer to a [`ToolProposal`].
///
/// The tool name and input are echoed back by the client; the server keeps
/// no record of what it proposed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationDecision {
    pub tool_name: String,
    #[serde(default)]
    pub input: BTreeMap<String, serde_json::Value>,
    pub confirmed: bool,
}

// =============================================================================
// Rate limiting
// =============================================================================

/// A fixed-window rate budget for one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    pub key: String,
    pub limit: u64,
    pub window_ms: u64,
}

impl RateWindow {
    pub fn new(key: impl Into<String>, limit: u64, window_ms: u64) -> Self {
        Self {
            key: key.into(),
            limit,
            window_ms,
        }
    }
}

/// Outcome of consulting a rate limiter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub reset_at: DateTime<Utc>,
}

impl RateDecision {
    /// Whole seconds from `now` until the window resets, rounded up.
    pub fn seconds_to_reset(&self, now: DateTime<Utc>) -> u64 {
        let ms = (self.reset_at - now).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    #[test]
    fn test_role_roundtrip_str() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("system".parse::<Role>().is_err());
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn test_message_serializes_camel_case_millis() {
        let msg = Message {
            id: Uuid::nil(),
            role: Role::User,
            content: "hi".to_string(),
            created_at: at(1_700_000_000_123),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["createdAt"], 1_700_000_000_123i64);
        assert_eq!(json["role"], "user");
    }

    #[test]
    fn test_sort_messages_is_stable_for_ties() {
        let mut conv = Conversation {
            id: Uuid::new_v4(),
            title: "t".to_string(),
            created_at: at(0),
            messages: vec![
                Message::new(Role::Assistant, "b", at(2)),
                Message::new(Role::User, "a1", at(1)),
                Message::new(Role::User, "a2", at(1)),
            ],
        };
        conv.sort_messages();
        let order: Vec<&str> = conv.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["a1", "a2", "b"]);

        let once = conv.clone();
        conv.sort_messages();
        assert_eq!(conv, once);
    }

    #[test]
    fn test_first_message() {
        let conv = Conversation {
            id: Uuid::new_v4(),
            title: "t".to_string(),
            created_at: at(0),
            messages: vec![
                Message::new(Role::Assistant, "later", at(5)),
                Message::new(Role::User, "first", at(4)),
            ],
        };
        assert_eq!(conv.first_message().unwrap().content, "first");
    }

    #[test]
    fn test_tool_proposal_rejects_extra_fields() {
        let ok: Result<ToolProposal, _> =
            serde_json::from_str(r#"{"toolName":"x","input":{"a":1}}"#);
        assert!(ok.is_ok());
        let extra: Result<ToolProposal, _> =
            serde_json::from_str(r#"{"toolName":"x","input":{},"note":"hi"}"#);
        assert!(extra.is_err());
    }

    #[test]
    fn test_confirmation_decision_input_defaults_empty() {
        let d: ConfirmationDecision =
            serde_json::from_str(r#"{"toolName":"x","confirmed":false}"#).unwrap();
        assert!(d.input.is_empty());
        assert!(!d.confirmed);
    }

    #[test]
    fn test_seconds_to_reset_rounds_up() {
        let decision = RateDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at: at(60_000),
        };
        assert_eq!(decision.seconds_to_reset(at(0)), 60);
        assert_eq!(decision.seconds_to_reset(at(59_001)), 1);
        assert_eq!(decision.seconds_to_reset(at(70_000)), 0);
    }
}
