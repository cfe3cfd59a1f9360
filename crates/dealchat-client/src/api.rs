//! HTTP access to the chat API.
//!
//! [`ConversationApi`] is the seam the session driver talks through;
//! [`HttpConversationApi`] implements it with `reqwest` against a running
//! server.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use dealchat_core::types::{ConfirmationDecision, Conversation, ToolProposal};

use crate::error::ClientError;

/// Header naming the conversation a streamed reply belongs to.
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

/// Streamed reply text, in arrival order.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// Answer to a submitted message.
pub enum AskReply {
    Stream {
        conversation_id: Uuid,
        text: TextStream,
    },
    Proposal(ToolProposal),
}

impl std::fmt::Debug for AskReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AskReply::Stream {
                conversation_id, ..
            } => f
                .debug_struct("Stream")
                .field("conversation_id", conversation_id)
                .finish(),
            AskReply::Proposal(p) => f.debug_tuple("Proposal").field(p).finish(),
        }
    }
}

/// Answer to a confirmation decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmReply {
    Results(Vec<Value>),
    Cancelled,
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list(&self) -> Result<Vec<Conversation>, ClientError>;

    async fn get(&self, id: Uuid) -> Result<Conversation, ClientError>;

    async fn create(&self, title: Option<&str>) -> Result<Conversation, ClientError>;

    async fn delete(&self, id: Uuid) -> Result<(), ClientError>;

    async fn rename(&self, id: Uuid, title: &str) -> Result<Conversation, ClientError>;

    async fn ask(&self, conversation_id: Option<Uuid>, message: &str) -> Result<AskReply, ClientError>;

    async fn confirm(&self, decision: &ConfirmationDecision) -> Result<ConfirmReply, ClientError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AskBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<Uuid>,
    message: &'a str,
}

#[derive(Serialize)]
struct CreateBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenameBody<'a> {
    conversation_id: Uuid,
    title: &'a str,
}

#[derive(Deserialize)]
struct ConversationsEnvelope {
    conversations: Vec<Conversation>,
}

#[derive(Deserialize)]
struct ConversationEnvelope {
    conversation: Conversation,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// `reqwest`-backed API client authenticating with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpConversationApi {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpConversationApi {
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chat/{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = request.bearer_auth(&self.token).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list(&self) -> Result<Vec<Conversation>, ClientError> {
        let response = self.send(self.client.get(self.url("conversations"))).await?;
        let envelope: ConversationsEnvelope = response.json().await?;
        Ok(envelope.conversations)
    }

    async fn get(&self, id: Uuid) -> Result<Conversation, ClientError> {
        let request = self
            .client
            .get(self.url("conversation"))
            .query(&[("conversationId", id.to_string())]);
        let envelope: ConversationEnvelope = self.send(request).await?.json().await?;
        Ok(envelope.conversation)
    }

    async fn create(&self, title: Option<&str>) -> Result<Conversation, ClientError> {
        let request = self
            .client
            .post(self.url("create"))
            .json(&CreateBody { title });
        let envelope: ConversationEnvelope = self.send(request).await?.json().await?;
        Ok(envelope.conversation)
    }

    async fn delete(&self, id: Uuid) -> Result<(), ClientError> {
        let request = self
            .client
            .delete(self.url("delete"))
            .query(&[("conversationId", id.to_string())]);
        self.send(request).await?;
        Ok(())
    }

    async fn rename(&self, id: Uuid, title: &str) -> Result<Conversation, ClientError> {
        let request = self.client.post(self.url("update-title")).json(&RenameBody {
            conversation_id: id,
            title,
        });
        let envelope: ConversationEnvelope = self.send(request).await?.json().await?;
        Ok(envelope.conversation)
    }

    async fn ask(&self, conversation_id: Option<Uuid>, message: &str) -> Result<AskReply, ClientError> {
        let request = self.client.post(self.url("ask")).json(&AskBody {
            conversation_id,
            message,
        });
        let response = self.send(request).await?;

        if is_json(response.headers()) {
            let proposal: ToolProposal = response.json().await?;
            return Ok(AskReply::Proposal(proposal));
        }

        let conversation_id = response
            .headers()
            .get(CONVERSATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| {
                ClientError::Decode(format!("missing or invalid {} header", CONVERSATION_ID_HEADER))
            })?;

        let text = response
            .bytes_stream()
            .scan(Utf8Chunker::default(), |chunker, item| {
                let out = match item {
                    Ok(bytes) => chunker.push(&bytes).map(Ok),
                    Err(e) => Some(Err(ClientError::from(e))),
                };
                futures::future::ready(Some(stream::iter(out)))
            })
            .flatten();

        Ok(AskReply::Stream {
            conversation_id,
            text: Box::pin(text),
        })
    }

    async fn confirm(&self, decision: &ConfirmationDecision) -> Result<ConfirmReply, ClientError> {
        let request = self.client.post(self.url("confirm")).json(decision);
        let body: Value = self.send(request).await?.json().await?;
        parse_confirm_body(body)
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

fn header_u64(headers: &HeaderMap, name: &str) -> u64 {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

async fn error_from_response(response: Response) -> ClientError {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let headers = response.headers();
        return ClientError::RateLimited {
            limit: header_u64(headers, "ratelimit-limit"),
            remaining: header_u64(headers, "ratelimit-remaining"),
            reset_secs: header_u64(headers, "ratelimit-reset"),
        };
    }
    let body = response.text().await.unwrap_or_default();
    let envelope = serde_json::from_str::<ErrorEnvelope>(&body).unwrap_or(ErrorEnvelope {
        error: String::new(),
        message: body,
    });
    ClientError::Status {
        status: status.as_u16(),
        error: envelope.error,
        message: envelope.message,
    }
}

fn parse_confirm_body(body: Value) -> Result<ConfirmReply, ClientError> {
    match body {
        Value::Array(rows) => Ok(ConfirmReply::Results(rows)),
        Value::Object(map) if map.get("success") == Some(&Value::Bool(false)) => {
            Ok(ConfirmReply::Cancelled)
        }
        other => Err(ClientError::Decode(format!(
            "unexpected confirmation response: {}",
            other
        ))),
    }
}

/// Turns arbitrary byte chunks into UTF-8 text, carrying incomplete
/// multi-byte sequences over to the next chunk.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return Some(text);
            }
        };
        if valid == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid);
        let text = String::from_utf8(std::mem::replace(&mut self.pending, rest)).ok()?;
        Some(text)
    }
}
