//! Chat orchestrator: central coordinator for a user turn.
//!
//! A turn is authenticated, rate limited, validated and resolved against
//! its conversation history before the model is asked for a reply. Prose
//! replies are forwarded chunk by chunk through a bounded channel and the
//! exchange is persisted once the model finishes. Tool proposals are handed
//! back unexecuted and only run when a later confirmation approves them.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Duration;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dealchat_core::clock::Clock;
use dealchat_core::config::{ChatConfig, RateLimitConfig};
use dealchat_core::types::{
    ConfirmationDecision, Conversation, Identity, Message, RateWindow, Role, ToolProposal,
};
use dealchat_storage::ConversationStore;

use crate::error::ChatError;
use crate::gateway::{classify_reply, ModelGateway, ModelReply, ModelRequest, PromptTurn, TokenStream};
use crate::rate_limit::{rate_subject, RateLimiter};
use crate::tools::{ToolExecutor, ToolOutput};

/// Key prefix for per-turn rate limiting.
const TURN_KEY_PREFIX: &str = "chat:turn";

/// An incoming request for one turn.
#[derive(Debug, Clone)]
pub enum TurnRequest {
    /// A new user message, optionally continuing a conversation.
    Message {
        conversation_id: Option<Uuid>,
        message: String,
    },
    /// The human's answer to an earlier tool proposal.
    Confirm(ConfirmationDecision),
}

/// The result of a successfully started turn.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Prose reply being streamed.
    Streaming(TurnStream),
    /// The model asked to run a tool; nothing was executed or persisted.
    Proposal {
        conversation_id: Option<Uuid>,
        proposal: ToolProposal,
    },
    /// A confirmed tool call ran.
    Executed(ToolOutput),
    /// The confirmation was declined or named an unknown tool.
    Cancelled,
}

/// Streamed reply fragments for one turn.
///
/// The stream ends only after the exchange has been persisted (or
/// persistence has failed and been logged). A trailing `Err` item means the
/// model failed part way through.
pub struct TurnStream {
    pub conversation_id: Uuid,
    pub is_new: bool,
    inner: ReceiverStream<Result<String, ChatError>>,
}

impl std::fmt::Debug for TurnStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnStream")
            .field("conversation_id", &self.conversation_id)
            .field("is_new", &self.is_new)
            .finish()
    }
}

impl Stream for TurnStream {
    type Item = Result<String, ChatError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Collaborators the orchestrator coordinates.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn ConversationStore>,
    pub gateway: Arc<dyn ModelGateway>,
    pub tools: Arc<dyn ToolExecutor>,
    pub limiter: Arc<dyn RateLimiter>,
    pub clock: Arc<dyn Clock>,
}

/// An admitted turn, ready to run exactly once.
pub struct TurnPermit<'a> {
    orchestrator: &'a ChatOrchestrator,
    identity: &'a Identity,
}

impl TurnPermit<'_> {
    pub async fn run(self, request: TurnRequest) -> Result<TurnOutcome, ChatError> {
        let Self {
            orchestrator,
            identity,
        } = self;
        match request {
            TurnRequest::Confirm(decision) => orchestrator.confirm(identity, decision).await,
            TurnRequest::Message {
                conversation_id,
                message,
            } => {
                orchestrator
                    .message_turn(identity, conversation_id, message)
                    .await
            }
        }
    }
}

/// Central chat orchestrator.
pub struct ChatOrchestrator {
    deps: OrchestratorDeps,
    chat: ChatConfig,
    rate: RateLimitConfig,
}

impl ChatOrchestrator {
    pub fn new(deps: OrchestratorDeps, chat: ChatConfig, rate: RateLimitConfig) -> Self {
        Self { deps, chat, rate }
    }

    /// Handle one turn for `identity`, arriving from network `origin`.
    pub async fn handle_turn(
        &self,
        identity: Option<&Identity>,
        origin: &str,
        request: TurnRequest,
    ) -> Result<TurnOutcome, ChatError> {
        self.admit_turn(identity, origin).await?.run(request).await
    }

    /// Authenticate and charge one turn against the caller's budget.
    ///
    /// Callers that still have to decode the request body admit first, so
    /// malformed turns count against the limit like well-formed ones.
    pub async fn admit_turn<'a>(
        &'a self,
        identity: Option<&'a Identity>,
        origin: &str,
    ) -> Result<TurnPermit<'a>, ChatError> {
        let identity = identity.ok_or(ChatError::Unauthorized)?;
        self.enforce_rate_limit(identity, origin).await?;
        Ok(TurnPermit {
            orchestrator: self,
            identity,
        })
    }

    async fn enforce_rate_limit(&self, identity: &Identity, origin: &str) -> Result<(), ChatError> {
        let window = RateWindow::new(
            format!("{}:{}", TURN_KEY_PREFIX, rate_subject(Some(identity), origin)),
            self.rate.turn_limit,
            self.rate.turn_window_ms,
        );
        let decision = self.deps.limiter.check(&window).await;
        if decision.allowed {
            return Ok(());
        }
        debug!(user = %identity, key = %window.key, "Turn rate limited");
        Err(ChatError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        })
    }

    async fn confirm(
        &self,
        identity: &Identity,
        decision: ConfirmationDecision,
    ) -> Result<TurnOutcome, ChatError> {
        if !decision.confirmed || !self.deps.tools.knows(&decision.tool_name) {
            info!(user = %identity, tool = %decision.tool_name, "Tool call cancelled");
            return Ok(TurnOutcome::Cancelled);
        }

        self.deps
            .tools
            .validate(&decision.tool_name, &decision.input)?;

        let output = self
            .deps
            .tools
            .execute(&decision.tool_name, &decision.input)
            .await
            .map_err(|e| match e {
                e @ (ChatError::InvalidToolInput(_) | ChatError::ToolExecutionFailed(_)) => e,
                other => ChatError::ToolExecutionFailed(other.to_string()),
            })?;
        Ok(TurnOutcome::Executed(output))
    }

    fn validate_message(&self, message: &str) -> Result<String, ChatError> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(ChatError::InvalidInput("message cannot be empty".to_string()));
        }
        if trimmed.chars().count() > self.chat.max_message_chars {
            return Err(ChatError::InvalidInput(format!(
                "message exceeds maximum length of {} characters",
                self.chat.max_message_chars
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Load a conversation and check that `identity` owns it.
    async fn owned_conversation(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> Result<Conversation, ChatError> {
        let record = self
            .deps
            .store
            .find(id)
            .await?
            .ok_or(ChatError::NotFound(id))?;
        if &record.owner != identity {
            warn!(user = %identity, conversation_id = %id, "Cross-user conversation access denied");
            return Err(ChatError::Forbidden);
        }
        Ok(record.conversation)
    }

    async fn message_turn(
        &self,
        identity: &Identity,
        conversation_id: Option<Uuid>,
        message: String,
    ) -> Result<TurnOutcome, ChatError> {
        let user_text = self.validate_message(&message)?;

        let existing = match conversation_id {
            Some(id) => Some(self.owned_conversation(identity, id).await?),
            None => None,
        };

        let history: &[Message] = existing.as_ref().map(|c| c.messages.as_slice()).unwrap_or(&[]);
        let mut turns: Vec<PromptTurn> = history
            .iter()
            .map(|m| PromptTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        turns.push(PromptTurn {
            role: Role::User,
            content: user_text.clone(),
        });
        let request = ModelRequest {
            system: self.chat.system_prompt.clone(),
            turns,
            tools: self.deps.tools.catalog(),
        };

        let tokens = self
            .deps
            .gateway
            .stream(&request)
            .await
            .map_err(|e| ChatError::ModelUnavailable(e.to_string()))?;
        let reply = classify_reply(tokens, self.deps.tools.as_ref())
            .await
            .map_err(|e| ChatError::ModelUnavailable(e.to_string()))?;

        let tokens = match reply {
            ModelReply::Proposal(proposal) => {
                info!(user = %identity, tool = %proposal.tool_name, "Model proposed a tool call");
                return Ok(TurnOutcome::Proposal {
                    conversation_id,
                    proposal,
                });
            }
            ModelReply::Text(tokens) => tokens,
        };

        let (id, is_new, title_source) = match &existing {
            Some(conv) => {
                let needs_title = conv.title == self.chat.placeholder_title;
                let source = conv
                    .first_message()
                    .map(|m| m.content.clone())
                    .unwrap_or_else(|| user_text.clone());
                (conv.id, false, needs_title.then_some(source))
            }
            None => (Uuid::new_v4(), true, Some(user_text.clone())),
        };

        let (tx, rx) = mpsc::channel(self.chat.stream_buffer.max(1));
        let pump = ReplyPump {
            store: Arc::clone(&self.deps.store),
            clock: Arc::clone(&self.deps.clock),
            owner: identity.clone(),
            conversation_id: id,
            is_new,
            user_text,
            placeholder_title: self.chat.placeholder_title.clone(),
            title: title_source.map(|s| derive_title(&s, self.chat.title_chars)),
        };
        tokio::spawn(pump.run(tokens, tx));

        Ok(TurnOutcome::Streaming(TurnStream {
            conversation_id: id,
            is_new,
            inner: ReceiverStream::new(rx),
        }))
    }

    /// Conversations owned by `identity`, newest first.
    pub async fn list_conversations(&self, identity: &Identity) -> Result<Vec<Conversation>, ChatError> {
        Ok(self.deps.store.list_for_owner(identity).await?)
    }

    pub async fn get_conversation(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> Result<Conversation, ChatError> {
        self.owned_conversation(identity, id).await
    }

    /// Create an empty conversation. A missing or blank title gets the placeholder.
    pub async fn create_conversation(
        &self,
        identity: &Identity,
        title: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.chat.placeholder_title);
        let conversation = self
            .deps
            .store
            .create(identity, title, self.deps.clock.now())
            .await?;
        info!(user = %identity, conversation_id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    /// Delete a conversation and all its messages.
    pub async fn delete_conversation(&self, identity: &Identity, id: Uuid) -> Result<(), ChatError> {
        self.owned_conversation(identity, id).await?;
        if !self.deps.store.delete(id).await? {
            return Err(ChatError::NotFound(id));
        }
        info!(user = %identity, conversation_id = %id, "Conversation deleted");
        Ok(())
    }

    /// Rename a conversation and return its updated state.
    pub async fn rename_conversation(
        &self,
        identity: &Identity,
        id: Uuid,
        title: &str,
    ) -> Result<Conversation, ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::InvalidInput("title cannot be empty".to_string()));
        }
        let mut conversation = self.owned_conversation(identity, id).await?;
        if !self.deps.store.rename(id, title).await? {
            return Err(ChatError::NotFound(id));
        }
        conversation.title = title.to_string();
        Ok(conversation)
    }
}

/// Leading `limit` characters of `text`.
pub fn derive_title(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Background task moving model fragments to the caller and persisting the
/// exchange when the model is done.
struct ReplyPump {
    store: Arc<dyn ConversationStore>,
    clock: Arc<dyn Clock>,
    owner: Identity,
    conversation_id: Uuid,
    is_new: bool,
    user_text: String,
    placeholder_title: String,
    /// Title to apply after a successful save, when one should be derived.
    title: Option<String>,
}

impl ReplyPump {
    async fn run(self, mut tokens: TokenStream, tx: mpsc::Sender<Result<String, ChatError>>) {
        let mut reply = String::new();
        let mut failure = None;
        let mut forwarding = true;

        while let Some(item) = tokens.next().await {
            match item {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    reply.push_str(&chunk);
                    // A vanished consumer stops forwarding, not the save.
                    if forwarding && tx.send(Ok(chunk)).await.is_err() {
                        debug!(
                            conversation_id = %self.conversation_id,
                            "Consumer went away mid-stream; draining reply for persistence"
                        );
                        forwarding = false;
                    }
                }
                Err(e) => {
                    warn!(conversation_id = %self.conversation_id, error = %e, "Model stream failed");
                    failure = Some(e);
                    break;
                }
            }
        }

        if !reply.trim().is_empty() {
            self.persist(&reply).await;
        }

        if let Some(e) = failure.filter(|_| forwarding) {
            let _ = tx.send(Err(ChatError::ModelUnavailable(e.to_string()))).await;
        }
    }

    async fn persist(&self, reply: &str) {
        let user_at = self.clock.now();
        let user = Message::new(Role::User, self.user_text.clone(), user_at);
        let assistant = Message::new(Role::Assistant, reply, user_at + Duration::milliseconds(1));
        let messages = [user, assistant];

        let saved = if self.is_new {
            self.store
                .create_with_messages(
                    self.conversation_id,
                    &self.owner,
                    &self.placeholder_title,
                    user_at,
                    &messages,
                )
                .await
        } else {
            self.store
                .append_messages(self.conversation_id, &messages)
                .await
        };

        if let Err(e) = saved {
            error!(
                conversation_id = %self.conversation_id,
                user = %self.owner,
                reply_len = reply.len(),
                error = %e,
                "Failed to persist exchange"
            );
            return;
        }
        debug!(
            conversation_id = %self.conversation_id,
            user_len = self.user_text.len(),
            reply_len = reply.len(),
            "Exchange persisted"
        );

        if let Some(title) = self.title.as_deref().filter(|t| !t.is_empty()) {
            match self.store.rename(self.conversation_id, title).await {
                Ok(true) => {}
                Ok(false) => warn!(conversation_id = %self.conversation_id, "Title not applied: conversation vanished"),
                Err(e) => warn!(conversation_id = %self.conversation_id, error = %e, "Failed to derive title"),
            }
        }
    }
}
