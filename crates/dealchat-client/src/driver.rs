//! Drives [`SessionState`] against a [`ConversationApi`].

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use dealchat_core::clock::Clock;
use dealchat_core::types::{ConfirmationDecision, ToolProposal};

use crate::api::{AskReply, ConfirmReply, ConversationApi};
use crate::error::ClientError;
use crate::session::{SessionState, TurnPhase};

/// How a sent message ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Reply streamed and the transcript was reconciled with the server.
    Replied,
    /// Reply streamed but reconciliation failed; local messages are flagged.
    Unconfirmed,
    /// The model wants to run a tool; call [`ChatSession::confirm`].
    Proposal(ToolProposal),
}

pub struct ChatSession<A: ConversationApi + 'static> {
    api: Arc<A>,
    clock: Arc<dyn Clock>,
    state: SessionState,
}

impl<A: ConversationApi + 'static> ChatSession<A> {
    pub fn new(api: Arc<A>, clock: Arc<dyn Clock>) -> Self {
        Self {
            api,
            clock,
            state: SessionState::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Reload the conversation list from the server.
    pub async fn refresh(&mut self) -> Result<(), ClientError> {
        let conversations = self.api.list().await?;
        self.state.load_conversations(conversations);
        Ok(())
    }

    pub fn select(&mut self, id: Uuid) -> bool {
        self.state.select(id)
    }

    pub fn start_new(&mut self) {
        self.state.start_new();
    }

    /// Create a conversation on the server and make it active.
    pub async fn create(&mut self, title: Option<&str>) -> Result<Uuid, ClientError> {
        let conversation = self.api.create(title).await?;
        let id = conversation.id;
        self.state.insert_conversation(conversation);
        self.state.select(id);
        Ok(id)
    }

    pub async fn rename(&mut self, id: Uuid, title: &str) -> Result<(), ClientError> {
        let conversation = self.api.rename(id, title).await?;
        self.state.replace_conversation(conversation);
        Ok(())
    }

    /// Remove a conversation locally and delete it on the server in the
    /// background. A failed delete is logged and the local removal stands.
    pub fn delete(&mut self, id: Uuid) -> JoinHandle<()> {
        self.state.remove_conversation(id);
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(e) = api.delete(id).await {
                tracing::warn!(conversation_id = %id, error = %e, "Background delete failed");
            }
        })
    }

    /// Send a message in the active conversation (or a new one).
    ///
    /// `on_chunk` sees each streamed fragment after it has been applied to
    /// the session state.
    pub async fn send<F>(&mut self, text: &str, mut on_chunk: F) -> Result<SendOutcome, ClientError>
    where
        F: FnMut(&str) + Send,
    {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let conversation_id = self.state.active_id();
        self.state.begin_turn(text, self.clock.now())?;

        let reply = match self.api.ask(conversation_id, text).await {
            Ok(reply) => reply,
            Err(e) => {
                self.state.mark_failed();
                return Err(e);
            }
        };

        let (id, mut stream) = match reply {
            AskReply::Proposal(proposal) => {
                self.state.pause_for_proposal(proposal.clone());
                return Ok(SendOutcome::Proposal(proposal));
            }
            AskReply::Stream {
                conversation_id,
                text,
            } => (conversation_id, text),
        };
        self.state.attach_conversation(id);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    self.state.apply_chunk(&chunk);
                    on_chunk(&chunk);
                }
                Err(e) => {
                    tracing::warn!(conversation_id = %id, error = %e, "Reply stream interrupted");
                    self.state.mark_failed();
                    return Err(e);
                }
            }
        }

        match self.api.get(id).await {
            Ok(conversation) => {
                self.state.reconcile(conversation);
                Ok(SendOutcome::Replied)
            }
            Err(e) => {
                tracing::warn!(conversation_id = %id, error = %e, "Reconciliation failed");
                self.state.mark_failed();
                Ok(SendOutcome::Unconfirmed)
            }
        }
    }

    /// Answer the pending tool proposal.
    pub async fn confirm(&mut self, confirmed: bool) -> Result<ConfirmReply, ClientError> {
        let proposal = self.state.take_proposal().ok_or(ClientError::NoProposal)?;
        let decision = ConfirmationDecision {
            tool_name: proposal.tool_name,
            input: proposal.input,
            confirmed,
        };
        let reply = self.api.confirm(&decision).await?;
        if let ConfirmReply::Results(rows) = &reply {
            self.state.set_tool_results(rows.clone());
        }
        Ok(reply)
    }

    /// Whether the last turn is still waiting on the server.
    pub fn is_sending(&self) -> bool {
        self.state
            .turn()
            .is_some_and(|t| t.phase == TurnPhase::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use dealchat_core::clock::ManualClock;
    use dealchat_core::types::{Conversation, Message, Role};
    use futures::stream;

    /// In-memory server stand-in: persists exchanges like the real one.
    #[derive(Default)]
    struct FakeApi {
        conversations: Mutex<HashMap<Uuid, Conversation>>,
        replies: Mutex<Vec<Vec<Result<String, ClientError>>>>,
        proposal: Mutex<Option<ToolProposal>>,
        fail_get: bool,
        fail_delete: bool,
        confirms: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl FakeApi {
        fn queue(&self, chunks: Vec<Result<String, ClientError>>) {
            self.replies.lock().unwrap().push(chunks);
        }
    }

    #[async_trait]
    impl ConversationApi for FakeApi {
        async fn list(&self) -> Result<Vec<Conversation>, ClientError> {
            let mut all: Vec<Conversation> =
                self.conversations.lock().unwrap().values().cloned().collect();
            all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(all)
        }

        async fn get(&self, id: Uuid) -> Result<Conversation, ClientError> {
            if self.fail_get {
                return Err(ClientError::Transport("connection refused".to_string()));
            }
            self.conversations
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or(ClientError::Status {
                    status: 404,
                    error: "not_found".to_string(),
                    message: "gone".to_string(),
                })
        }

        async fn create(&self, title: Option<&str>) -> Result<Conversation, ClientError> {
            let conv = Conversation {
                id: Uuid::new_v4(),
                title: title.unwrap_or("New Chat").to_string(),
                created_at: Utc::now(),
                messages: vec![],
            };
            self.conversations.lock().unwrap().insert(conv.id, conv.clone());
            Ok(conv)
        }

        async fn delete(&self, id: Uuid) -> Result<(), ClientError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete {
                return Err(ClientError::Transport("offline".to_string()));
            }
            self.conversations.lock().unwrap().remove(&id);
            Ok(())
        }

        async fn rename(&self, id: Uuid, title: &str) -> Result<Conversation, ClientError> {
            let mut all = self.conversations.lock().unwrap();
            let conv = all
                .get_mut(&id)
                .ok_or_else(|| ClientError::Transport("unknown conversation".to_string()))?;
            conv.title = title.to_string();
            Ok(conv.clone())
        }

        async fn ask(&self, conversation_id: Option<Uuid>, message: &str) -> Result<AskReply, ClientError> {
            if let Some(proposal) = self.proposal.lock().unwrap().take() {
                return Ok(AskReply::Proposal(proposal));
            }
            let chunks = self.replies.lock().unwrap().remove(0);
            let reply: String = chunks.iter().filter_map(|c| c.as_ref().ok()).cloned().collect();
            let failed = chunks.iter().any(|c| c.is_err());

            let id = conversation_id.unwrap_or_else(Uuid::new_v4);
            if !failed {
                let now = Utc::now();
                let mut all = self.conversations.lock().unwrap();
                let conv = all.entry(id).or_insert_with(|| Conversation {
                    id,
                    title: message.chars().take(30).collect(),
                    created_at: now,
                    messages: vec![],
                });
                conv.messages.push(Message::new(Role::User, message, now));
                conv.messages
                    .push(Message::new(Role::Assistant, reply, now + Duration::milliseconds(1)));
            }
            Ok(AskReply::Stream {
                conversation_id: id,
                text: Box::pin(stream::iter(chunks)),
            })
        }

        async fn confirm(&self, decision: &ConfirmationDecision) -> Result<ConfirmReply, ClientError> {
            self.confirms.fetch_add(1, Ordering::SeqCst);
            if decision.confirmed {
                Ok(ConfirmReply::Results(vec![serde_json::json!({"id": "d1"})]))
            } else {
                Ok(ConfirmReply::Cancelled)
            }
        }
    }

    fn session(api: FakeApi) -> (Arc<FakeApi>, ChatSession<FakeApi>) {
        let api = Arc::new(api);
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (api.clone(), ChatSession::new(api, clock))
    }

    fn chunks(parts: &[&str]) -> Vec<Result<String, ClientError>> {
        parts.iter().map(|p| Ok(p.to_string())).collect()
    }

    #[tokio::test]
    async fn test_send_streams_then_reconciles() {
        let (api, mut session) = session(FakeApi::default());
        api.queue(chunks(&["Hel", "lo"]));

        let mut seen = Vec::new();
        let outcome = session
            .send("hi", |c| seen.push(c.to_string()))
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::Replied);
        assert_eq!(seen, vec!["Hel", "lo"]);
        let state = session.state();
        assert_eq!(state.turn().unwrap().phase, TurnPhase::Confirmed);
        assert_eq!(state.conversations().len(), 1);
        assert_eq!(state.active_id(), Some(state.conversations()[0].id));
        let msgs = state.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "Hello");
        assert!(!session.is_sending());
    }

    #[tokio::test]
    async fn test_reconcile_failure_leaves_unconfirmed_messages() {
        let (api, mut session) = session(FakeApi {
            fail_get: true,
            ..FakeApi::default()
        });
        api.queue(chunks(&["partial ", "answer"]));

        let outcome = session.send("hi", |_| {}).await.unwrap();
        assert_eq!(outcome, SendOutcome::Unconfirmed);

        let state = session.state();
        assert_eq!(state.turn().unwrap().phase, TurnPhase::Failed);
        let msgs = state.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "partial answer");
        assert!(msgs.iter().all(|m| state.is_unconfirmed(m.id)));
    }

    #[tokio::test]
    async fn test_stream_error_marks_turn_failed() {
        let (api, mut session) = session(FakeApi::default());
        api.queue(vec![
            Ok("so far".to_string()),
            Err(ClientError::Transport("reset".to_string())),
        ]);

        let err = session.send("hi", |_| {}).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(session.state().turn().unwrap().phase, TurnPhase::Failed);
        assert_eq!(session.state().messages()[1].content, "so far");
    }

    #[tokio::test]
    async fn test_proposal_then_confirm_and_cancel() {
        let (api, mut session) = session(FakeApi::default());
        let proposal = ToolProposal {
            tool_name: "databaseQueryTool".to_string(),
            input: [("minEbitda".to_string(), serde_json::json!(350000))]
                .into_iter()
                .collect(),
        };
        *api.proposal.lock().unwrap() = Some(proposal.clone());

        let outcome = session.send("deals over 350k", |_| {}).await.unwrap();
        assert_eq!(outcome, SendOutcome::Proposal(proposal.clone()));
        assert_eq!(session.state().turn().unwrap().phase, TurnPhase::Proposed);

        let reply = session.confirm(true).await.unwrap();
        assert!(matches!(reply, ConfirmReply::Results(ref rows) if rows.len() == 1));
        assert_eq!(session.state().tool_results().unwrap().len(), 1);
        assert!(matches!(session.confirm(true).await, Err(ClientError::NoProposal)));

        *api.proposal.lock().unwrap() = Some(proposal);
        session.send("again", |_| {}).await.unwrap();
        assert_eq!(session.confirm(false).await.unwrap(), ConfirmReply::Cancelled);
        assert_eq!(api.confirms.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_is_optimistic_even_when_server_fails() {
        let (api, mut session) = session(FakeApi {
            fail_delete: true,
            ..FakeApi::default()
        });
        let id = session.create(Some("doomed")).await.unwrap();
        assert_eq!(session.state().active_id(), Some(id));

        session.delete(id).await.unwrap();
        assert!(session.state().conversations().is_empty());
        assert!(session.state().active_id().is_none());
        assert_eq!(api.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_and_rename() {
        let (api, mut session) = session(FakeApi::default());
        let created = api.create(Some("first")).await.unwrap();
        session.refresh().await.unwrap();
        assert_eq!(session.state().conversations().len(), 1);

        session.rename(created.id, "Renamed").await.unwrap();
        assert_eq!(session.state().conversations()[0].title, "Renamed");
    }

    #[tokio::test]
    async fn test_blank_message_rejected_locally() {
        let (_api, mut session) = session(FakeApi::default());
        assert!(matches!(
            session.send("   ", |_| {}).await,
            Err(ClientError::EmptyMessage)
        ));
        assert!(session.state().messages().is_empty());
    }
}
