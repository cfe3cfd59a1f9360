//! Client session state.
//!
//! Holds the conversation list (most recent first), the active conversation
//! and its transcript. A submitted turn is shown optimistically as a user
//! message plus an empty assistant placeholder, filled as chunks arrive, and
//! then either replaced by the server's copy or left visible and flagged as
//! unconfirmed.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use dealchat_core::types::{Conversation, Message, Role, ToolProposal};

use crate::error::ClientError;

/// Lifecycle of one optimistic turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Submitted; the reply may still be streaming.
    Pending,
    /// The model asked to run a tool; waiting for the human.
    Proposed,
    /// Replaced by the server's authoritative transcript.
    Confirmed,
    /// The turn or its reconciliation failed; messages stay, flagged stale.
    Failed,
}

/// Bookkeeping for the most recent turn.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    /// Known once the server has assigned or confirmed it.
    pub conversation_id: Option<Uuid>,
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    pub phase: TurnPhase,
}

#[derive(Debug, Default)]
pub struct SessionState {
    conversations: Vec<Conversation>,
    active: Option<Uuid>,
    transcript: Vec<Message>,
    turn: Option<PendingTurn>,
    proposal: Option<ToolProposal>,
    tool_results: Option<Vec<Value>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.active
    }

    /// Messages of the active conversation, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.transcript
    }

    pub fn turn(&self) -> Option<&PendingTurn> {
        self.turn.as_ref()
    }

    pub fn proposal(&self) -> Option<&ToolProposal> {
        self.proposal.as_ref()
    }

    pub fn tool_results(&self) -> Option<&[Value]> {
        self.tool_results.as_deref()
    }

    /// Whether `message_id` belongs to a turn the server never confirmed.
    pub fn is_unconfirmed(&self, message_id: Uuid) -> bool {
        match &self.turn {
            Some(turn) if turn.phase == TurnPhase::Failed => {
                turn.user_message_id == message_id || turn.assistant_message_id == message_id
            }
            _ => false,
        }
    }

    /// Replace the conversation list with a fresh listing from the server.
    pub fn load_conversations(&mut self, mut conversations: Vec<Conversation>) {
        for conv in &mut conversations {
            conv.sort_messages();
        }
        self.conversations = conversations;

        let Some(active) = self.active else {
            return;
        };
        if self.turn_in_flight() {
            return;
        }
        match self.conversations.iter().find(|c| c.id == active) {
            Some(conv) => self.transcript = conv.messages.clone(),
            None => {
                self.active = None;
                self.transcript.clear();
            }
        }
    }

    /// Make `id` the active conversation. Returns false if it is not listed.
    pub fn select(&mut self, id: Uuid) -> bool {
        let Some(conv) = self.conversations.iter().find(|c| c.id == id) else {
            return false;
        };
        self.transcript = conv.messages.clone();
        self.active = Some(id);
        self.clear_turn();
        true
    }

    /// Start a fresh, not yet persisted conversation.
    pub fn start_new(&mut self) {
        self.active = None;
        self.transcript.clear();
        self.clear_turn();
    }

    /// Add a conversation at the front of the list unless already present.
    pub fn insert_conversation(&mut self, mut conversation: Conversation) {
        if self.conversations.iter().any(|c| c.id == conversation.id) {
            return;
        }
        conversation.sort_messages();
        self.conversations.insert(0, conversation);
    }

    /// Replace a listed conversation in place, keeping its position.
    pub fn replace_conversation(&mut self, mut conversation: Conversation) -> bool {
        conversation.sort_messages();
        let Some(slot) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        else {
            return false;
        };
        *slot = conversation;
        true
    }

    /// Optimistically append the user's message and an empty assistant
    /// placeholder timestamped one millisecond later.
    pub fn begin_turn(&mut self, text: &str, now: DateTime<Utc>) -> Result<&PendingTurn, ClientError> {
        if self.turn_in_flight() {
            return Err(ClientError::TurnInProgress);
        }
        let user = Message::new(Role::User, text, now);
        let assistant = Message::new(Role::Assistant, "", now + Duration::milliseconds(1));
        let turn = PendingTurn {
            conversation_id: self.active,
            user_message_id: user.id,
            assistant_message_id: assistant.id,
            phase: TurnPhase::Pending,
        };
        self.transcript.push(user);
        self.transcript.push(assistant);
        self.proposal = None;
        self.tool_results = None;
        Ok(&*self.turn.insert(turn))
    }

    /// Append a streamed chunk to the assistant placeholder.
    pub fn apply_chunk(&mut self, chunk: &str) -> bool {
        let Some(turn) = self.turn.as_ref().filter(|t| t.phase == TurnPhase::Pending) else {
            return false;
        };
        let target = turn.assistant_message_id;
        match self.transcript.iter_mut().find(|m| m.id == target) {
            Some(message) => {
                message.content.push_str(chunk);
                true
            }
            None => false,
        }
    }

    /// Record the conversation id the server used for the current turn.
    pub fn attach_conversation(&mut self, id: Uuid) {
        if let Some(turn) = self.turn.as_mut() {
            turn.conversation_id = Some(id);
        }
        if self.active.is_none() {
            self.active = Some(id);
        }
    }

    /// The model proposed a tool call instead of replying: drop the empty
    /// placeholder and hold the proposal for the human.
    pub fn pause_for_proposal(&mut self, proposal: ToolProposal) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.phase = TurnPhase::Proposed;
        let placeholder = turn.assistant_message_id;
        self.transcript
            .retain(|m| m.id != placeholder || !m.content.is_empty());
        self.proposal = Some(proposal);
    }

    /// Take the proposal awaiting confirmation, if any.
    pub fn take_proposal(&mut self) -> Option<ToolProposal> {
        self.proposal.take()
    }

    pub fn set_tool_results(&mut self, results: Vec<Value>) {
        self.tool_results = Some(results);
    }

    /// Swap optimistic state for the server's copy of `conversation` and move
    /// it to the front of the list.
    pub fn reconcile(&mut self, mut conversation: Conversation) {
        conversation.sort_messages();
        let id = conversation.id;

        let turn_matches = self
            .turn
            .as_ref()
            .is_some_and(|t| t.conversation_id == Some(id));
        if self.active == Some(id) || turn_matches {
            self.active = Some(id);
            self.transcript = conversation.messages.clone();
        }
        if turn_matches {
            if let Some(turn) = self.turn.as_mut() {
                turn.phase = TurnPhase::Confirmed;
            }
        }

        self.conversations.retain(|c| c.id != id);
        self.conversations.insert(0, conversation);
    }

    /// Flag the in-flight turn as failed. Its messages stay visible.
    pub fn mark_failed(&mut self) {
        if let Some(turn) = self.turn.as_mut() {
            if turn.phase == TurnPhase::Pending {
                turn.phase = TurnPhase::Failed;
            }
        }
    }

    /// Remove a conversation locally. If it was active, the next listed
    /// conversation becomes active.
    pub fn remove_conversation(&mut self, id: Uuid) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != id);
        let removed = self.conversations.len() != before;

        if self.active == Some(id) {
            self.clear_turn();
            match self.conversations.first() {
                Some(next) => {
                    self.active = Some(next.id);
                    self.transcript = next.messages.clone();
                }
                None => {
                    self.active = None;
                    self.transcript.clear();
                }
            }
        }
        removed
    }

    fn turn_in_flight(&self) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|t| t.phase == TurnPhase::Pending)
    }

    fn clear_turn(&mut self) {
        self.turn = None;
        self.proposal = None;
        self.tool_results = None;
    }
}
