//! Dealchat client crate - session state and HTTP access to the chat API.
//!
//! [`SessionState`] holds the conversation list and the active transcript,
//! applying optimistic updates while a turn streams and reconciling with the
//! server afterwards. [`ChatSession`] drives that state against a
//! [`ConversationApi`].

pub mod api;
pub mod driver;
pub mod error;
pub mod session;

pub use api::{AskReply, ConfirmReply, ConversationApi, HttpConversationApi, TextStream};
pub use driver::{ChatSession, SendOutcome};
pub use error::ClientError;
pub use session::{PendingTurn, SessionState, TurnPhase};
