//! Conversation turn handling for Dealchat.
//!
//! Coordinates rate limiting, conversation history, the language model
//! gateway and the confirm-before-execute tool flow for each user turn.

pub mod error;
pub mod gateway;
pub mod openai;
pub mod orchestrator;
pub mod rate_limit;
pub mod tools;

pub use error::ChatError;
pub use gateway::{
    classify_reply, GatewayError, ModelGateway, ModelReply, ModelRequest, PromptTurn,
    Script, ScriptedGateway, TokenStream,
};
pub use openai::OpenAiGateway;
pub use orchestrator::{
    derive_title, ChatOrchestrator, OrchestratorDeps, TurnOutcome, TurnPermit, TurnRequest,
    TurnStream,
};
pub use rate_limit::{rate_subject, FixedWindowLimiter, RateLimiter};
pub use tools::deal_search::DealSearchTool;
pub use tools::{Tool, ToolExecutor, ToolOutput, ToolRegistry, ToolSpec};
