//! Dealchat API crate - axum HTTP server for the chat feature.
//!
//! Exposes message turns (streamed text or a tool proposal), tool
//! confirmation, and conversation management behind bearer-token auth
//! and per-user rate limiting.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
