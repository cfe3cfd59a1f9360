//! Dealchat Storage crate - SQLite persistence for conversations and deals.
//!
//! Provides a WAL-mode SQLite database with a versioned schema, the
//! conversation repository behind the [`ConversationStore`] trait, and the
//! read-mostly deal repository queried by the search tool.

pub mod db;
pub mod deals;
pub mod migrations;
pub mod repository;
pub mod store;

pub use db::Database;
pub use deals::{Deal, DealFilter, DealRepository};
pub use repository::{ConversationRecord, ConversationRepository};
pub use store::ConversationStore;
