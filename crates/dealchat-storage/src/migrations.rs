//! Database schema.
//!
//! Applies the initial schema: conversations, messages, deals, and the
//! schema_migrations bookkeeping table.

use rusqlite::Connection;
use tracing::info;

use dealchat_core::error::DealchatError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), DealchatError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| DealchatError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| DealchatError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
///
/// Timestamps are unix milliseconds. `messages.seq` records insertion order
/// and breaks ties between messages sharing a `created_at`.
fn apply_v1(conn: &Connection) -> Result<(), DealchatError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY NOT NULL,
            user_id     TEXT NOT NULL,
            title       TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations (user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            role            TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content         TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages (conversation_id, created_at ASC, seq ASC);

        CREATE TABLE IF NOT EXISTS deals (
            id                TEXT PRIMARY KEY NOT NULL,
            title             TEXT NOT NULL,
            ebitda            REAL,
            revenue           REAL,
            company_location  TEXT,
            ebitda_margin     REAL,
            created_at        INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_deals_ebitda
            ON deals (ebitda DESC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| DealchatError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
