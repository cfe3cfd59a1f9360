//! Conversation persistence.
//!
//! Conversations and their messages live in two tables joined by
//! `conversation_id`. Message rows are only ever inserted; the one mutable
//! column on a conversation is its title.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use dealchat_core::error::DealchatError;
use dealchat_core::types::{Conversation, Identity, Message, Role};

use crate::db::Database;

/// A conversation together with the identity that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub owner: Identity,
    pub conversation: Conversation,
}

/// Repository for conversations and their messages.
pub struct ConversationRepository {
    db: Arc<Database>,
}

impl ConversationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create an empty conversation with a fresh id.
    pub fn create(
        &self,
        owner: &Identity,
        title: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Conversation, DealchatError> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at,
            messages: Vec::new(),
        };
        self.db.with_conn(|conn| {
            insert_conversation(conn, conversation.id, owner, title, created_at)?;
            Ok(())
        })?;
        Ok(conversation)
    }

    /// Create a conversation with a caller-chosen id and its first messages
    /// in one transaction.
    pub fn create_with_messages(
        &self,
        id: Uuid,
        owner: &Identity,
        title: &str,
        created_at: DateTime<Utc>,
        messages: &[Message],
    ) -> Result<(), DealchatError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| DealchatError::Storage(format!("Failed to begin transaction: {}", e)))?;
            insert_conversation(&tx, id, owner, title, created_at)?;
            for message in messages {
                insert_message(&tx, id, message)?;
            }
            tx.commit()
                .map_err(|e| DealchatError::Storage(format!("Failed to commit: {}", e)))?;
            Ok(())
        })
    }

    /// Append messages to an existing conversation in one transaction.
    pub fn append_messages(
        &self,
        conversation_id: Uuid,
        messages: &[Message],
    ) -> Result<(), DealchatError> {
        self.db.with_conn(|conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM conversations WHERE id = ?1",
                    rusqlite::params![conversation_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| DealchatError::Storage(e.to_string()))?;
            if exists.is_none() {
                return Err(DealchatError::ConversationNotFound(conversation_id));
            }

            let tx = conn
                .unchecked_transaction()
                .map_err(|e| DealchatError::Storage(format!("Failed to begin transaction: {}", e)))?;
            for message in messages {
                insert_message(&tx, conversation_id, message)?;
            }
            tx.commit()
                .map_err(|e| DealchatError::Storage(format!("Failed to commit: {}", e)))?;
            Ok(())
        })
    }

    /// Rename a conversation. Returns false if it does not exist.
    pub fn rename(&self, id: Uuid, title: &str) -> Result<bool, DealchatError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE conversations SET title = ?1 WHERE id = ?2",
                    rusqlite::params![title, id.to_string()],
                )
                .map_err(|e| DealchatError::Storage(format!("Failed to rename conversation: {}", e)))?;
            Ok(changed > 0)
        })
    }

    /// Delete a conversation and, by cascade, all of its messages.
    /// Returns false if it did not exist.
    pub fn delete(&self, id: Uuid) -> Result<bool, DealchatError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "DELETE FROM conversations WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                )
                .map_err(|e| DealchatError::Storage(format!("Failed to delete conversation: {}", e)))?;
            Ok(changed > 0)
        })
    }

    /// Fetch a conversation with its messages in timestamp order.
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<ConversationRecord>, DealchatError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, user_id, title, created_at FROM conversations WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| DealchatError::Storage(e.to_string()))?;

            let Some((id_str, user_id, title, created_at)) = row else {
                return Ok(None);
            };
            let id = parse_uuid(&id_str)?;
            let messages = load_messages(conn, id)?;
            Ok(Some(ConversationRecord {
                owner: Identity::new(user_id),
                conversation: Conversation {
                    id,
                    title,
                    created_at: millis_to_datetime(created_at),
                    messages,
                },
            }))
        })
    }

    /// All conversations owned by `owner`, newest first, each with its
    /// messages in timestamp order.
    pub fn list_for_owner(&self, owner: &Identity) -> Result<Vec<Conversation>, DealchatError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, title, created_at FROM conversations
                     WHERE user_id = ?1
                     ORDER BY created_at DESC, rowid DESC",
                )
                .map_err(|e| DealchatError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![owner.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(|e| DealchatError::Storage(e.to_string()))?;

            let mut heads = Vec::new();
            for row in rows {
                heads.push(row.map_err(|e| DealchatError::Storage(e.to_string()))?);
            }

            let mut conversations = Vec::with_capacity(heads.len());
            for (id_str, title, created_at) in heads {
                let id = parse_uuid(&id_str)?;
                conversations.push(Conversation {
                    id,
                    title,
                    created_at: millis_to_datetime(created_at),
                    messages: load_messages(conn, id)?,
                });
            }
            Ok(conversations)
        })
    }
}

fn insert_conversation(
    conn: &Connection,
    id: Uuid,
    owner: &Identity,
    title: &str,
    created_at: DateTime<Utc>,
) -> Result<(), DealchatError> {
    conn.execute(
        "INSERT INTO conversations (id, user_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            id.to_string(),
            owner.as_str(),
            title,
            created_at.timestamp_millis()
        ],
    )
    .map_err(|e| DealchatError::Storage(format!("Failed to create conversation: {}", e)))?;
    Ok(())
}

fn insert_message(
    conn: &Connection,
    conversation_id: Uuid,
    message: &Message,
) -> Result<(), DealchatError> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, role, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            message.id.to_string(),
            conversation_id.to_string(),
            message.role.as_str(),
            message.content,
            message.created_at.timestamp_millis(),
        ],
    )
    .map_err(|e| DealchatError::Storage(format!("Failed to save message: {}", e)))?;
    Ok(())
}

fn load_messages(conn: &Connection, conversation_id: Uuid) -> Result<Vec<Message>, DealchatError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, role, content, created_at FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, seq ASC",
        )
        .map_err(|e| DealchatError::Storage(e.to_string()))?;

    let rows = stmt
        .query_map(rusqlite::params![conversation_id.to_string()], |row| {
            Ok(row_to_message(row))
        })
        .map_err(|e| DealchatError::Storage(e.to_string()))?;

    let mut messages = Vec::new();
    for row in rows {
        let message = row.map_err(|e| DealchatError::Storage(e.to_string()))??;
        messages.push(message);
    }
    Ok(messages)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, DealchatError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DealchatError::Storage(e.to_string()))?;
    let role_str: String = row
        .get(1)
        .map_err(|e| DealchatError::Storage(e.to_string()))?;
    let content: String = row
        .get(2)
        .map_err(|e| DealchatError::Storage(e.to_string()))?;
    let created_at: i64 = row
        .get(3)
        .map_err(|e| DealchatError::Storage(e.to_string()))?;

    Ok(Message {
        id: parse_uuid(&id_str)?,
        role: role_str
            .parse::<Role>()
            .map_err(DealchatError::Storage)?,
        content,
        created_at: millis_to_datetime(created_at),
    })
}

fn parse_uuid(s: &str) -> Result<Uuid, DealchatError> {
    Uuid::parse_str(s).map_err(|e| DealchatError::Storage(format!("Invalid UUID: {}", e)))
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
