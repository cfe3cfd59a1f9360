//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and foreign keys on initialization so that deleting
//! a conversation cascades to its messages.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use tracing::info;

use dealchat_core::error::DealchatError;

use crate::migrations;

/// Thread-safe SQLite database wrapper.
///
/// The connection is wrapped in a Mutex since rusqlite Connection is not Sync.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path and apply the schema.
    pub fn new(path: &Path) -> Result<Self, DealchatError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| DealchatError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| DealchatError::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, DealchatError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DealchatError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| DealchatError::Storage(format!("Failed to set pragmas: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DealchatError> {
        register_functions(&conn)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure, so multi-statement
    /// writes inside one closure are never interleaved with another caller.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DealchatError>
    where
        F: FnOnce(&Connection) -> Result<T, DealchatError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DealchatError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// SQL name of the Unicode-aware lowercase function.
///
/// SQLite's built-in `lower()` and `LIKE` only fold ASCII letters.
const FOLD_CASE_FN: &str = "fold_case";

fn register_functions(conn: &Connection) -> Result<(), DealchatError> {
    conn.create_scalar_function(
        FOLD_CASE_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|t| t.to_lowercase()))
        },
    )
    .map_err(|e| DealchatError::Storage(format!("Failed to register {}: {}", FOLD_CASE_FN, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(db: &Database, table: &str) -> i64 {
        db.with_conn(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .map_err(|e| DealchatError::Storage(e.to_string()))
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        assert_eq!(count(&db, "conversations"), 0);
        assert_eq!(count(&db, "messages"), 0);
        assert_eq!(count(&db, "deals"), 0);
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dealchat.db");
        let db = Database::new(&path).unwrap();
        assert_eq!(count(&db, "conversations"), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_file_database_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dealchat.db");
        {
            let db = Database::new(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO conversations (id, user_id, title, created_at) VALUES ('c', 'u', 't', 0)",
                    [],
                )
                .map_err(|e| DealchatError::Storage(e.to_string()))
            })
            .unwrap();
        }
        let db = Database::new(&path).unwrap();
        assert_eq!(count(&db, "conversations"), 1);
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let db = Database::in_memory().unwrap();
        let enabled: i64 = db
            .with_conn(|conn| {
                conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                    .map_err(|e| DealchatError::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
