//! SQLite persistence for conversation transcripts.
//!
//! Uses `rusqlite` in synchronous mode. All identities share one table keyed
//! by `identity`; row IDs give the insertion order. WAL journaling with
//! `synchronous=FULL` makes every committed insert survive a crash.

use rusqlite::types::Type;
use rusqlite::{params, Connection};

use super::errors::AgentError;
use super::types::StoredMessage;
use crate::inference::types::Role;

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite handle for conversation history.
pub struct HistoryDatabase {
    conn: Connection,
}

impl HistoryDatabase {
    /// Open (or create) the history database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_messages_identity
                ON messages(identity, id);
            ",
        )?;
        Ok(())
    }

    // ─── Messages ───────────────────────────────────────────────────────

    /// Append a message. Returns the stored row once committed.
    pub fn insert_message(
        &self,
        identity: &str,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<StoredMessage, AgentError> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO messages (identity, timestamp, role, content, token_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![identity, timestamp, role.as_str(), content, token_count],
        )?;

        Ok(StoredMessage {
            id: self.conn.last_insert_rowid(),
            identity: identity.to_string(),
            timestamp,
            role,
            content: content.to_string(),
            token_count,
        })
    }

    /// All messages for an identity, oldest first.
    pub fn get_messages(&self, identity: &str) -> Result<Vec<StoredMessage>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity, timestamp, role, content, token_count
             FROM messages
             WHERE identity = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![identity], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// The `limit` most recent messages for an identity, oldest first.
    pub fn get_recent_messages(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity, timestamp, role, content, token_count
             FROM messages
             WHERE identity = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![identity, limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Delete every message for an identity. Returns the number removed.
    pub fn clear_conversation(&self, identity: &str) -> Result<usize, AgentError> {
        let removed = self.conn.execute(
            "DELETE FROM messages WHERE identity = ?1",
            params![identity],
        )?;
        Ok(removed)
    }
}

// ─── Row Mapping ────────────────────────────────────────────────────────────

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role_str: String = row.get(3)?;
    let role = Role::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            Box::new(AgentError::InvalidRole { role: role_str }),
        )
    })?;
    let token_count: i64 = row.get(5)?;

    Ok(StoredMessage {
        id: row.get(0)?,
        identity: row.get(1)?,
        timestamp: row.get(2)?,
        role,
        content: row.get(4)?,
        token_count: token_count.max(0) as u32,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> HistoryDatabase {
        HistoryDatabase::open(":memory:").unwrap()
    }

    #[test]
    fn test_insert_and_get_messages() {
        let db = test_db();
        db.insert_message("c1", Role::User, "hello", 2).unwrap();
        db.insert_message("c1", Role::Assistant, "hi!", 2).unwrap();

        let msgs = db.get_messages("c1").unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[0].content, "hello");
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(msgs[0].id < msgs[1].id);
    }

    #[test]
    fn test_empty_content_round_trips() {
        let db = test_db();
        db.insert_message("c1", Role::Assistant, "", 0).unwrap();
        let msgs = db.get_messages("c1").unwrap();
        assert_eq!(msgs[0].content, "");
    }

    #[test]
    fn test_get_recent_messages() {
        let db = test_db();
        for i in 0..10 {
            db.insert_message("c1", Role::User, &format!("m{i}"), 1)
                .unwrap();
        }
        let recent = db.get_recent_messages("c1", 3).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m7", "m8", "m9"]);
    }

    #[test]
    fn test_identities_are_isolated() {
        let db = test_db();
        db.insert_message("a", Role::User, "for a", 1).unwrap();
        db.insert_message("b", Role::User, "for b", 1).unwrap();
        assert_eq!(db.get_messages("a").unwrap().len(), 1);
        assert_eq!(db.get_messages("b").unwrap()[0].content, "for b");
        assert!(db.get_messages("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_clear_conversation() {
        let db = test_db();
        db.insert_message("a", Role::User, "one", 1).unwrap();
        db.insert_message("a", Role::User, "two", 1).unwrap();
        db.insert_message("b", Role::User, "keep", 1).unwrap();

        assert_eq!(db.clear_conversation("a").unwrap(), 2);
        assert!(db.get_messages("a").unwrap().is_empty());
        assert_eq!(db.get_messages("b").unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_role_is_rejected_on_read() {
        let db = test_db();
        db.conn
            .execute(
                "INSERT INTO messages (identity, timestamp, role, content) VALUES ('a', 't', 'wizard', 'x')",
                [],
            )
            .unwrap();
        let err = db.get_messages("a").unwrap_err();
        assert!(matches!(err, AgentError::PersistenceError { .. }));
    }

    #[test]
    fn test_reopen_preserves_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let path = path.to_str().unwrap();

        {
            let db = HistoryDatabase::open(path).unwrap();
            db.insert_message("c", Role::User, "before restart", 3).unwrap();
            db.insert_message("c", Role::Tool, "tool output", 3).unwrap();
        }

        let db = HistoryDatabase::open(path).unwrap();
        let msgs = db.get_messages("c").unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "before restart");
        assert_eq!(msgs[1].role, Role::Tool);
    }
}
