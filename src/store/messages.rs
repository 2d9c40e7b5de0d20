//! MessageStore — persistence and watermark queries for inbound messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::db::Database;
use crate::scheduler::task::to_stored_timestamp;

/// A persisted inbound chat message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Transport-native message id (used as the reply-to target).
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Persistent message storage backed by SQLite.
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert an inbound message. Duplicate ids are ignored — transports
    /// may redeliver on reconnect.
    pub fn insert(&self, message: &StoredMessage) -> Result<(), rusqlite::Error> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO messages (id, chat_jid, sender, content, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                message.id,
                message.chat_jid,
                message.sender,
                message.content,
                to_stored_timestamp(message.timestamp),
                to_stored_timestamp(Utc::now()),
            ],
        )?;
        debug!(id = %message.id, chat = %message.chat_jid, "Message stored");
        Ok(())
    }

    /// Messages for a chat newer than the watermark, oldest first, excluding
    /// anything the assistant itself said.
    pub fn messages_since(
        &self,
        chat_jid: &str,
        watermark: Option<DateTime<Utc>>,
        assistant_name: &str,
    ) -> Result<Vec<StoredMessage>, rusqlite::Error> {
        let floor = watermark
            .map(to_stored_timestamp)
            .unwrap_or_else(|| "0000".to_string());
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, chat_jid, sender, content, timestamp
             FROM messages
             WHERE chat_jid = ?1 AND timestamp > ?2 AND sender != ?3
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![chat_jid, floor, assistant_name],
            row_to_message,
        )?;
        rows.collect()
    }

    /// Upsert chat display metadata.
    pub fn store_chat_metadata(&self, jid: &str, name: &str) -> Result<(), rusqlite::Error> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO chats (jid, name, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(jid) DO UPDATE SET name = ?2, updated_at = ?3",
            rusqlite::params![jid, name, to_stored_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Display name of a chat, if known.
    pub fn chat_name(&self, jid: &str) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT name FROM chats WHERE jid = ?1")?;
        let mut rows = stmt.query_map(rusqlite::params![jid], |row| row.get(0))?;
        match rows.next() {
            Some(Ok(name)) => Ok(Some(name)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, rusqlite::Error> {
    let timestamp: String = row.get(4)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        chat_jid: row.get(1)?,
        sender: row.get(2)?,
        content: row.get(3)?,
        timestamp: parse_datetime(&timestamp),
    })
}
