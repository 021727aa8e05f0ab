//! Raw storage of conversation key records.
//!
//! Records are opaque JSON text here; parsing and validation belong to the
//! client key store.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::ConversationId;

use crate::database::Database;
use crate::error::Result;
use crate::messages::format_timestamp;

impl Database {
    pub fn get_key_record(&self, conversation_id: &ConversationId) -> Result<Option<String>> {
        let record = self
            .conn()
            .query_row(
                "SELECT record FROM conversation_keys WHERE conversation_id = ?1",
                params![conversation_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(record)
    }

    /// Insert or replace (last write wins).
    pub fn store_key_record(&self, conversation_id: &ConversationId, record: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversation_keys (conversation_id, record, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id)
             DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
            params![
                conversation_id.as_str(),
                record,
                format_timestamp(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn delete_key_record(&self, conversation_id: &ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversation_keys WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Conversations that currently have a stored key record.
    pub fn list_key_conversations(&self) -> Result<Vec<ConversationId>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id FROM conversation_keys ORDER BY conversation_id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(ConversationId::new(row?));
        }
        Ok(ids)
    }
}
