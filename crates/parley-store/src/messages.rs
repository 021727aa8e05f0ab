//! CRUD operations for [`MessageRow`] records.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use uuid::Uuid;

use parley_shared::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::MessageRow;

impl Database {
    pub fn insert_message(&self, message: &MessageRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id.to_string(),
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                message.payload,
                format_timestamp(&message.created_at),
            ],
        )?;
        Ok(())
    }

    /// The `limit` most recent messages of a conversation, oldest first.
    pub fn get_messages_for_conversation(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender_id, payload, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, seq DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![conversation_id.as_str(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Highest sequence number currently stored, `0` for an empty table.
    pub fn latest_message_seq(&self) -> Result<i64> {
        let seq: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM messages",
            [],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    /// Messages inserted after `seq` by any connection, in insertion order,
    /// each paired with its sequence number.
    pub fn get_messages_after(&self, seq: i64) -> Result<Vec<(i64, MessageRow)>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender_id, payload, created_at, seq
             FROM messages
             WHERE seq > ?1
             ORDER BY seq",
        )?;

        let rows = stmt.query_map(params![seq], |row| {
            Ok((row.get::<_, i64>(5)?, row_to_message(row)?))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Delete a set of messages in one transaction.
    pub fn delete_messages(&self, ids: &[Uuid]) -> Result<usize> {
        let tx = self.conn().unchecked_transaction()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM messages WHERE id = ?1")?;
            for id in ids {
                affected += stmt.execute(params![id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    pub fn delete_conversation_messages(&self, conversation_id: &ConversationId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
        )?;
        Ok(affected)
    }

    pub fn count_messages(&self, conversation_id: &ConversationId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

// Fixed-width so lexical order matches time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let id_str: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let payload: String = row.get(3)?;
    let ts_str: String = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(MessageRow {
        id,
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new(sender_id),
        payload,
        created_at,
    })
}
