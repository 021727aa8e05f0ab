//! Storage of per-user X25519 key pairs.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::identity::UserKeyPair;
use parley_shared::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::messages::format_timestamp;

impl Database {
    /// Store (or replace) the active key pair of a user.
    pub fn store_user_keys(&self, user_id: &UserId, pair: &UserKeyPair) -> Result<()> {
        let record = serde_json::to_string(pair)?;
        self.conn().execute(
            "INSERT INTO user_keys (user_id, record, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id)
             DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
            params![user_id.as_str(), record, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    /// The active key pair of a user, `None` when none is stored.
    pub fn get_user_keys(&self, user_id: &UserId) -> Result<Option<UserKeyPair>> {
        let record: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM user_keys WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match record {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
