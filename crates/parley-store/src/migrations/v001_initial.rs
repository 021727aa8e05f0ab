//! v001 -- Initial schema creation.
//!
//! Creates `conversation_keys`, `messages` and `user_keys`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversation keys (opaque JSON key records, one per conversation)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_keys (
    conversation_id TEXT PRIMARY KEY NOT NULL,
    record          TEXT NOT NULL,            -- JSON KeyRecord, may be corrupt
    updated_at      TEXT NOT NULL             -- RFC-3339
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    payload         TEXT NOT NULL,              -- plaintext or [ENCRYPTED:...]
    created_at      TEXT NOT NULL               -- RFC-3339, microseconds, UTC
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC);

-- ----------------------------------------------------------------
-- User key pairs (JSON UserKeyPair, one active pair per user)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_keys (
    user_id    TEXT PRIMARY KEY NOT NULL,
    record     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
