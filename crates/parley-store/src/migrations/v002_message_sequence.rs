//! v002 -- Monotonic message sequence.
//!
//! Rebuilds `messages` with an `AUTOINCREMENT` sequence column. Sequence
//! numbers are never reused, so a reader can follow inserts made by other
//! connections with a simple high-water mark.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE messages_v2 (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,       -- UUID v4
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    payload         TEXT NOT NULL,              -- plaintext or [ENCRYPTED:...]
    created_at      TEXT NOT NULL               -- RFC-3339, microseconds, UTC
);

INSERT INTO messages_v2 (id, conversation_id, sender_id, payload, created_at)
    SELECT id, conversation_id, sender_id, payload, created_at
    FROM messages
    ORDER BY created_at, rowid;

DROP TABLE messages;
ALTER TABLE messages_v2 RENAME TO messages;

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(UP_SQL)?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{run_migrations, v001_initial};

    #[test]
    fn test_upgrade_keeps_rows_in_time_order() {
        let conn = Connection::open_in_memory().unwrap();
        v001_initial::up(&conn).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        for (id, ts) in [
            ("b", "2024-01-01T00:00:02.000000Z"),
            ("a", "2024-01-01T00:00:01.000000Z"),
        ] {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, payload, created_at)
                 VALUES (?1, 'c1', 'u1', 'hi', ?2)",
                [id, ts],
            )
            .unwrap();
        }

        run_migrations(&conn).unwrap();

        let mut stmt = conn.prepare("SELECT id FROM messages ORDER BY seq").unwrap();
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ids, ["a", "b"]);
    }
}
