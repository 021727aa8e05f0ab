//! SQLite-backed implementation of both storage seams.
//!
//! Rows reach the change feed two ways. An insert through this store is
//! announced straight away. Rows written by any other connection to the same
//! file are picked up by a background poller that follows the `seq` column,
//! started by the first [`MessageStore::subscribe`] made inside a tokio
//! runtime. A shared cursor makes sure each row is announced once.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_shared::ConversationId;

use crate::backend::{KeyVault, MessageStore, FEED_CAPACITY};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::MessageRow;

/// How often the poller looks for rows written by other connections.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct Shared {
    db: Mutex<Database>,
    feed: broadcast::Sender<MessageRow>,
    /// Highest `seq` already announced. Locked before `db`.
    cursor: Mutex<i64>,
}

impl Shared {
    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    fn cursor(&self) -> Result<MutexGuard<'_, i64>> {
        self.cursor.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Announce every row past the cursor and advance it.
    fn publish_new(&self) -> Result<usize> {
        let mut cursor = self.cursor()?;
        let fresh = self.db()?.get_messages_after(*cursor)?;

        for (seq, row) in &fresh {
            // No subscribers is not an error.
            let _ = self.feed.send(row.clone());
            *cursor = *seq;
        }
        Ok(fresh.len())
    }

    /// Move the cursor to the newest row without announcing anything.
    fn skip_to_latest(&self) -> Result<()> {
        let mut cursor = self.cursor()?;
        *cursor = self.db()?.latest_message_seq()?;
        Ok(())
    }
}

/// A [`Database`] shared behind a mutex, plus the insert change feed.
pub struct LocalStore {
    shared: Arc<Shared>,
    poll_interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl LocalStore {
    /// Wrap an open database. Rows already in it are never announced.
    pub fn new(db: Database) -> Result<Self> {
        let cursor = db.latest_message_seq()?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                db: Mutex::new(db),
                feed,
                cursor: Mutex::new(cursor),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poller: Mutex::new(None),
        })
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Self::new(Database::open_at(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Database::open_in_memory()?)
    }

    /// Set how often rows from other writers are looked for. Takes effect
    /// when the poller starts, on the first subscription.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Run a closure against the database for operations outside the two
    /// storage seams (user key pairs, counts).
    pub fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.shared.db()?;
        f(&guard)
    }

    fn ensure_poller(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.is_some() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No tokio runtime, feed carries local inserts only");
            return;
        };

        // Rows written elsewhere before the first subscriber belong to history.
        if let Err(e) = self.shared.skip_to_latest() {
            warn!(error = %e, "Could not position the feed cursor");
        }

        let shared = self.shared.clone();
        let every = self.poll_interval;
        *poller = Some(handle.spawn(poll_feed(shared, every)));
        debug!(interval_ms = every.as_millis() as u64, "Feed poller started");
    }
}

async fn poll_feed(shared: Arc<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match shared.publish_new() {
            Ok(0) => {}
            Ok(n) => debug!(rows = n, "Announced rows from another writer"),
            Err(e) => warn!(error = %e, "Feed poll failed"),
        }
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        let poller = self.poller.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = poller.take() {
            handle.abort();
        }
    }
}

impl KeyVault for LocalStore {
    fn load(&self, conversation_id: &ConversationId) -> Result<Option<String>> {
        self.shared.db()?.get_key_record(conversation_id)
    }

    fn save(&self, conversation_id: &ConversationId, record: &str) -> Result<()> {
        self.shared.db()?.store_key_record(conversation_id, record)
    }

    fn remove(&self, conversation_id: &ConversationId) -> Result<bool> {
        self.shared.db()?.delete_key_record(conversation_id)
    }
}

impl MessageStore for LocalStore {
    fn insert(&self, row: &MessageRow) -> Result<()> {
        self.shared.db()?.insert_message(row)?;

        // The row is stored; a failed announcement is retried by the poller.
        if let Err(e) = self.shared.publish_new() {
            warn!(message_id = %row.id, error = %e, "Could not announce inserted row");
        }
        Ok(())
    }

    fn select(&self, conversation_id: &ConversationId, limit: u32) -> Result<Vec<MessageRow>> {
        self.shared.db()?.get_messages_for_conversation(conversation_id, limit)
    }

    fn delete(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.shared.db()?.delete_messages(ids)
    }

    fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<usize> {
        self.shared.db()?.delete_conversation_messages(conversation_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<MessageRow> {
        let rx = self.shared.feed.subscribe();
        self.ensure_poller();
        rx
    }
}
