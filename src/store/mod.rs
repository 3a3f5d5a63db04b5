//! SQLite-backed local store
//!
//! The local database is a cache of server state behind an r2d2 connection
//! pool. All mutation goes through [`LocalStore::write`], a scoped
//! transaction that commits on success and rolls back on any error, so
//! partial thread-graph states are never visible outside the transaction.
//!
//! Change notification is an explicit observer seam: after committing,
//! callers hand the set of touched folder ids to [`LocalStore::notify`] and
//! every subscriber receives a [`StoreChange`]. The sync core itself never
//! consumes these; they exist for the UI layer.

pub mod folders;
pub mod messages;
pub mod threads;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction};
use tracing::debug;

use crate::error::{MailError, Result};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Emitted to subscribers after a committed write transaction.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub folder_ids: Vec<String>,
}

pub struct LocalStore {
    pool: DbPool,
    observers: Mutex<Vec<flume::Sender<StoreChange>>>,
}

impl LocalStore {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(init_connection);
        let pool = Pool::builder()
            .max_size(5)
            .build(manager)
            .map_err(|e| MailError::Database(format!("failed to create pool: {e}")))?;
        Self::from_pool(pool)
    }

    /// In-memory database, single connection (each pooled connection would
    /// otherwise get its own private memory database).
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| MailError::Database(format!("failed to create pool: {e}")))?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> Result<Self> {
        let store = Self {
            pool,
            observers: Mutex::new(Vec::new()),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| MailError::Database(format!("failed to get connection: {e}")))
    }

    /// Run `f` inside a write transaction. Commits if `f` returns `Ok`,
    /// rolls back otherwise (including cancellation), on every exit path.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run a read-only closure on a pooled connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        f(&conn)
    }

    /// Subscribe to committed changes. Dropped receivers are pruned on the
    /// next notification.
    pub fn subscribe(&self) -> flume::Receiver<StoreChange> {
        let (tx, rx) = flume::unbounded();
        self.observers.lock().unwrap().push(tx);
        rx
    }

    /// Fan a committed change out to subscribers.
    pub fn notify(&self, folder_ids: &BTreeSet<String>) {
        if folder_ids.is_empty() {
            return;
        }
        let change = StoreChange {
            folder_ids: folder_ids.iter().cloned().collect(),
        };
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|tx| tx.send(change.clone()).is_ok());
        debug!(
            "notified {} observer(s) of changes in {:?}",
            observers.len(),
            change.folder_ids
        );
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'custom',
                cursor TEXT,
                remaining_old_messages_to_fetch INTEGER NOT NULL DEFAULT 0,
                is_history_complete INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                last_updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS messages (
                uid TEXT PRIMARY KEY,
                short_uid INTEGER NOT NULL,
                folder_id TEXT NOT NULL REFERENCES folders(id),
                subject TEXT,
                date TEXT NOT NULL,
                message_ids TEXT NOT NULL,  -- JSON array
                seen INTEGER NOT NULL DEFAULT 0,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                answered INTEGER NOT NULL DEFAULT 0,
                forwarded INTEGER NOT NULL DEFAULT 0,
                scheduled INTEGER NOT NULL DEFAULT 0,
                is_spam INTEGER NOT NULL DEFAULT 0,
                is_draft INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                fully_downloaded INTEGER NOT NULL DEFAULT 0,
                draft_uuid TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_folder
                ON messages(folder_id, short_uid);

            CREATE TABLE IF NOT EXISTS threads (
                uid TEXT PRIMARY KEY,
                folder_id TEXT NOT NULL REFERENCES folders(id),
                unseen_messages_count INTEGER NOT NULL DEFAULT 0,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                date TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_threads_folder ON threads(folder_id);

            -- Thread membership (which messages a thread displays)
            CREATE TABLE IF NOT EXISTS thread_messages (
                thread_uid TEXT NOT NULL REFERENCES threads(uid) ON DELETE CASCADE,
                message_uid TEXT NOT NULL REFERENCES messages(uid) ON DELETE CASCADE,
                PRIMARY KEY (thread_uid, message_uid)
            );
            CREATE INDEX IF NOT EXISTS idx_thread_messages_message
                ON thread_messages(message_uid);

            -- Thread ancestry (union of member messages' message-id headers);
            -- grows monotonically and is what new arrivals match against
            CREATE TABLE IF NOT EXISTS thread_message_ids (
                thread_uid TEXT NOT NULL REFERENCES threads(uid) ON DELETE CASCADE,
                message_id TEXT NOT NULL,
                PRIMARY KEY (thread_uid, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_thread_message_ids_id
                ON thread_message_ids(message_id);

            -- Local draft mirrors, deleted together with their message
            CREATE TABLE IF NOT EXISTS drafts (
                uuid TEXT PRIMARY KEY,
                message_uid TEXT,
                subject TEXT,
                body TEXT
            );
            "#,
        )?;
        Ok(())
    }
}

fn init_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )
}
