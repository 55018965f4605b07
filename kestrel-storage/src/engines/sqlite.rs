//! Durable metadata index backed by SQLite.
//!
//! One row per message, body optional (the default composition keeps bodies
//! in [`crate::engines::BodyStore`] and stores bodyless rows here; a
//! standalone `SqliteMetaStore` carries bodies in the `body` column).
//!
//! The connection is owned by a dedicated worker thread with a FIFO request
//! queue; async callers submit closures over the connection and await the
//! reply. That single queue is also what makes the two-statement claim
//! protocol atomic: no other database work interleaves a queued job.

use std::{
    path::Path,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread,
};

use async_trait::async_trait;
use kestrel_common::{LogName, log};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tokio::sync::oneshot;

use crate::{
    error::{Result, StorageError},
    message::{ClientId, Message, MessageId},
    storage::Storage,
};

/// Schema version written by this build.
const CURRENT_VERSION: &str = "0.1.8";

const COLUMNS: &str = "id, destination, persistent, claimant, body, timestamp, size";

const CREATE_SCHEMA: &str = "
    CREATE TABLE messages (
        id          TEXT PRIMARY KEY,
        destination TEXT NOT NULL,
        persistent  CHAR(1),
        claimant    INT,
        body        TEXT,
        timestamp   INT,
        size        INT
    );
    CREATE INDEX idx_messages_destination ON messages(destination);
    CREATE INDEX idx_messages_timestamp ON messages(timestamp);
    CREATE INDEX idx_messages_claimant ON messages(claimant);
    CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);
";

type MigrationStep = fn(&Transaction<'_>) -> rusqlite::Result<()>;

/// In-place upgrades, applied in order from the detected version. Each step
/// runs in its own transaction: probe, DDL, version bump, commit-or-rollback.
const MIGRATIONS: &[(&str, MigrationStep)] =
    &[("0.1.7", upgrade_to_0_1_7), ("0.1.8", upgrade_to_0_1_8)];

/// Adds the `timestamp` and `size` columns.
fn upgrade_to_0_1_7(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "ALTER TABLE messages ADD COLUMN timestamp INT;
         ALTER TABLE messages ADD COLUMN size INT;",
    )
}

/// Introduces the `meta` table and rebuilds `messages` with a TEXT primary
/// key (ids used to be integers).
fn upgrade_to_0_1_8(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);
         ALTER TABLE messages RENAME TO old_messages;
         CREATE TABLE messages (
             id          TEXT PRIMARY KEY,
             destination TEXT NOT NULL,
             persistent  CHAR(1),
             claimant    INT,
             body        TEXT,
             timestamp   INT,
             size        INT
         );
         INSERT INTO messages (id, destination, persistent, claimant, body, timestamp, size)
             SELECT CAST(id AS TEXT), destination, persistent, claimant, body, timestamp, size
             FROM old_messages;
         DROP TABLE old_messages;
         CREATE INDEX idx_messages_destination ON messages(destination);
         CREATE INDEX idx_messages_timestamp ON messages(timestamp);
         CREATE INDEX idx_messages_claimant ON messages(claimant);",
    )?;
    tx.execute(
        "INSERT INTO meta (key, value) VALUES ('version', '0.1.8')",
        [],
    )?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Probe-query column detection, for databases predating the `meta` table.
fn has_column(conn: &Connection, table: &str, column: &str) -> bool {
    conn.prepare(&format!("SELECT {column} FROM {table} LIMIT 0"))
        .is_ok()
}

fn schema_version(conn: &Connection) -> rusqlite::Result<String> {
    if table_exists(conn, "meta")? {
        let version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(version.unwrap_or_else(|| CURRENT_VERSION.to_string()))
    } else if has_column(conn, "messages", "timestamp") {
        Ok("0.1.7".to_string())
    } else {
        Ok("pre-0.1.7".to_string())
    }
}

fn migrate(conn: &mut Connection, name: &LogName) -> Result<()> {
    if !table_exists(conn, "messages")? {
        let tx = conn.transaction()?;
        tx.execute_batch(CREATE_SCHEMA)?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('version', ?1)",
            params![CURRENT_VERSION],
        )?;
        tx.commit()?;
        tracing::info!(
            target: "kestrel",
            engine = %name,
            version = CURRENT_VERSION,
            "created fresh message database"
        );
        return Ok(());
    }

    let version = schema_version(conn)?;
    let first_pending = match version.as_str() {
        "pre-0.1.7" => 0,
        v => match MIGRATIONS.iter().position(|(target, _)| *target == v) {
            Some(applied) => applied + 1,
            None => {
                return Err(StorageError::Migration {
                    version: v.to_string(),
                    reason: "database is newer than this build".to_string(),
                });
            }
        },
    };

    for (target, step) in &MIGRATIONS[first_pending..] {
        tracing::info!(
            target: "kestrel",
            engine = %name,
            version = target,
            "upgrading message database schema"
        );
        // Dropping the transaction on the error path rolls the step back
        let tx = conn.transaction()?;
        step(&tx).map_err(|e| StorageError::Migration {
            version: (*target).to_string(),
            reason: e.to_string(),
        })?;
        tx.commit().map_err(|e| StorageError::Migration {
            version: (*target).to_string(),
            reason: e.to_string(),
        })?;
    }

    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let destination: String = row.get(1)?;
    let persistent: Option<String> = row.get(2)?;
    let claimant: Option<i64> = row.get(3)?;
    let body: Option<Vec<u8>> = row.get(4)?;
    let timestamp: Option<i64> = row.get(5)?;
    let size: Option<i64> = row.get(6)?;

    Ok(Message {
        id: MessageId::new(id),
        destination,
        persistent: persistent.as_deref() == Some("1"),
        body: body.map_or_else(|| std::sync::Arc::from(&[][..]), std::sync::Arc::from),
        timestamp: timestamp.unwrap_or(0) as u64,
        size: size.unwrap_or(0) as u64,
        claimant: claimant.map(|c| ClientId::new(c as u64)),
    })
}

/// Classify a worker-side failure. Ordinary statement errors are transient
/// and surfaced to the caller; an unusable database handle means continuing
/// would risk acknowledging writes that never land, so the process stops.
fn fatal_or_transient(e: rusqlite::Error, name: &LogName) -> StorageError {
    use rusqlite::ErrorCode;

    let code = match &e {
        rusqlite::Error::SqliteFailure(err, _) => Some(err.code),
        _ => None,
    };

    if matches!(
        code,
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    ) {
        log::alert(
            name,
            &format!("metadata database is unusable, terminating: {e}"),
        );
        std::process::exit(74);
    }

    tracing::error!(target: "kestrel", engine = %name, error = %e, "database operation failed");
    StorageError::Database(e.to_string())
}

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// The single request queue in front of the connection.
#[derive(Debug)]
struct DbWorker {
    name: LogName,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DbWorker {
    fn spawn(mut conn: Connection, name: LogName) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name("kestrel-db".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job(&mut conn);
                }
            })
            .map_err(|e| StorageError::Internal(format!("cannot start database worker: {e}")))?;

        Ok(Self {
            name,
            jobs: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return Err(StorageError::ShuttingDown);
        };

        let (tx, rx) = oneshot::channel();
        sender
            .send(Box::new(move |conn| {
                let _ = tx.send(f(conn));
            }))
            .map_err(|_| StorageError::Internal("database worker is gone".to_string()))?;

        let outcome = rx
            .await
            .map_err(|_| StorageError::Internal("database worker dropped a reply".to_string()))?;
        outcome.map_err(|e| fatal_or_transient(e, &self.name))
    }

    async fn shutdown(&self) -> Result<()> {
        // Closing the queue ends the worker loop once in-flight jobs land
        self.jobs.lock()?.take();
        let handle = self.thread.lock()?.take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| StorageError::Internal(format!("worker join failed: {e}")))?
                .map_err(|_| StorageError::Internal("database worker panicked".to_string()))?;
        }
        Ok(())
    }
}

/// Message metadata store on SQLite.
#[derive(Debug)]
pub struct SqliteMetaStore {
    name: LogName,
    worker: DbWorker,
    next_id: AtomicU64,
}

impl SqliteMetaStore {
    /// Open (and create or upgrade if needed) the database at `path`.
    ///
    /// On open the store migrates the schema to [`CURRENT_VERSION`], clears
    /// every residual claim (the broker is the only claim authority and no
    /// client survives a restart), and seeds the id allocator past the
    /// largest stored numeric id.
    ///
    /// # Errors
    /// Fails if the database cannot be opened or a migration step fails
    /// (fatal; the broker must not start on a half-upgraded database).
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_named(path, LogName::root("SQLITE")).await
    }

    /// As [`SqliteMetaStore::open`], with the engine name supplied by the
    /// assembling parent.
    ///
    /// # Errors
    /// As [`SqliteMetaStore::open`].
    pub async fn open_named(path: impl AsRef<Path>, name: LogName) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let opening = name.clone();
        let (conn, next_id) =
            tokio::task::spawn_blocking(move || open_connection(&path, &opening))
                .await
                .map_err(|e| StorageError::Internal(format!("open task failed: {e}")))??;

        Ok(Self {
            worker: DbWorker::spawn(conn, name.clone())?,
            name,
            next_id: AtomicU64::new(next_id),
        })
    }

    /// Allocate a fresh message id, for brokers that want store-assigned ids.
    ///
    /// Ids are numeric strings, strictly increasing, and never collide with
    /// ids already in the database at open time.
    pub fn next_message_id(&self) -> MessageId {
        MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }
}

fn open_connection(path: &Path, name: &LogName) -> Result<(Connection, u64)> {
    let mut conn = Connection::open(path).map_err(|e| StorageError::Configuration {
        field: "db_dsn",
        reason: format!("cannot open database at {}: {e}", path.display()),
    })?;

    // WAL keeps readers unblocked during writes; NORMAL sync is safe with it
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;",
    )?;

    migrate(&mut conn, name)?;

    let cleared = conn.execute(
        "UPDATE messages SET claimant = NULL WHERE claimant IS NOT NULL",
        [],
    )?;
    if cleared > 0 {
        tracing::info!(
            target: "kestrel",
            engine = %name,
            count = cleared,
            "cleared residual claims from previous run"
        );
    }

    let max_id: Option<i64> =
        conn.query_row("SELECT MAX(CAST(id AS INTEGER)) FROM messages", [], |row| {
            row.get(0)
        })?;
    let next_id = max_id.map_or(1, |max| max.max(0) as u64 + 1);

    Ok((conn, next_id))
}

#[async_trait]
impl Storage for SqliteMetaStore {
    async fn store(&self, message: Message) -> Result<()> {
        tracing::debug!(target: "kestrel", engine = %self.name, id = %message.id, "storing message row");
        self.worker
            .call(move |conn| {
                let body: Option<&[u8]> = if message.body.is_empty() {
                    None
                } else {
                    Some(&message.body)
                };
                conn.execute(
                    "INSERT INTO messages (id, destination, persistent, claimant, body, timestamp, size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        message.id.as_str(),
                        message.destination,
                        if message.persistent { "1" } else { "0" },
                        message.claimant.map(|c| c.value() as i64),
                        body,
                        message.timestamp as i64,
                        message.size as i64,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        self.worker
            .call(move |conn| {
                let mut removed = Vec::with_capacity(ids.len());
                for id in &ids {
                    let message = conn
                        .query_row(
                            &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                            params![id],
                            row_to_message,
                        )
                        .optional()?;
                    if message.is_some() {
                        conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                    }
                    removed.push(message);
                }
                Ok(removed)
            })
            .await
    }

    async fn discard(&self, ids: &[MessageId]) -> Result<()> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        self.worker
            .call(move |conn| {
                for id in &ids {
                    conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                }
                Ok(())
            })
            .await
    }

    async fn empty(&self) -> Result<Vec<Message>> {
        self.worker
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM messages ORDER BY timestamp ASC, id ASC"
                ))?;
                let all = stmt
                    .query_map([], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                drop(stmt);
                conn.execute("DELETE FROM messages", [])?;
                Ok(all)
            })
            .await
    }

    async fn claim_and_retrieve(
        &self,
        destination: &str,
        client: ClientId,
    ) -> Result<Option<Message>> {
        let destination = destination.to_string();
        let name = self.name.clone();
        self.worker
            .call(move |conn| {
                // Select-then-update; nothing interleaves on the worker queue
                let candidate = conn
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM messages
                             WHERE destination = ?1 AND claimant IS NULL
                             ORDER BY id ASC LIMIT 1"
                        ),
                        params![destination],
                        row_to_message,
                    )
                    .optional()?;

                let Some(mut message) = candidate else {
                    return Ok(None);
                };

                conn.execute(
                    "UPDATE messages SET claimant = ?1 WHERE id = ?2",
                    params![client.value() as i64, message.id.as_str()],
                )?;
                message.claimant = Some(client);
                tracing::debug!(
                    target: "kestrel",
                    engine = %name,
                    id = %message.id,
                    client = %client,
                    "claimed message row"
                );
                Ok(Some(message))
            })
            .await
    }

    async fn disown(&self, destination: &str, client: ClientId) -> Result<()> {
        let destination = destination.to_string();
        self.worker
            .call(move |conn| {
                conn.execute(
                    "UPDATE messages SET claimant = NULL WHERE destination = ?1 AND claimant = ?2",
                    params![destination, client.value() as i64],
                )?;
                Ok(())
            })
            .await
    }

    async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        self.worker
            .call(move |conn| {
                let mut found = Vec::with_capacity(ids.len());
                for id in &ids {
                    found.push(
                        conn.query_row(
                            &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                            params![id],
                            row_to_message,
                        )
                        .optional()?,
                    );
                }
                Ok(found)
            })
            .await
    }

    async fn peek_oldest(&self) -> Result<Option<Message>> {
        self.worker
            .call(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM messages ORDER BY timestamp ASC, id ASC LIMIT 1"
                    ),
                    [],
                    row_to_message,
                )
                .optional()
            })
            .await
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!(target: "kestrel", engine = %self.name, "shutting down metadata store");
        self.worker.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn message(id: &str, destination: &str, timestamp: u64) -> Message {
        Message::builder()
            .id(id)
            .destination(destination)
            .persistent(true)
            .body(format!("body of {id}").into_bytes())
            .timestamp(timestamp)
            .build()
            .expect("build message")
    }

    #[tokio::test]
    async fn test_fresh_database_is_current_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mq.db");

        let store = SqliteMetaStore::open(&path).await.unwrap();
        store.shutdown().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_store_and_peek_round_trips_body() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("mq.db")).await.unwrap();

        store.store(message("m1", "/queue/a", 100)).await.unwrap();

        let peeked = store.peek(&[MessageId::new("m1")]).await.unwrap();
        let m = peeked[0].as_ref().expect("row exists");
        assert_eq!(&*m.body, b"body of m1");
        assert_eq!(m.destination, "/queue/a");
        assert!(m.persistent);
        assert_eq!(m.timestamp, 100);
        assert_eq!(m.size, 10);
        assert!(m.claimant.is_none());
    }

    #[tokio::test]
    async fn test_empty_body_round_trips() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("mq.db")).await.unwrap();

        let m = Message::builder()
            .id("m1")
            .destination("/queue/a")
            .timestamp(1)
            .build()
            .unwrap();
        store.store(m).await.unwrap();

        let peeked = store.peek(&[MessageId::new("m1")]).await.unwrap();
        assert!(peeked[0].as_ref().unwrap().body.is_empty());
    }

    #[tokio::test]
    async fn test_claim_protocol_orders_by_id() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("mq.db")).await.unwrap();

        store.store(message("2", "/queue/a", 100)).await.unwrap();
        store.store(message("1", "/queue/a", 101)).await.unwrap();

        let first = store
            .claim_and_retrieve("/queue/a", ClientId::new(42))
            .await
            .unwrap()
            .expect("claimable");
        assert_eq!(first.id.as_str(), "1", "id order, not arrival order");
        assert_eq!(first.claimant, Some(ClientId::new(42)));

        // The claimed row is invisible to other clients
        let second = store
            .claim_and_retrieve("/queue/a", ClientId::new(43))
            .await
            .unwrap()
            .expect("one message left");
        assert_eq!(second.id.as_str(), "2");

        assert!(
            store
                .claim_and_retrieve("/queue/a", ClientId::new(44))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_disown_clears_only_matching_claims() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("mq.db")).await.unwrap();

        store.store(message("1", "/queue/a", 100)).await.unwrap();
        store.store(message("2", "/queue/b", 100)).await.unwrap();
        store.claim_and_retrieve("/queue/a", ClientId::new(7)).await.unwrap();
        store.claim_and_retrieve("/queue/b", ClientId::new(7)).await.unwrap();

        store.disown("/queue/a", ClientId::new(7)).await.unwrap();

        let rows = store
            .peek(&[MessageId::new("1"), MessageId::new("2")])
            .await
            .unwrap();
        assert!(rows[0].as_ref().unwrap().claimant.is_none());
        assert_eq!(rows[1].as_ref().unwrap().claimant, Some(ClientId::new(7)));
    }

    #[tokio::test]
    async fn test_residual_claims_cleared_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mq.db");

        let store = SqliteMetaStore::open(&path).await.unwrap();
        store.store(message("1", "/queue/a", 100)).await.unwrap();
        store.claim_and_retrieve("/queue/a", ClientId::new(9)).await.unwrap();
        store.shutdown().await.unwrap();

        let store = SqliteMetaStore::open(&path).await.unwrap();
        let rows = store.peek(&[MessageId::new("1")]).await.unwrap();
        assert!(
            rows[0].as_ref().unwrap().claimant.is_none(),
            "no client survives a restart, so no claim does"
        );
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_id_allocator_skips_stored_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mq.db");

        let store = SqliteMetaStore::open(&path).await.unwrap();
        store.store(message("41", "/queue/a", 100)).await.unwrap();
        store.shutdown().await.unwrap();

        let store = SqliteMetaStore::open(&path).await.unwrap();
        assert_eq!(store.next_message_id().as_str(), "42");
        assert_eq!(store.next_message_id().as_str(), "43");
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_id_is_a_transient_error() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("mq.db")).await.unwrap();

        store.store(message("1", "/queue/a", 100)).await.unwrap();
        let err = store.store(message("1", "/queue/a", 100)).await.unwrap_err();
        assert!(matches!(err, StorageError::Database(_)));

        // The engine stays usable
        store.store(message("2", "/queue/a", 100)).await.unwrap();
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_returns_rows_and_discard_does_not() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("mq.db")).await.unwrap();

        store.store(message("1", "/queue/a", 100)).await.unwrap();
        store.store(message("2", "/queue/a", 101)).await.unwrap();

        let removed = store
            .remove(&[MessageId::new("1"), MessageId::new("404")])
            .await
            .unwrap();
        assert_eq!(removed[0].as_ref().unwrap().id.as_str(), "1");
        assert!(removed[1].is_none());

        store.discard(&[MessageId::new("2")]).await.unwrap();
        let rows = store.peek(&[MessageId::new("2")]).await.unwrap();
        assert!(rows[0].is_none());
    }

    #[tokio::test]
    async fn test_peek_oldest_orders_by_timestamp_then_id() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("mq.db")).await.unwrap();

        store.store(message("9", "/queue/a", 50)).await.unwrap();
        store.store(message("5", "/queue/b", 50)).await.unwrap();
        store.store(message("1", "/queue/c", 100)).await.unwrap();

        let oldest = store.peek_oldest().await.unwrap().expect("not empty");
        assert_eq!(oldest.id.as_str(), "5");
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_are_rejected() {
        let dir = tempdir().unwrap();
        let store = SqliteMetaStore::open(dir.path().join("mq.db")).await.unwrap();
        store.shutdown().await.unwrap();

        let err = store.store(message("1", "/queue/a", 100)).await.unwrap_err();
        assert!(matches!(err, StorageError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_migrates_0_1_7_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mq.db");

        // A 0.1.7-era database: integer ids, timestamp and size present,
        // no meta table, and a stale claim left by a crash.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE messages (
                     id          INTEGER PRIMARY KEY,
                     destination TEXT NOT NULL,
                     persistent  CHAR(1),
                     claimant    INT,
                     body        TEXT,
                     timestamp   INT,
                     size        INT
                 );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO messages VALUES (7, '/queue/a', '1', 99, 'old body', 123, 8)",
                [],
            )
            .unwrap();
        }

        let store = SqliteMetaStore::open(&path).await.unwrap();

        let rows = store.peek(&[MessageId::new("7")]).await.unwrap();
        let m = rows[0].as_ref().expect("row survived the migration");
        assert_eq!(m.destination, "/queue/a");
        assert!(m.persistent);
        assert_eq!(&*m.body, b"old body");
        assert_eq!(m.timestamp, 123);
        assert_eq!(m.size, 8);
        assert!(m.claimant.is_none(), "stale claim cleared");

        // New ids do not collide with migrated ones
        assert_eq!(store.next_message_id().as_str(), "8");
        store.shutdown().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, "0.1.8");
    }

    #[tokio::test]
    async fn test_migrates_pre_0_1_7_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mq.db");

        // Oldest supported layout: no timestamp or size columns at all
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE messages (
                     id          INTEGER PRIMARY KEY,
                     destination TEXT NOT NULL,
                     persistent  CHAR(1),
                     claimant    INT,
                     body        TEXT
                 );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO messages VALUES (3, '/queue/x', '0', NULL, 'ancient')",
                [],
            )
            .unwrap();
        }

        let store = SqliteMetaStore::open(&path).await.unwrap();

        let rows = store.peek(&[MessageId::new("3")]).await.unwrap();
        let m = rows[0].as_ref().expect("row survived both migrations");
        assert_eq!(&*m.body, b"ancient");
        assert!(!m.persistent);
        assert_eq!(m.timestamp, 0, "column added with no value");
        store.shutdown().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, "0.1.8");
    }
}
