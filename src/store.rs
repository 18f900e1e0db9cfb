//! # Persistent Store Adapter
//!
//! Durable storage for the routing context, shared by every instance that
//! opens the same database.
//!
//! ## Layout
//!
//! 1. **Structured record** (`routing` table):
//!    - one row per key, the session uses `"latest"`
//!    - value is the MessagePack-encoded `RoutingContext`
//!
//! 2. **Flat metadata** (`session_meta` table):
//!    - `sessionId`, `writer`, `appName`, `timestamp`
//!    - rewritten in the same transaction as the record
//!
//! `writer` identifies the open instance, not the session: a reused session
//! id is shared by several instances, so own writes are recognized by
//! `writer` alone.
//!
//! Other instances notice a write by watching the metadata row only; they
//! are told "something changed" and reload the record themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::{Result, SessionError};
use crate::RoutingContext;

/// Record key used by the session.
pub const LATEST_KEY: &str = "latest";

const SCHEMA_VERSION: i32 = 1;

const META_SESSION_ID: &str = "sessionId";
const META_WRITER: &str = "writer";
const META_APP_NAME: &str = "appName";
const META_TIMESTAMP: &str = "timestamp";

// ============================================================================
// Types
// ============================================================================

/// Lightweight cross-instance signaling data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub session_id: String,
    /// Token of the instance that wrote, unique per open model
    pub writer: String,
    pub app_name: String,
    /// Milliseconds since the Unix epoch of the last write
    pub timestamp: i64,
}

impl SessionMeta {
    /// Metadata stamped now, with the session id doubling as writer token.
    pub fn now(session_id: &str, app_name: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            writer: session_id.to_string(),
            app_name: app_name.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_writer(mut self, writer: &str) -> Self {
        self.writer = writer.to_string();
        self
    }
}

/// Notification that another instance wrote to the store.
///
/// Carries no context content: the subscriber decides whether to reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub writer: String,
    pub timestamp: i64,
}

/// Storage backend for the routing context.
pub trait ContextStore {
    /// Load the context stored under `key`, `None` when nothing was saved.
    fn load(&self, key: &str) -> Result<Option<RoutingContext>>;

    /// Save the context and the session metadata atomically.
    ///
    /// Returns the metadata actually written (its timestamp is bumped past the
    /// previous one so every write is observable).
    fn save(&self, key: &str, context: &RoutingContext, meta: &SessionMeta) -> Result<SessionMeta>;

    /// Remove the record under `key` and bump the metadata.
    fn clear(&self, key: &str, meta: &SessionMeta) -> Result<SessionMeta>;

    /// Read the current session metadata.
    fn read_meta(&self) -> Result<Option<SessionMeta>>;

    /// Subscribe to writes made by instances other than `own_writer`.
    fn watch(&self, own_writer: &str, interval: Duration) -> Result<ExternalChangeHandle>;
}

// ============================================================================
// External change subscription
// ============================================================================

type ChangeCallback = Box<dyn FnMut(&StoreChange) + Send>;

/// Handle for a cross-instance change subscription.
///
/// Changes are queued until the owner drains them, so callbacks always run on
/// the owner's thread.
pub struct ExternalChangeHandle {
    receiver: mpsc::Receiver<StoreChange>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    subscribers: Vec<ChangeCallback>,
}

impl ExternalChangeHandle {
    fn new(
        receiver: mpsc::Receiver<StoreChange>,
        stop: Arc<AtomicBool>,
        worker: Option<thread::JoinHandle<()>>,
    ) -> Self {
        Self {
            receiver,
            stop,
            worker,
            subscribers: Vec::new(),
        }
    }

    /// Next pending change, if any (non-blocking).
    pub fn try_recv(&self) -> Option<StoreChange> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the next change up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StoreChange> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// All pending changes.
    pub fn drain(&self) -> Vec<StoreChange> {
        self.receiver.try_iter().collect()
    }

    /// Register a callback run by [`dispatch_pending`](Self::dispatch_pending).
    pub fn on_external_change<F>(&mut self, callback: F)
    where
        F: FnMut(&StoreChange) + Send + 'static,
    {
        self.subscribers.push(Box::new(callback));
    }

    /// Deliver pending changes to every subscriber. Returns how many changes
    /// were delivered.
    pub fn dispatch_pending(&mut self) -> usize {
        let changes = self.drain();
        for change in &changes {
            for subscriber in self.subscribers.iter_mut() {
                subscriber(change);
            }
        }
        changes.len()
    }

    pub fn is_active(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    /// Stop watching. Pending changes are discarded.
    pub fn cancel(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("[RoutingStore] Watcher thread panicked");
            }
        }
    }
}

impl Drop for ExternalChangeHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// SQLite store
// ============================================================================

/// SQLite-backed store. Every instance opening the same file shares the
/// record and the metadata.
pub struct SqliteStore {
    db: Connection,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        Self::migrate(&db)?;
        info!("[RoutingStore] Opened {}", db_path);
        Ok(Self {
            db,
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing). Cannot be watched.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Bring the schema to `SCHEMA_VERSION`. Safe to run on every open.
    fn migrate(conn: &Connection) -> Result<()> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        info!(
            "[RoutingStore] Migrating schema from version {} to {}",
            version, SCHEMA_VERSION
        );
        conn.execute_batch(
            r#"
            -- Structured record: serialized routing context per key
            CREATE TABLE IF NOT EXISTS routing (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL
            );

            -- Flat key-value store for cross-instance signaling
            CREATE TABLE IF NOT EXISTS session_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    fn read_meta_from(conn: &Connection) -> Result<Option<SessionMeta>> {
        let mut stmt = conn.prepare("SELECT key, value FROM session_meta")?;
        let values: HashMap<String, String> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let Some(session_id) = values.get(META_SESSION_ID) else {
            return Ok(None);
        };
        Ok(Some(SessionMeta {
            session_id: session_id.clone(),
            writer: values
                .get(META_WRITER)
                .unwrap_or(session_id)
                .clone(),
            app_name: values.get(META_APP_NAME).cloned().unwrap_or_default(),
            timestamp: values
                .get(META_TIMESTAMP)
                .and_then(|t| t.parse().ok())
                .unwrap_or(0),
        }))
    }

    fn write_meta(conn: &Connection, meta: &SessionMeta) -> Result<SessionMeta> {
        let previous = Self::read_meta_from(conn)?
            .map(|m| m.timestamp)
            .unwrap_or(i64::MIN);
        let written = SessionMeta {
            timestamp: meta.timestamp.max(previous.saturating_add(1)),
            ..meta.clone()
        };

        let mut stmt = conn.prepare(
            "INSERT INTO session_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )?;
        stmt.execute(params![META_SESSION_ID, written.session_id])?;
        stmt.execute(params![META_WRITER, written.writer])?;
        stmt.execute(params![META_APP_NAME, written.app_name])?;
        stmt.execute(params![META_TIMESTAMP, written.timestamp.to_string()])?;
        Ok(written)
    }
}

impl ContextStore for SqliteStore {
    fn load(&self, key: &str) -> Result<Option<RoutingContext>> {
        let blob: Option<Vec<u8>> = self
            .db
            .query_row(
                "SELECT data FROM routing WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            Some(bytes) => {
                let context: RoutingContext = rmp_serde::from_slice(&bytes)?;
                debug!(
                    "[RoutingStore] Loaded '{}' ({} entries, {} bytes)",
                    key,
                    context.len(),
                    bytes.len()
                );
                Ok(Some(context))
            }
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, context: &RoutingContext, meta: &SessionMeta) -> Result<SessionMeta> {
        // Named encoding: request parameters carry flattened keys
        let blob = rmp_serde::to_vec_named(context)?;

        let tx = self.db.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO routing (key, data) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET data = excluded.data",
            params![key, blob],
        )?;
        let written = Self::write_meta(&tx, meta)?;
        tx.commit().map_err(|e| {
            error!("[RoutingStore] Commit of '{}' failed: {}", key, e);
            SessionError::from(e)
        })?;

        debug!(
            "[RoutingStore] Saved '{}' ({} entries, {} bytes) at {}",
            key,
            context.len(),
            blob.len(),
            written.timestamp
        );
        Ok(written)
    }

    fn clear(&self, key: &str, meta: &SessionMeta) -> Result<SessionMeta> {
        let tx = self.db.unchecked_transaction()?;
        tx.execute("DELETE FROM routing WHERE key = ?1", params![key])?;
        let written = Self::write_meta(&tx, meta)?;
        tx.commit()?;
        info!("[RoutingStore] Cleared '{}'", key);
        Ok(written)
    }

    fn read_meta(&self) -> Result<Option<SessionMeta>> {
        Self::read_meta_from(&self.db)
    }

    fn watch(&self, own_writer: &str, interval: Duration) -> Result<ExternalChangeHandle> {
        if self.db_path == ":memory:" {
            return Err(SessionError::Persistence {
                message: "an in-memory database cannot be watched".to_string(),
            });
        }

        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut last_seen = Self::read_meta_from(&conn)?.map(|m| m.timestamp);

        let (sender, receiver) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let own = own_writer.to_string();
        let path = self.db_path.clone();

        let worker = thread::spawn(move || {
            debug!("[RoutingStore] Watching {} every {:?}", path, interval);
            while !stop_flag.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }

                let meta = match Self::read_meta_from(&conn) {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!("[RoutingStore] Watcher read failed: {}", e);
                        continue;
                    }
                };
                let Some(meta) = meta else { continue };
                if last_seen == Some(meta.timestamp) {
                    continue;
                }
                last_seen = Some(meta.timestamp);

                if meta.writer == own {
                    continue;
                }
                let change = StoreChange {
                    writer: meta.writer,
                    timestamp: meta.timestamp,
                };
                if sender.send(change).is_err() {
                    break;
                }
            }
            debug!("[RoutingStore] Watcher for {} stopped", path);
        });

        Ok(ExternalChangeHandle::new(receiver, stop, Some(worker)))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, Vec<u8>>,
    meta: Option<SessionMeta>,
    watchers: Vec<(String, mpsc::Sender<StoreChange>)>,
    fail_writes: bool,
}

/// Process-local store. Clones share the same data, so several sessions in
/// one process behave like instances sharing a database; watchers are
/// notified on write instead of by polling.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a rejected transaction would.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| SessionError::Persistence {
            message: "memory store lock poisoned".to_string(),
        })
    }

    fn stamp(inner: &mut MemoryInner, meta: &SessionMeta) -> SessionMeta {
        let previous = inner.meta.as_ref().map(|m| m.timestamp).unwrap_or(i64::MIN);
        let written = SessionMeta {
            timestamp: meta.timestamp.max(previous.saturating_add(1)),
            ..meta.clone()
        };
        inner.meta = Some(written.clone());

        let change = StoreChange {
            writer: written.writer.clone(),
            timestamp: written.timestamp,
        };
        inner.watchers.retain(|(owner, sender)| {
            owner == &change.writer || sender.send(change.clone()).is_ok()
        });
        written
    }
}

impl ContextStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<RoutingContext>> {
        let inner = self.lock()?;
        match inner.records.get(key) {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, context: &RoutingContext, meta: &SessionMeta) -> Result<SessionMeta> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(SessionError::Persistence {
                message: format!("write of '{}' rejected", key),
            });
        }
        let blob = rmp_serde::to_vec_named(context)?;
        inner.records.insert(key.to_string(), blob);
        Ok(Self::stamp(&mut inner, meta))
    }

    fn clear(&self, key: &str, meta: &SessionMeta) -> Result<SessionMeta> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(SessionError::Persistence {
                message: format!("clear of '{}' rejected", key),
            });
        }
        inner.records.remove(key);
        Ok(Self::stamp(&mut inner, meta))
    }

    fn read_meta(&self) -> Result<Option<SessionMeta>> {
        Ok(self.lock()?.meta.clone())
    }

    fn watch(&self, own_writer: &str, _interval: Duration) -> Result<ExternalChangeHandle> {
        let (sender, receiver) = mpsc::channel();
        self.lock()?
            .watchers
            .push((own_writer.to_string(), sender));
        Ok(ExternalChangeHandle::new(
            receiver,
            Arc::new(AtomicBool::new(false)),
            None,
        ))
    }
}
