//! Durable on-disk FIFO used as the connector's retry path when the bus is
//! unreachable or rejects a message (spec.md §4.2).
//!
//! # Schema
//! One table per direction, named by configuration
//! (`connector.backup_table_to_bus` / `connector.backup_table_from_bus`),
//! columns `(id, kind, routing_key, persistent, recipient, msg)`. `id` is
//! the FIFO ordering key.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! `PRAGMA integrity_check` runs at open; returns error if it fails.
//!
//! # Buffering
//! `buffer_in` holds rows appended by `put`/`put_batch` that have not yet
//! been written to disk; `buffer_out` holds rows already deleted from disk
//! by a prefetching `pop` but not yet handed to a caller. Both are flushed
//! back to disk by `flush()` (and therefore by `Drop`), preserving FIFO
//! order across a restart even if the process stops mid-prefetch.

use bridge_protocol::capability::PublishRequest;
use bridge_protocol::message::{Kind, Message};
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::Path;

/// Number of rows a single prefetch pulls off disk into `buffer_out`.
const PREFETCH_BATCH: i64 = 32;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A message about to be appended to the store. Carries enough routing
/// metadata that a replayed entry can be handed straight to a
/// [`bridge_protocol::capability::BusPublisher`] without re-parsing.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub kind: String,
    pub routing_key: Option<String>,
    pub persistent: bool,
    pub recipient: Option<String>,
    pub payload: Vec<u8>,
}

impl NewEntry {
    /// Build an entry from a pipeline [`Message`] and its already-emitted
    /// wire-form bytes.
    pub fn from_message(msg: &Message, payload: Vec<u8>) -> Self {
        NewEntry {
            kind: msg.kind.as_str().to_owned(),
            routing_key: msg.routing_key.clone(),
            persistent: msg.persistent,
            recipient: msg.recipient.clone(),
            payload,
        }
    }
}

/// An entry retrieved from the store via `pop`.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub id: i64,
    pub kind: String,
    pub routing_key: Option<String>,
    pub persistent: bool,
    pub recipient: Option<String>,
    pub payload: Vec<u8>,
}

impl RetryEntry {
    /// Best-effort `Kind` for logging; unknown tags fall back to `Event`.
    pub fn kind(&self) -> Kind {
        Kind::from_str(&self.kind).unwrap_or(Kind::Event)
    }

    /// Build the publish request for replaying this entry, without
    /// re-parsing the already-serialized payload. Consumes the entry since
    /// the request takes ownership of the payload.
    pub fn into_publish_request(self) -> PublishRequest {
        PublishRequest {
            kind: self.kind,
            routing_key: self.routing_key,
            payload: self.payload,
            persistent: self.persistent,
            recipient: self.recipient,
        }
    }
}

/// Error type for retry-store operations.
#[derive(Debug)]
pub enum RetryStoreError {
    Sqlite(rusqlite::Error),
    /// The database is locked by another writer/reader; caller should
    /// suspend briefly and retry (spec.md §7).
    Busy,
    IntegrityCheckFailed(String),
}

impl std::fmt::Display for RetryStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStoreError::Sqlite(e) => write!(f, "sqlite error: {}", e),
            RetryStoreError::Busy => write!(f, "retry store is locked"),
            RetryStoreError::IntegrityCheckFailed(s) => write!(f, "integrity check failed: {}", s),
        }
    }
}

impl std::error::Error for RetryStoreError {}

impl From<rusqlite::Error> for RetryStoreError {
    fn from(e: rusqlite::Error) -> Self {
        if is_busy(&e) {
            RetryStoreError::Busy
        } else {
            RetryStoreError::Sqlite(e)
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

// ---------------------------------------------------------------------------
// RetryStore
// ---------------------------------------------------------------------------

/// The durable FIFO for a single direction (to-bus or from-bus).
pub struct RetryStore {
    conn: Connection,
    table: String,
    buffer_in: Vec<NewEntry>,
    buffer_out: VecDeque<RetryEntry>,
}

impl RetryStore {
    /// Open (or create) the store at `path` using `table` as the row
    /// namespace. Idempotent; fails only on I/O/permission errors or a
    /// failed integrity check.
    pub fn open(path: &Path, table: &str) -> Result<Self, RetryStoreError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn, table)?;
        Ok(RetryStore {
            conn,
            table: table.to_owned(),
            buffer_in: Vec::new(),
            buffer_out: VecDeque::new(),
        })
    }

    /// Append one entry. May be coalesced in `buffer_in` until the next
    /// `flush`-triggering operation.
    pub fn put(&mut self, entry: NewEntry) -> Result<(), RetryStoreError> {
        self.buffer_in.push(entry);
        self.flush_writes()
    }

    /// Append several entries as a single batch (used when draining the
    /// in-memory queue on disconnect, spec.md §4.3 step 1).
    pub fn put_batch(&mut self, entries: impl IntoIterator<Item = NewEntry>) -> Result<(), RetryStoreError> {
        self.buffer_in.extend(entries);
        self.flush_writes()
    }

    /// Return and remove the oldest entry, or `None` if the store is empty.
    pub fn pop(&mut self) -> Result<Option<RetryEntry>, RetryStoreError> {
        self.flush_writes()?;
        if self.buffer_out.is_empty() {
            self.prefetch()?;
        }
        Ok(self.buffer_out.pop_front())
    }

    /// Row count on disk plus both in-memory buffers.
    pub fn size(&mut self) -> Result<i64, RetryStoreError> {
        self.flush_writes()?;
        let on_disk: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(on_disk + self.buffer_out.len() as i64)
    }

    /// Number of entries held only in `buffer_in` (not yet on disk).
    pub fn buffer_in_len(&self) -> usize {
        self.buffer_in.len()
    }

    /// Number of entries prefetched into `buffer_out` (deleted from disk,
    /// not yet handed to a caller).
    pub fn buffer_out_len(&self) -> usize {
        self.buffer_out.len()
    }

    /// Drain both buffers to disk. Restores `buffer_out` contents ahead of
    /// `buffer_in` so FIFO order survives the round trip.
    pub fn flush(&mut self) -> Result<(), RetryStoreError> {
        self.restore_buffer_out()?;
        self.flush_writes()
    }

    /// Reclaim disk space after a large backlog has fully drained. Advisory
    /// disk hygiene, not correctness — called by the `SessionManager` once
    /// `size()` returns to zero after a drain; errors are logged and
    /// otherwise ignored.
    pub fn maybe_vacuum(&mut self) {
        match self.size() {
            Ok(0) => {
                if let Err(e) = self.conn.execute_batch("VACUUM;") {
                    tracing::warn!(error = %e, table = %self.table, "retry store vacuum failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, table = %self.table, "retry store size check before vacuum failed"),
        }
    }

    fn flush_writes(&mut self) -> Result<(), RetryStoreError> {
        if self.buffer_in.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO \"{}\" (kind, routing_key, persistent, recipient, msg) VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table
            ))?;
            for entry in self.buffer_in.drain(..) {
                stmt.execute(params![
                    entry.kind,
                    entry.routing_key,
                    entry.persistent,
                    entry.recipient,
                    entry.payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn restore_buffer_out(&mut self) -> Result<(), RetryStoreError> {
        if self.buffer_out.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO \"{}\" (kind, routing_key, persistent, recipient, msg) VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table
            ))?;
            for entry in self.buffer_out.drain(..) {
                stmt.execute(params![
                    entry.kind,
                    entry.routing_key,
                    entry.persistent,
                    entry.recipient,
                    entry.payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn prefetch(&mut self) -> Result<(), RetryStoreError> {
        let tx = self.conn.transaction()?;
        let mut fetched = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, kind, routing_key, persistent, recipient, msg FROM \"{}\" ORDER BY id ASC LIMIT ?1",
                self.table
            ))?;
            let rows = stmt.query_map(params![PREFETCH_BATCH], map_row)?;
            for row in rows {
                fetched.push(row?);
            }
        }
        if !fetched.is_empty() {
            let ids: Vec<i64> = fetched.iter().map(|e| e.id).collect();
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            tx.execute(
                &format!("DELETE FROM \"{}\" WHERE id IN ({})", self.table, placeholders),
                rusqlite::params_from_iter(ids.iter()),
            )?;
        }
        tx.commit()?;
        self.buffer_out.extend(fetched);
        Ok(())
    }
}

impl Drop for RetryStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(error = %e, "failed to flush retry store on drop");
        }
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), RetryStoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), RetryStoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(RetryStoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection, table: &str) -> Result<(), RetryStoreError> {
    let schema = include_str!("schema.sql").replace("{table}", table);
    conn.execute_batch(&schema)?;
    Ok(())
}

fn map_row(row: &rusqlite::Row<'_>) -> Result<RetryEntry, rusqlite::Error> {
    Ok(RetryEntry {
        id: row.get(0)?,
        kind: row.get(1)?,
        routing_key: row.get(2)?,
        persistent: row.get::<_, i64>(3)? != 0,
        recipient: row.get(4)?,
        payload: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn make_store() -> (RetryStore, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp file");
        let store = RetryStore::open(file.path(), "retry_to_bus").expect("open store");
        (store, file)
    }

    fn entry(tag: &str) -> NewEntry {
        NewEntry {
            kind: "event".to_owned(),
            routing_key: None,
            persistent: true,
            recipient: None,
            payload: tag.as_bytes().to_vec(),
        }
    }

    #[test]
    fn fifo_order_is_preserved_across_put_and_pop() {
        let (mut store, _file) = make_store();
        store.put(entry("A")).unwrap();
        store.put(entry("B")).unwrap();
        store.put(entry("C")).unwrap();

        assert_eq!(store.pop().unwrap().unwrap().payload, b"A");
        assert_eq!(store.pop().unwrap().unwrap().payload, b"B");
        assert_eq!(store.pop().unwrap().unwrap().payload, b"C");
        assert!(store.pop().unwrap().is_none());
    }

    #[test]
    fn size_counts_disk_rows_and_buffers() {
        let (mut store, _file) = make_store();
        assert_eq!(store.size().unwrap(), 0);
        store.put(entry("A")).unwrap();
        store.put(entry("B")).unwrap();
        assert_eq!(store.size().unwrap(), 2);
        store.pop().unwrap();
        assert_eq!(store.size().unwrap(), 1);
    }

    #[test]
    fn entries_survive_reopen_in_fifo_order() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut store = RetryStore::open(file.path(), "retry_to_bus").unwrap();
            store.put(entry("A")).unwrap();
            store.put(entry("B")).unwrap();
        }
        let mut reopened = RetryStore::open(file.path(), "retry_to_bus").unwrap();
        assert_eq!(reopened.pop().unwrap().unwrap().payload, b"A");
        assert_eq!(reopened.pop().unwrap().unwrap().payload, b"B");
    }

    #[test]
    fn prefetched_but_unconsumed_entries_survive_flush_and_drop() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut store = RetryStore::open(file.path(), "retry_to_bus").unwrap();
            store.put(entry("A")).unwrap();
            store.put(entry("B")).unwrap();
            // force a prefetch into buffer_out without consuming it
            store.pop().unwrap();
            assert!(store.buffer_out_len() <= 1);
            // dropping here must flush buffer_out back to disk
        }
        let mut reopened = RetryStore::open(file.path(), "retry_to_bus").unwrap();
        assert_eq!(reopened.pop().unwrap().unwrap().payload, b"B");
        assert!(reopened.pop().unwrap().is_none());
    }

    #[test]
    fn empty_store_pop_returns_none() {
        let (mut store, _file) = make_store();
        assert!(store.pop().unwrap().is_none());
    }

    #[test]
    fn maybe_vacuum_is_a_no_op_on_a_nonempty_store() {
        let (mut store, _file) = make_store();
        store.put(entry("A")).unwrap();
        store.maybe_vacuum();
        assert_eq!(store.size().unwrap(), 1);
    }

    #[test]
    fn maybe_vacuum_runs_without_error_once_drained() {
        let (mut store, _file) = make_store();
        store.put(entry("A")).unwrap();
        store.pop().unwrap();
        assert_eq!(store.size().unwrap(), 0);
        store.maybe_vacuum();
        assert_eq!(store.size().unwrap(), 0);
    }

    #[test]
    fn put_batch_preserves_order() {
        let (mut store, _file) = make_store();
        store.put_batch(vec![entry("A"), entry("B"), entry("C")]).unwrap();
        assert_eq!(store.pop().unwrap().unwrap().payload, b"A");
        assert_eq!(store.pop().unwrap().unwrap().payload, b"B");
        assert_eq!(store.pop().unwrap().unwrap().payload, b"C");
    }
}
