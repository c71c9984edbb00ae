//! SQLite-backed metadata store
//!
//! Revision trees are stored as bincode blobs keyed by content hash; the event
//! log is a table keyed by sequence number. A tree update and its event are
//! written in one transaction. The connection runs in WAL mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::event::{Event, Operation};
use crate::object::Hash;
use crate::revision::RevisionTree;
use crate::storage::{MetadataStore, Result, StoreError};

fn db(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn bytes_to_hash(bytes: &[u8]) -> Result<Hash> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization(format!("Bad hash length {}", bytes.len())))?;
    Ok(Hash::new(arr))
}

fn encode_heads(heads: &BTreeSet<Hash>) -> Vec<u8> {
    heads.iter().flat_map(|h| h.as_bytes().iter().copied()).collect()
}

fn decode_heads(bytes: &[u8]) -> Result<BTreeSet<Hash>> {
    if bytes.len() % 32 != 0 {
        return Err(StoreError::Serialization(format!("Bad head list length {}", bytes.len())));
    }
    bytes.chunks(32).map(bytes_to_hash).collect()
}

fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(db)?;
    conn.pragma_update(None, "journal_mode", "WAL").map_err(db)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(db)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS trees (
            content BLOB PRIMARY KEY,
            tree BLOB NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY,
            content BLOB NOT NULL,
            revisions BLOB NOT NULL,
            operation TEXT NOT NULL,
            timestamp INTEGER NOT NULL -- nanoseconds since the epoch
        );",
    )
    .map_err(db)?;
    Ok(conn)
}

pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_db(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("Connection lock poisoned".to_string()))
    }
}

type EventRow = (i64, Vec<u8>, Vec<u8>, String, i64);

fn row_to_event((seq, content, revisions, operation, timestamp): EventRow) -> Result<Event> {
    let operation = Operation::parse(&operation)
        .ok_or_else(|| StoreError::Serialization(format!("Unknown operation {:?}", operation)))?;
    let timestamp: DateTime<Utc> = DateTime::from_timestamp_nanos(timestamp);
    Ok(Event {
        seq: seq as u64,
        content: bytes_to_hash(&content)?,
        revisions: decode_heads(&revisions)?,
        operation,
        timestamp,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn tree(&self, content: Hash) -> Result<Option<RevisionTree>> {
        let conn = self.conn()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT tree FROM trees WHERE content=?1",
                rusqlite::params![content.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        blob.map(|b| bincode::deserialize(&b).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()
    }

    async fn commit(&self, tree: &RevisionTree, operation: Operation) -> Result<Event> {
        let blob = bincode::serialize(tree).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;

        let last: i64 = tx
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |row| row.get(0))
            .map_err(db)?;
        let event = Event::new(last as u64 + 1, tree.content(), tree.head_hashes(), operation);
        let nanos = event.timestamp.timestamp_nanos_opt().ok_or_else(|| {
            StoreError::Serialization(format!("Timestamp {} out of range", event.timestamp))
        })?;

        tx.execute(
            "INSERT INTO trees (content, tree) VALUES (?1, ?2) \
             ON CONFLICT(content) DO UPDATE SET tree=excluded.tree",
            rusqlite::params![tree.content().as_bytes().as_slice(), blob],
        )
        .map_err(db)?;
        tx.execute(
            "INSERT INTO events (seq, content, revisions, operation, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                event.seq as i64,
                event.content.as_bytes().as_slice(),
                encode_heads(&event.revisions),
                event.operation.as_str(),
                nanos,
            ],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;

        Ok(event)
    }

    async fn read(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT seq, content, revisions, operation, timestamp FROM events \
                 WHERE seq > ?1 ORDER BY seq LIMIT ?2",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(rusqlite::params![after as i64, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })
            .map_err(db)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row_to_event(row.map_err(db)?)?);
        }
        Ok(events)
    }

    async fn last_seq(&self) -> Result<u64> {
        let conn = self.conn()?;
        let last: i64 = conn
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |row| row.get(0))
            .map_err(db)?;
        Ok(last as u64)
    }

    async fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM trees", [], |row| row.get(0))
            .map_err(db)?;
        Ok(count as u64)
    }
}
