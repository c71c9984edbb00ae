//! Storage abstraction layer for revstore
//!
//! Two collaborators back a repository: a `ContentStore` holding raw bytes
//! addressed by their hash, and a `MetadataStore` holding revision trees and
//! the event log. Writing a tree and appending its event is one atomic step.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;

use crate::event::{Event, Operation};
use crate::object::Hash;
use crate::revision::{RevisionTree, TreeError};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Streamed content bytes
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Chunk size used when streaming content
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Conflict on {content}: expected head [{}], found [{}]", fmt_heads(.expected), fmt_heads(.actual))]
    Conflict {
        content: Hash,
        expected: BTreeSet<Hash>,
        actual: BTreeSet<Hash>,
    },

    #[error("Content already exists: {0}")]
    AlreadyExists(Hash),

    #[error("Unknown content: {0}")]
    UnknownContent(Hash),

    #[error("Unknown revision: {0}")]
    UnknownRevision(Hash),

    #[error("Unknown repository: {0}")]
    UnknownRepository(String),

    #[error("Repository {0} is closed")]
    Closed(String),

    #[error("Integrity failure: expected {expected}, received {actual}")]
    Integrity { expected: Hash, actual: Hash },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl StoreError {
    /// Conditions an agent retries: a reference that raced with a delete,
    /// or a store that is closed for now.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::UnknownContent(_) | StoreError::UnknownRevision(_) | StoreError::Closed(_)
        )
    }
}

fn fmt_heads(heads: &BTreeSet<Hash>) -> String {
    heads.iter().map(Hash::short).collect::<Vec<_>>().join(",")
}

/// Content bytes addressed by their SHA-256 digest
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Open a stream over stored content
    async fn open(&self, hash: Hash) -> Result<ContentReader>;

    /// Store a stream, returning its hash and length.
    ///
    /// When `expected` is given, a digest mismatch fails with `Integrity`
    /// and nothing is stored.
    async fn put(&self, reader: ContentReader, expected: Option<Hash>) -> Result<(Hash, u64)>;

    /// Remove stored content
    async fn delete(&self, hash: Hash) -> Result<()>;

    /// Check if content exists
    async fn contains(&self, hash: Hash) -> Result<bool>;
}

/// Revision trees plus the append-only event log
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Latest stored tree for a content
    async fn tree(&self, content: Hash) -> Result<Option<RevisionTree>>;

    /// Replace the tree for its content and append the matching event,
    /// atomically
    async fn commit(&self, tree: &RevisionTree, operation: Operation) -> Result<Event>;

    /// Events with `seq > after`, oldest first, at most `limit`
    async fn read(&self, after: u64, limit: usize) -> Result<Vec<Event>>;

    /// Sequence number of the newest event (0 when empty)
    async fn last_seq(&self) -> Result<u64>;

    /// Number of contents with a revision tree
    async fn count(&self) -> Result<u64>;
}

/// Verify a computed digest against the expected one
pub(crate) fn check_digest(expected: Option<Hash>, actual: Hash) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::Integrity { expected, actual }),
        _ => Ok(()),
    }
}

/// In-memory content store
#[derive(Default)]
pub struct MemoryContentStore {
    objects: RwLock<HashMap<Hash, Bytes>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn open(&self, hash: Hash) -> Result<ContentReader> {
        let objects = self.objects.read().await;
        let data = objects.get(&hash).cloned().ok_or(StoreError::UnknownContent(hash))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn put(&self, mut reader: ContentReader, expected: Option<Hash>) -> Result<(Hash, u64)> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let hash = Hash::from_data(&data);
        check_digest(expected, hash)?;
        let length = data.len() as u64;
        self.objects.write().await.entry(hash).or_insert_with(|| Bytes::from(data));
        Ok((hash, length))
    }

    async fn delete(&self, hash: Hash) -> Result<()> {
        self.objects
            .write()
            .await
            .remove(&hash)
            .map(|_| ())
            .ok_or(StoreError::UnknownContent(hash))
    }

    async fn contains(&self, hash: Hash) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(&hash))
    }
}

#[derive(Default)]
struct MemoryLog {
    trees: HashMap<Hash, RevisionTree>,
    events: Vec<Event>,
}

/// In-memory metadata store
#[derive(Default)]
pub struct MemoryMetadataStore {
    log: RwLock<MemoryLog>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn tree(&self, content: Hash) -> Result<Option<RevisionTree>> {
        Ok(self.log.read().await.trees.get(&content).cloned())
    }

    async fn commit(&self, tree: &RevisionTree, operation: Operation) -> Result<Event> {
        let mut log = self.log.write().await;
        let seq = log.events.last().map(|e| e.seq).unwrap_or(0) + 1;
        let event = Event::new(seq, tree.content(), tree.head_hashes(), operation);
        log.trees.insert(tree.content(), tree.clone());
        log.events.push(event.clone());
        Ok(event)
    }

    async fn read(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        let log = self.log.read().await;
        // seq n lives at index n - 1
        let start = (after as usize).min(log.events.len());
        Ok(log.events[start..].iter().take(limit).cloned().collect())
    }

    async fn last_seq(&self) -> Result<u64> {
        Ok(self.log.read().await.events.last().map(|e| e.seq).unwrap_or(0))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.log.read().await.trees.len() as u64)
    }
}
