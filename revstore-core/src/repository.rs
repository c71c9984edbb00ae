//! Repository write path
//!
//! A repository pairs a content store with a metadata store. Every write
//! produces a new revision, folds it into the content's revision tree and
//! records one event, all under a single write lock so heads and sequence
//! numbers advance together.

use crate::event::{Event, Operation};
use crate::fs_store::FsContentStore;
use crate::object::{Hash, Metadata};
use crate::revision::{Revision, RevisionTree};
use crate::sqlite_store::SqliteMetadataStore;
use crate::storage::{
    ContentReader, ContentStore, MemoryContentStore, MemoryMetadataStore, MetadataStore, Result,
    StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Summary of a repository's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub uuid: String,
    pub last_seq: u64,
    pub contents: u64,
    pub closed: bool,
}

pub struct Repository {
    name: String,
    uuid: String,
    content: Arc<dyn ContentStore>,
    metadata: Arc<dyn MetadataStore>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

fn live(tree: &RevisionTree) -> Option<&Revision> {
    tree.latest().filter(|r| !r.is_deleted())
}

impl Repository {
    /// Assemble a repository from its two stores
    pub fn new(
        name: impl Into<String>,
        uuid: impl Into<String>,
        content: Arc<dyn ContentStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
            content,
            metadata,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Repository kept entirely in memory
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(
            name,
            uuid::Uuid::new_v4().to_string(),
            Arc::new(MemoryContentStore::new()),
            Arc::new(MemoryMetadataStore::new()),
        )
    }

    /// Open or create an on-disk repository at `path`
    pub fn open(name: impl Into<String>, path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let uuid_path = path.join("uuid");
        let uuid = if uuid_path.exists() {
            std::fs::read_to_string(&uuid_path)?.trim().to_string()
        } else {
            let u = uuid::Uuid::new_v4().to_string();
            std::fs::write(&uuid_path, &u)?;
            u
        };

        let content = FsContentStore::open(path)?;
        let metadata = SqliteMetadataStore::open(&path.join("metadata.sqlite"))?;
        Ok(Self::new(name, uuid, Arc::new(content), Arc::new(metadata)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Refuse all further calls with `Closed`
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        info!("Repository {} closed", self.name);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StoreError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    async fn current(&self, content: Hash) -> Result<RevisionTree> {
        self.metadata
            .tree(content)
            .await?
            .ok_or(StoreError::UnknownContent(content))
    }

    fn check_head(tree: &RevisionTree, expected: &BTreeSet<Hash>) -> Result<()> {
        let actual = tree.head_hashes();
        if &actual != expected {
            return Err(StoreError::Conflict {
                content: tree.content(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    // ==================== Write path ====================

    /// Store new content with its first metadata.
    ///
    /// Content that was deleted before is re-created on top of its history.
    pub async fn add(&self, reader: ContentReader, metadata: Metadata) -> Result<Revision> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;

        let (hash, length) = self.content.put(reader, None).await?;
        let previous = self.metadata.tree(hash).await?;
        if previous.as_ref().and_then(live).is_some() {
            return Err(StoreError::AlreadyExists(hash));
        }

        let parents = previous.as_ref().map(RevisionTree::head_hashes).unwrap_or_default();
        let revision = Revision::new(hash, length, parents, metadata, false);
        let mut builder = RevisionTree::builder(hash);
        if let Some(previous) = &previous {
            builder.add_tree(previous)?;
        }
        builder.add(revision.clone())?;

        let event = self.metadata.commit(&builder.build(), Operation::Create).await?;
        info!("[{}] {}", self.name, event);
        Ok(revision)
    }

    /// Replace the metadata of live content; `expected` must be the current head
    pub async fn update(
        &self,
        content: Hash,
        expected: &BTreeSet<Hash>,
        metadata: Metadata,
    ) -> Result<Revision> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;

        let tree = self.current(content).await?;
        Self::check_head(&tree, expected)?;
        let head = live(&tree).ok_or(StoreError::UnknownContent(content))?;

        let revision = Revision::new(content, head.length(), expected.iter().copied(), metadata, false);
        let mut builder = RevisionTree::builder(content);
        builder.add_tree(&tree)?.add(revision.clone())?;

        let event = self.metadata.commit(&builder.build(), Operation::Update).await?;
        info!("[{}] {}", self.name, event);
        Ok(revision)
    }

    /// Mark content deleted and drop its bytes; metadata is carried over
    pub async fn delete(&self, content: Hash, expected: &BTreeSet<Hash>) -> Result<Revision> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;

        let tree = self.current(content).await?;
        Self::check_head(&tree, expected)?;
        let head = live(&tree).ok_or(StoreError::UnknownContent(content))?;

        let revision = Revision::new(
            content,
            head.length(),
            expected.iter().copied(),
            head.metadata().clone(),
            true,
        );
        let mut builder = RevisionTree::builder(content);
        builder.add_tree(&tree)?.add(revision.clone())?;

        let event = self.metadata.commit(&builder.build(), Operation::Delete).await?;
        self.discard_bytes(content).await?;
        info!("[{}] {}", self.name, event);
        Ok(revision)
    }

    /// Fold revisions received from elsewhere into the local tree.
    ///
    /// Diverged heads are merged. An event is recorded only when the head
    /// changes; `None` means the revisions were already known. A live head
    /// needs its bytes to be present already.
    pub async fn integrate(&self, incoming: &RevisionTree) -> Result<Option<Event>> {
        self.integrate_from(incoming, None).await
    }

    /// Like [`Repository::integrate`], fetching missing bytes from `source`
    /// when the merged head is live.
    ///
    /// Bytes are fetched under the write lock, so they are only ever kept
    /// for a live head. Whenever the merged head is deleted, local bytes are
    /// dropped, including when the head did not change.
    pub async fn integrate_from(
        &self,
        incoming: &RevisionTree,
        source: Option<&Repository>,
    ) -> Result<Option<Event>> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;

        let content = incoming.content();
        let previous = self.metadata.tree(content).await?;
        let mut builder = RevisionTree::builder(content);
        if let Some(previous) = &previous {
            builder.add_tree(previous)?;
        }
        builder.add_tree(incoming)?;
        let merged = builder.build().merge();
        let deleted = merged.latest().is_some_and(Revision::is_deleted);

        let old_head = previous.as_ref().map(RevisionTree::head_hashes).unwrap_or_default();
        if merged.head_hashes() == old_head {
            if deleted {
                self.discard_bytes(content).await?;
            }
            debug!("[{}] {} already up to date", self.name, content.short());
            return Ok(None);
        }

        merged.latest().ok_or(StoreError::UnknownContent(content))?;
        let operation = if deleted {
            Operation::Delete
        } else if previous.as_ref().and_then(live).is_some() {
            Operation::Update
        } else {
            Operation::Create
        };

        if !deleted && !self.content.contains(content).await? {
            let source = source.ok_or(StoreError::UnknownContent(content))?;
            let reader = source.open_content(content).await?;
            let (_, length) = self.content.put(reader, Some(content)).await?;
            debug!(
                "[{}] fetched {} ({} bytes) from {}",
                self.name,
                content.short(),
                length,
                source.name()
            );
        }

        let event = self.metadata.commit(&merged, operation).await?;
        if deleted {
            self.discard_bytes(content).await?;
        }
        info!("[{}] integrated {}", self.name, event);
        Ok(Some(event))
    }

    async fn discard_bytes(&self, content: Hash) -> Result<()> {
        match self.content.delete(content).await {
            Ok(()) | Err(StoreError::UnknownContent(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Store bytes received from elsewhere, verifying their digest
    pub async fn put_content(&self, reader: ContentReader, expected: Hash) -> Result<u64> {
        self.ensure_open()?;
        let (_, length) = self.content.put(reader, Some(expected)).await?;
        Ok(length)
    }

    // ==================== Read path ====================

    /// Stream content bytes
    pub async fn open_content(&self, content: Hash) -> Result<ContentReader> {
        self.ensure_open()?;
        self.content.open(content).await
    }

    pub async fn has_content(&self, content: Hash) -> Result<bool> {
        self.ensure_open()?;
        self.content.contains(content).await
    }

    /// Full revision tree of a content
    pub async fn revisions(&self, content: Hash) -> Result<RevisionTree> {
        self.ensure_open()?;
        self.current(content).await
    }

    /// One revision by hash
    pub async fn revision(&self, content: Hash, revision: Hash) -> Result<Revision> {
        let tree = self.revisions(content).await?;
        tree.get(&revision).cloned().ok_or(StoreError::UnknownRevision(revision))
    }

    /// Events with `seq > after`, oldest first
    pub async fn history(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        self.ensure_open()?;
        self.metadata.read(after, limit).await
    }

    pub async fn info(&self) -> Result<RepositoryInfo> {
        Ok(RepositoryInfo {
            name: self.name.clone(),
            uuid: self.uuid.clone(),
            last_seq: self.metadata.last_seq().await?,
            contents: self.metadata.count().await?,
            closed: self.is_closed(),
        })
    }
}

/// Name to repository registry
#[derive(Default)]
pub struct Catalog {
    repositories: RwLock<BTreeMap<String, Arc<Repository>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository under its own name, replacing any previous one
    pub fn insert(&self, repository: Arc<Repository>) {
        let mut repositories = self.repositories.write().unwrap_or_else(|e| e.into_inner());
        repositories.insert(repository.name().to_string(), repository);
    }

    pub fn get(&self, name: &str) -> Result<Arc<Repository>> {
        let repositories = self.repositories.read().unwrap_or_else(|e| e.into_inner());
        repositories
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownRepository(name.to_string()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Repository>> {
        let mut repositories = self.repositories.write().unwrap_or_else(|e| e.into_inner());
        repositories.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let repositories = self.repositories.read().unwrap_or_else(|e| e.into_inner());
        repositories.keys().cloned().collect()
    }
}
