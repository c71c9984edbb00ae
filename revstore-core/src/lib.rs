//! RevStore Core Library
//!
//! Core functionality for RevStore including:
//! - Content hashes and typed metadata values
//! - Revision DAG per content, with automatic multi-way merge
//! - Per-repository event log
//! - Content and metadata stores (in-memory, filesystem, SQLite in WAL mode)
//! - Repository write path and name registry
//! - Search index collaborator
//! - Node configuration

pub mod object;
pub mod revision;
pub mod merge;
pub mod event;
pub mod storage;
pub mod fs_store;
pub mod sqlite_store;
pub mod repository;
pub mod index;
pub mod config;

pub use object::{Hash, Metadata, Value};
pub use revision::{Revision, RevisionTree, RevisionTreeBuilder, TreeError};
pub use event::{Event, Operation};
pub use storage::{
    ContentReader, ContentStore, MemoryContentStore, MemoryMetadataStore, MetadataStore, Result,
    StoreError,
};
pub use fs_store::FsContentStore;
pub use sqlite_store::SqliteMetadataStore;
pub use repository::{Catalog, Repository, RepositoryInfo};
pub use index::{MemoryIndex, SearchIndex};
pub use config::{AgentConfig, LinkConfig, NodeConfig, RepositoryConfig};
