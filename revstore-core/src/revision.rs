//! Revision history model
//!
//! A `Revision` is one immutable version of a content's metadata, identified
//! by the digest of its own fields. A `RevisionTree` is the DAG of every known
//! revision for one content hash, keyed by revision hash. Parent links are
//! hashes, never live references, so a tree can hold revisions whose parents
//! it has not seen yet.

use crate::object::{Hash, Metadata};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Errors raised while assembling a revision tree
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("Revision {revision} belongs to content {found}, not {expected}")]
    ContentMismatch {
        expected: Hash,
        found: Hash,
        revision: Hash,
    },

    #[error("Revision {0} does not match its own digest")]
    Corrupt(Hash),
}

/// One immutable version of a content's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    content: Hash,
    length: u64,
    parents: BTreeSet<Hash>,
    metadata: Metadata,
    deleted: bool,
    revision: Hash,
}

impl Revision {
    /// Create a revision; its hash is derived from every other field
    pub fn new(
        content: Hash,
        length: u64,
        parents: impl IntoIterator<Item = Hash>,
        metadata: Metadata,
        deleted: bool,
    ) -> Self {
        let parents: BTreeSet<Hash> = parents.into_iter().collect();
        let revision = Self::compute_hash(&content, length, &parents, &metadata, deleted);
        Self {
            content,
            length,
            parents,
            metadata,
            deleted,
            revision,
        }
    }

    fn compute_hash(
        content: &Hash,
        length: u64,
        parents: &BTreeSet<Hash>,
        metadata: &Metadata,
        deleted: bool,
    ) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hasher.update(length.to_le_bytes());
        hasher.update((parents.len() as u64).to_le_bytes());
        for parent in parents {
            hasher.update(parent.as_bytes());
        }
        hasher.update((metadata.len() as u64).to_le_bytes());
        for (key, value) in metadata {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            value.digest_into(&mut hasher);
        }
        hasher.update([deleted as u8]);
        Hash::from_hasher(hasher)
    }

    /// Revision hash
    pub fn hash(&self) -> Hash {
        self.revision
    }

    /// Hash of the content this revision describes
    pub fn content(&self) -> Hash {
        self.content
    }

    /// Content length in bytes
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn parents(&self) -> &BTreeSet<Hash> {
        &self.parents
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Check that the stored hash still matches the fields
    pub fn verify(&self) -> bool {
        Self::compute_hash(
            &self.content,
            self.length,
            &self.parents,
            &self.metadata,
            self.deleted,
        ) == self.revision
    }
}

/// DAG of all known revisions for one content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "TreeRecord", try_from = "TreeRecord")]
pub struct RevisionTree {
    content: Hash,
    nodes: BTreeMap<Hash, Arc<Revision>>,
}

/// Flat serialized form of a tree
#[derive(Serialize, Deserialize)]
struct TreeRecord {
    content: Hash,
    revisions: Vec<Revision>,
}

impl From<RevisionTree> for TreeRecord {
    fn from(tree: RevisionTree) -> Self {
        Self {
            content: tree.content,
            revisions: tree.nodes.values().map(|r| Revision::clone(r)).collect(),
        }
    }
}

impl TryFrom<TreeRecord> for RevisionTree {
    type Error = TreeError;

    fn try_from(record: TreeRecord) -> Result<Self, Self::Error> {
        let mut builder = RevisionTree::builder(record.content);
        for revision in record.revisions {
            if !revision.verify() {
                return Err(TreeError::Corrupt(revision.hash()));
            }
            builder.add(revision)?;
        }
        Ok(builder.build())
    }
}

impl RevisionTree {
    /// Start an empty builder for `content`
    pub fn builder(content: Hash) -> RevisionTreeBuilder {
        RevisionTreeBuilder {
            content,
            nodes: BTreeMap::new(),
        }
    }

    /// Build a tree from a set of revisions
    pub fn of(
        content: Hash,
        revisions: impl IntoIterator<Item = Revision>,
    ) -> Result<Self, TreeError> {
        let mut builder = Self::builder(content);
        for revision in revisions {
            builder.add(revision)?;
        }
        Ok(builder.build())
    }

    pub(crate) fn from_nodes(content: Hash, nodes: BTreeMap<Hash, Arc<Revision>>) -> Self {
        Self { content, nodes }
    }

    pub(crate) fn nodes(&self) -> &BTreeMap<Hash, Arc<Revision>> {
        &self.nodes
    }

    /// Content this tree is for
    pub fn content(&self) -> Hash {
        self.content
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, revision: &Hash) -> Option<&Revision> {
        self.nodes.get(revision).map(|r| r.as_ref())
    }

    pub fn contains(&self, revision: &Hash) -> bool {
        self.nodes.contains_key(revision)
    }

    /// Iterate revisions in ascending hash order
    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.nodes.values().map(|r| r.as_ref())
    }

    /// Revisions that are nobody's parent, in ascending hash order
    pub fn head(&self) -> Vec<&Revision> {
        let referenced: BTreeSet<&Hash> = self.nodes.values().flat_map(|r| r.parents.iter()).collect();
        self.nodes
            .iter()
            .filter(|(hash, _)| !referenced.contains(hash))
            .map(|(_, r)| r.as_ref())
            .collect()
    }

    /// Hashes of the head revisions
    pub fn head_hashes(&self) -> BTreeSet<Hash> {
        self.head().into_iter().map(Revision::hash).collect()
    }

    /// The head revision when history is linear at the top
    pub fn latest(&self) -> Option<&Revision> {
        let head = self.head();
        if head.len() == 1 { head.into_iter().next() } else { None }
    }

    /// Revisions with no parent present in this tree, in ascending hash order
    pub fn tail(&self) -> Vec<&Revision> {
        self.nodes
            .values()
            .filter(|r| !r.parents.iter().any(|p| self.nodes.contains_key(p)))
            .map(|r| r.as_ref())
            .collect()
    }

    /// Parent hashes referenced by some revision but absent from the tree
    pub fn unknown_parents(&self) -> BTreeSet<Hash> {
        self.nodes
            .values()
            .flat_map(|r| r.parents.iter())
            .filter(|p| !self.nodes.contains_key(p))
            .copied()
            .collect()
    }

    /// Topological order: every revision follows its present parents.
    /// Ties are broken by ascending revision hash.
    pub fn list(&self) -> Vec<&Revision> {
        let mut waiting: BTreeMap<Hash, usize> = BTreeMap::new();
        let mut children: BTreeMap<Hash, Vec<Hash>> = BTreeMap::new();
        let mut ready: BTreeSet<Hash> = BTreeSet::new();

        for (hash, revision) in &self.nodes {
            let present: Vec<&Hash> = revision
                .parents
                .iter()
                .filter(|p| self.nodes.contains_key(p))
                .collect();
            if present.is_empty() {
                ready.insert(*hash);
            } else {
                waiting.insert(*hash, present.len());
                for parent in present {
                    children.entry(*parent).or_default().push(*hash);
                }
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(hash) = ready.pop_first() {
            order.push(self.nodes[&hash].as_ref());
            for child in children.get(&hash).into_iter().flatten() {
                if let Some(count) = waiting.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        waiting.remove(child);
                        ready.insert(*child);
                    }
                }
            }
        }
        order
    }

    /// Every present ancestor of `revision`, excluding itself
    pub fn ancestors(&self, revision: &Hash) -> BTreeSet<Hash> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![*revision];
        while let Some(hash) = stack.pop() {
            if let Some(node) = self.nodes.get(&hash) {
                for parent in &node.parents {
                    if self.nodes.contains_key(parent) && seen.insert(*parent) {
                        stack.push(*parent);
                    }
                }
            }
        }
        seen
    }
}

/// Append-only assembly of a `RevisionTree`
#[derive(Debug, Clone)]
pub struct RevisionTreeBuilder {
    content: Hash,
    nodes: BTreeMap<Hash, Arc<Revision>>,
}

impl RevisionTreeBuilder {
    /// Add one revision; adding a revision twice is a no-op
    pub fn add(&mut self, revision: Revision) -> Result<&mut Self, TreeError> {
        self.add_shared(Arc::new(revision))
    }

    fn add_shared(&mut self, revision: Arc<Revision>) -> Result<&mut Self, TreeError> {
        if revision.content != self.content {
            return Err(TreeError::ContentMismatch {
                expected: self.content,
                found: revision.content,
                revision: revision.revision,
            });
        }
        self.nodes.entry(revision.revision).or_insert(revision);
        Ok(self)
    }

    /// Add every revision of another tree, sharing the nodes
    pub fn add_tree(&mut self, tree: &RevisionTree) -> Result<&mut Self, TreeError> {
        for revision in tree.nodes.values() {
            self.add_shared(Arc::clone(revision))?;
        }
        Ok(self)
    }

    pub fn build(self) -> RevisionTree {
        RevisionTree {
            content: self.content,
            nodes: self.nodes,
        }
    }
}
