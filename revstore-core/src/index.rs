//! Search index collaborator
//!
//! `SearchIndex` is what the indexing agent feeds. `MemoryIndex` is a small
//! inverted index over text metadata and content words, rebuilt from the
//! event log whenever a node starts.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use crate::object::{Hash, Metadata, Value};
use crate::storage::{ContentReader, Result, CHUNK_SIZE};

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index (or re-index) a content at the given revision
    async fn add(
        &self,
        content: Hash,
        revision: Hash,
        metadata: &Metadata,
        reader: ContentReader,
    ) -> Result<()>;

    /// Remove a content; removing an unknown content is not an error
    async fn delete(&self, content: Hash) -> Result<()>;

    /// Contents matching every term of the query, in ascending hash order
    async fn find(&self, query: &str) -> Result<Vec<Hash>>;

    /// Revision currently indexed for a content
    async fn indexed(&self, content: Hash) -> Result<Option<Hash>>;
}

struct Document {
    revision: Hash,
    metadata: Metadata,
    words: BTreeSet<String>,
}

#[derive(Default)]
struct IndexState {
    documents: HashMap<Hash, Document>,
    postings: BTreeMap<String, BTreeSet<Hash>>,
}

impl IndexState {
    fn remove(&mut self, content: &Hash) -> bool {
        let Some(document) = self.documents.remove(content) else {
            return false;
        };
        for word in &document.words {
            if let Some(hits) = self.postings.get_mut(word) {
                hits.remove(content);
                if hits.is_empty() {
                    self.postings.remove(word);
                }
            }
        }
        true
    }
}

#[derive(Default)]
pub struct MemoryIndex {
    state: RwLock<IndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Splits a byte stream into lower-case words. Bytes of multi-byte UTF-8
/// sequences count as word characters so chunk boundaries never split them.
#[derive(Default)]
struct Tokenizer {
    partial: Vec<u8>,
    words: BTreeSet<String>,
}

impl Tokenizer {
    fn feed(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if b.is_ascii_alphanumeric() || b >= 0x80 {
                self.partial.push(b.to_ascii_lowercase());
            } else {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        if !self.partial.is_empty() {
            let word = String::from_utf8_lossy(&self.partial).to_lowercase();
            self.words.insert(word);
            self.partial.clear();
        }
    }

    fn finish(mut self) -> BTreeSet<String> {
        self.flush();
        self.words
    }
}

fn field_matches(metadata: &Metadata, key: &str, raw: &str) -> bool {
    match metadata.get(key) {
        Some(Value::Text(text)) => text.eq_ignore_ascii_case(raw),
        Some(value) => *value == Value::parse(raw),
        None => false,
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn add(
        &self,
        content: Hash,
        revision: Hash,
        metadata: &Metadata,
        mut reader: ContentReader,
    ) -> Result<()> {
        let mut tokenizer = Tokenizer::default();
        for value in metadata.values() {
            if let Some(text) = value.as_text() {
                tokenizer.feed(text.as_bytes());
                tokenizer.flush();
            }
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tokenizer.feed(&buf[..n]);
        }
        let words = tokenizer.finish();

        let mut state = self.state.write().await;
        state.remove(&content);
        for word in &words {
            state.postings.entry(word.clone()).or_default().insert(content);
        }
        state.documents.insert(
            content,
            Document {
                revision,
                metadata: metadata.clone(),
                words,
            },
        );
        Ok(())
    }

    async fn delete(&self, content: Hash) -> Result<()> {
        self.state.write().await.remove(&content);
        Ok(())
    }

    async fn find(&self, query: &str) -> Result<Vec<Hash>> {
        let state = self.state.read().await;
        let mut result: Option<BTreeSet<Hash>> = None;

        for term in query.split_whitespace() {
            let hits: BTreeSet<Hash> = match term.split_once(':') {
                Some((key, raw)) => state
                    .documents
                    .iter()
                    .filter(|(_, doc)| field_matches(&doc.metadata, key, raw))
                    .map(|(hash, _)| *hash)
                    .collect(),
                None => state
                    .postings
                    .get(&term.to_lowercase())
                    .cloned()
                    .unwrap_or_default(),
            };
            result = Some(match result {
                Some(acc) => acc.intersection(&hits).copied().collect(),
                None => hits,
            });
        }

        Ok(result.unwrap_or_default().into_iter().collect())
    }

    async fn indexed(&self, content: Hash) -> Result<Option<Hash>> {
        Ok(self.state.read().await.documents.get(&content).map(|d| d.revision))
    }
}
