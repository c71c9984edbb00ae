//! Search index maintenance

use async_trait::async_trait;
use revstore_core::storage::CHUNK_SIZE;
use revstore_core::{Event, Repository, Result, SearchIndex, StoreError};
use std::sync::Arc;
use tracing::debug;

use crate::agent::{AgentTask, Outcome};

/// Keeps a search index in step with a repository's current heads
pub struct IndexTask {
    repository: Arc<Repository>,
    index: Arc<dyn SearchIndex>,
}

impl IndexTask {
    pub(crate) fn new(repository: Arc<Repository>, index: Arc<dyn SearchIndex>) -> Self {
        Self { repository, index }
    }

    async fn apply(&self, event: &Event) -> Result<()> {
        let content = event.content;
        let tree = self.repository.revisions(content).await?;
        let Some(head) = tree.latest().filter(|head| !head.is_deleted()) else {
            return self.index.delete(content).await;
        };
        if self.index.indexed(content).await? == Some(head.hash()) {
            debug!("{} already indexed at {}", content.short(), head.hash().short());
            return Ok(());
        }

        // Bytes flow through a bounded pipe so the content is never held whole
        let mut reader = self.repository.open_content(content).await?;
        let (mut writer, pipe) = tokio::io::duplex(CHUNK_SIZE);
        let producer = tokio::spawn(async move { tokio::io::copy(&mut reader, &mut writer).await });

        let added = self
            .index
            .add(content, head.hash(), head.metadata(), Box::new(pipe))
            .await;
        let copied = producer
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        added?;
        copied?;
        Ok(())
    }
}

#[async_trait]
impl AgentTask for IndexTask {
    async fn history(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        self.repository.history(after, limit).await
    }

    async fn process(&self, event: &Event) -> Outcome {
        match self.apply(event).await {
            Ok(()) => Outcome::Applied,
            Err(e) => e.into(),
        }
    }
}
