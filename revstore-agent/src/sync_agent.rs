//! Replication of one repository into another

use async_trait::async_trait;
use revstore_core::{Event, Repository, Result};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::agent::{AgentTask, Outcome};
use crate::manager::{AgentManager, Inner};

/// Copies bytes and revisions of every changed content from `source` to
/// `destination`, then wakes the destination's own agents.
pub struct SyncTask {
    source: Arc<Repository>,
    destination: Arc<Repository>,
    manager: Weak<Inner>,
}

impl SyncTask {
    pub(crate) fn new(source: Arc<Repository>, destination: Arc<Repository>, manager: Weak<Inner>) -> Self {
        Self {
            source,
            destination,
            manager,
        }
    }

    /// True when the destination recorded a new head
    async fn apply(&self, event: &Event) -> Result<bool> {
        let tree = self.source.revisions(event.content).await?;
        let recorded = self
            .destination
            .integrate_from(&tree, Some(self.source.as_ref()))
            .await?;
        if recorded.is_none() {
            debug!(
                "{} unchanged on {} -> {}",
                event.content.short(),
                self.source.name(),
                self.destination.name()
            );
        }
        Ok(recorded.is_some())
    }
}

#[async_trait]
impl AgentTask for SyncTask {
    async fn history(&self, after: u64, limit: usize) -> Result<Vec<Event>> {
        self.source.history(after, limit).await
    }

    async fn process(&self, event: &Event) -> Outcome {
        match self.apply(event).await {
            Ok(changed) => {
                if changed {
                    if let Some(manager) = AgentManager::upgrade(&self.manager) {
                        manager.signal(self.destination.name());
                    }
                }
                Outcome::Applied
            }
            Err(e) => e.into(),
        }
    }
}
