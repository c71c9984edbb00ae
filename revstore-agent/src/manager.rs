//! Agent registry
//!
//! Owns every replication agent (keyed by source and destination) and every
//! indexing agent (keyed by repository), and fans change signals out along
//! the replication graph.

use futures::future::join_all;
use revstore_core::{Catalog, Result, SearchIndex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tracing::info;

use crate::agent::{Agent, AgentOptions, AgentStatus};
use crate::index_agent::IndexTask;
use crate::sync_agent::SyncTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Sync,
    Index,
}

/// Which agent, between which repositories
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDescriptor {
    pub kind: AgentKind,
    pub source: String,
    /// `None` for indexing agents
    pub destination: Option<String>,
}

#[derive(Default)]
struct Registry {
    sync: BTreeMap<(String, String), Arc<Agent>>,
    index: BTreeMap<String, Arc<Agent>>,
}

impl Registry {
    /// Agents reading from `name`
    fn sourced_from(&self, name: &str) -> Vec<Arc<Agent>> {
        self.sync
            .iter()
            .filter(|((source, _), _)| source == name)
            .map(|(_, agent)| agent.clone())
            .chain(self.index.get(name).cloned())
            .collect()
    }

    /// Agents reading from or writing to `name`
    fn touching(&self, name: &str) -> Vec<Arc<Agent>> {
        self.sync
            .iter()
            .filter(|((source, destination), _)| source == name || destination == name)
            .map(|(_, agent)| agent.clone())
            .chain(self.index.get(name).cloned())
            .collect()
    }

    fn all(&self) -> Vec<Arc<Agent>> {
        self.sync.values().chain(self.index.values()).cloned().collect()
    }
}

pub(crate) struct Inner {
    catalog: Arc<Catalog>,
    options: AgentOptions,
    runtime: Handle,
    registry: Mutex<Registry>,
}

/// Cheap to clone; clones share one registry
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<Inner>,
}

impl AgentManager {
    pub fn new(catalog: Arc<Catalog>, options: AgentOptions, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                options,
                runtime,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replicate `source` into `destination`. Returns false if already linked.
    pub fn sync(&self, source: &str, destination: &str) -> Result<bool> {
        let from = self.inner.catalog.get(source)?;
        let to = self.inner.catalog.get(destination)?;

        let agent = {
            let mut registry = self.registry();
            let key = (source.to_string(), destination.to_string());
            if registry.sync.contains_key(&key) {
                return Ok(false);
            }
            let task = SyncTask::new(from, to, self.downgrade());
            let agent = Agent::new(
                format!("sync {} -> {}", source, destination),
                Arc::new(task),
                self.inner.options.clone(),
                self.inner.runtime.clone(),
            );
            registry.sync.insert(key, agent.clone());
            agent
        };

        info!("Linked {} -> {}", source, destination);
        agent.start();
        Ok(true)
    }

    /// Stop and forget the link; no-op when there is none
    pub fn unsync(&self, source: &str, destination: &str) -> bool {
        let removed = self
            .registry()
            .sync
            .remove(&(source.to_string(), destination.to_string()));
        match removed {
            Some(agent) => {
                agent.stop();
                info!("Unlinked {} -> {}", source, destination);
                true
            }
            None => false,
        }
    }

    /// Keep `index` in step with `name`. Returns false if already indexed.
    pub fn index(&self, name: &str, index: Arc<dyn SearchIndex>) -> Result<bool> {
        let repository = self.inner.catalog.get(name)?;

        let agent = {
            let mut registry = self.registry();
            if registry.index.contains_key(name) {
                return Ok(false);
            }
            let agent = Agent::new(
                format!("index {}", name),
                Arc::new(IndexTask::new(repository, index)),
                self.inner.options.clone(),
                self.inner.runtime.clone(),
            );
            registry.index.insert(name.to_string(), agent.clone());
            agent
        };

        info!("Indexing {}", name);
        agent.start();
        Ok(true)
    }

    pub fn unindex(&self, name: &str) -> bool {
        match self.registry().index.remove(name) {
            Some(agent) => {
                agent.stop();
                true
            }
            None => false,
        }
    }

    /// Start every agent reading from or writing to `name`
    pub fn start(&self, name: &str) {
        let agents = self.registry().touching(name);
        for agent in agents {
            agent.start();
        }
    }

    /// Stop every agent reading from or writing to `name`
    pub fn stop(&self, name: &str) {
        let agents = self.registry().touching(name);
        for agent in agents {
            agent.stop();
        }
    }

    /// Stop and remove every agent reading from or writing to `name`
    pub fn drop(&self, name: &str) {
        let removed = {
            let mut registry = self.registry();
            let removed = registry.touching(name);
            registry
                .sync
                .retain(|(source, destination), _| source != name && destination != name);
            registry.index.remove(name);
            removed
        };
        for agent in &removed {
            agent.stop();
        }
        if !removed.is_empty() {
            info!("Dropped {} agents of {}", removed.len(), name);
        }
    }

    /// Wake every agent reading from `name`
    pub fn signal(&self, name: &str) {
        let agents = self.registry().sourced_from(name);
        for agent in agents {
            agent.signal();
        }
    }

    pub fn agents(&self) -> Vec<AgentDescriptor> {
        let registry = self.registry();
        let sync = registry.sync.keys().map(|(source, destination)| AgentDescriptor {
            kind: AgentKind::Sync,
            source: source.clone(),
            destination: Some(destination.clone()),
        });
        let index = registry.index.keys().map(|name| AgentDescriptor {
            kind: AgentKind::Index,
            source: name.clone(),
            destination: None,
        });
        sync.chain(index).collect()
    }

    pub fn status(&self) -> Vec<AgentStatus> {
        self.registry().all().iter().map(|agent| agent.status()).collect()
    }

    /// Resolves once every agent is idle at the same time.
    ///
    /// Two consecutive passes must agree that all agents are idle and that no
    /// worker was spawned in between.
    pub async fn wait_idle(&self) {
        loop {
            let agents = self.registry().all();
            join_all(agents.iter().map(|agent| agent.wait_idle())).await;

            let first: Vec<(bool, u64)> = agents.iter().map(|a| a.activity()).collect();
            let second: Vec<(bool, u64)> = agents.iter().map(|a| a.activity()).collect();
            let settled = first.iter().all(|(idle, _)| *idle) && first == second;
            if settled && self.registry().all().len() == agents.len() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}
