//! A node: a directory holding `revstore.json` and one sub-directory per
//! repository, opened for the duration of one command.

use anyhow::{anyhow, bail, Context, Result};
use revstore_agent::{AgentManager, AgentOptions, AgentState, AgentStatus};
use revstore_core::config::check_repository_name;
use revstore_core::{
    Catalog, Hash, MemoryIndex, Metadata, NodeConfig, Repository, RepositoryInfo, Revision,
    RevisionTree, SearchIndex, Value,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

pub struct Node {
    root: PathBuf,
    config: NodeConfig,
    catalog: Arc<Catalog>,
    manager: AgentManager,
}

impl Node {
    /// Create the node config if missing; returns false when it already existed
    pub fn init(root: &Path) -> Result<bool> {
        if root.join(revstore_core::config::CONFIG_FILE).exists() {
            return Ok(false);
        }
        NodeConfig::default().save(root)?;
        Ok(true)
    }

    /// Open every configured repository
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join(revstore_core::config::CONFIG_FILE).exists() {
            bail!("{} is not a revstore node; run `revstore init` first", root.display());
        }
        let config = NodeConfig::load(root)?;
        let catalog = Arc::new(Catalog::new());
        for repo in &config.repositories {
            let path = NodeConfig::repository_path(root, &repo.name);
            let repository = Repository::open(repo.name.as_str(), &path)
                .with_context(|| format!("Failed to open repository {}", repo.name))?;
            catalog.insert(Arc::new(repository));
        }

        let options = AgentOptions {
            batch_size: config.agent.batch_size,
        };
        let manager = AgentManager::new(catalog.clone(), options, Handle::current());
        Ok(Self {
            root: root.to_path_buf(),
            config,
            catalog,
            manager,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn repository(&self, name: &str) -> Result<Arc<Repository>> {
        Ok(self.catalog.get(name)?)
    }

    pub fn create_repository(&mut self, name: &str, index: bool) -> Result<()> {
        check_repository_name(name)?;
        if !self.config.add_repository(name, index) {
            bail!("Repository {} already exists", name);
        }
        let repository = Repository::open(name, &NodeConfig::repository_path(&self.root, name))?;
        info!("Created repository {} ({})", name, repository.uuid());
        self.catalog.insert(Arc::new(repository));
        self.config.save(&self.root)
    }

    pub fn link(&mut self, source: &str, destination: &str) -> Result<()> {
        self.repository(source)?;
        self.repository(destination)?;
        if source == destination {
            bail!("Repository {} cannot replicate to itself", source);
        }
        if !self.config.add_link(source, destination) {
            bail!("{} is already linked to {}", source, destination);
        }
        self.config.save(&self.root)
    }

    pub fn unlink(&mut self, source: &str, destination: &str) -> Result<()> {
        if !self.config.remove_link(source, destination) {
            bail!("{} is not linked to {}", source, destination);
        }
        self.config.save(&self.root)
    }

    pub async fn add(&self, repo: &str, file: &Path, fields: Vec<(String, Value)>) -> Result<Revision> {
        let repository = self.repository(repo)?;
        let reader = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("Failed to open {}", file.display()))?;
        let metadata: Metadata = fields.into_iter().collect();
        Ok(repository.add(Box::new(reader), metadata).await?)
    }

    /// Set and remove fields on top of the current head's metadata
    pub async fn update(
        &self,
        repo: &str,
        content: Hash,
        fields: Vec<(String, Value)>,
        remove: &[String],
    ) -> Result<Revision> {
        let repository = self.repository(repo)?;
        let tree = repository.revisions(content).await?;
        let head = tree
            .latest()
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| anyhow!("Content {} is deleted", content))?;

        let mut metadata = head.metadata().clone();
        for key in remove {
            metadata.remove(key);
        }
        metadata.extend(fields);
        Ok(repository.update(content, &tree.head_hashes(), metadata).await?)
    }

    pub async fn delete(&self, repo: &str, content: Hash) -> Result<Revision> {
        let repository = self.repository(repo)?;
        let tree = repository.revisions(content).await?;
        Ok(repository.delete(content, &tree.head_hashes()).await?)
    }

    pub async fn show(&self, repo: &str, content: Hash) -> Result<RevisionTree> {
        Ok(self.repository(repo)?.revisions(content).await?)
    }

    /// Build the repository's index from its event log, then query it
    pub async fn find(&self, repo: &str, query: &str) -> Result<Vec<Hash>> {
        let indexed = self
            .config
            .repository(repo)
            .ok_or_else(|| anyhow!("Unknown repository {}", repo))?
            .index;
        if !indexed {
            bail!("Repository {} is not indexed; create it with --index", repo);
        }

        let index = Arc::new(MemoryIndex::new());
        self.manager.index(repo, index.clone())?;
        self.manager.wait_idle().await;
        Ok(index.find(query).await?)
    }

    /// Run every replication link until nothing is left to copy
    pub async fn sync(&self) -> Result<Vec<AgentStatus>> {
        for link in &self.config.links {
            self.manager.sync(&link.source, &link.destination)?;
        }
        for name in self.catalog.names() {
            self.manager.signal(&name);
        }
        self.manager.wait_idle().await;

        let status = self.manager.status();
        let faulted: Vec<&str> = status
            .iter()
            .filter(|s| s.state == AgentState::Faulted)
            .map(|s| s.name.as_str())
            .collect();
        if !faulted.is_empty() {
            bail!("Replication failed: {}", faulted.join(", "));
        }
        Ok(status)
    }

    pub async fn info(&self) -> Result<Vec<RepositoryInfo>> {
        let mut infos = Vec::new();
        for name in self.catalog.names() {
            infos.push(self.repository(&name)?.info().await?);
        }
        Ok(infos)
    }
}
