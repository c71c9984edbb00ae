//! Node configuration stored at `<root>/revstore.json`.
//!
//! Lists the repositories a node hosts, which of them are indexed, the
//! replication links between them and the agent tuning knobs.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "revstore.json";

/// Repository names double as directory names under `<root>/repos`
pub fn check_repository_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(anyhow!("Invalid repository name {:?}", name));
    }
    Ok(())
}

/// One hosted repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    /// Whether an indexing agent follows this repository
    #[serde(default)]
    pub index: bool,
}

/// One-way replication from `source` to `destination`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub source: String,
    pub destination: String,
}

/// Agent tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Events fetched per history page
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl NodeConfig {
    /// Load the config of a node root, or the default when none exists yet
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read node config from {:?}", path))?;
        let config: NodeConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse node config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Save atomically (temp file then rename)
    pub fn save(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        let path = Self::config_path(root);
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Every link must join two distinct, configured repositories
    pub fn validate(&self) -> Result<()> {
        for (i, repo) in self.repositories.iter().enumerate() {
            check_repository_name(&repo.name)?;
            if self.repositories[..i].iter().any(|r| r.name == repo.name) {
                return Err(anyhow!("Repository {} is listed twice", repo.name));
            }
        }
        for link in &self.links {
            for name in [&link.source, &link.destination] {
                if self.repository(name).is_none() {
                    return Err(anyhow!("Link {} -> {} names unknown repository {}", link.source, link.destination, name));
                }
            }
            if link.source == link.destination {
                return Err(anyhow!("Repository {} cannot replicate to itself", link.source));
            }
        }
        if self.agent.batch_size == 0 {
            return Err(anyhow!("agent.batch_size must be positive"));
        }
        Ok(())
    }

    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.name == name)
    }

    /// Add a repository; returns false when it already exists
    pub fn add_repository(&mut self, name: &str, index: bool) -> bool {
        if self.repository(name).is_some() {
            return false;
        }
        self.repositories.push(RepositoryConfig {
            name: name.to_string(),
            index,
        });
        true
    }

    /// Add a link; returns false when it already exists
    pub fn add_link(&mut self, source: &str, destination: &str) -> bool {
        if self.has_link(source, destination) {
            return false;
        }
        self.links.push(LinkConfig {
            source: source.to_string(),
            destination: destination.to_string(),
        });
        true
    }

    /// Remove a link; returns false when there was none
    pub fn remove_link(&mut self, source: &str, destination: &str) -> bool {
        let before = self.links.len();
        self.links.retain(|l| !(l.source == source && l.destination == destination));
        self.links.len() != before
    }

    pub fn has_link(&self, source: &str, destination: &str) -> bool {
        self.links.iter().any(|l| l.source == source && l.destination == destination)
    }

    /// Directory holding one repository's data
    pub fn repository_path(root: &Path, name: &str) -> PathBuf {
        root.join("repos").join(name)
    }

    fn config_path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }
}
