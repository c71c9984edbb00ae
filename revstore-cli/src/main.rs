//! revstore: content-addressed store with mergeable metadata history.
//!
//! # Usage
//!
//! ```bash
//! revstore --root /srv/node init
//! revstore --root /srv/node create docs --index
//! revstore --root /srv/node create backup
//! revstore --root /srv/node link docs backup
//! revstore --root /srv/node add docs report.pdf -m title="Q3 report" -m pages=12
//! revstore --root /srv/node sync
//! revstore --root /srv/node find docs report
//! ```

mod node;

use anyhow::Result;
use clap::{Parser, Subcommand};
use node::Node;
use revstore_core::{Hash, Value};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "revstore")]
#[command(author = "RevStore Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Replicated content-addressed store")]
struct Cli {
    /// Node directory
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a node in the root directory
    Init,

    /// Create a repository
    Create {
        name: String,
        /// Maintain a search index for this repository
        #[arg(long)]
        index: bool,
    },

    /// Replicate one repository into another
    Link { source: String, destination: String },

    /// Remove a replication link
    Unlink { source: String, destination: String },

    /// Store a file
    Add {
        repo: String,
        file: PathBuf,
        /// Metadata field, repeatable
        #[arg(short = 'm', long = "meta", value_parser = parse_field)]
        meta: Vec<(String, Value)>,
    },

    /// Change the metadata of stored content
    Update {
        repo: String,
        content: Hash,
        /// Field to set, repeatable
        #[arg(short = 'm', long = "meta", value_parser = parse_field)]
        meta: Vec<(String, Value)>,
        /// Field to remove, repeatable
        #[arg(long)]
        remove: Vec<String>,
    },

    /// Delete stored content
    Delete { repo: String, content: Hash },

    /// Show the revision history of a content
    Show { repo: String, content: Hash },

    /// List repository events
    Log {
        repo: String,
        /// Only events after this sequence number
        #[arg(long, default_value_t = 0)]
        after: u64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Search an indexed repository
    Find { repo: String, query: String },

    /// Run all replication links until drained
    Sync,

    /// Show repositories and links
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_field(raw: &str) -> std::result::Result<(String, Value), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), Value::parse(value))),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let root = cli.root;
    match cli.command {
        Commands::Init => {
            if Node::init(&root)? {
                println!("Initialized node at {}", root.display());
            } else {
                println!("Node already initialized at {}", root.display());
            }
        }

        Commands::Create { name, index } => {
            let mut node = Node::open(&root)?;
            node.create_repository(&name, index)?;
            println!("Created repository {}", name);
        }

        Commands::Link { source, destination } => {
            let mut node = Node::open(&root)?;
            node.link(&source, &destination)?;
            println!("Linked {} -> {}", source, destination);
        }

        Commands::Unlink { source, destination } => {
            let mut node = Node::open(&root)?;
            node.unlink(&source, &destination)?;
            println!("Unlinked {} -> {}", source, destination);
        }

        Commands::Add { repo, file, meta } => {
            let node = Node::open(&root)?;
            let revision = node.add(&repo, &file, meta).await?;
            println!("Content:  {}", revision.content());
            println!("Revision: {}", revision.hash());
            println!("Length:   {}", revision.length());
        }

        Commands::Update {
            repo,
            content,
            meta,
            remove,
        } => {
            let node = Node::open(&root)?;
            let revision = node.update(&repo, content, meta, &remove).await?;
            println!("Revision: {}", revision.hash());
        }

        Commands::Delete { repo, content } => {
            let node = Node::open(&root)?;
            let revision = node.delete(&repo, content).await?;
            println!("Deleted {} at revision {}", content, revision.hash());
        }

        Commands::Show { repo, content } => {
            let node = Node::open(&root)?;
            let tree = node.show(&repo, content).await?;
            let heads = tree.head_hashes();
            println!("Content: {} ({} revisions)", content, tree.len());
            for revision in tree.list() {
                let marker = if heads.contains(&revision.hash()) { "*" } else { " " };
                let parents: Vec<String> = revision.parents().iter().map(Hash::short).collect();
                println!(
                    "{} {} parents=[{}]{}",
                    marker,
                    revision.hash().short(),
                    parents.join(","),
                    if revision.is_deleted() { " deleted" } else { "" }
                );
                for (key, value) in revision.metadata() {
                    println!("      {} = {}", key, value);
                }
            }
        }

        Commands::Log { repo, after, limit } => {
            let node = Node::open(&root)?;
            for event in node.repository(&repo)?.history(after, limit).await? {
                println!(
                    "{}  {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                    event
                );
            }
        }

        Commands::Find { repo, query } => {
            let node = Node::open(&root)?;
            let hits = node.find(&repo, &query).await?;
            if hits.is_empty() {
                println!("No matches.");
            }
            for hit in hits {
                println!("{}", hit);
            }
        }

        Commands::Sync => {
            let node = Node::open(&root)?;
            let status = node.sync().await?;
            if status.is_empty() {
                println!("No links configured.");
            }
            for agent in status {
                println!("{}: {} events applied (cursor #{})", agent.name, agent.processed, agent.cursor);
            }
        }

        Commands::Status { json } => {
            let node = Node::open(&root)?;
            let infos = node.info().await?;
            if json {
                let report = serde_json::json!({
                    "repositories": infos,
                    "links": node.config().links,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for info in &infos {
                    let indexed = node
                        .config()
                        .repository(&info.name)
                        .is_some_and(|r| r.index);
                    println!(
                        "{:<16} {:>6} contents  #{:<6} {}{}",
                        info.name,
                        info.contents,
                        info.last_seq,
                        info.uuid,
                        if indexed { "  [indexed]" } else { "" }
                    );
                }
                for link in &node.config().links {
                    println!("{} -> {}", link.source, link.destination);
                }
            }
        }
    }

    Ok(())
}
