//! RevStore agent engine
//!
//! Background workers that drain repository event logs to keep replicas and
//! search indexes eventually consistent:
//! - `Agent`: signal-coalescing single worker over an `AgentTask`
//! - `SyncTask`: replicates content and revisions between repositories
//! - `IndexTask`: maintains a `SearchIndex`
//! - `AgentManager`: registry and signal fan-out

pub mod agent;
pub mod manager;
pub mod sync_agent;
pub mod index_agent;

pub use agent::{Agent, AgentOptions, AgentState, AgentStatus, AgentTask, Outcome};
pub use manager::{AgentDescriptor, AgentKind, AgentManager};
pub use sync_agent::SyncTask;
pub use index_agent::IndexTask;
