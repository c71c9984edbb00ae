//! Repository event log records

use crate::object::Hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of head-changing write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a repository's event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Sequence number, strictly increasing per repository, starting at 1
    pub seq: u64,
    /// Content whose head changed
    pub content: Hash,
    /// Head revisions after the write
    pub revisions: BTreeSet<Hash>,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(seq: u64, content: Hash, revisions: BTreeSet<Hash>, operation: Operation) -> Self {
        Self {
            seq,
            content,
            revisions,
            operation,
            timestamp: Utc::now(),
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} {} [{}]",
            self.seq,
            self.operation,
            self.content.short(),
            self.revisions.iter().map(Hash::short).collect::<Vec<_>>().join(",")
        )
    }
}
