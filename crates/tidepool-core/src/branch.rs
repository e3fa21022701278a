//! Branch addressing and update fragment types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The record that owns an inst.
///
/// Ephemeral insts have no owning record and are never written to the
/// durable tier; they live entirely in the temporary store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordScope {
    Persisted(String),
    Ephemeral,
}

impl RecordScope {
    pub fn persisted(record: impl Into<String>) -> Self {
        RecordScope::Persisted(record.into())
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, RecordScope::Ephemeral)
    }

    /// Record name, if this scope is persisted.
    pub fn record_name(&self) -> Option<&str> {
        match self {
            RecordScope::Persisted(name) => Some(name),
            RecordScope::Ephemeral => None,
        }
    }

    fn segment(&self) -> &str {
        self.record_name().unwrap_or("")
    }
}

/// Fully-qualified address of a branch: (record scope, inst, branch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchKey {
    pub scope: RecordScope,
    pub inst: String,
    pub branch: String,
}

impl BranchKey {
    pub fn new(
        scope: RecordScope,
        inst: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            inst: inst.into(),
            branch: branch.into(),
        }
    }

    /// Namespace used by the protocol server to address this branch's
    /// update stream.
    pub fn namespace(&self) -> String {
        format!(
            "/branch/{}/{}/{}",
            self.scope.segment(),
            self.inst,
            self.branch
        )
    }

    /// Namespace for the presence (join/leave) channel of this branch.
    pub fn watch_devices_namespace(&self) -> String {
        format!(
            "/watched_branch/{}/{}/{}",
            self.scope.segment(),
            self.inst,
            self.branch
        )
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace())
    }
}

/// Metadata for an inst (a named collaborative workspace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstInfo {
    pub scope: RecordScope,
    pub inst: String,
    /// Resource markers (access-control tags) attached to the inst.
    pub markers: Vec<String>,
}

/// Metadata for a branch within an inst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub key: BranchKey,
    /// Temporary branches are never promoted to durable storage and are
    /// garbage-collected when their last watcher disconnects.
    pub temporary: bool,
    pub linked_inst: Option<InstInfo>,
}

impl BranchInfo {
    pub fn new(key: BranchKey, temporary: bool) -> Self {
        Self {
            key,
            temporary,
            linked_inst: None,
        }
    }
}

/// An opaque CRDT delta plus the wall-clock time it was received at.
///
/// Fragments are immutable once stored; byte length is their size
/// contribution and byte content is their dedup identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFragment {
    pub data: Bytes,
    pub timestamp_ms: u64,
}

impl UpdateFragment {
    pub fn now(data: Bytes) -> Self {
        Self {
            data,
            timestamp_ms: epoch_millis(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// The currently-retained fragments of one branch plus cached size
/// bookkeeping. `updates` and `timestamps` are parallel arrays.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentUpdates {
    pub updates: Vec<Bytes>,
    pub timestamps: Vec<u64>,
    pub inst_size_bytes: u64,
    pub branch_size_bytes: u64,
}

impl CurrentUpdates {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }
}

/// A reconciled update history with no size bookkeeping attached.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredUpdates {
    pub updates: Vec<Bytes>,
    pub timestamps: Vec<u64>,
}

impl StoredUpdates {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
