//! Protocol message types
//!
//! One tagged enum covers both directions of the transport; a transport
//! adapter serializes these as JSON (or any serde format) and routes
//! inbound variants to the matching [`ProtocolServer`](crate::server::ProtocolServer)
//! method.

use crate::connections::ConnectionInfo;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tidepool_core::BranchKey;

/// Which replication protocol a watcher speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchProtocol {
    /// Legacy atom-based replication.
    Atoms,
    /// Update-fragment replication.
    #[default]
    Updates,
}

/// Request to start watching a branch's update stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchBranchRequest {
    pub branch: BranchKey,
    /// Temporary branches are purged from every store once their last
    /// temporary watcher disconnects.
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub protocol: BranchProtocol,
}

/// A batch of update fragments for one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddUpdatesMessage {
    pub branch: BranchKey,
    pub updates: Vec<Bytes>,
    /// Correlation id echoed back in the acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
    /// Set on the snapshot sent to a freshly-watching connection so the
    /// client can distinguish it from an incremental delta.
    #[serde(default)]
    pub initial: bool,
}

/// Why an update batch was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum UpdateRejection {
    MaxSizeReached {
        max_size_bytes: u64,
        needed_size_bytes: u64,
    },
}

/// Acknowledgement sent to the producer of an update batch (and only to
/// the producer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatesReceivedMessage {
    pub branch: BranchKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UpdateRejection>,
}

/// A batch of legacy atoms for one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddAtomsMessage {
    pub branch: BranchKey,
    pub atoms: Vec<serde_json::Value>,
    #[serde(default)]
    pub initial: bool,
}

/// A remote action routed between devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteAction {
    /// An application-defined event.
    Action {
        event_name: String,
        argument: serde_json::Value,
    },
    /// Seeds initial branch content. Idempotent: a no-op when the branch
    /// already has stored updates.
    SetupServer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init_update: Option<Bytes>,
    },
}

/// Addressing for a remote action. Explicit fields take priority; with
/// none set, one connected watcher is chosen at random.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub broadcast: bool,
}

/// Request to route a remote action to other watchers of a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEventRequest {
    pub branch: BranchKey,
    pub action: RemoteAction,
    #[serde(default)]
    pub target: EventTarget,
}

/// Time-sync sample. The client fills `client_request_time_ms`; the
/// server echoes it back with its receive and transmit times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSample {
    pub id: u64,
    pub client_request_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_receive_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_transmit_time_ms: Option<u64>,
}

/// All messages exchanged with clients, tagged by wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    WatchBranch(WatchBranchRequest),
    UnwatchBranch { branch: BranchKey },
    AddUpdates(AddUpdatesMessage),
    UpdatesReceived(UpdatesReceivedMessage),
    AddAtoms(AddAtomsMessage),
    AtomsReceived { branch: BranchKey },
    DeviceConnectedToBranch {
        branch: WatchBranchRequest,
        connection: ConnectionInfo,
    },
    DeviceDisconnectedFromBranch {
        branch: BranchKey,
        connection_id: String,
    },
    WatchBranchDevices { branch: BranchKey },
    UnwatchBranchDevices { branch: BranchKey },
    SendEvent(SendEventRequest),
    ReceiveEvent {
        branch: BranchKey,
        action: RemoteAction,
    },
    #[serde(rename = "repo/device_count")]
    DeviceCount {
        branch: Option<BranchKey>,
        count: u64,
    },
    SyncTime(TimeSample),
    RateLimitExceeded { retry_after_ms: u64 },
}
