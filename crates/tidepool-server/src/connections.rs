//! Connection and presence directory
//!
//! Tracks which connections exist and which namespaces (branch update
//! streams and presence channels) each one is watching. The contract is
//! swappable so a multi-process deployment can externalize it; the
//! in-memory implementation backs single-process servers and tests.

use crate::error::Result;
use crate::messages::BranchProtocol;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tidepool_core::BranchKey;
use uuid::Uuid;

/// Identity of one connected device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub device_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ConnectionInfo {
    /// Fresh connection identity with random ids. Mostly useful for tests
    /// and embedded transports.
    pub fn generate(username: Option<String>) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            device_id: Uuid::new_v4().to_string(),
            session_id: Uuid::new_v4().to_string(),
            username,
        }
    }
}

/// What a namespace registration is for.
#[derive(Debug, Clone, PartialEq)]
pub enum NamespaceKind {
    /// Watching a branch's update stream.
    Branch {
        key: BranchKey,
        temporary: bool,
        protocol: BranchProtocol,
    },
    /// Watching a branch's presence (join/leave) channel.
    DeviceWatch { key: BranchKey },
}

/// One (connection, namespace) watching relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceEntry {
    pub namespace: String,
    pub connection: ConnectionInfo,
    pub kind: NamespaceKind,
}

/// Directory of connections and their namespace registrations.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn save_connection(&self, info: ConnectionInfo) -> Result<()>;

    async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionInfo>>;

    /// Removes the connection and every namespace registration it holds.
    async fn delete_connection(&self, connection_id: &str) -> Result<()>;

    async fn save_namespace_connection(&self, entry: NamespaceEntry) -> Result<()>;

    async fn delete_namespace_connection(
        &self,
        namespace: &str,
        connection_id: &str,
    ) -> Result<()>;

    async fn get_namespace_connection(
        &self,
        namespace: &str,
        connection_id: &str,
    ) -> Result<Option<NamespaceEntry>>;

    async fn get_connections_by_namespace(&self, namespace: &str)
        -> Result<Vec<NamespaceEntry>>;

    async fn count_connections_by_namespace(&self, namespace: &str) -> Result<u64>;

    async fn get_namespaces_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<NamespaceEntry>>;

    /// Total number of registered connections.
    async fn count_connections(&self) -> Result<u64>;

    /// When this connection was last sent a rate-limit notification.
    async fn get_rate_limit_notified_at(&self, connection_id: &str) -> Result<Option<u64>>;

    async fn set_rate_limit_notified_at(
        &self,
        connection_id: &str,
        timestamp_ms: u64,
    ) -> Result<()>;
}

/// In-memory connection directory.
pub struct MemoryConnectionStore {
    connections: DashMap<String, ConnectionInfo>,
    by_namespace: DashMap<String, Vec<NamespaceEntry>>,
    by_connection: DashMap<String, Vec<NamespaceEntry>>,
    rate_limits: DashMap<String, u64>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_namespace: DashMap::new(),
            by_connection: DashMap::new(),
            rate_limits: DashMap::new(),
        }
    }
}

impl Default for MemoryConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn save_connection(&self, info: ConnectionInfo) -> Result<()> {
        self.connections.insert(info.connection_id.clone(), info);
        Ok(())
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionInfo>> {
        Ok(self.connections.get(connection_id).map(|c| c.clone()))
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<()> {
        self.connections.remove(connection_id);
        self.rate_limits.remove(connection_id);
        if let Some((_, entries)) = self.by_connection.remove(connection_id) {
            for entry in entries {
                if let Some(mut list) = self.by_namespace.get_mut(&entry.namespace) {
                    list.retain(|e| e.connection.connection_id != connection_id);
                }
            }
        }
        Ok(())
    }

    async fn save_namespace_connection(&self, entry: NamespaceEntry) -> Result<()> {
        let connection_id = entry.connection.connection_id.clone();

        let mut list = self
            .by_namespace
            .entry(entry.namespace.clone())
            .or_default();
        list.retain(|e| e.connection.connection_id != connection_id);
        list.push(entry.clone());
        drop(list);

        let mut list = self.by_connection.entry(connection_id).or_default();
        list.retain(|e| e.namespace != entry.namespace);
        list.push(entry);
        Ok(())
    }

    async fn delete_namespace_connection(
        &self,
        namespace: &str,
        connection_id: &str,
    ) -> Result<()> {
        if let Some(mut list) = self.by_namespace.get_mut(namespace) {
            list.retain(|e| e.connection.connection_id != connection_id);
        }
        if let Some(mut list) = self.by_connection.get_mut(connection_id) {
            list.retain(|e| e.namespace != namespace);
        }
        Ok(())
    }

    async fn get_namespace_connection(
        &self,
        namespace: &str,
        connection_id: &str,
    ) -> Result<Option<NamespaceEntry>> {
        Ok(self.by_namespace.get(namespace).and_then(|list| {
            list.iter()
                .find(|e| e.connection.connection_id == connection_id)
                .cloned()
        }))
    }

    async fn get_connections_by_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<NamespaceEntry>> {
        Ok(self
            .by_namespace
            .get(namespace)
            .map(|list| list.clone())
            .unwrap_or_default())
    }

    async fn count_connections_by_namespace(&self, namespace: &str) -> Result<u64> {
        Ok(self
            .by_namespace
            .get(namespace)
            .map(|list| list.len() as u64)
            .unwrap_or_default())
    }

    async fn get_namespaces_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<NamespaceEntry>> {
        Ok(self
            .by_connection
            .get(connection_id)
            .map(|list| list.clone())
            .unwrap_or_default())
    }

    async fn count_connections(&self) -> Result<u64> {
        Ok(self.connections.len() as u64)
    }

    async fn get_rate_limit_notified_at(&self, connection_id: &str) -> Result<Option<u64>> {
        Ok(self.rate_limits.get(connection_id).map(|t| *t))
    }

    async fn set_rate_limit_notified_at(
        &self,
        connection_id: &str,
        timestamp_ms: u64,
    ) -> Result<()> {
        self.rate_limits.insert(connection_id.to_string(), timestamp_ms);
        Ok(())
    }
}
