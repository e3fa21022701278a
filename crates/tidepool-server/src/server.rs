//! Protocol server - the per-branch watch/replicate/presence state machine
//!
//! Each inbound client operation is handled independently; mutating
//! operations on one branch serialize through a per-namespace lock while
//! operations on different branches run concurrently.

use crate::connections::{ConnectionInfo, ConnectionStore, NamespaceEntry, NamespaceKind};
use crate::error::{Result, ServerError};
use crate::messages::{
    AddAtomsMessage, AddUpdatesMessage, BranchProtocol, ProtocolMessage, RemoteAction,
    SendEventRequest, TimeSample, UpdateRejection, UpdatesReceivedMessage, WatchBranchRequest,
};
use crate::messenger::Messenger;
use bytes::Bytes;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tidepool_core::{epoch_millis, BranchInfo, BranchKey, InstInfo, UpdateMerger};
use tidepool_store::{InstRecordsStore, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Server behavior toggles.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// When an update batch is rejected for exceeding the size quota,
    /// merge the branch's full history with the new updates and retry via
    /// a squash instead of failing outright.
    pub merge_updates_on_max_size_exceeded: bool,
    /// Minimum gap between rate-limit notifications to one connection.
    pub rate_limit_notify_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            merge_updates_on_max_size_exceeded: false,
            rate_limit_notify_interval_ms: 1000,
        }
    }
}

/// The session-level protocol server.
///
/// Stateless between requests apart from the per-branch locks; all watch
/// relationships live in the [`ConnectionStore`] and all branch data in
/// the [`InstRecordsStore`], so independent server instances can be
/// constructed freely (one per test, one per process).
pub struct ProtocolServer<S, C, M> {
    store: Arc<S>,
    connections: Arc<C>,
    messenger: Arc<M>,
    merger: Arc<dyn UpdateMerger>,
    config: ServerConfig,
    branch_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S, C, M> ProtocolServer<S, C, M>
where
    S: InstRecordsStore,
    C: ConnectionStore,
    M: Messenger,
{
    pub fn new(
        store: Arc<S>,
        connections: Arc<C>,
        messenger: Arc<M>,
        merger: Arc<dyn UpdateMerger>,
    ) -> Self {
        Self {
            store,
            connections,
            messenger,
            merger,
            config: ServerConfig::default(),
            branch_locks: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a new connection.
    pub async fn connect(&self, info: ConnectionInfo) -> Result<()> {
        debug!(connection = %info.connection_id, "Connection registered");
        self.connections.save_connection(info).await
    }

    /// Deregisters a connection, garbage-collecting temporary branches it
    /// was the last temporary watcher of and notifying presence watchers.
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        let entries = self
            .connections
            .get_namespaces_by_connection(connection_id)
            .await?;
        self.connections.delete_connection(connection_id).await?;
        debug!(connection = %connection_id, namespaces = entries.len(), "Connection closed");

        for entry in entries {
            if let NamespaceKind::Branch { key, temporary, .. } = entry.kind {
                if temporary {
                    self.maybe_purge_temporary(&key).await?;
                }
                self.notify_device_watchers(
                    &key,
                    ProtocolMessage::DeviceDisconnectedFromBranch {
                        branch: key.clone(),
                        connection_id: connection_id.to_string(),
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Registers the connection as a branch watcher and sends it the
    /// branch's current state tagged `initial`.
    pub async fn watch_branch(
        &self,
        connection_id: &str,
        request: WatchBranchRequest,
    ) -> Result<()> {
        let conn = self.require_connection(connection_id).await?;
        let key = request.branch.clone();
        let namespace = key.namespace();
        debug!(connection = %connection_id, branch = %key, "Watch branch");

        self.connections
            .save_namespace_connection(NamespaceEntry {
                namespace,
                connection: conn.clone(),
                kind: NamespaceKind::Branch {
                    key: key.clone(),
                    temporary: request.temporary,
                    protocol: request.protocol,
                },
            })
            .await?;

        self.ensure_branch(&key, request.temporary).await?;

        let current = self
            .store
            .get_current_updates(&key)
            .await?
            .unwrap_or_default();
        let initial = match request.protocol {
            BranchProtocol::Updates => ProtocolMessage::AddUpdates(AddUpdatesMessage {
                branch: key.clone(),
                updates: current.updates,
                update_id: None,
                initial: true,
            }),
            // Atom state lives in the legacy atom store, outside this
            // engine; legacy watchers start from an empty snapshot.
            BranchProtocol::Atoms => ProtocolMessage::AddAtoms(AddAtomsMessage {
                branch: key.clone(),
                atoms: Vec::new(),
                initial: true,
            }),
        };
        self.messenger
            .send_message(&[connection_id.to_string()], initial, None)
            .await?;

        self.notify_device_watchers(
            &key,
            ProtocolMessage::DeviceConnectedToBranch {
                branch: request,
                connection: conn,
            },
        )
        .await
    }

    /// Deregisters a branch watcher. Unwatching a namespace that was never
    /// watched is a silent no-op.
    pub async fn unwatch_branch(&self, connection_id: &str, key: &BranchKey) -> Result<()> {
        let namespace = key.namespace();
        let entry = self
            .connections
            .get_namespace_connection(&namespace, connection_id)
            .await?;
        self.connections
            .delete_namespace_connection(&namespace, connection_id)
            .await?;

        let Some(entry) = entry else {
            return Ok(());
        };
        debug!(connection = %connection_id, branch = %key, "Unwatch branch");

        if matches!(entry.kind, NamespaceKind::Branch { temporary: true, .. }) {
            self.maybe_purge_temporary(key).await?;
        }
        self.notify_device_watchers(
            key,
            ProtocolMessage::DeviceDisconnectedFromBranch {
                branch: key.clone(),
                connection_id: connection_id.to_string(),
            },
        )
        .await
    }

    /// Persists an update batch, fans it out to every other watcher, and
    /// acknowledges the sender. On a quota rejection the server may merge
    /// and retry; if that also fails the sender alone hears about it.
    pub async fn add_updates(
        &self,
        connection_id: &str,
        request: AddUpdatesMessage,
    ) -> Result<()> {
        let key = request.branch.clone();
        let lock = self.branch_lock(&key.namespace());
        let _guard = lock.lock().await;

        self.ensure_branch(&key, false).await?;
        let size_bytes: u64 = request.updates.iter().map(|u| u.len() as u64).sum();

        match self.store.add_updates(&key, &request.updates, size_bytes).await {
            Ok(_) => self.finish_add_updates(connection_id, request).await,
            Err(StoreError::MaxSizeReached {
                max_size_bytes,
                needed_size_bytes,
                ..
            }) => {
                if self.config.merge_updates_on_max_size_exceeded {
                    match self.merge_and_replace(&key, &request.updates).await {
                        Ok(()) => return self.finish_add_updates(connection_id, request).await,
                        Err(retry_err) => {
                            warn!(
                                branch = %key,
                                error = %retry_err,
                                "Merge-on-overflow retry failed"
                            );
                        }
                    }
                }
                // The failed batch must not reach other watchers; only the
                // sender learns of the rejection.
                let ack = ProtocolMessage::UpdatesReceived(UpdatesReceivedMessage {
                    branch: key,
                    update_id: request.update_id,
                    error: Some(UpdateRejection::MaxSizeReached {
                        max_size_bytes,
                        needed_size_bytes,
                    }),
                });
                self.messenger
                    .send_message(&[connection_id.to_string()], ack, None)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fans out a legacy atom batch and acknowledges the sender. Atom
    /// persistence belongs to the external atom store.
    pub async fn add_atoms(&self, connection_id: &str, request: AddAtomsMessage) -> Result<()> {
        let namespace = request.branch.namespace();
        let watchers = self.watcher_ids(&namespace).await?;
        self.messenger
            .send_message(
                &watchers,
                ProtocolMessage::AddAtoms(AddAtomsMessage {
                    initial: false,
                    ..request.clone()
                }),
                Some(connection_id),
            )
            .await?;
        self.messenger
            .send_message(
                &[connection_id.to_string()],
                ProtocolMessage::AtomsReceived {
                    branch: request.branch,
                },
                None,
            )
            .await
    }

    /// Routes a remote action to one or more target connections.
    pub async fn send_event(&self, connection_id: &str, request: SendEventRequest) -> Result<()> {
        let key = request.branch.clone();

        if let RemoteAction::SetupServer { init_update } = &request.action {
            return self.setup_server(&key, init_update.clone()).await;
        }

        let watchers = self
            .connections
            .get_connections_by_namespace(&key.namespace())
            .await?;
        let target = &request.target;

        let targets: Vec<String> = if target.broadcast {
            watchers
                .iter()
                .map(|e| e.connection.connection_id.clone())
                .filter(|id| id != connection_id)
                .collect()
        } else if let Some(device_id) = &target.device_id {
            watchers
                .iter()
                .filter(|e| e.connection.device_id == *device_id)
                .map(|e| e.connection.connection_id.clone())
                .collect()
        } else if let Some(session_id) = &target.session_id {
            watchers
                .iter()
                .filter(|e| e.connection.session_id == *session_id)
                .map(|e| e.connection.connection_id.clone())
                .collect()
        } else if let Some(username) = &target.username {
            watchers
                .iter()
                .filter(|e| e.connection.username.as_deref() == Some(username.as_str()))
                .map(|e| e.connection.connection_id.clone())
                .collect()
        } else {
            // No explicit address: any single connected watcher may be
            // chosen. Uniform over the current watcher list.
            let candidates: Vec<String> = watchers
                .iter()
                .map(|e| e.connection.connection_id.clone())
                .filter(|id| id != connection_id)
                .collect();
            candidates
                .choose(&mut rand::thread_rng())
                .cloned()
                .into_iter()
                .collect()
        };

        if targets.is_empty() {
            return Ok(());
        }
        self.messenger
            .send_message(
                &targets,
                ProtocolMessage::ReceiveEvent {
                    branch: key,
                    action: request.action,
                },
                None,
            )
            .await
    }

    /// Subscribes to a branch's presence channel and replays the devices
    /// already watching the branch.
    pub async fn watch_branch_devices(
        &self,
        connection_id: &str,
        key: &BranchKey,
    ) -> Result<()> {
        let conn = self.require_connection(connection_id).await?;
        self.connections
            .save_namespace_connection(NamespaceEntry {
                namespace: key.watch_devices_namespace(),
                connection: conn,
                kind: NamespaceKind::DeviceWatch { key: key.clone() },
            })
            .await?;

        let watchers = self
            .connections
            .get_connections_by_namespace(&key.namespace())
            .await?;
        for entry in watchers {
            if let NamespaceKind::Branch {
                key: branch_key,
                temporary,
                protocol,
            } = entry.kind
            {
                self.messenger
                    .send_message(
                        &[connection_id.to_string()],
                        ProtocolMessage::DeviceConnectedToBranch {
                            branch: WatchBranchRequest {
                                branch: branch_key,
                                temporary,
                                protocol,
                            },
                            connection: entry.connection,
                        },
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn unwatch_branch_devices(
        &self,
        connection_id: &str,
        key: &BranchKey,
    ) -> Result<()> {
        self.connections
            .delete_namespace_connection(&key.watch_devices_namespace(), connection_id)
            .await
    }

    /// Reports the watcher count for one branch, or the global connection
    /// count when no branch is given.
    pub async fn device_count(
        &self,
        connection_id: &str,
        branch: Option<BranchKey>,
    ) -> Result<()> {
        let count = match &branch {
            Some(key) => {
                self.connections
                    .count_connections_by_namespace(&key.namespace())
                    .await?
            }
            None => self.connections.count_connections().await?,
        };
        self.messenger
            .send_message(
                &[connection_id.to_string()],
                ProtocolMessage::DeviceCount { branch, count },
                None,
            )
            .await
    }

    /// Delivers an HTTP-shaped event to one randomly chosen connected
    /// watcher. Returns an HTTP-style status: 404 when the branch has no
    /// stored data, 503 when nobody is connected, 200 on dispatch.
    pub async fn webhook(
        &self,
        key: &BranchKey,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<u16> {
        let has_data = self
            .store
            .get_current_updates(key)
            .await?
            .is_some_and(|c| !c.is_empty());
        if !has_data {
            return Ok(404);
        }

        let watchers = self
            .connections
            .get_connections_by_namespace(&key.namespace())
            .await?;
        let Some(chosen) = watchers.choose(&mut rand::thread_rng()) else {
            return Ok(503);
        };

        info!(branch = %key, event = event_name, "Dispatching webhook");
        self.messenger
            .send_message(
                &[chosen.connection.connection_id.clone()],
                ProtocolMessage::ReceiveEvent {
                    branch: key.clone(),
                    action: RemoteAction::Action {
                        event_name: event_name.to_string(),
                        argument: payload,
                    },
                },
                None,
            )
            .await?;
        Ok(200)
    }

    /// Stateless time-sync echo.
    pub async fn sync_time(&self, connection_id: &str, sample: TimeSample) -> Result<()> {
        let server_receive_time_ms = Some(epoch_millis());
        self.messenger
            .send_message(
                &[connection_id.to_string()],
                ProtocolMessage::SyncTime(TimeSample {
                    server_receive_time_ms,
                    server_transmit_time_ms: Some(epoch_millis()),
                    ..sample
                }),
                None,
            )
            .await
    }

    /// Notifies a connection that it is being rate limited, at most once
    /// per configured rolling window.
    pub async fn rate_limit_exceeded(
        &self,
        connection_id: &str,
        retry_after_ms: u64,
    ) -> Result<()> {
        let now = epoch_millis();
        let last = self
            .connections
            .get_rate_limit_notified_at(connection_id)
            .await?;
        if let Some(last) = last {
            if now.saturating_sub(last) < self.config.rate_limit_notify_interval_ms {
                return Ok(());
            }
        }
        self.connections
            .set_rate_limit_notified_at(connection_id, now)
            .await?;
        self.messenger
            .send_message(
                &[connection_id.to_string()],
                ProtocolMessage::RateLimitExceeded { retry_after_ms },
                None,
            )
            .await
    }

    async fn require_connection(&self, connection_id: &str) -> Result<ConnectionInfo> {
        self.connections
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| ServerError::ConnectionNotFound(connection_id.to_string()))
    }

    fn branch_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.branch_locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates the inst and branch records on first contact.
    async fn ensure_branch(&self, key: &BranchKey, temporary: bool) -> Result<()> {
        if self.store.get_branch_by_name(key).await?.is_some() {
            return Ok(());
        }
        if !key.scope.is_ephemeral()
            && self
                .store
                .get_inst_by_name(&key.scope, &key.inst)
                .await?
                .is_none()
        {
            self.store
                .save_inst(InstInfo {
                    scope: key.scope.clone(),
                    inst: key.inst.clone(),
                    markers: Vec::new(),
                })
                .await?;
        }
        self.store
            .save_branch(BranchInfo::new(key.clone(), temporary))
            .await?;
        Ok(())
    }

    async fn finish_add_updates(
        &self,
        connection_id: &str,
        request: AddUpdatesMessage,
    ) -> Result<()> {
        let watchers = self.watcher_ids(&request.branch.namespace()).await?;
        self.messenger
            .send_message(
                &watchers,
                ProtocolMessage::AddUpdates(AddUpdatesMessage {
                    branch: request.branch.clone(),
                    updates: request.updates,
                    update_id: None,
                    initial: false,
                }),
                Some(connection_id),
            )
            .await?;
        self.messenger
            .send_message(
                &[connection_id.to_string()],
                ProtocolMessage::UpdatesReceived(UpdatesReceivedMessage {
                    branch: request.branch,
                    update_id: request.update_id,
                    error: None,
                }),
                None,
            )
            .await
    }

    async fn merge_and_replace(&self, key: &BranchKey, new_updates: &[Bytes]) -> Result<()> {
        let history = self.store.get_all_updates(key).await?.unwrap_or_default();
        let mut fragments = history.updates;
        fragments.extend_from_slice(new_updates);

        let merged = self.merger.merge(&fragments)?;
        let size_bytes = merged.len() as u64;
        info!(
            branch = %key,
            fragments = fragments.len(),
            merged_size = size_bytes,
            "Merging update history to recover from size quota"
        );
        self.store
            .replace_current_updates(key, merged, size_bytes)
            .await?;
        Ok(())
    }

    /// Seeds initial branch content, once. Delete wins over concurrent
    /// adds: both run under the branch lock, and a purge between them
    /// leaves the branch absent.
    async fn setup_server(&self, key: &BranchKey, init_update: Option<Bytes>) -> Result<()> {
        let lock = self.branch_lock(&key.namespace());
        let _guard = lock.lock().await;

        let existing = self.store.get_current_updates(key).await?;
        if existing.is_some_and(|c| !c.is_empty()) {
            debug!(branch = %key, "Branch already initialized; setup skipped");
            return Ok(());
        }
        let Some(init) = init_update else {
            return Ok(());
        };
        self.ensure_branch(key, false).await?;
        let size_bytes = init.len() as u64;
        self.store.add_updates(key, &[init], size_bytes).await?;
        info!(branch = %key, size = size_bytes, "Seeded initial branch content");
        Ok(())
    }

    /// Purges a temporary branch once no temporary watcher remains.
    async fn maybe_purge_temporary(&self, key: &BranchKey) -> Result<()> {
        let remaining = self
            .connections
            .get_connections_by_namespace(&key.namespace())
            .await?
            .iter()
            .filter(|e| matches!(e.kind, NamespaceKind::Branch { temporary: true, .. }))
            .count();
        if remaining > 0 {
            return Ok(());
        }
        let lock = self.branch_lock(&key.namespace());
        let _guard = lock.lock().await;
        info!(branch = %key, "Purging temporary branch after last watcher left");
        self.store.delete_branch(key).await?;
        Ok(())
    }

    async fn notify_device_watchers(
        &self,
        key: &BranchKey,
        message: ProtocolMessage,
    ) -> Result<()> {
        let watchers = self.watcher_ids(&key.watch_devices_namespace()).await?;
        if watchers.is_empty() {
            return Ok(());
        }
        self.messenger.send_message(&watchers, message, None).await
    }

    async fn watcher_ids(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .connections
            .get_connections_by_namespace(namespace)
            .await?
            .into_iter()
            .map(|e| e.connection.connection_id)
            .collect())
    }
}
