//! In-memory durable store
//!
//! Reference implementation of the [`InstRecordsStore`] contract, suitable
//! for development and for exercising the split store. A production
//! deployment supplies a database-backed implementation instead.

use crate::{InstRecordsStore, Result, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tidepool_core::{
    epoch_millis, BranchInfo, BranchKey, CurrentUpdates, InstInfo, RecordScope, StoredUpdates,
    UpdateFragment,
};

#[derive(Debug)]
struct DurableBranch {
    info: BranchInfo,
    fragments: Vec<UpdateFragment>,
}

/// Durable tier held in process memory.
///
/// Optionally enforces a per-inst size quota, rejecting writes that would
/// exceed it with [`StoreError::MaxSizeReached`].
pub struct MemoryInstStore {
    insts: DashMap<(RecordScope, String), InstInfo>,
    branches: DashMap<BranchKey, DurableBranch>,
    max_inst_size: Option<u64>,
}

impl MemoryInstStore {
    pub fn new() -> Self {
        Self {
            insts: DashMap::new(),
            branches: DashMap::new(),
            max_inst_size: None,
        }
    }

    /// Creates a store that rejects writes pushing an inst past
    /// `max_inst_size` bytes.
    pub fn with_max_inst_size(max_inst_size: u64) -> Self {
        Self {
            max_inst_size: Some(max_inst_size),
            ..Self::new()
        }
    }

    fn inst_key(scope: &RecordScope, inst: &str) -> (RecordScope, String) {
        (scope.clone(), inst.to_string())
    }

    fn computed_inst_size(&self, scope: &RecordScope, inst: &str) -> u64 {
        self.branches
            .iter()
            .filter(|entry| entry.key().scope == *scope && entry.key().inst == inst)
            .map(|entry| {
                entry
                    .value()
                    .fragments
                    .iter()
                    .map(UpdateFragment::size_bytes)
                    .sum::<u64>()
            })
            .sum()
    }

    fn branch_size(&self, key: &BranchKey) -> u64 {
        self.branches
            .get(key)
            .map(|b| b.fragments.iter().map(UpdateFragment::size_bytes).sum())
            .unwrap_or_default()
    }

    fn inst_known(&self, scope: &RecordScope, inst: &str) -> bool {
        self.insts.contains_key(&Self::inst_key(scope, inst))
            || self
                .branches
                .iter()
                .any(|entry| entry.key().scope == *scope && entry.key().inst == inst)
    }

    fn check_quota(&self, key: &BranchKey, needed: u64) -> Result<()> {
        if let Some(max) = self.max_inst_size {
            if needed > max {
                return Err(StoreError::MaxSizeReached {
                    branch: key.branch.clone(),
                    max_size_bytes: max,
                    needed_size_bytes: needed,
                });
            }
        }
        Ok(())
    }
}

impl Default for MemoryInstStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstRecordsStore for MemoryInstStore {
    async fn get_inst_by_name(
        &self,
        scope: &RecordScope,
        inst: &str,
    ) -> Result<Option<InstInfo>> {
        Ok(self
            .insts
            .get(&Self::inst_key(scope, inst))
            .map(|i| i.clone()))
    }

    async fn save_inst(&self, info: InstInfo) -> Result<()> {
        self.insts
            .insert(Self::inst_key(&info.scope, &info.inst), info);
        Ok(())
    }

    async fn get_branch_by_name(&self, key: &BranchKey) -> Result<Option<BranchInfo>> {
        let mut info = match self.branches.get(key) {
            Some(branch) => branch.info.clone(),
            None => return Ok(None),
        };
        info.linked_inst = self
            .insts
            .get(&Self::inst_key(&key.scope, &key.inst))
            .map(|i| i.clone());
        Ok(Some(info))
    }

    async fn save_branch(&self, info: BranchInfo) -> Result<()> {
        self.branches
            .entry(info.key.clone())
            .and_modify(|branch| branch.info = info.clone())
            .or_insert_with(|| DurableBranch {
                info,
                fragments: Vec::new(),
            });
        Ok(())
    }

    async fn get_current_updates(&self, key: &BranchKey) -> Result<Option<CurrentUpdates>> {
        let (updates, timestamps, branch_size) = match self.branches.get(key) {
            Some(branch) => (
                branch.fragments.iter().map(|f| f.data.clone()).collect(),
                branch.fragments.iter().map(|f| f.timestamp_ms).collect(),
                branch
                    .fragments
                    .iter()
                    .map(UpdateFragment::size_bytes)
                    .sum(),
            ),
            None => return Ok(None),
        };
        Ok(Some(CurrentUpdates {
            updates,
            timestamps,
            inst_size_bytes: self.computed_inst_size(&key.scope, &key.inst),
            branch_size_bytes: branch_size,
        }))
    }

    async fn get_all_updates(&self, key: &BranchKey) -> Result<Option<StoredUpdates>> {
        Ok(self.branches.get(key).map(|branch| StoredUpdates {
            updates: branch.fragments.iter().map(|f| f.data.clone()).collect(),
            timestamps: branch.fragments.iter().map(|f| f.timestamp_ms).collect(),
        }))
    }

    async fn get_inst_size(&self, scope: &RecordScope, inst: &str) -> Result<Option<u64>> {
        if !self.inst_known(scope, inst) {
            return Ok(None);
        }
        Ok(Some(self.computed_inst_size(scope, inst)))
    }

    async fn add_updates(
        &self,
        key: &BranchKey,
        updates: &[Bytes],
        size_bytes: u64,
    ) -> Result<u64> {
        let needed = self.computed_inst_size(&key.scope, &key.inst) + size_bytes;
        self.check_quota(key, needed)?;

        let now = epoch_millis();
        let mut branch = self
            .branches
            .entry(key.clone())
            .or_insert_with(|| DurableBranch {
                info: BranchInfo::new(key.clone(), false),
                fragments: Vec::new(),
            });
        for update in updates {
            branch.fragments.push(UpdateFragment {
                data: update.clone(),
                timestamp_ms: now,
            });
        }
        Ok(needed)
    }

    async fn delete_branch(&self, key: &BranchKey) -> Result<()> {
        self.branches.remove(key);
        Ok(())
    }

    async fn replace_current_updates(
        &self,
        key: &BranchKey,
        update: Bytes,
        size_bytes: u64,
    ) -> Result<()> {
        let inst_size = self.computed_inst_size(&key.scope, &key.inst);
        let needed = inst_size - self.branch_size(key) + size_bytes;
        self.check_quota(key, needed)?;

        let mut branch = self
            .branches
            .entry(key.clone())
            .or_insert_with(|| DurableBranch {
                info: BranchInfo::new(key.clone(), false),
                fragments: Vec::new(),
            });
        branch.fragments = vec![UpdateFragment {
            data: update,
            timestamp_ms: epoch_millis(),
        }];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(branch: &str) -> BranchKey {
        BranchKey::new(RecordScope::persisted("rec"), "inst", branch)
    }

    #[tokio::test]
    async fn test_implicit_branch_creation_on_add() {
        let store = MemoryInstStore::new();
        let k = key("main");

        let size = store
            .add_updates(&k, &[Bytes::from_static(b"u1")], 2)
            .await
            .unwrap();
        assert_eq!(size, 2);

        let branch = store.get_branch_by_name(&k).await.unwrap().unwrap();
        assert_eq!(branch.key, k);
        assert!(!branch.temporary);
    }

    #[tokio::test]
    async fn test_inst_size_unknown_inst() {
        let store = MemoryInstStore::new();
        let scope = RecordScope::persisted("rec");
        assert_eq!(store.get_inst_size(&scope, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quota_rejection_carries_context() {
        let store = MemoryInstStore::with_max_inst_size(4);
        let k = key("main");

        store
            .add_updates(&k, &[Bytes::from_static(b"abc")], 3)
            .await
            .unwrap();

        let err = store
            .add_updates(&k, &[Bytes::from_static(b"de")], 2)
            .await
            .unwrap_err();
        match err {
            StoreError::MaxSizeReached {
                branch,
                max_size_bytes,
                needed_size_bytes,
            } => {
                assert_eq!(branch, "main");
                assert_eq!(max_size_bytes, 4);
                assert_eq!(needed_size_bytes, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replace_respects_quota_against_replaced_size() {
        let store = MemoryInstStore::with_max_inst_size(5);
        let k = key("main");

        store
            .add_updates(
                &k,
                &[Bytes::from_static(b"ab"), Bytes::from_static(b"cde")],
                5,
            )
            .await
            .unwrap();

        // Replacing 5 bytes with 4 fits even though 5 + 4 would not.
        store
            .replace_current_updates(&k, Bytes::from_static(b"wxyz"), 4)
            .await
            .unwrap();

        let current = store.get_current_updates(&k).await.unwrap().unwrap();
        assert_eq!(current.updates, vec![Bytes::from_static(b"wxyz")]);
        assert_eq!(current.branch_size_bytes, 4);
    }

    #[tokio::test]
    async fn test_save_inst_and_linked_inst() {
        let store = MemoryInstStore::new();
        let k = key("main");
        store
            .save_inst(InstInfo {
                scope: k.scope.clone(),
                inst: k.inst.clone(),
                markers: vec!["private".into()],
            })
            .await
            .unwrap();
        store
            .save_branch(BranchInfo::new(k.clone(), false))
            .await
            .unwrap();

        let branch = store.get_branch_by_name(&k).await.unwrap().unwrap();
        let inst = branch.linked_inst.unwrap();
        assert_eq!(inst.markers, vec!["private".to_string()]);
    }
}
