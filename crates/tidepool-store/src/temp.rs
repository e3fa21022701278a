//! In-memory temporary (cache) store

use crate::{CachedBranch, Result, TempBranchStore};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tidepool_core::{
    epoch_millis, BranchInfo, BranchKey, CurrentUpdates, RecordScope, UpdateFragment,
};

#[derive(Debug, Default)]
struct BranchUpdates {
    fragments: Vec<UpdateFragment>,
    size_bytes: u64,
}

/// Volatile, size-tracked cache of recently-active branches.
///
/// Branch-level mutations hold the branch's map entry for their duration,
/// so the fragment list and branch size counter stay consistent per key.
/// The inst-level counter is maintained separately so it can be primed
/// from the durable store before any branch is cached.
pub struct MemoryTempStore {
    branch_info: DashMap<BranchKey, BranchInfo>,
    updates: DashMap<BranchKey, BranchUpdates>,
    inst_sizes: DashMap<(RecordScope, String), u64>,
}

impl MemoryTempStore {
    pub fn new() -> Self {
        Self {
            branch_info: DashMap::new(),
            updates: DashMap::new(),
            inst_sizes: DashMap::new(),
        }
    }

    fn inst_key(scope: &RecordScope, inst: &str) -> (RecordScope, String) {
        (scope.clone(), inst.to_string())
    }

    fn apply_inst_delta(&self, scope: &RecordScope, inst: &str, delta: i64) {
        let mut entry = self
            .inst_sizes
            .entry(Self::inst_key(scope, inst))
            .or_insert(0);
        if delta.is_negative() {
            *entry = entry.saturating_sub(delta.unsigned_abs());
        } else {
            *entry += delta as u64;
        }
    }
}

impl Default for MemoryTempStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TempBranchStore for MemoryTempStore {
    async fn get_branch_by_name(&self, key: &BranchKey) -> Result<Option<CachedBranch>> {
        let info = match self.branch_info.get(key) {
            Some(info) => info.clone(),
            None => return Ok(None),
        };
        let branch_size_bytes = self
            .updates
            .get(key)
            .map(|u| u.size_bytes)
            .unwrap_or_default();
        Ok(Some(CachedBranch {
            info,
            branch_size_bytes,
        }))
    }

    async fn save_branch_info(&self, info: BranchInfo) -> Result<()> {
        self.branch_info.insert(info.key.clone(), info);
        Ok(())
    }

    async fn delete_all_inst_branch_info(&self, scope: &RecordScope, inst: &str) -> Result<()> {
        self.branch_info
            .retain(|key, _| !(key.scope == *scope && key.inst == inst));
        Ok(())
    }

    async fn get_updates(&self, key: &BranchKey) -> Result<Option<CurrentUpdates>> {
        let branch = match self.updates.get(key) {
            Some(branch) => branch,
            None => return Ok(None),
        };
        let inst_size_bytes = self
            .inst_sizes
            .get(&Self::inst_key(&key.scope, &key.inst))
            .map(|s| *s)
            .unwrap_or_default();
        Ok(Some(CurrentUpdates {
            updates: branch.fragments.iter().map(|f| f.data.clone()).collect(),
            timestamps: branch.fragments.iter().map(|f| f.timestamp_ms).collect(),
            inst_size_bytes,
            branch_size_bytes: branch.size_bytes,
        }))
    }

    async fn add_updates(
        &self,
        key: &BranchKey,
        updates: &[Bytes],
        size_bytes: u64,
    ) -> Result<()> {
        {
            let mut branch = self.updates.entry(key.clone()).or_default();
            let now = epoch_millis();
            for update in updates {
                branch.fragments.push(UpdateFragment {
                    data: update.clone(),
                    timestamp_ms: now,
                });
            }
            branch.size_bytes += size_bytes;
        }
        self.apply_inst_delta(&key.scope, &key.inst, size_bytes as i64);
        Ok(())
    }

    async fn get_inst_size(&self, scope: &RecordScope, inst: &str) -> Result<Option<u64>> {
        Ok(self
            .inst_sizes
            .get(&Self::inst_key(scope, inst))
            .map(|s| *s))
    }

    async fn set_inst_size(&self, scope: &RecordScope, inst: &str, size_bytes: u64) -> Result<()> {
        self.inst_sizes
            .insert(Self::inst_key(scope, inst), size_bytes);
        Ok(())
    }

    async fn add_inst_size(&self, scope: &RecordScope, inst: &str, delta: i64) -> Result<()> {
        self.apply_inst_delta(scope, inst, delta);
        Ok(())
    }

    async fn trim_updates(&self, key: &BranchKey, count: usize) -> Result<()> {
        let removed_bytes = match self.updates.get_mut(key) {
            Some(mut branch) => {
                let count = count.min(branch.fragments.len());
                let removed: u64 = branch
                    .fragments
                    .drain(..count)
                    .map(|f| f.size_bytes())
                    .sum();
                branch.size_bytes = branch.size_bytes.saturating_sub(removed);
                removed
            }
            None => return Ok(()),
        };
        if removed_bytes > 0 {
            self.apply_inst_delta(&key.scope, &key.inst, -(removed_bytes as i64));
        }
        Ok(())
    }

    async fn delete_branch(&self, key: &BranchKey) -> Result<()> {
        self.branch_info.remove(key);
        if let Some((_, branch)) = self.updates.remove(key) {
            if branch.size_bytes > 0 {
                self.apply_inst_delta(&key.scope, &key.inst, -(branch.size_bytes as i64));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::RecordScope;

    fn key(branch: &str) -> BranchKey {
        BranchKey::new(RecordScope::persisted("rec"), "inst", branch)
    }

    #[tokio::test]
    async fn test_missing_branch_is_none() {
        let store = MemoryTempStore::new();
        assert!(store.get_branch_by_name(&key("b")).await.unwrap().is_none());
        assert!(store.get_updates(&key("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_updates_tracks_sizes() {
        let store = MemoryTempStore::new();
        let k = key("main");

        store
            .add_updates(&k, &[Bytes::from_static(b"abc")], 3)
            .await
            .unwrap();
        store
            .add_updates(&k, &[Bytes::from_static(b"de")], 2)
            .await
            .unwrap();

        let current = store.get_updates(&k).await.unwrap().unwrap();
        assert_eq!(current.updates.len(), 2);
        assert_eq!(current.timestamps.len(), 2);
        assert!(current.timestamps[0] <= current.timestamps[1]);
        assert_eq!(current.branch_size_bytes, 5);
        assert_eq!(current.inst_size_bytes, 5);
        assert_eq!(
            store
                .get_inst_size(&k.scope, &k.inst)
                .await
                .unwrap(),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_inst_size_priming_without_branches() {
        let store = MemoryTempStore::new();
        let scope = RecordScope::persisted("rec");

        store.set_inst_size(&scope, "inst", 100).await.unwrap();
        assert_eq!(store.get_inst_size(&scope, "inst").await.unwrap(), Some(100));

        store.add_inst_size(&scope, "inst", -30).await.unwrap();
        assert_eq!(store.get_inst_size(&scope, "inst").await.unwrap(), Some(70));
    }

    #[tokio::test]
    async fn test_trim_removes_oldest_and_releases_size() {
        let store = MemoryTempStore::new();
        let k = key("main");

        for (data, size) in [(&b"aa"[..], 2), (&b"bbb"[..], 3), (&b"c"[..], 1)] {
            store
                .add_updates(&k, &[Bytes::copy_from_slice(data)], size)
                .await
                .unwrap();
        }

        store.trim_updates(&k, 2).await.unwrap();

        let current = store.get_updates(&k).await.unwrap().unwrap();
        assert_eq!(current.updates, vec![Bytes::from_static(b"c")]);
        assert_eq!(current.branch_size_bytes, 1);
        assert_eq!(store.get_inst_size(&k.scope, &k.inst).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_delete_branch_restores_inst_size() {
        let store = MemoryTempStore::new();
        let a = key("a");
        let b = key("b");

        store
            .add_updates(&a, &[Bytes::from_static(b"xxxx")], 4)
            .await
            .unwrap();
        store
            .add_updates(&b, &[Bytes::from_static(b"yy")], 2)
            .await
            .unwrap();

        store.delete_branch(&a).await.unwrap();

        assert!(store.get_updates(&a).await.unwrap().is_none());
        assert_eq!(store.get_inst_size(&a.scope, &a.inst).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_delete_all_inst_branch_info() {
        let store = MemoryTempStore::new();
        let a = key("a");
        let b = key("b");
        let other = BranchKey::new(RecordScope::persisted("rec"), "other", "a");

        for k in [&a, &b, &other] {
            store
                .save_branch_info(BranchInfo::new(k.clone(), false))
                .await
                .unwrap();
        }

        store
            .delete_all_inst_branch_info(&a.scope, "inst")
            .await
            .unwrap();

        assert!(store.get_branch_by_name(&a).await.unwrap().is_none());
        assert!(store.get_branch_by_name(&b).await.unwrap().is_none());
        assert!(store.get_branch_by_name(&other).await.unwrap().is_some());
    }
}
