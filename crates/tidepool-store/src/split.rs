//! Split store - tiered facade over the temporary and durable stores
//!
//! Reads go cache-first with durable fallback-and-backfill; writes land in
//! the cache and are promoted to the durable tier by an external flush
//! process. Squashes rewrite the durable tier first and only then touch
//! the cache, so a rejected squash leaves the cache byte-for-byte intact.

use crate::{InstRecordsStore, Result, StoreError, TempBranchStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tidepool_core::{BranchInfo, BranchKey, CurrentUpdates, InstInfo, RecordScope, StoredUpdates};
use tracing::debug;

/// Composes a [`TempBranchStore`] cache and a durable [`InstRecordsStore`]
/// into one `InstRecordsStore` contract.
///
/// Ephemeral branches (no owning record) never reach the durable tier in
/// either direction. An optional inst size quota is enforced on
/// [`add_updates`](InstRecordsStore::add_updates).
pub struct SplitInstStore<T, D> {
    temp: Arc<T>,
    durable: Arc<D>,
    max_inst_size: Option<u64>,
}

impl<T, D> SplitInstStore<T, D>
where
    T: TempBranchStore,
    D: InstRecordsStore,
{
    pub fn new(temp: Arc<T>, durable: Arc<D>) -> Self {
        Self {
            temp,
            durable,
            max_inst_size: None,
        }
    }

    /// Sets the size quota applied to incoming updates.
    pub fn with_max_inst_size(mut self, max_inst_size: u64) -> Self {
        self.max_inst_size = Some(max_inst_size);
        self
    }

    pub fn temp(&self) -> &Arc<T> {
        &self.temp
    }

    pub fn durable(&self) -> &Arc<D> {
        &self.durable
    }
}

#[async_trait]
impl<T, D> InstRecordsStore for SplitInstStore<T, D>
where
    T: TempBranchStore,
    D: InstRecordsStore,
{
    async fn get_inst_by_name(
        &self,
        scope: &RecordScope,
        inst: &str,
    ) -> Result<Option<InstInfo>> {
        if scope.is_ephemeral() {
            return Ok(None);
        }
        self.durable.get_inst_by_name(scope, inst).await
    }

    async fn save_inst(&self, info: InstInfo) -> Result<()> {
        if !info.scope.is_ephemeral() {
            self.durable.save_inst(info.clone()).await?;
        }
        // Marker changes must not be served from stale cached branch info.
        self.temp
            .delete_all_inst_branch_info(&info.scope, &info.inst)
            .await
    }

    async fn get_branch_by_name(&self, key: &BranchKey) -> Result<Option<BranchInfo>> {
        if let Some(cached) = self.temp.get_branch_by_name(key).await? {
            return Ok(Some(cached.info));
        }
        if key.scope.is_ephemeral() {
            return Ok(None);
        }
        match self.durable.get_branch_by_name(key).await? {
            Some(info) => {
                debug!(branch = %key, "Backfilling branch info into cache");
                self.temp.save_branch_info(info.clone()).await?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    async fn save_branch(&self, info: BranchInfo) -> Result<()> {
        if !info.key.scope.is_ephemeral() && !info.temporary {
            self.durable.save_branch(info.clone()).await?;
        }
        self.temp.save_branch_info(info).await
    }

    async fn get_current_updates(&self, key: &BranchKey) -> Result<Option<CurrentUpdates>> {
        if let Some(updates) = self.temp.get_updates(key).await? {
            return Ok(Some(updates));
        }
        if key.scope.is_ephemeral() {
            return Ok(None);
        }
        let durable = self.durable.get_current_updates(key).await?;
        if let Some(current) = &durable {
            if !current.is_empty() {
                debug!(
                    branch = %key,
                    count = current.len(),
                    "Warming cache from durable updates"
                );
                self.temp
                    .add_updates(key, &current.updates, current.branch_size_bytes)
                    .await?;
            }
        }
        Ok(durable)
    }

    async fn get_all_updates(&self, key: &BranchKey) -> Result<Option<StoredUpdates>> {
        let durable = if key.scope.is_ephemeral() {
            None
        } else {
            self.durable.get_all_updates(key).await?
        };
        let cached = self.temp.get_updates(key).await?;

        if durable.is_none() && cached.is_none() {
            return Ok(None);
        }

        // The cache may hold updates not yet flushed and the durable store
        // may hold flushed updates no longer cached; a complete history
        // needs both, deduplicated on fragment content.
        let mut seen: HashSet<Bytes> = HashSet::new();
        let mut merged: Vec<(Bytes, u64)> = Vec::new();

        let durable_pairs = durable
            .into_iter()
            .flat_map(|s| s.updates.into_iter().zip(s.timestamps));
        let cached_pairs = cached
            .into_iter()
            .flat_map(|c| c.updates.into_iter().zip(c.timestamps));

        for (update, timestamp) in durable_pairs.chain(cached_pairs) {
            if seen.insert(update.clone()) {
                merged.push((update, timestamp));
            }
        }
        merged.sort_by_key(|(_, timestamp)| *timestamp);

        let (updates, timestamps) = merged.into_iter().unzip();
        Ok(Some(StoredUpdates {
            updates,
            timestamps,
        }))
    }

    async fn get_inst_size(&self, scope: &RecordScope, inst: &str) -> Result<Option<u64>> {
        if let Some(size) = self.temp.get_inst_size(scope, inst).await? {
            return Ok(Some(size));
        }
        if scope.is_ephemeral() {
            return Ok(None);
        }
        match self.durable.get_inst_size(scope, inst).await? {
            Some(size) => {
                self.temp.set_inst_size(scope, inst, size).await?;
                Ok(Some(size))
            }
            None => Ok(None),
        }
    }

    async fn add_updates(
        &self,
        key: &BranchKey,
        updates: &[Bytes],
        size_bytes: u64,
    ) -> Result<u64> {
        if let Some(max) = self.max_inst_size {
            let current = self
                .get_inst_size(&key.scope, &key.inst)
                .await?
                .unwrap_or_default();
            let needed = current + size_bytes;
            if needed > max {
                return Err(StoreError::MaxSizeReached {
                    branch: key.branch.clone(),
                    max_size_bytes: max,
                    needed_size_bytes: needed,
                });
            }
        }

        self.temp.add_updates(key, updates, size_bytes).await?;
        Ok(self
            .temp
            .get_inst_size(&key.scope, &key.inst)
            .await?
            .unwrap_or_default())
    }

    async fn delete_branch(&self, key: &BranchKey) -> Result<()> {
        if key.scope.is_ephemeral() {
            return self.temp.delete_branch(key).await;
        }
        let (temp_result, durable_result) = tokio::join!(
            self.temp.delete_branch(key),
            self.durable.delete_branch(key)
        );
        temp_result?;
        durable_result
    }

    async fn replace_current_updates(
        &self,
        key: &BranchKey,
        update: Bytes,
        size_bytes: u64,
    ) -> Result<()> {
        let cached_count = self
            .temp
            .get_updates(key)
            .await?
            .map(|c| c.len())
            .unwrap_or_default();

        if !key.scope.is_ephemeral() {
            // The durable tier owns the quota authority; a rejection here
            // must leave the cache untouched.
            self.durable
                .replace_current_updates(key, update.clone(), size_bytes)
                .await?;
        }

        debug!(branch = %key, trimmed = cached_count, "Squashed branch updates");
        self.temp.add_updates(key, &[update], size_bytes).await?;
        self.temp.trim_updates(key, cached_count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryInstStore, MemoryTempStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Durable store wrapper that counts reads, for cache-through checks.
    struct CountingStore {
        inner: MemoryInstStore,
        current_update_reads: AtomicUsize,
    }

    impl CountingStore {
        fn new(inner: MemoryInstStore) -> Self {
            Self {
                inner,
                current_update_reads: AtomicUsize::new(0),
            }
        }

        fn reads(&self) -> usize {
            self.current_update_reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InstRecordsStore for CountingStore {
        async fn get_inst_by_name(
            &self,
            scope: &RecordScope,
            inst: &str,
        ) -> Result<Option<InstInfo>> {
            self.inner.get_inst_by_name(scope, inst).await
        }

        async fn save_inst(&self, info: InstInfo) -> Result<()> {
            self.inner.save_inst(info).await
        }

        async fn get_branch_by_name(&self, key: &BranchKey) -> Result<Option<BranchInfo>> {
            self.inner.get_branch_by_name(key).await
        }

        async fn save_branch(&self, info: BranchInfo) -> Result<()> {
            self.inner.save_branch(info).await
        }

        async fn get_current_updates(&self, key: &BranchKey) -> Result<Option<CurrentUpdates>> {
            self.current_update_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_current_updates(key).await
        }

        async fn get_all_updates(&self, key: &BranchKey) -> Result<Option<StoredUpdates>> {
            self.inner.get_all_updates(key).await
        }

        async fn get_inst_size(&self, scope: &RecordScope, inst: &str) -> Result<Option<u64>> {
            self.inner.get_inst_size(scope, inst).await
        }

        async fn add_updates(
            &self,
            key: &BranchKey,
            updates: &[Bytes],
            size_bytes: u64,
        ) -> Result<u64> {
            self.inner.add_updates(key, updates, size_bytes).await
        }

        async fn delete_branch(&self, key: &BranchKey) -> Result<()> {
            self.inner.delete_branch(key).await
        }

        async fn replace_current_updates(
            &self,
            key: &BranchKey,
            update: Bytes,
            size_bytes: u64,
        ) -> Result<()> {
            self.inner
                .replace_current_updates(key, update, size_bytes)
                .await
        }
    }

    fn key(branch: &str) -> BranchKey {
        BranchKey::new(RecordScope::persisted("rec"), "inst", branch)
    }

    fn split_over(
        durable: MemoryInstStore,
    ) -> (
        SplitInstStore<MemoryTempStore, CountingStore>,
        Arc<MemoryTempStore>,
        Arc<CountingStore>,
    ) {
        let temp = Arc::new(MemoryTempStore::new());
        let counting = Arc::new(CountingStore::new(durable));
        let split = SplitInstStore::new(temp.clone(), counting.clone());
        (split, temp, counting)
    }

    #[tokio::test]
    async fn test_cache_through_reads_durable_once() {
        let durable = MemoryInstStore::new();
        let k = key("main");
        durable
            .add_updates(&k, &[Bytes::from_static(b"u1"), Bytes::from_static(b"u2")], 4)
            .await
            .unwrap();

        let (split, _, counting) = split_over(durable);

        let first = split.get_current_updates(&k).await.unwrap().unwrap();
        assert_eq!(
            first.updates,
            vec![Bytes::from_static(b"u1"), Bytes::from_static(b"u2")]
        );
        assert_eq!(counting.reads(), 1);

        let second = split.get_current_updates(&k).await.unwrap().unwrap();
        assert_eq!(second.updates, first.updates);
        // Served from the cache; no second durable read.
        assert_eq!(counting.reads(), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_miss_never_reaches_durable() {
        let (split, _, counting) = split_over(MemoryInstStore::new());
        let k = BranchKey::new(RecordScope::Ephemeral, "inst", "main");

        assert!(split.get_current_updates(&k).await.unwrap().is_none());
        assert!(split.get_branch_by_name(&k).await.unwrap().is_none());
        assert_eq!(counting.reads(), 0);
    }

    #[tokio::test]
    async fn test_branch_info_backfill() {
        let durable = MemoryInstStore::new();
        let k = key("main");
        durable
            .save_branch(BranchInfo::new(k.clone(), false))
            .await
            .unwrap();

        let (split, temp, _) = split_over(durable);

        assert!(temp.get_branch_by_name(&k).await.unwrap().is_none());
        let info = split.get_branch_by_name(&k).await.unwrap().unwrap();
        assert_eq!(info.key, k);
        // Backfilled into the cache.
        assert!(temp.get_branch_by_name(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_all_updates_dedups_and_orders() {
        let durable = MemoryInstStore::new();
        let k = key("main");
        let (a, b, c) = (
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        );

        // Durable holds [a, b]; the cache still holds b (not yet trimmed)
        // plus a fresher c.
        durable.add_updates(&k, &[a.clone()], 1).await.unwrap();
        durable.add_updates(&k, &[b.clone()], 1).await.unwrap();

        let (split, temp, _) = split_over(durable);
        temp.add_updates(&k, &[b.clone()], 1).await.unwrap();
        temp.add_updates(&k, &[c.clone()], 1).await.unwrap();

        let all = split.get_all_updates(&k).await.unwrap().unwrap();
        assert_eq!(all.updates, vec![a, b, c]);
        assert!(all.timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_add_updates_returns_cache_inst_size() {
        let (split, _, _) = split_over(MemoryInstStore::new());
        let k = key("main");

        let size = split
            .add_updates(&k, &[Bytes::from_static(b"xxxx")], 4)
            .await
            .unwrap();
        assert_eq!(size, 4);

        let size = split
            .add_updates(&k, &[Bytes::from_static(b"yy")], 2)
            .await
            .unwrap();
        assert_eq!(size, 6);
    }

    #[tokio::test]
    async fn test_quota_enforced_against_primed_size() {
        let durable = MemoryInstStore::new();
        let k = key("main");
        durable
            .add_updates(&k, &[Bytes::from_static(b"1234567890")], 10)
            .await
            .unwrap();

        let (split, _, _) = split_over(durable);
        let split = split.with_max_inst_size(12);

        let err = split
            .add_updates(&k, &[Bytes::from_static(b"abc")], 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::MaxSizeReached {
                needed_size_bytes: 13,
                max_size_bytes: 12,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_size_conservation_across_add_and_delete() {
        let (split, _, _) = split_over(MemoryInstStore::new());
        let k = key("main");
        let before = split
            .get_inst_size(&k.scope, &k.inst)
            .await
            .unwrap()
            .unwrap_or_default();

        split
            .add_updates(&k, &[Bytes::from_static(b"xxxx")], 4)
            .await
            .unwrap();
        split.delete_branch(&k).await.unwrap();

        let after = split
            .get_inst_size(&k.scope, &k.inst)
            .await
            .unwrap()
            .unwrap_or_default();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_delete_branch_clears_both_tiers() {
        let durable = MemoryInstStore::new();
        let k = key("main");
        durable
            .add_updates(&k, &[Bytes::from_static(b"u1")], 2)
            .await
            .unwrap();

        let (split, temp, counting) = split_over(durable);
        temp.add_updates(&k, &[Bytes::from_static(b"u2")], 2)
            .await
            .unwrap();

        split.delete_branch(&k).await.unwrap();

        assert!(temp.get_updates(&k).await.unwrap().is_none());
        assert!(counting
            .inner
            .get_current_updates(&k)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_squash_failure_leaves_cache_untouched() {
        let durable = MemoryInstStore::with_max_inst_size(3);
        let k = key("main");

        let (split, temp, _) = split_over(durable);
        temp.add_updates(
            &k,
            &[Bytes::from_static(b"u1"), Bytes::from_static(b"u2")],
            4,
        )
        .await
        .unwrap();
        let before = temp.get_updates(&k).await.unwrap().unwrap();

        let err = split
            .replace_current_updates(&k, Bytes::from_static(b"merged"), 6)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MaxSizeReached { .. }));

        let after = temp.get_updates(&k).await.unwrap().unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_squash_replaces_cache_contents() {
        let durable = MemoryInstStore::new();
        let k = key("main");

        let (split, temp, counting) = split_over(durable);
        temp.add_updates(
            &k,
            &[Bytes::from_static(b"u1"), Bytes::from_static(b"u2")],
            4,
        )
        .await
        .unwrap();

        split
            .replace_current_updates(&k, Bytes::from_static(b"merged"), 6)
            .await
            .unwrap();

        let cached = temp.get_updates(&k).await.unwrap().unwrap();
        assert_eq!(cached.updates, vec![Bytes::from_static(b"merged")]);

        let durable_current = counting
            .inner
            .get_current_updates(&k)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(durable_current.updates, vec![Bytes::from_static(b"merged")]);
    }

    #[tokio::test]
    async fn test_save_inst_invalidates_cached_branch_info() {
        let durable = MemoryInstStore::new();
        let k = key("main");
        durable
            .save_branch(BranchInfo::new(k.clone(), false))
            .await
            .unwrap();

        let (split, temp, _) = split_over(durable);
        split.get_branch_by_name(&k).await.unwrap();
        assert!(temp.get_branch_by_name(&k).await.unwrap().is_some());

        split
            .save_inst(InstInfo {
                scope: k.scope.clone(),
                inst: k.inst.clone(),
                markers: vec!["publicRead".into()],
            })
            .await
            .unwrap();

        assert!(temp.get_branch_by_name(&k).await.unwrap().is_none());
    }
}
