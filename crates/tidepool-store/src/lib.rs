//! Tidepool Storage Tiers
//!
//! Update fragments for a branch live in two tiers:
//! - a volatile, size-tracked temporary store that fresh writes land in, and
//! - a durable store holding the already-flushed authoritative history.
//!
//! [`SplitInstStore`] composes the two behind the single [`InstRecordsStore`]
//! contract: reads are cache-first with durable fallback-and-backfill, writes
//! go to the cache, and squashes rewrite both tiers.

pub mod memory;
pub mod split;
pub mod temp;

use async_trait::async_trait;
use bytes::Bytes;
use tidepool_core::{BranchInfo, BranchKey, CurrentUpdates, InstInfo, RecordScope, StoredUpdates};

/// Storage error types.
///
/// Absence of a record, inst, or branch during a lookup is never an error;
/// lookups return `Ok(None)` instead. The variants here are reserved for
/// rejected writes and dependency failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Inst not found: {0}")]
    InstNotFound(String),

    /// The write would push the inst past its size quota. Carries enough
    /// context for the caller to decide whether a merge-and-retry is worth
    /// attempting.
    #[error("Max size reached for branch {branch}: needed {needed_size_bytes} of max {max_size_bytes}")]
    MaxSizeReached {
        branch: String,
        max_size_bytes: u64,
        needed_size_bytes: u64,
    },

    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The authoritative store contract for inst records, branches, and their
/// update fragments. Implemented by durable backends and by the
/// [`split::SplitInstStore`] facade.
#[async_trait]
pub trait InstRecordsStore: Send + Sync {
    async fn get_inst_by_name(&self, scope: &RecordScope, inst: &str)
        -> Result<Option<InstInfo>>;

    /// Upserts an inst. Re-saving an inst invalidates any cached branch
    /// metadata under it so marker changes are picked up on next use.
    async fn save_inst(&self, info: InstInfo) -> Result<()>;

    async fn get_branch_by_name(&self, key: &BranchKey) -> Result<Option<BranchInfo>>;

    async fn save_branch(&self, info: BranchInfo) -> Result<()>;

    /// The currently-retained fragments of the branch, or `None` when the
    /// branch is unknown.
    async fn get_current_updates(&self, key: &BranchKey) -> Result<Option<CurrentUpdates>>;

    /// The complete reconciled history of the branch, ordered by timestamp
    /// with content-duplicates removed.
    async fn get_all_updates(&self, key: &BranchKey) -> Result<Option<StoredUpdates>>;

    async fn get_inst_size(&self, scope: &RecordScope, inst: &str) -> Result<Option<u64>>;

    /// Appends fragments to the branch. `size_bytes` is the total byte
    /// length of `updates`, already computed by the caller. Returns the
    /// post-write inst size.
    async fn add_updates(&self, key: &BranchKey, updates: &[Bytes], size_bytes: u64)
        -> Result<u64>;

    /// Deletes the branch and its size contribution from every tier this
    /// store manages.
    async fn delete_branch(&self, key: &BranchKey) -> Result<()>;

    /// Replaces the branch's current fragments with one merged fragment
    /// (squash). The durable tier owns the authority on whether the
    /// replacement is permitted; on rejection nothing changes.
    async fn replace_current_updates(
        &self,
        key: &BranchKey,
        update: Bytes,
        size_bytes: u64,
    ) -> Result<()>;
}

/// Branch metadata as held by the temporary store, with its cache-only
/// size bookkeeping attached.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBranch {
    pub info: BranchInfo,
    pub branch_size_bytes: u64,
}

/// The temporary (cache) store contract.
///
/// This tier is a low-latency holding area, not a second source of truth:
/// its contents may be evicted at any time and rebuilt from the durable
/// store by the caller. No method fails for "not found".
#[async_trait]
pub trait TempBranchStore: Send + Sync {
    /// Cached branch metadata, or `None` on a miss. Never consults the
    /// durable store; cache-miss handling is the caller's job.
    async fn get_branch_by_name(&self, key: &BranchKey) -> Result<Option<CachedBranch>>;

    /// Idempotent metadata upsert.
    async fn save_branch_info(&self, info: BranchInfo) -> Result<()>;

    /// Bulk-invalidates every cached branch under an inst.
    async fn delete_all_inst_branch_info(&self, scope: &RecordScope, inst: &str) -> Result<()>;

    async fn get_updates(&self, key: &BranchKey) -> Result<Option<CurrentUpdates>>;

    /// Appends fragments stamped with the current wall-clock time and bumps
    /// the branch and inst size counters by `size_bytes`.
    async fn add_updates(&self, key: &BranchKey, updates: &[Bytes], size_bytes: u64)
        -> Result<()>;

    async fn get_inst_size(&self, scope: &RecordScope, inst: &str) -> Result<Option<u64>>;

    /// Primes the inst-level size counter without implying any branch is
    /// cached.
    async fn set_inst_size(&self, scope: &RecordScope, inst: &str, size_bytes: u64)
        -> Result<()>;

    async fn add_inst_size(&self, scope: &RecordScope, inst: &str, delta: i64) -> Result<()>;

    /// Removes the `count` oldest fragments from the cached branch and
    /// releases their size contribution. Used after those fragments have
    /// been durably persisted, not for eviction.
    async fn trim_updates(&self, key: &BranchKey, count: usize) -> Result<()>;

    /// Removes the branch's fragments and metadata, subtracting its size
    /// contribution from the inst counter.
    async fn delete_branch(&self, key: &BranchKey) -> Result<()>;
}

pub use memory::MemoryInstStore;
pub use split::SplitInstStore;
pub use temp::MemoryTempStore;
