//! Tidepool Core - data model for CRDT branch synchronization
//!
//! This crate provides the building blocks shared by the stores and the
//! protocol server:
//! - Branch addressing (record scope, inst, branch)
//! - Update fragments and size-tracked fragment collections
//! - The opaque CRDT merge primitive used to squash update history

pub mod branch;
pub mod merge;

pub use branch::{
    epoch_millis, BranchInfo, BranchKey, CurrentUpdates, InstInfo, RecordScope, StoredUpdates,
    UpdateFragment,
};
pub use merge::{MergeError, UpdateMerger, YrsMerger};
