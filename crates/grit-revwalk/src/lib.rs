//! Commit graph traversal.
//!
//! [`Walker`] drives every history-shaped question in the workspace:
//! log output, negotiation have-generation, and reachability checks.

pub mod walk;

pub use walk::{EntryChanges, Ordering, WalkEntry, WalkOptions, Walker};

use grit_hash::ObjectId;

/// Errors from revision walking.
#[derive(Debug, thiserror::Error)]
pub enum RevWalkError {
    #[error("not a commit: {0}")]
    NotACommit(ObjectId),

    #[error("commit not found: {0}")]
    CommitNotFound(ObjectId),

    #[error(transparent)]
    Odb(#[from] grit_odb::OdbError),

    #[error(transparent)]
    Diff(#[from] grit_diff::DiffError),
}
