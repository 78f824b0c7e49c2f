//! Tree differencing.
//!
//! Produces flat change records between two tree snapshots (the shape the
//! graph walker's path filtering and the rename detector consume), not
//! rendered patches.

pub mod rename;
pub mod tree;

pub use rename::{RenameConfig, RenameDetector};
pub use tree::{tree_changes, tree_changes_for_merge};

use bstr::BString;
use grit_hash::ObjectId;
use grit_object::FileMode;

/// Errors from diff operations.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("not a tree: {0}")]
    NotATree(ObjectId),

    #[error("not a blob: {0}")]
    NotABlob(ObjectId),

    #[error(transparent)]
    Odb(#[from] grit_odb::OdbError),
}

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Delete,
    Modify,
    Rename,
    Copy,
    Unchanged,
}

/// One side of a change: a path with its mode and OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub path: BString,
    pub mode: FileMode,
    pub oid: ObjectId,
}

/// A single file-level change between two trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub kind: ChangeKind,
    pub old: Option<ChangeEntry>,
    pub new: Option<ChangeEntry>,
    /// Similarity score 0..=100 for renames and copies.
    pub similarity: Option<u8>,
}

impl TreeChange {
    pub fn add(new: ChangeEntry) -> Self {
        Self {
            kind: ChangeKind::Add,
            old: None,
            new: Some(new),
            similarity: None,
        }
    }

    pub fn delete(old: ChangeEntry) -> Self {
        Self {
            kind: ChangeKind::Delete,
            old: Some(old),
            new: None,
            similarity: None,
        }
    }

    pub fn modify(old: ChangeEntry, new: ChangeEntry) -> Self {
        Self {
            kind: ChangeKind::Modify,
            old: Some(old),
            new: Some(new),
            similarity: None,
        }
    }

    pub fn unchanged(entry: ChangeEntry) -> Self {
        Self {
            kind: ChangeKind::Unchanged,
            old: Some(entry.clone()),
            new: Some(entry),
            similarity: None,
        }
    }

    /// The path this change is best known by (new side when present).
    pub fn path(&self) -> &BString {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|e| &e.path)
            .expect("change has at least one side")
    }

    /// True when either side's path starts with `prefix`.
    pub fn touches_prefix(&self, prefix: &[u8]) -> bool {
        let hit = |entry: &Option<ChangeEntry>| {
            entry.as_ref().is_some_and(|e| {
                e.path.starts_with(prefix)
                    && (e.path.len() == prefix.len() || e.path.get(prefix.len()) == Some(&b'/'))
            })
        };
        hit(&self.old) || hit(&self.new)
    }
}
