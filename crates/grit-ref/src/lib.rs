//! Reference storage.
//!
//! Refs are the only mutable entities in a repository. Storage is a triad:
//! a loose file per ref, the shared `packed-refs` file, and an append-only
//! reflog per ref. Loose values shadow packed ones; every mutation is a
//! compare-and-swap serialized by a lock file on the loose ref path.

pub mod name;
pub mod packed;
pub mod reflog;
pub mod store;

pub use name::RefName;
pub use packed::{PackedRef, PackedRefs};
pub use reflog::ReflogEntry;
pub use store::{FilesRefStore, RefLock};

use std::path::PathBuf;

use grit_hash::ObjectId;
use grit_utils::{LockError, UtilError};

/// Errors from ref operations.
#[derive(Debug, thiserror::Error)]
pub enum RefError {
    #[error("invalid ref name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("symbolic ref chain too deep resolving {0}")]
    SymrefLoop(String),

    #[error("ref not found: {0}")]
    NotFound(String),

    #[error("cannot parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("lock contended: {0}")]
    LockContended(PathBuf),

    #[error(transparent)]
    Hash(#[from] grit_hash::HashError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Util(UtilError),
}

impl From<UtilError> for RefError {
    fn from(e: UtilError) -> Self {
        match e {
            UtilError::Lock(LockError::AlreadyLocked { path }) => Self::LockContended(path),
            other => Self::Util(other),
        }
    }
}

/// What a ref file holds: an OID, or a pointer to another ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    Direct(ObjectId),
    Symbolic(RefName),
}

impl RefValue {
    pub fn as_direct(&self) -> Option<&ObjectId> {
        match self {
            Self::Direct(oid) => Some(oid),
            Self::Symbolic(_) => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(_))
    }
}
