//! Foundation utilities shared across the grit workspace.
//!
//! Provides the lock-file protocol used for every mutating storage
//! operation, and git date/identity parsing.

pub mod date;
mod error;
pub mod lockfile;

pub use error::{LockError, UtilError};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UtilError>;
