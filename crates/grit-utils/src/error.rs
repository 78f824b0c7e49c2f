use std::path::PathBuf;

/// Lock acquisition and commit failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock file already held: {path}")]
    AlreadyLocked { path: PathBuf },

    #[error("cannot create lock file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot commit lock file {path}: {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the utility layer.
#[derive(Debug, thiserror::Error)]
pub enum UtilError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("invalid date: {0}")]
    DateParse(String),

    #[error("invalid identity: {0}")]
    IdentityParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
