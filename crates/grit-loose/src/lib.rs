//! Loose object storage.
//!
//! One zlib-deflated file per object at `objects/xx/yyyy...`, where `xx` is
//! the first OID byte in hex. File contents are the framed serialization
//! `"<type> <len>\0<body>"`. Objects are write-once; an existing file is
//! never rewritten.

mod enumerate;
mod read;
mod write;

pub use enumerate::LooseIter;

use std::path::{Path, PathBuf};

use grit_hash::{HashAlgorithm, ObjectId};

/// Handle to an `objects/` directory holding loose objects.
pub struct LooseStore {
    objects_dir: PathBuf,
    hash_algo: HashAlgorithm,
    compression: flate2::Compression,
}

impl LooseStore {
    pub fn open(objects_dir: impl AsRef<Path>, hash_algo: HashAlgorithm) -> Self {
        Self {
            objects_dir: objects_dir.as_ref().to_path_buf(),
            hash_algo,
            compression: flate2::Compression::default(),
        }
    }

    /// Set the zlib level (0-9).
    pub fn set_compression_level(&mut self, level: u32) {
        self.compression = flate2::Compression::new(level);
    }

    pub fn hash_algo(&self) -> HashAlgorithm {
        self.hash_algo
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Absolute path of the file an OID would live at.
    pub fn object_path(&self, oid: &ObjectId) -> PathBuf {
        self.objects_dir.join(oid.loose_path())
    }
}

/// Errors from loose object operations.
#[derive(Debug, thiserror::Error)]
pub enum LooseError {
    #[error("corrupt loose object {oid}: {reason}")]
    Corrupt { oid: String, reason: String },

    #[error("cannot decompress {oid}: {source}")]
    Decompress {
        oid: String,
        #[source]
        source: std::io::Error,
    },

    #[error("hash mismatch at {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Object(#[from] grit_object::ObjectError),

    #[error(transparent)]
    Hash(#[from] grit_hash::HashError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_fans_out() {
        let store = LooseStore::open("/repo/objects", HashAlgorithm::Sha1);
        let oid = ObjectId::from_hex("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        assert_eq!(
            store.object_path(&oid),
            PathBuf::from("/repo/objects/ce/013625030ba8dba906f756967f9e9ca394464a")
        );
    }
}
