//! Streaming digest computation.

use crate::{HashAlgorithm, HashError, ObjectId};

enum Inner {
    Sha1(Box<sha1_checked::Sha1>),
    Sha256(sha2::Sha256),
}

/// Incremental hasher producing an [`ObjectId`].
///
/// SHA-1 runs with collision detection; a detected collision attack is
/// reported as an error instead of returning an attacker-chosen digest.
/// Implements [`std::io::Write`] so it can sit inside tee'd write paths.
pub struct Hasher {
    inner: Inner,
}

impl Hasher {
    pub fn new(algo: HashAlgorithm) -> Self {
        use digest::Digest;
        let inner = match algo {
            HashAlgorithm::Sha1 => Inner::Sha1(Box::new(sha1_checked::Sha1::new())),
            HashAlgorithm::Sha256 => Inner::Sha256(sha2::Sha256::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        use digest::Digest;
        match &mut self.inner {
            Inner::Sha1(h) => h.update(data),
            Inner::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Result<ObjectId, HashError> {
        match self.inner {
            Inner::Sha1(h) => {
                let out = h.try_finalize();
                if out.has_collision() {
                    return Err(HashError::Sha1Collision);
                }
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(out.hash().as_slice());
                Ok(ObjectId::Sha1(bytes))
            }
            Inner::Sha256(h) => {
                use digest::Digest;
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(h.finalize().as_slice());
                Ok(ObjectId::Sha256(bytes))
            }
        }
    }

    /// One-shot digest of a byte slice.
    pub fn digest(algo: HashAlgorithm, data: &[u8]) -> Result<ObjectId, HashError> {
        let mut h = Self::new(algo);
        h.update(data);
        h.finalize()
    }

    /// Digest a git object: `"<type> <len>\0"` followed by the body.
    pub fn hash_object(
        algo: HashAlgorithm,
        type_name: &str,
        body: &[u8],
    ) -> Result<ObjectId, HashError> {
        let mut h = Self::new(algo);
        h.update(format!("{} {}\0", type_name, body.len()).as_bytes());
        h.update(body);
        h.finalize()
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_empty_string() {
        let oid = Hasher::digest(HashAlgorithm::Sha1, b"").unwrap();
        assert_eq!(oid.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn hello_blob_oid() {
        let oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", b"hello\n").unwrap();
        assert_eq!(oid.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn empty_tree_oid() {
        let oid = Hasher::hash_object(HashAlgorithm::Sha1, "tree", b"").unwrap();
        assert_eq!(oid.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut h = Hasher::new(HashAlgorithm::Sha1);
        h.update(b"hel");
        h.update(b"lo\n");
        let split = h.finalize().unwrap();
        assert_eq!(split, Hasher::digest(HashAlgorithm::Sha1, b"hello\n").unwrap());
    }

    #[test]
    fn write_impl_feeds_hasher() {
        use std::io::Write;
        let mut h = Hasher::new(HashAlgorithm::Sha1);
        h.write_all(b"hello\n").unwrap();
        assert_eq!(
            h.finalize().unwrap(),
            Hasher::digest(HashAlgorithm::Sha1, b"hello\n").unwrap()
        );
    }

    #[test]
    fn sha256_digest_len() {
        let oid = Hasher::digest(HashAlgorithm::Sha256, b"x").unwrap();
        assert_eq!(oid.as_bytes().len(), 32);
    }
}
