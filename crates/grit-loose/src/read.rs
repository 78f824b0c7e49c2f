use std::fs;
use std::io::Read;

use flate2::read::ZlibDecoder;
use grit_hash::hasher::Hasher;
use grit_hash::ObjectId;
use grit_object::{header, Object, ObjectType, ParseOptions};

use crate::{LooseError, LooseStore};

impl LooseStore {
    /// Existence check by stat; no file is opened.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.object_path(oid).is_file()
    }

    /// Read and parse a loose object. `Ok(None)` when absent.
    pub fn read(&self, oid: &ObjectId) -> Result<Option<Object>, LooseError> {
        self.read_with(oid, ParseOptions::strict())
    }

    pub fn read_with(
        &self,
        oid: &ObjectId,
        opts: ParseOptions,
    ) -> Result<Option<Object>, LooseError> {
        let raw = match self.read_raw(oid)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        Ok(Some(Object::parse_with(&raw, opts)?))
    }

    /// Read the framed bytes (`"<type> <len>\0<body>"`) without parsing.
    pub fn read_raw(&self, oid: &ObjectId) -> Result<Option<Vec<u8>>, LooseError> {
        let path = self.object_path(oid);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LooseError::Io(e)),
        };

        let mut decoder = ZlibDecoder::new(std::io::BufReader::new(file));
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| LooseError::Decompress {
                oid: oid.to_hex(),
                source: e,
            })?;
        Ok(Some(raw))
    }

    /// Read only the framed header: `(type, body_size)`.
    ///
    /// Inflates just enough bytes to find the NUL terminator.
    pub fn read_header(&self, oid: &ObjectId) -> Result<Option<(ObjectType, usize)>, LooseError> {
        let path = self.object_path(oid);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LooseError::Io(e)),
        };

        let mut decoder = ZlibDecoder::new(std::io::BufReader::new(file));
        let mut buf = [0u8; 64];
        let mut filled = 0;
        loop {
            if filled == buf.len() {
                return Err(LooseError::Corrupt {
                    oid: oid.to_hex(),
                    reason: "framing header longer than 64 bytes".into(),
                });
            }
            let n = decoder
                .read(&mut buf[filled..])
                .map_err(|e| LooseError::Decompress {
                    oid: oid.to_hex(),
                    source: e,
                })?;
            if n == 0 {
                return Err(LooseError::Corrupt {
                    oid: oid.to_hex(),
                    reason: "EOF before header terminator".into(),
                });
            }
            filled += n;
            if buf[..filled].contains(&0) {
                break;
            }
        }

        let (obj_type, size, _) = header::parse_header(&buf[..filled])?;
        Ok(Some((obj_type, size)))
    }

    /// Read and re-hash, rejecting content that does not match its address.
    pub fn read_verified(&self, oid: &ObjectId) -> Result<Option<Object>, LooseError> {
        let raw = match self.read_raw(oid)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let actual = Hasher::digest(self.hash_algo(), &raw)?;
        if actual != *oid {
            return Err(LooseError::HashMismatch {
                path: self.object_path(oid),
                expected: oid.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(Some(Object::parse(&raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grit_hash::HashAlgorithm;
    use grit_object::Blob;

    fn store(dir: &std::path::Path) -> LooseStore {
        LooseStore::open(dir, HashAlgorithm::Sha1)
    }

    #[test]
    fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.read(&ObjectId::NULL_SHA1).unwrap(), None);
        assert!(!store.contains(&ObjectId::NULL_SHA1));
    }

    #[test]
    fn write_then_read_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let oid = store
            .write(&Object::Blob(Blob::new(&b"hello\n"[..])))
            .unwrap();
        let (ty, size) = store.read_header(&oid).unwrap().unwrap();
        assert_eq!(ty, ObjectType::Blob);
        assert_eq!(size, 6);
    }

    #[test]
    fn verified_read_rejects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let oid = store
            .write(&Object::Blob(Blob::new(&b"hello\n"[..])))
            .unwrap();

        // Overwrite the object file with a different (valid) blob.
        let path = store.object_path(&oid);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o644);
        }
        std::fs::set_permissions(&path, perms).unwrap();
        let evil = {
            use flate2::write::ZlibEncoder;
            use std::io::Write;
            let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(b"blob 5\0evil\n").unwrap();
            enc.finish().unwrap()
        };
        std::fs::write(&path, evil).unwrap();

        assert!(matches!(
            store.read_verified(&oid),
            Err(LooseError::HashMismatch { .. })
        ));
    }
}
