//! Abbreviated OID resolution.

use grit_hash::ObjectId;

use crate::{ObjectDatabase, OdbError};

/// Minimum abbreviation length accepted, matching C git.
const MIN_PREFIX_LEN: usize = 4;

/// Resolve a hex prefix to the single OID it abbreviates.
pub fn resolve(db: &ObjectDatabase, hex_prefix: &str) -> Result<ObjectId, OdbError> {
    let prefix = hex_prefix.to_ascii_lowercase();
    if prefix.len() < MIN_PREFIX_LEN
        || prefix.len() > 40
        || !prefix.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(OdbError::PrefixNotFound(hex_prefix.to_string()));
    }

    // A full hex string needs no search.
    if prefix.len() == 40 {
        let oid = ObjectId::from_hex(&prefix).map_err(OdbError::Hash)?;
        return if db.contains(&oid) {
            Ok(oid)
        } else {
            Err(OdbError::NotFound(oid))
        };
    }

    let mut matches: Vec<ObjectId> = db
        .iter_all_oids()?
        .into_iter()
        .filter(|oid| oid.starts_with_hex(&prefix))
        .collect();
    matches.sort();
    matches.dedup();

    match matches.len() {
        0 => Err(OdbError::PrefixNotFound(hex_prefix.to_string())),
        1 => Ok(matches[0]),
        count => Err(OdbError::AmbiguousPrefix {
            prefix: hex_prefix.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grit_object::{Blob, Object};

    #[test]
    fn unique_prefix_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDatabase::open(dir.path()).unwrap();
        let oid = db.add(&Object::Blob(Blob::new(&b"hello\n"[..]))).unwrap();

        let prefix = &oid.to_hex()[..8];
        assert_eq!(db.resolve_prefix(prefix).unwrap(), oid);
        // Case-insensitive.
        assert_eq!(db.resolve_prefix(&prefix.to_uppercase()).unwrap(), oid);
    }

    #[test]
    fn short_or_bad_prefix_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDatabase::open(dir.path()).unwrap();
        assert!(db.resolve_prefix("ab").is_err());
        assert!(db.resolve_prefix("zzzz").is_err());
    }

    #[test]
    fn unknown_prefix_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDatabase::open(dir.path()).unwrap();
        assert!(matches!(
            db.resolve_prefix("deadbeef"),
            Err(OdbError::PrefixNotFound(_))
        ));
    }

    #[test]
    fn full_hex_resolves_without_scan() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDatabase::open(dir.path()).unwrap();
        let oid = db.add(&Object::Blob(Blob::new(&b"x"[..]))).unwrap();
        assert_eq!(db.resolve_prefix(&oid.to_hex()).unwrap(), oid);
    }
}
