use std::fmt;
use std::str::FromStr;

use crate::{hex, HashAlgorithm, HashError};

/// A git object identifier: the hash of an object's framed content.
///
/// Ordering and equality are lexicographic on the raw digest bytes, which
/// matches the sort order of pack indexes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl ObjectId {
    /// The SHA-1 zero OID, written as forty `0`s on the wire to mean
    /// "no object" (ref creation and deletion).
    pub const NULL_SHA1: Self = Self::Sha1([0u8; 20]);
    pub const NULL_SHA256: Self = Self::Sha256([0u8; 32]);

    /// Build an OID from raw digest bytes.
    pub fn from_bytes(bytes: &[u8], algo: HashAlgorithm) -> Result<Self, HashError> {
        if bytes.len() != algo.digest_len() {
            return Err(HashError::InvalidDigestLength {
                expected: algo.digest_len(),
                actual: bytes.len(),
            });
        }
        Ok(match algo {
            HashAlgorithm::Sha1 => {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(bytes);
                Self::Sha1(arr)
            }
            HashAlgorithm::Sha256 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Self::Sha256(arr)
            }
        })
    }

    /// Parse from hex; the algorithm is inferred from the length
    /// (40 chars for SHA-1, 64 for SHA-256).
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let algo = HashAlgorithm::from_hex_len(s.len()).ok_or(HashError::InvalidHexLength {
            expected: 40,
            actual: s.len(),
        })?;
        match algo {
            HashAlgorithm::Sha1 => {
                let mut arr = [0u8; 20];
                hex::decode_into(s, &mut arr)?;
                Ok(Self::Sha1(arr))
            }
            HashAlgorithm::Sha256 => {
                let mut arr = [0u8; 32];
                hex::decode_into(s, &mut arr)?;
                Ok(Self::Sha256(arr))
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(b) => b,
            Self::Sha256(b) => b,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    /// True for the all-zeros sentinel.
    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// First digest byte, used for fan-out bucketing.
    pub fn first_byte(&self) -> u8 {
        self.as_bytes()[0]
    }

    /// Whether the hex form starts with `prefix` (case-insensitive).
    pub fn starts_with_hex(&self, prefix: &str) -> bool {
        self.to_hex().starts_with(&prefix.to_ascii_lowercase())
    }

    /// Relative loose-object path: `"xx/yyyy..."`.
    pub fn loose_path(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}", &hex[..2], &hex[2..])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..8])
    }
}

impl FromStr for ObjectId {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_BLOB: &str = "ce013625030ba8dba906f756967f9e9ca394464a";

    #[test]
    fn hex_roundtrip() {
        let oid = ObjectId::from_hex(HELLO_BLOB).unwrap();
        assert_eq!(oid.to_hex(), HELLO_BLOB);
        assert_eq!(oid.to_string().parse::<ObjectId>().unwrap(), oid);
    }

    #[test]
    fn null_sentinel() {
        assert!(ObjectId::NULL_SHA1.is_null());
        assert_eq!(
            ObjectId::NULL_SHA1.to_hex(),
            "0000000000000000000000000000000000000000"
        );
        assert!(!ObjectId::from_hex(HELLO_BLOB).unwrap().is_null());
    }

    #[test]
    fn ordering_is_bytewise() {
        let a = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        let b = ObjectId::from_hex("ff00000000000000000000000000000000000000").unwrap();
        assert!(a < b);
    }

    #[test]
    fn from_bytes_length_checked() {
        assert!(matches!(
            ObjectId::from_bytes(&[0u8; 19], HashAlgorithm::Sha1),
            Err(HashError::InvalidDigestLength {
                expected: 20,
                actual: 19
            })
        ));
    }

    #[test]
    fn from_hex_length_checked() {
        assert!(ObjectId::from_hex("abcd").is_err());
        assert!(ObjectId::from_hex("zz013625030ba8dba906f756967f9e9ca394464a").is_err());
    }

    #[test]
    fn loose_path_split() {
        let oid = ObjectId::from_hex(HELLO_BLOB).unwrap();
        assert_eq!(oid.loose_path(), format!("ce/{}", &HELLO_BLOB[2..]));
    }

    #[test]
    fn first_byte_and_prefix() {
        let oid = ObjectId::from_hex(HELLO_BLOB).unwrap();
        assert_eq!(oid.first_byte(), 0xce);
        assert!(oid.starts_with_hex("CE01"));
        assert!(!oid.starts_with_hex("ab"));
    }

    #[test]
    fn debug_is_abbreviated() {
        let oid = ObjectId::from_hex(HELLO_BLOB).unwrap();
        assert_eq!(format!("{oid:?}"), "ObjectId(ce013625)");
    }
}
