//! The git object model: blob, tree, commit, and tag.
//!
//! Objects are immutable values addressed by the hash of their canonical
//! serialization. Parsing is strict by default; [`ParseOptions::lenient`]
//! exists for rehydrating historical objects that predate today's
//! validation rules and must round-trip byte-for-byte.

mod blob;
mod commit;
pub mod header;
mod tag;
mod tree;

pub use blob::Blob;
pub use commit::Commit;
pub use tag::Tag;
pub use tree::{FileMode, Tree, TreeEntry};

use bstr::BString;
use grit_hash::{HashAlgorithm, HashError, ObjectId};

/// Errors produced while parsing or serializing objects.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("invalid object type: {0}")]
    InvalidType(BString),

    #[error("invalid object header: {0}")]
    InvalidHeader(String),

    #[error("truncated object: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid tree entry at offset {offset}: {reason}")]
    InvalidTreeEntry { offset: usize, reason: String },

    #[error("invalid commit: missing '{field}' header")]
    MissingCommitField { field: &'static str },

    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    #[error("invalid tag: missing '{field}' header")]
    MissingTagField { field: &'static str },

    #[error("invalid file mode: {0}")]
    InvalidFileMode(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Parsing strictness knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Accept unknown tree modes, unsorted or duplicate tree entries, and
    /// non-UTF-8 identities without an `encoding` header.
    pub lenient: bool,
}

impl ParseOptions {
    pub fn strict() -> Self {
        Self { lenient: false }
    }

    pub fn lenient() -> Self {
        Self { lenient: true }
    }
}

/// The four git object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectType {
    /// Parse the type token used in object headers.
    pub fn from_bytes(s: &[u8]) -> Result<Self, ObjectError> {
        match s {
            b"blob" => Ok(Self::Blob),
            b"tree" => Ok(Self::Tree),
            b"commit" => Ok(Self::Commit),
            b"tag" => Ok(Self::Tag),
            _ => Err(ObjectError::InvalidType(BString::from(s))),
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Blob => b"blob",
            Self::Tree => b"tree",
            Self::Commit => b"commit",
            Self::Tag => b"tag",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// The numeric type used in pack entry headers (1, 2, 3, 4).
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Inverse of [`pack_type`](Self::pack_type).
    pub fn from_pack_type(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectType {
    type Err = ObjectError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

/// A parsed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
    Commit(Commit),
    Tag(Tag),
}

impl Object {
    /// Parse from framed bytes (`"<type> <len>\0<body>"`).
    pub fn parse(data: &[u8]) -> Result<Self, ObjectError> {
        Self::parse_with(data, ParseOptions::strict())
    }

    pub fn parse_with(data: &[u8], opts: ParseOptions) -> Result<Self, ObjectError> {
        let (obj_type, size, header_len) = header::parse_header(data)?;
        let body = &data[header_len..];
        if body.len() < size {
            return Err(ObjectError::Truncated {
                expected: size,
                actual: body.len(),
            });
        }
        Self::parse_body_with(obj_type, &body[..size], opts)
    }

    /// Parse an unframed body with a known type.
    pub fn parse_body(obj_type: ObjectType, body: &[u8]) -> Result<Self, ObjectError> {
        Self::parse_body_with(obj_type, body, ParseOptions::strict())
    }

    pub fn parse_body_with(
        obj_type: ObjectType,
        body: &[u8],
        opts: ParseOptions,
    ) -> Result<Self, ObjectError> {
        match obj_type {
            ObjectType::Blob => Ok(Self::Blob(Blob::new(body))),
            ObjectType::Tree => Ok(Self::Tree(Tree::parse_with(body, opts)?)),
            ObjectType::Commit => Ok(Self::Commit(Commit::parse_with(body, opts)?)),
            ObjectType::Tag => Ok(Self::Tag(Tag::parse(body)?)),
        }
    }

    /// Canonical framed serialization (`"<type> <len>\0<body>"`).
    pub fn serialize(&self) -> Vec<u8> {
        let body = self.serialize_body();
        let hdr = header::write_header(self.object_type(), body.len());
        let mut out = Vec::with_capacity(hdr.len() + body.len());
        out.extend_from_slice(&hdr);
        out.extend_from_slice(&body);
        out
    }

    /// Canonical body without the framing header.
    pub fn serialize_body(&self) -> Vec<u8> {
        match self {
            Self::Blob(b) => b.data.to_vec(),
            Self::Tree(t) => t.serialize_body(),
            Self::Commit(c) => c.serialize_body(),
            Self::Tag(t) => t.serialize_body(),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Blob(_) => ObjectType::Blob,
            Self::Tree(_) => ObjectType::Tree,
            Self::Commit(_) => ObjectType::Commit,
            Self::Tag(_) => ObjectType::Tag,
        }
    }

    /// The OID: the hash of the framed serialization.
    pub fn oid(&self, algo: HashAlgorithm) -> Result<ObjectId, HashError> {
        grit_hash::hasher::Hasher::hash_object(
            algo,
            self.object_type().as_str(),
            &self.serialize_body(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_token_roundtrip() {
        for ty in [
            ObjectType::Blob,
            ObjectType::Tree,
            ObjectType::Commit,
            ObjectType::Tag,
        ] {
            assert_eq!(ObjectType::from_bytes(ty.as_bytes()).unwrap(), ty);
            assert_eq!(ObjectType::from_pack_type(ty.pack_type()), Some(ty));
        }
        assert!(ObjectType::from_bytes(b"bogus").is_err());
        assert_eq!(ObjectType::from_pack_type(6), None);
    }

    #[test]
    fn parse_framed_blob() {
        let obj = Object::parse(b"blob 6\0hello\n").unwrap();
        assert_eq!(obj.object_type(), ObjectType::Blob);
        assert_eq!(obj.serialize(), b"blob 6\0hello\n");
    }

    #[test]
    fn framed_oid_matches_known_value() {
        let obj = Object::parse(b"blob 6\0hello\n").unwrap();
        assert_eq!(
            obj.oid(HashAlgorithm::Sha1).unwrap().to_hex(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
    }

    #[test]
    fn truncated_body_rejected() {
        assert!(matches!(
            Object::parse(b"blob 10\0short"),
            Err(ObjectError::Truncated {
                expected: 10,
                actual: 5
            })
        ));
    }
}
