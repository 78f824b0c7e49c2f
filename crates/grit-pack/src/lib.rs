//! The pack engine.
//!
//! Packs are the container format for many delta-compressed objects, both
//! on disk (`objects/pack/*.pack` + `.idx`) and on the wire (fetch/push).
//! This crate covers the v2 pack format, the v1/v2 index formats, the
//! copy/insert delta codec, streaming pack assembly, and dependency-ordered
//! delta-chain resolution including thin-pack completion.

pub mod delta;
pub mod entry;
pub mod index;
pub mod pack;
pub mod resolve;
pub mod write;

use grit_hash::ObjectId;
use grit_object::ObjectType;

/// Errors from pack operations.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("invalid pack header: {0}")]
    InvalidHeader(String),

    #[error("invalid pack index: {0}")]
    InvalidIndex(String),

    #[error("unsupported pack version: {0}")]
    UnsupportedVersion(u32),

    #[error("pack truncated at offset {0}")]
    Truncated(u64),

    #[error("corrupt pack entry at offset {0}")]
    CorruptEntry(u64),

    #[error("invalid delta at offset {offset}: {reason}")]
    InvalidDelta { offset: u64, reason: String },

    #[error("delta base not found: {0}")]
    MissingBase(ObjectId),

    #[error("delta chain too deep (more than {max_depth}) at offset {offset}")]
    DeltaChainTooDeep { offset: u64, max_depth: usize },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: ObjectId, actual: ObjectId },

    #[error("deltas with unresolved external bases: {oids:?}")]
    UnresolvedDeltas { oids: Vec<ObjectId> },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Object(#[from] grit_object::ObjectError),

    #[error(transparent)]
    Hash(#[from] grit_hash::HashError),
}

/// How a pack entry stores its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Full zlib-deflated object of the given type.
    Full(ObjectType),
    /// Delta whose base lives earlier in the same pack.
    OfsDelta { base_offset: u64 },
    /// Delta whose base is named by OID (possibly outside the pack).
    RefDelta { base_oid: ObjectId },
}

impl EntryKind {
    /// The numeric type stored in the entry header.
    pub fn type_number(&self) -> u8 {
        match self {
            Self::Full(ty) => ty.pack_type(),
            Self::OfsDelta { .. } => OFS_DELTA,
            Self::RefDelta { .. } => REF_DELTA,
        }
    }
}

/// A fully materialized object read out of a pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedObject {
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
}

impl PackedObject {
    /// The OID of the materialized object.
    pub fn oid(&self) -> Result<ObjectId, PackError> {
        Ok(grit_hash::hasher::Hasher::hash_object(
            grit_hash::HashAlgorithm::Sha1,
            self.obj_type.as_str(),
            &self.data,
        )?)
    }
}

/// Pack format constants.
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_SIZE: usize = 12;

/// Entry type numbers for the two delta encodings.
pub const OFS_DELTA: u8 = 6;
pub const REF_DELTA: u8 = 7;

/// Index constants. v1 has no signature; a file starting with the v2 magic
/// is v2, anything else is read as v1.
pub const IDX_SIGNATURE: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];
pub const IDX_VERSION: u32 = 2;

/// Bail-out depth for corrupt chains; honest packs stay far below this.
pub const MAX_DELTA_CHAIN_DEPTH: usize = 512;
