//! Object identity for the grit git implementation.
//!
//! Provides [`ObjectId`], streaming hash computation with SHA-1 collision
//! detection, hex encoding/decoding, and the fan-out table used by pack
//! indexes.

mod algorithm;
mod error;
pub mod fanout;
pub mod hasher;
pub mod hex;
mod oid;

pub use algorithm::HashAlgorithm;
pub use error::HashError;
pub use oid::ObjectId;
