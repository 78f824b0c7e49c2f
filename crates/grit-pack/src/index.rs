//! Pack index files.
//!
//! v2 layout (magic `\xfftOc`, version 2):
//!
//! ```text
//! magic + version | 256 x u32 fanout | N x 20-byte sorted OIDs
//! | N x u32 CRC32 | N x u32 offsets (MSB -> large table)
//! | M x u64 large offsets | pack SHA-1 | index SHA-1
//! ```
//!
//! v1 is the legacy layout with no magic: the fanout is followed by N
//! entries of `u32 offset + OID`, with no CRC table and no large offsets.
//! v1 is read-only here; the writer always produces v2.

use std::cmp::Ordering;
use std::io::Write;
use std::path::{Path, PathBuf};

use grit_hash::fanout::Fanout;
use grit_hash::hasher::Hasher;
use grit_hash::{HashAlgorithm, ObjectId};
use memmap2::Mmap;

use crate::{PackError, IDX_SIGNATURE, IDX_VERSION};

const OID_LEN: usize = 20;

/// An open pack index, v1 or v2.
pub struct PackIndex {
    data: Mmap,
    version: u32,
    num_objects: u32,
    /// Offsets of the fixed tables within the file.
    oid_table: usize,
    crc_table: usize,
    offset_table: usize,
    large_offset_table: usize,
    path: PathBuf,
}

impl PackIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PackError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < 1024 + 2 * OID_LEN {
            return Err(PackError::InvalidIndex("file too small".into()));
        }

        let (version, fanout_start) = if data[0..4] == IDX_SIGNATURE {
            let version = read_u32(&data, 4);
            if version != IDX_VERSION {
                return Err(PackError::UnsupportedVersion(version));
            }
            (2, 8)
        } else {
            (1, 0)
        };

        let num_objects = read_u32(&data, fanout_start + 255 * 4);
        let n = num_objects as usize;

        let (oid_table, crc_table, offset_table, large_offset_table, min_len) = match version {
            2 => {
                let oid_table = fanout_start + 1024;
                let crc_table = oid_table + n * OID_LEN;
                let offset_table = crc_table + n * 4;
                let large_offset_table = offset_table + n * 4;
                (
                    oid_table,
                    crc_table,
                    offset_table,
                    large_offset_table,
                    large_offset_table + 2 * OID_LEN,
                )
            }
            _ => {
                // v1: interleaved (offset, oid) entries; table offsets point
                // at the start of the entry array.
                let entries = fanout_start + 1024;
                (
                    entries,
                    0,
                    entries,
                    0,
                    entries + n * (4 + OID_LEN) + 2 * OID_LEN,
                )
            }
        };

        if data.len() < min_len {
            return Err(PackError::InvalidIndex(format!(
                "file too small: {} < {min_len}",
                data.len()
            )));
        }

        // The fanout must be internally consistent.
        Fanout::from_bytes(&data[fanout_start..fanout_start + 1024])
            .map_err(|e| PackError::InvalidIndex(format!("bad fanout: {e}")))?;

        Ok(Self {
            data,
            version,
            num_objects,
            oid_table,
            crc_table,
            offset_table,
            large_offset_table,
            path,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> u32 {
        self.num_objects
    }

    pub fn is_empty(&self) -> bool {
        self.num_objects == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Binary search bounded by the fanout bucket of the first OID byte.
    pub fn lookup(&self, oid: &ObjectId) -> Option<u64> {
        let (mut lo, mut hi) = self.bucket_bounds(oid.first_byte());
        let target = oid.as_bytes();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_bytes(mid).cmp(target) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(self.offset_at(mid as u32)),
            }
        }
        None
    }

    /// All `(oid, offset)` pairs whose OID starts with the given bytes.
    pub fn lookup_prefix(&self, prefix: &[u8]) -> Vec<(ObjectId, u64)> {
        if prefix.is_empty() {
            return Vec::new();
        }
        let (lo, hi) = self.bucket_bounds(prefix[0]);
        (lo..hi)
            .filter(|&i| self.oid_bytes(i).starts_with(prefix))
            .map(|i| (self.oid_at(i as u32), self.offset_at(i as u32)))
            .collect()
    }

    /// OID at sorted position `i`.
    pub fn oid_at(&self, i: u32) -> ObjectId {
        ObjectId::from_bytes(self.oid_bytes(i as usize), HashAlgorithm::Sha1)
            .expect("index OID slice has digest length")
    }

    /// Pack offset at sorted position `i`.
    pub fn offset_at(&self, i: u32) -> u64 {
        match self.version {
            2 => {
                let raw = read_u32(&self.data, self.offset_table + i as usize * 4);
                if raw & 0x8000_0000 != 0 {
                    let slot = (raw & 0x7fff_ffff) as usize;
                    read_u64(&self.data, self.large_offset_table + slot * 8)
                } else {
                    u64::from(raw)
                }
            }
            _ => u64::from(read_u32(&self.data, self.offset_table + i as usize * (4 + OID_LEN))),
        }
    }

    /// CRC32 of the compressed entry at sorted position `i` (v2 only).
    pub fn crc32_at(&self, i: u32) -> Option<u32> {
        match self.version {
            2 => Some(read_u32(&self.data, self.crc_table + i as usize * 4)),
            _ => None,
        }
    }

    /// The pack checksum recorded in the trailer.
    pub fn pack_checksum(&self) -> ObjectId {
        let start = self.data.len() - 2 * OID_LEN;
        ObjectId::from_bytes(&self.data[start..start + OID_LEN], HashAlgorithm::Sha1)
            .expect("trailer slice has digest length")
    }

    /// The index file's own trailing checksum.
    pub fn index_checksum(&self) -> ObjectId {
        let start = self.data.len() - OID_LEN;
        ObjectId::from_bytes(&self.data[start..], HashAlgorithm::Sha1)
            .expect("trailer slice has digest length")
    }

    /// Iterate `(oid, offset, crc32)` in OID order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, u64, Option<u32>)> + '_ {
        (0..self.num_objects).map(|i| (self.oid_at(i), self.offset_at(i), self.crc32_at(i)))
    }

    fn bucket_bounds(&self, first: u8) -> (usize, usize) {
        let fanout_start = if self.version == 2 { 8 } else { 0 };
        let hi = read_u32(&self.data, fanout_start + first as usize * 4) as usize;
        let lo = match first {
            0 => 0,
            _ => read_u32(&self.data, fanout_start + (first as usize - 1) * 4) as usize,
        };
        (lo, hi)
    }

    fn oid_bytes(&self, i: usize) -> &[u8] {
        let start = match self.version {
            2 => self.oid_table + i * OID_LEN,
            // v1 entries are (offset, oid) pairs.
            _ => self.oid_table + i * (4 + OID_LEN) + 4,
        };
        &self.data[start..start + OID_LEN]
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(data[at..at + 4].try_into().expect("4-byte slice"))
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(data[at..at + 8].try_into().expect("8-byte slice"))
}

/// One row destined for an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub oid: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

/// Write a v2 index for `entries` to `out`; returns the index checksum.
///
/// Entries are sorted by OID here; offsets past 2^31 - 1 spill into the
/// large-offset table.
pub fn write_index<W: Write>(
    mut out: W,
    entries: &[IndexEntry],
    pack_checksum: &ObjectId,
) -> Result<ObjectId, PackError> {
    let mut sorted: Vec<&IndexEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.oid.cmp(&b.oid));

    let mut hasher = Hasher::new(HashAlgorithm::Sha1);
    let mut emit = |out: &mut W, bytes: &[u8]| -> Result<(), PackError> {
        out.write_all(bytes)?;
        hasher.update(bytes);
        Ok(())
    };

    emit(&mut out, &IDX_SIGNATURE)?;
    emit(&mut out, &IDX_VERSION.to_be_bytes())?;

    let oids: Vec<ObjectId> = sorted.iter().map(|e| e.oid).collect();
    emit(&mut out, &Fanout::build(&oids).to_bytes())?;

    for entry in &sorted {
        emit(&mut out, entry.oid.as_bytes())?;
    }
    for entry in &sorted {
        emit(&mut out, &entry.crc32.to_be_bytes())?;
    }

    let mut large: Vec<u64> = Vec::new();
    for entry in &sorted {
        if entry.offset < 0x8000_0000 {
            emit(&mut out, &(entry.offset as u32).to_be_bytes())?;
        } else {
            let slot = 0x8000_0000u32 | large.len() as u32;
            emit(&mut out, &slot.to_be_bytes())?;
            large.push(entry.offset);
        }
    }
    for offset in &large {
        emit(&mut out, &offset.to_be_bytes())?;
    }

    emit(&mut out, pack_checksum.as_bytes())?;

    let index_checksum = hasher.finalize()?;
    out.write_all(index_checksum.as_bytes())?;
    Ok(index_checksum)
}

/// Write a v2 index to a file path.
pub fn write_index_file(
    path: impl AsRef<Path>,
    entries: &[IndexEntry],
    pack_checksum: &ObjectId,
) -> Result<ObjectId, PackError> {
    let file = std::fs::File::create(path)?;
    let mut out = std::io::BufWriter::new(file);
    let checksum = write_index(&mut out, entries, pack_checksum)?;
    out.flush()?;
    Ok(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(first: u8, last: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        bytes[19] = last;
        ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
    }

    fn entry(first: u8, last: u8, offset: u64, crc32: u32) -> IndexEntry {
        IndexEntry {
            oid: oid(first, last),
            offset,
            crc32,
        }
    }

    fn write_tmp(entries: &[IndexEntry]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.idx");
        write_index_file(&path, entries, &ObjectId::NULL_SHA1).unwrap();
        (dir, path)
    }

    #[test]
    fn roundtrip_and_lookup() {
        let entries = [
            entry(0x00, 1, 12, 0x11),
            entry(0x00, 2, 300, 0x22),
            entry(0x7f, 1, 77, 0x33),
            entry(0xff, 9, 4242, 0x44),
        ];
        let (_dir, path) = write_tmp(&entries);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.version(), 2);
        assert_eq!(idx.len(), 4);

        for e in &entries {
            assert_eq!(idx.lookup(&e.oid), Some(e.offset));
        }
        assert_eq!(idx.lookup(&oid(0x42, 0x42)), None);
    }

    #[test]
    fn iter_is_sorted_with_crcs() {
        let entries = [
            entry(0xcc, 0, 2, 0xc),
            entry(0xaa, 0, 1, 0xa),
            entry(0xee, 0, 3, 0xe),
        ];
        let (_dir, path) = write_tmp(&entries);
        let idx = PackIndex::open(&path).unwrap();

        let rows: Vec<_> = idx.iter().collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (oid(0xaa, 0), 1, Some(0xa)));
        assert_eq!(rows[1], (oid(0xcc, 0), 2, Some(0xc)));
        assert_eq!(rows[2], (oid(0xee, 0), 3, Some(0xe)));
    }

    #[test]
    fn binary_search_agrees_with_linear_scan() {
        let entries: Vec<IndexEntry> = (0u16..600)
            .map(|i| entry((i % 251) as u8, (i / 251) as u8, u64::from(i) * 7 + 12, 0))
            .collect();
        let (_dir, path) = write_tmp(&entries);
        let idx = PackIndex::open(&path).unwrap();

        for e in &entries {
            let linear = idx
                .iter()
                .find(|(oid, _, _)| oid == &e.oid)
                .map(|(_, off, _)| off);
            assert_eq!(idx.lookup(&e.oid), linear);
        }
    }

    #[test]
    fn large_offsets_spill_to_u64_table() {
        let big = 5 * 1024 * 1024 * 1024u64; // past the 31-bit boundary
        let entries = [entry(0x10, 0, 42, 0), entry(0x20, 0, big, 0)];
        let (_dir, path) = write_tmp(&entries);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.lookup(&oid(0x20, 0)), Some(big));
        assert_eq!(idx.lookup(&oid(0x10, 0)), Some(42));
    }

    #[test]
    fn checksums_recorded() {
        let pack_sha = oid(0xab, 0xcd);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.idx");
        let idx_sha = write_index_file(&path, &[entry(1, 1, 1, 1)], &pack_sha).unwrap();

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.pack_checksum(), pack_sha);
        assert_eq!(idx.index_checksum(), idx_sha);
    }

    #[test]
    fn reads_v1_layout() {
        // Hand-build a v1 index: fanout, then (offset, oid) pairs.
        let entries = [entry(0x05, 1, 11, 0), entry(0x05, 2, 22, 0), entry(0xf0, 1, 33, 0)];
        let mut sorted = entries;
        sorted.sort_by(|a, b| a.oid.cmp(&b.oid));

        let mut buf = Vec::new();
        let oids: Vec<ObjectId> = sorted.iter().map(|e| e.oid).collect();
        buf.extend_from_slice(&Fanout::build(&oids).to_bytes());
        for e in &sorted {
            buf.extend_from_slice(&(e.offset as u32).to_be_bytes());
            buf.extend_from_slice(e.oid.as_bytes());
        }
        buf.extend_from_slice(ObjectId::NULL_SHA1.as_bytes());
        let checksum = Hasher::digest(HashAlgorithm::Sha1, &buf).unwrap();
        buf.extend_from_slice(checksum.as_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.idx");
        std::fs::write(&path, &buf).unwrap();

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.version(), 1);
        assert_eq!(idx.len(), 3);
        for e in &entries {
            assert_eq!(idx.lookup(&e.oid), Some(e.offset));
            // v1 has no CRC table.
        }
        assert_eq!(idx.crc32_at(0), None);
        assert_eq!(idx.index_checksum(), checksum);
    }

    #[test]
    fn empty_index() {
        let (_dir, path) = write_tmp(&[]);
        let idx = PackIndex::open(&path).unwrap();
        assert!(idx.is_empty());
        assert_eq!(idx.lookup(&oid(0, 0)), None);
        assert_eq!(idx.iter().count(), 0);
    }

    #[test]
    fn garbage_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.idx");
        std::fs::write(&path, b"not an index").unwrap();
        assert!(PackIndex::open(&path).is_err());
    }
}
