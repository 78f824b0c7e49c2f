//! Reading `.pack` files.
//!
//! [`PackData`] gives raw access to a pack byte stream (mmap'd when it
//! came from disk); [`Pack`] pairs it with its index for OID lookup and
//! resolves delta chains on demand.

use std::io::Read;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use flate2::bufread::ZlibDecoder;
use grit_hash::hasher::Hasher;
use grit_hash::{HashAlgorithm, ObjectId};
use grit_object::ObjectType;

use crate::delta::apply_delta;
use crate::entry::{decode_header, EntryHeader};
use crate::index::PackIndex;
use crate::{
    EntryKind, PackError, PackedObject, MAX_DELTA_CHAIN_DEPTH, PACK_HEADER_SIZE, PACK_SIGNATURE,
    PACK_VERSION,
};

enum PackBytes {
    Mapped(memmap2::Mmap),
    Heap(Vec<u8>),
}

impl Deref for PackBytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Heap(v) => v,
        }
    }
}

/// An entry inflated straight out of the pack, delta still unapplied.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub offset: u64,
    pub kind: EntryKind,
    /// Inflated payload: object body, or delta instruction stream.
    pub data: Vec<u8>,
    /// Offset just past this entry's compressed payload.
    pub end_offset: u64,
    /// CRC32 over the entry's on-disk bytes (header + compressed payload).
    pub crc32: u32,
}

/// Raw pack byte stream with header/trailer access.
pub struct PackData {
    bytes: PackBytes,
    num_objects: u32,
    path: Option<PathBuf>,
}

impl PackData {
    /// Open from disk, mmap'd when the platform allows.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PackError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let bytes = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(map) => PackBytes::Mapped(map),
            Err(_) => {
                let mut buf = Vec::new();
                std::io::BufReader::new(file).read_to_end(&mut buf)?;
                PackBytes::Heap(buf)
            }
        };
        Self::new(bytes, Some(path))
    }

    /// Wrap an in-memory pack (a wire-received stream).
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, PackError> {
        Self::new(PackBytes::Heap(data), None)
    }

    fn new(bytes: PackBytes, path: Option<PathBuf>) -> Result<Self, PackError> {
        if bytes.len() < PACK_HEADER_SIZE + 20 {
            return Err(PackError::InvalidHeader("file too small".into()));
        }
        if &bytes[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidHeader("bad PACK signature".into()));
        }
        let version = u32::from_be_bytes(bytes[4..8].try_into().expect("4 bytes"));
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let num_objects = u32::from_be_bytes(bytes[8..12].try_into().expect("4 bytes"));
        Ok(Self {
            bytes,
            num_objects,
            path,
        })
    }

    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The SHA-1 trailer.
    pub fn checksum(&self) -> ObjectId {
        let start = self.bytes.len() - 20;
        ObjectId::from_bytes(&self.bytes[start..], HashAlgorithm::Sha1)
            .expect("trailer slice has digest length")
    }

    /// Recompute the trailer hash over the whole file.
    pub fn verify_checksum(&self) -> Result<(), PackError> {
        let body = &self.bytes[..self.bytes.len() - 20];
        let actual = Hasher::digest(HashAlgorithm::Sha1, body)?;
        let expected = self.checksum();
        if actual != expected {
            return Err(PackError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    /// Decode the header of the entry at `offset` without inflating it.
    pub fn header_at(&self, offset: u64) -> Result<EntryHeader, PackError> {
        if offset as usize >= self.bytes.len() - 20 {
            return Err(PackError::Truncated(offset));
        }
        decode_header(&self.bytes[offset as usize..], offset)
    }

    /// Decode and inflate the entry at `offset`.
    pub fn entry_at(&self, offset: u64) -> Result<RawEntry, PackError> {
        let header = self.header_at(offset)?;
        if header.data_offset as usize > self.bytes.len() - 20 {
            return Err(PackError::Truncated(offset));
        }
        let compressed = &self.bytes[header.data_offset as usize..self.bytes.len() - 20];

        let mut decoder = ZlibDecoder::new(compressed);
        let mut data = Vec::with_capacity(header.inflated_size as usize);
        decoder
            .read_to_end(&mut data)
            .map_err(|_| PackError::CorruptEntry(offset))?;
        if data.len() as u64 != header.inflated_size {
            return Err(PackError::CorruptEntry(offset));
        }
        let end_offset = header.data_offset + decoder.total_in();

        let mut crc = crc32fast::Hasher::new();
        crc.update(&self.bytes[offset as usize..end_offset as usize]);

        Ok(RawEntry {
            offset,
            kind: header.kind,
            data,
            end_offset,
            crc32: crc.finalize(),
        })
    }

    /// Iterate raw entries front to back. The inflater reports how many
    /// input bytes each entry consumed, which is what locates the next one.
    pub fn iter_entries(&self) -> RawEntryIter<'_> {
        RawEntryIter {
            pack: self,
            next_offset: PACK_HEADER_SIZE as u64,
            remaining: self.num_objects,
        }
    }
}

/// Sequential scan over a pack's raw entries.
pub struct RawEntryIter<'a> {
    pack: &'a PackData,
    next_offset: u64,
    remaining: u32,
}

impl Iterator for RawEntryIter<'_> {
    type Item = Result<RawEntry, PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.pack.entry_at(self.next_offset) {
            Ok(entry) => {
                self.next_offset = entry.end_offset;
                Some(Ok(entry))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// A pack file together with its index.
pub struct Pack {
    data: PackData,
    index: PackIndex,
}

impl Pack {
    /// Open `<name>.pack` alongside its `<name>.idx`.
    pub fn open(pack_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let pack_path = pack_path.as_ref();
        let data = PackData::open(pack_path)?;
        let index = PackIndex::open(pack_path.with_extension("idx"))?;
        if index.len() != data.num_objects() {
            return Err(PackError::InvalidHeader(format!(
                "pack has {} objects but index has {}",
                data.num_objects(),
                index.len()
            )));
        }
        Ok(Self { data, index })
    }

    pub fn data(&self) -> &PackData {
        &self.data
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn num_objects(&self) -> u32 {
        self.data.num_objects()
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.index.lookup(oid).is_some()
    }

    /// Materialize an object by OID; `Ok(None)` when not in this pack.
    pub fn read_object(&self, oid: &ObjectId) -> Result<Option<PackedObject>, PackError> {
        self.read_object_with(oid, |_| None)
    }

    /// Like [`read_object`](Self::read_object), consulting `resolve_ext`
    /// for REF_DELTA bases that live outside this pack.
    pub fn read_object_with(
        &self,
        oid: &ObjectId,
        resolve_ext: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self.resolve_at_with(offset, resolve_ext).map(Some),
            None => Ok(None),
        }
    }

    /// Cached variant of [`read_object`](Self::read_object).
    pub fn read_object_cached(
        &self,
        oid: &ObjectId,
        cache: &mut dyn ResolveCache,
    ) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self.resolve_at_cached(offset, |_| None, cache).map(Some),
            None => Ok(None),
        }
    }

    /// Materialize the object at a pack offset, walking its delta chain.
    pub fn resolve_at(&self, offset: u64) -> Result<PackedObject, PackError> {
        self.resolve_at_with(offset, |_| None)
    }

    pub fn resolve_at_with(
        &self,
        offset: u64,
        resolve_ext: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<PackedObject, PackError> {
        self.resolve_at_cached(offset, resolve_ext, &mut NoCache)
    }

    /// Chain walk is iterative: deltas stack up until a full-text base is
    /// reached, then apply in reverse. A cache hit anywhere along the
    /// descent short-circuits it; the final result is offered back to the
    /// cache since deep chains revisit the same bases. Depth is bounded to
    /// catch cycles in corrupt packs.
    pub fn resolve_at_cached(
        &self,
        offset: u64,
        resolve_ext: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
        cache: &mut dyn ResolveCache,
    ) -> Result<PackedObject, PackError> {
        let mut deltas: Vec<Vec<u8>> = Vec::new();
        let mut current = offset;

        for _ in 0..MAX_DELTA_CHAIN_DEPTH {
            if let Some((obj_type, base)) = cache.get(current) {
                let resolved = PackedObject {
                    obj_type,
                    data: unwind_deltas(base, &deltas)?,
                };
                cache.put(offset, resolved.obj_type, &resolved.data);
                return Ok(resolved);
            }

            let entry = self.data.entry_at(current)?;
            match entry.kind {
                EntryKind::Full(obj_type) => {
                    cache.put(current, obj_type, &entry.data);
                    let resolved = PackedObject {
                        obj_type,
                        data: unwind_deltas(entry.data, &deltas)?,
                    };
                    cache.put(offset, resolved.obj_type, &resolved.data);
                    return Ok(resolved);
                }
                EntryKind::OfsDelta { base_offset } => {
                    deltas.push(entry.data);
                    current = base_offset;
                }
                EntryKind::RefDelta { base_oid } => {
                    deltas.push(entry.data);
                    match self.index.lookup(&base_oid) {
                        Some(base_offset) => current = base_offset,
                        None => {
                            let (obj_type, base) = resolve_ext(&base_oid)
                                .ok_or(PackError::MissingBase(base_oid))?;
                            let resolved = PackedObject {
                                obj_type,
                                data: unwind_deltas(base, &deltas)?,
                            };
                            cache.put(offset, resolved.obj_type, &resolved.data);
                            return Ok(resolved);
                        }
                    }
                }
            }
        }

        Err(PackError::DeltaChainTooDeep {
            offset,
            max_depth: MAX_DELTA_CHAIN_DEPTH,
        })
    }

    /// Full integrity pass: trailer checksum, per-entry CRC32 against the
    /// index (v2), and resolvability of every object.
    pub fn verify(&self) -> Result<(), PackError> {
        self.data.verify_checksum()?;
        for (oid, offset, crc32) in self.index.iter() {
            let entry = self.data.entry_at(offset)?;
            if let Some(expected) = crc32 {
                if entry.crc32 != expected {
                    return Err(PackError::InvalidIndex(format!(
                        "CRC mismatch for {oid} at offset {offset}"
                    )));
                }
            }
            let resolved = self.resolve_at(offset)?;
            let actual = resolved.oid()?;
            if actual != oid {
                return Err(PackError::ChecksumMismatch {
                    expected: oid,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Read exactly one pack off a live byte stream, without waiting for EOF.
///
/// The wire gives no length up front: the header says how many entries
/// follow, each entry's zlib stream is self-terminating, and 20 trailer
/// bytes close the pack. Anything after the trailer is left unread in the
/// stream (receive-pack keeps talking on the same connection). Returns the
/// verbatim pack bytes.
pub fn read_pack_stream(reader: &mut dyn Read) -> Result<Vec<u8>, PackError> {
    let mut header = [0u8; PACK_HEADER_SIZE];
    reader.read_exact(&mut header)?;
    if &header[0..4] != PACK_SIGNATURE {
        return Err(PackError::InvalidHeader("bad PACK signature".into()));
    }
    let version = u32::from_be_bytes(header[4..8].try_into().expect("4 bytes"));
    if version != PACK_VERSION {
        return Err(PackError::UnsupportedVersion(version));
    }
    let count = u32::from_be_bytes(header[8..12].try_into().expect("4 bytes"));

    let mut out = header.to_vec();
    let mut stream = ByteReader::new(reader);

    for _ in 0..count {
        let entry_start = out.len() as u64;

        // Entry header: size varint with MSB continuation.
        let mut byte = stream.next(&mut out, entry_start)?;
        let type_num = (byte >> 4) & 0x07;
        while byte & 0x80 != 0 {
            byte = stream.next(&mut out, entry_start)?;
        }

        match type_num {
            crate::OFS_DELTA => {
                let mut b = stream.next(&mut out, entry_start)?;
                while b & 0x80 != 0 {
                    b = stream.next(&mut out, entry_start)?;
                }
            }
            crate::REF_DELTA => {
                let mut base = [0u8; 20];
                stream
                    .read_exact_tail(&mut base)
                    .map_err(|_| PackError::Truncated(entry_start))?;
                out.extend_from_slice(&base);
            }
            1..=4 => {}
            _ => return Err(PackError::CorruptEntry(entry_start)),
        }

        // The zlib stream ends itself; inflate until it says so, copying
        // the consumed compressed bytes verbatim.
        let mut inflate = flate2::Decompress::new(true);
        let mut scratch = [0u8; 8192];
        loop {
            let chunk = stream.peek()?;
            if chunk.is_empty() {
                return Err(PackError::Truncated(entry_start));
            }
            let before_in = inflate.total_in();
            let status = inflate
                .decompress(chunk, &mut scratch, flate2::FlushDecompress::None)
                .map_err(|_| PackError::CorruptEntry(entry_start))?;
            let used = (inflate.total_in() - before_in) as usize;
            out.extend_from_slice(&chunk[..used]);
            stream.consume(used);
            if status == flate2::Status::StreamEnd {
                break;
            }
        }
    }

    let mut trailer = [0u8; 20];
    // Buffered bytes first, then the stream.
    stream.read_exact_tail(&mut trailer)?;
    out.extend_from_slice(&trailer);
    Ok(out)
}

/// Minimal pull buffer over a `Read` for the streaming pack parser.
struct ByteReader<'a> {
    reader: &'a mut dyn Read,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(reader: &'a mut dyn Read) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn fill(&mut self) -> Result<usize, PackError> {
        if self.pos == self.buf.len() {
            self.buf.resize(8192, 0);
            self.pos = 0;
            let n = self.reader.read(&mut self.buf)?;
            self.buf.truncate(n);
            return Ok(n);
        }
        Ok(self.buf.len() - self.pos)
    }

    fn next(&mut self, out: &mut Vec<u8>, at: u64) -> Result<u8, PackError> {
        if self.fill()? == 0 {
            return Err(PackError::Truncated(at));
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        out.push(byte);
        Ok(byte)
    }

    fn peek(&mut self) -> Result<&[u8], PackError> {
        self.fill()?;
        Ok(&self.buf[self.pos..])
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
    }

    fn read_exact_tail(&mut self, target: &mut [u8]) -> Result<(), PackError> {
        let mut filled = 0;
        while filled < target.len() {
            if self.fill()? == 0 {
                return Err(PackError::Truncated(0));
            }
            let available = self.buf.len() - self.pos;
            let take = available.min(target.len() - filled);
            target[filled..filled + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(())
    }
}

/// Cache of materialized objects keyed by entry offset, shared across
/// reads so delta chains do not repeatedly re-inflate their bases.
pub trait ResolveCache {
    fn get(&mut self, offset: u64) -> Option<(ObjectType, Vec<u8>)>;
    fn put(&mut self, offset: u64, obj_type: ObjectType, data: &[u8]);
}

/// The do-nothing cache.
pub struct NoCache;

impl ResolveCache for NoCache {
    fn get(&mut self, _offset: u64) -> Option<(ObjectType, Vec<u8>)> {
        None
    }

    fn put(&mut self, _offset: u64, _obj_type: ObjectType, _data: &[u8]) {}
}

/// Apply stacked deltas innermost-base first.
fn unwind_deltas(base: Vec<u8>, deltas: &[Vec<u8>]) -> Result<Vec<u8>, PackError> {
    let mut data = base;
    for delta in deltas.iter().rev() {
        data = apply_delta(&data, delta)?;
    }
    Ok(data)
}
