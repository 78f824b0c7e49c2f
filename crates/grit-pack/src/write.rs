//! Streaming pack assembly.
//!
//! Objects are sorted by (type, path hint, size) so that likely delta
//! relatives sit next to each other, then each object is tried against a
//! sliding window of previously written same-type objects. The pack is
//! written strictly front to back (header, entries, SHA-1 trailer), so the
//! same code serves files and wire streams; OFS_DELTA bases always precede
//! their dependents because the window only ever looks backward.

use std::io::Write;
use std::path::Path;

use bstr::BString;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use grit_hash::hasher::Hasher;
use grit_hash::{HashAlgorithm, ObjectId};
use grit_object::ObjectType;

use crate::delta::compute_delta;
use crate::entry::{encode_header, encode_ofs_offset};
use crate::{PackError, PACK_SIGNATURE, PACK_VERSION, REF_DELTA};

/// One object to be packed.
#[derive(Debug, Clone)]
pub struct PackInput {
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    /// Last path component the object was seen at; groups delta relatives.
    pub path_hint: Option<BString>,
    /// The already-deflated body, when the caller pulled this entry out
    /// of an existing pack; reused verbatim unless a delta wins.
    pub compressed: Option<Vec<u8>>,
}

impl PackInput {
    pub fn new(obj_type: ObjectType, data: Vec<u8>) -> Self {
        Self {
            obj_type,
            data,
            path_hint: None,
            compressed: None,
        }
    }

    pub fn with_hint(obj_type: ObjectType, data: Vec<u8>, hint: Option<BString>) -> Self {
        Self {
            obj_type,
            data,
            path_hint: hint,
            compressed: None,
        }
    }

    pub fn with_compressed(mut self, compressed: Vec<u8>) -> Self {
        self.compressed = Some(compressed);
        self
    }
}

/// Knobs for pack generation.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// How many previous same-type objects to try as delta bases.
    pub window_size: usize,
    /// Master switch for deltification.
    pub delta: bool,
    /// Allow offset-addressed bases (REF_DELTA otherwise).
    pub ofs_delta: bool,
    /// Pass through pre-compressed bodies instead of re-deflating.
    pub reuse_compressed: bool,
    /// zlib level 0..=9, or -1 for the library default.
    pub compression_level: i32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            window_size: 10,
            delta: true,
            ofs_delta: true,
            reuse_compressed: true,
            compression_level: -1,
        }
    }
}

impl WriteOptions {
    pub fn no_delta() -> Self {
        Self {
            delta: false,
            ..Self::default()
        }
    }

    fn compression(&self) -> Compression {
        match self.compression_level {
            -1 => Compression::default(),
            n => Compression::new(n.clamp(0, 9) as u32),
        }
    }
}

/// Index-building record for one written entry.
#[derive(Debug, Clone, Copy)]
pub struct WrittenEntry {
    pub oid: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

/// An external delta base the receiver is known to hold (thin packs only).
#[derive(Debug, Clone)]
pub struct ExternalBase {
    pub oid: ObjectId,
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
}

struct WindowSlot {
    oid: ObjectId,
    obj_type: ObjectType,
    data: Vec<u8>,
    /// `None` for external (thin) bases.
    offset: Option<u64>,
}

/// Write a self-contained pack. Returns the trailer checksum and the
/// entries for index construction.
pub fn write_pack<W: Write>(
    out: W,
    inputs: Vec<PackInput>,
    opts: &WriteOptions,
) -> Result<(ObjectId, Vec<WrittenEntry>), PackError> {
    write_pack_inner(out, inputs, Vec::new(), opts)
}

/// Write a thin pack: deltas may reference `external_bases` by OID without
/// including them. Only valid on the wire, never on disk.
pub fn write_thin_pack<W: Write>(
    out: W,
    inputs: Vec<PackInput>,
    external_bases: Vec<ExternalBase>,
    opts: &WriteOptions,
) -> Result<(ObjectId, Vec<WrittenEntry>), PackError> {
    write_pack_inner(out, inputs, external_bases, opts)
}

/// Convenience wrapper writing to a file path.
pub fn write_pack_file(
    path: impl AsRef<Path>,
    inputs: Vec<PackInput>,
    opts: &WriteOptions,
) -> Result<(ObjectId, Vec<WrittenEntry>), PackError> {
    let file = std::fs::File::create(path)?;
    let mut out = std::io::BufWriter::new(file);
    let result = write_pack(&mut out, inputs, opts)?;
    out.flush()?;
    Ok(result)
}

fn write_pack_inner<W: Write>(
    out: W,
    mut inputs: Vec<PackInput>,
    external_bases: Vec<ExternalBase>,
    opts: &WriteOptions,
) -> Result<(ObjectId, Vec<WrittenEntry>), PackError> {
    // Delta relatives cluster: same type, then same path hint, larger first
    // (deltas against larger bases tend to be mostly copies).
    inputs.sort_by(|a, b| {
        (a.obj_type.pack_type(), &a.path_hint, b.data.len())
            .cmp(&(b.obj_type.pack_type(), &b.path_hint, a.data.len()))
    });

    let mut writer = CountingHashWriter::new(out);
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(PACK_SIGNATURE);
    header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
    header[8..12].copy_from_slice(&(inputs.len() as u32).to_be_bytes());
    writer.write_all(&header)?;

    let mut window: Vec<WindowSlot> = external_bases
        .into_iter()
        .map(|b| WindowSlot {
            oid: b.oid,
            obj_type: b.obj_type,
            data: b.data,
            offset: None,
        })
        .collect();

    let mut entries = Vec::with_capacity(inputs.len());

    for input in inputs {
        let oid = Hasher::hash_object(HashAlgorithm::Sha1, input.obj_type.as_str(), &input.data)?;
        let offset = writer.position();

        let best = if opts.delta {
            best_delta(&window, &input, opts)
        } else {
            None
        };

        let mut crc = crc32fast::Hasher::new();
        match best {
            Some((base_index, delta)) => {
                let base = &window[base_index];
                match base.offset {
                    Some(base_offset) if opts.ofs_delta => {
                        let hdr = encode_header(crate::OFS_DELTA, delta.len() as u64);
                        let ofs = encode_ofs_offset(offset - base_offset);
                        crc.update(&hdr);
                        crc.update(&ofs);
                        writer.write_all(&hdr)?;
                        writer.write_all(&ofs)?;
                    }
                    _ => {
                        let hdr = encode_header(REF_DELTA, delta.len() as u64);
                        crc.update(&hdr);
                        crc.update(base.oid.as_bytes());
                        writer.write_all(&hdr)?;
                        writer.write_all(base.oid.as_bytes())?;
                    }
                }
                let compressed = deflate(&delta, opts.compression())?;
                crc.update(&compressed);
                writer.write_all(&compressed)?;
            }
            None => {
                let hdr = encode_header(input.obj_type.pack_type(), input.data.len() as u64);
                crc.update(&hdr);
                writer.write_all(&hdr)?;
                let compressed = match (&input.compressed, opts.reuse_compressed) {
                    (Some(cached), true) => cached.clone(),
                    _ => deflate(&input.data, opts.compression())?,
                };
                crc.update(&compressed);
                writer.write_all(&compressed)?;
            }
        }

        entries.push(WrittenEntry {
            oid,
            offset,
            crc32: crc.finalize(),
        });

        window.push(WindowSlot {
            oid,
            obj_type: input.obj_type,
            data: input.data,
            offset: Some(offset),
        });
        if window.len() > opts.window_size.max(1) * 4 {
            window.remove(0);
        }
    }

    let checksum = writer.finish()?;
    Ok((checksum, entries))
}

/// Try up to `window_size` previous same-type objects; keep the shortest
/// delta, and only if it beats half the full-text size.
fn best_delta(
    window: &[WindowSlot],
    input: &PackInput,
    opts: &WriteOptions,
) -> Option<(usize, Vec<u8>)> {
    let threshold = input.data.len() / 2;
    let mut best: Option<(usize, Vec<u8>)> = None;

    let candidates = window
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, slot)| slot.obj_type == input.obj_type)
        .take(opts.window_size);

    for (i, slot) in candidates {
        let delta = compute_delta(&slot.data, &input.data);
        if delta.len() >= threshold {
            continue;
        }
        match best {
            Some((_, ref current)) if current.len() <= delta.len() => {}
            _ => best = Some((i, delta)),
        }
    }
    best
}

fn deflate(data: &[u8], level: Compression) -> Result<Vec<u8>, PackError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Tees everything written into a SHA-1 hasher and tracks the position so
/// entry offsets are known without seeking.
struct CountingHashWriter<W> {
    inner: W,
    hasher: Hasher,
    position: u64,
}

impl<W: Write> CountingHashWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(HashAlgorithm::Sha1),
            position: 0,
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    /// Write the trailer (the running hash) and return it.
    fn finish(mut self) -> Result<ObjectId, PackError> {
        let checksum = self.hasher.finalize()?;
        self.inner.write_all(checksum.as_bytes())?;
        self.inner.flush()?;
        Ok(checksum)
    }
}

impl<W: Write> Write for CountingHashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
