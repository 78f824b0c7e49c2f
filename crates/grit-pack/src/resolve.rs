//! Dependency-ordered delta resolution.
//!
//! A received pack is a soup of full-text entries and deltas whose bases
//! may sit anywhere in the pack (or, for thin packs, outside it). The
//! resolver scans entry headers once, then yields every object exactly
//! once in dependency order: full texts seed a work stack, and each
//! yielded object unlocks the deltas recorded against its offset and its
//! OID. Delta payloads are re-inflated on demand, so peak memory stays
//! proportional to the chain being worked, not the pack.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use grit_hash::hasher::Hasher;
use grit_hash::{HashAlgorithm, ObjectId};
use grit_object::ObjectType;

use crate::delta::apply_delta;
use crate::index::{write_index_file, IndexEntry};
use crate::pack::PackData;
use crate::write::{write_pack_file, ExternalBase, PackInput, WriteOptions};
use crate::{EntryKind, PackError};

/// One fully materialized object out of a pack.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub offset: u64,
    pub oid: ObjectId,
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    /// CRC32 of the entry's on-disk bytes, as recorded in a v2 index.
    pub crc32: u32,
}

enum Ready {
    /// A full-text entry, not yet inflated.
    Full(u64),
    /// A delta already applied against its base.
    Materialized {
        offset: u64,
        obj_type: ObjectType,
        data: Vec<u8>,
        crc32: u32,
    },
}

/// Iterator yielding each resolved object in dependency order.
pub struct DeltaResolver<'a, F> {
    pack: &'a PackData,
    resolve_ext: F,
    ready: Vec<Ready>,
    pending_by_offset: HashMap<u64, Vec<u64>>,
    pending_by_ref: HashMap<ObjectId, Vec<u64>>,
    /// External bases pulled in while completing a thin pack.
    external_used: Vec<ExternalBase>,
    done: bool,
}

impl<'a, F> DeltaResolver<'a, F>
where
    F: FnMut(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
{
    /// Scan the pack's headers and prepare the work stack.
    pub fn new(pack: &'a PackData, resolve_ext: F) -> Result<Self, PackError> {
        let mut ready = Vec::new();
        let mut pending_by_offset: HashMap<u64, Vec<u64>> = HashMap::new();
        let mut pending_by_ref: HashMap<ObjectId, Vec<u64>> = HashMap::new();

        let mut offset = crate::PACK_HEADER_SIZE as u64;
        for _ in 0..pack.num_objects() {
            // Inflate once just to learn where the next entry starts; the
            // payload itself is dropped here and re-read when needed.
            let entry = pack.entry_at(offset)?;
            match entry.kind {
                EntryKind::Full(_) => ready.push(Ready::Full(offset)),
                EntryKind::OfsDelta { base_offset } => {
                    pending_by_offset.entry(base_offset).or_default().push(offset);
                }
                EntryKind::RefDelta { base_oid } => {
                    pending_by_ref.entry(base_oid).or_default().push(offset);
                }
            }
            offset = entry.end_offset;
        }

        Ok(Self {
            pack,
            resolve_ext,
            ready,
            pending_by_offset,
            pending_by_ref,
            external_used: Vec::new(),
            done: false,
        })
    }

    /// Bases that had to be fetched from outside the pack so far.
    pub fn external_bases(&self) -> &[ExternalBase] {
        &self.external_used
    }

    /// Apply every delta pending on `(offset, oid)` of a just-yielded
    /// object and push the results.
    fn unlock_dependents(
        &mut self,
        offset: Option<u64>,
        oid: &ObjectId,
        obj_type: ObjectType,
        base_data: &[u8],
    ) -> Result<(), PackError> {
        let mut dependents: Vec<u64> = Vec::new();
        if let Some(offset) = offset {
            if let Some(deps) = self.pending_by_offset.remove(&offset) {
                dependents.extend(deps);
            }
        }
        if let Some(deps) = self.pending_by_ref.remove(oid) {
            dependents.extend(deps);
        }

        for dep_offset in dependents {
            let entry = self.pack.entry_at(dep_offset)?;
            let data = apply_delta(base_data, &entry.data)?;
            self.ready.push(Ready::Materialized {
                offset: dep_offset,
                obj_type,
                data,
                crc32: entry.crc32,
            });
        }
        Ok(())
    }

    /// When the in-pack work dries up, the remaining ref-delta bases are
    /// external. Resolve one and push its dependents; errors if none of
    /// the remaining bases can be found.
    fn pull_external(&mut self) -> Result<bool, PackError> {
        let Some(base_oid) = self.pending_by_ref.keys().next().copied() else {
            return Ok(false);
        };

        match (self.resolve_ext)(&base_oid) {
            Some((obj_type, data)) => {
                self.unlock_dependents(None, &base_oid, obj_type, &data)?;
                self.external_used.push(ExternalBase {
                    oid: base_oid,
                    obj_type,
                    data,
                });
                Ok(true)
            }
            None => {
                let mut oids: Vec<ObjectId> = self.pending_by_ref.keys().copied().collect();
                oids.sort();
                Err(PackError::UnresolvedDeltas { oids })
            }
        }
    }

    fn next_inner(&mut self) -> Result<Option<ResolvedEntry>, PackError> {
        loop {
            let Some(item) = self.ready.pop() else {
                if self.pull_external()? {
                    continue;
                }
                return Ok(None);
            };

            let (offset, obj_type, data, crc32) = match item {
                Ready::Full(offset) => {
                    let entry = self.pack.entry_at(offset)?;
                    let EntryKind::Full(obj_type) = entry.kind else {
                        return Err(PackError::CorruptEntry(offset));
                    };
                    (offset, obj_type, entry.data, entry.crc32)
                }
                Ready::Materialized {
                    offset,
                    obj_type,
                    data,
                    crc32,
                } => (offset, obj_type, data, crc32),
            };

            let oid = Hasher::hash_object(HashAlgorithm::Sha1, obj_type.as_str(), &data)?;
            self.unlock_dependents(Some(offset), &oid, obj_type, &data)?;

            return Ok(Some(ResolvedEntry {
                offset,
                oid,
                obj_type,
                data,
                crc32,
            }));
        }
    }
}

impl<F> Iterator for DeltaResolver<'_, F>
where
    F: FnMut(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
{
    type Item = Result<ResolvedEntry, PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_inner() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Resolve a whole pack. Returns the materialized objects plus any
/// external bases that were pulled in.
pub fn resolve_all<F>(
    pack: &PackData,
    resolve_ext: F,
) -> Result<(Vec<ResolvedEntry>, Vec<ExternalBase>), PackError>
where
    F: FnMut(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
{
    let mut resolver = DeltaResolver::new(pack, resolve_ext)?;
    let mut entries = Vec::with_capacity(pack.num_objects() as usize);
    for entry in resolver.by_ref() {
        entries.push(entry?);
    }
    let external = std::mem::take(&mut resolver.external_used);

    if entries.len() != pack.num_objects() as usize {
        // Leftover OFS deltas whose chains never grounded.
        return Err(PackError::CorruptEntry(0));
    }
    Ok((entries, external))
}

/// Index a self-contained pack: resolve everything and write `<pack>.idx`
/// next to it. Returns the index rows.
pub fn index_pack(pack_path: &Path) -> Result<Vec<IndexEntry>, PackError> {
    let data = PackData::open(pack_path)?;
    data.verify_checksum()?;
    let (entries, external) = resolve_all(&data, |_| None)?;
    debug_assert!(external.is_empty());

    let rows: Vec<IndexEntry> = entries
        .iter()
        .map(|e| IndexEntry {
            oid: e.oid,
            offset: e.offset,
            crc32: e.crc32,
        })
        .collect();
    write_index_file(pack_path.with_extension("idx"), &rows, &data.checksum())?;
    Ok(rows)
}

/// Complete a (possibly thin) received pack into the pack directory.
///
/// External REF_DELTA bases are fetched via `resolve_ext` and folded into
/// the rewritten pack so the result is self-contained. The `.pack`/`.idx`
/// pair is staged in tempfiles and renamed into place; nothing is visible
/// until both renames land. Returns the final pack path and its checksum.
pub fn complete_thin_pack<F>(
    data: &PackData,
    resolve_ext: F,
    pack_dir: &Path,
) -> Result<(PathBuf, ObjectId, u32), PackError>
where
    F: FnMut(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
{
    data.verify_checksum()?;
    let (entries, external) = resolve_all(data, resolve_ext)?;

    let mut inputs: Vec<PackInput> = Vec::with_capacity(entries.len() + external.len());
    let mut seen: std::collections::HashSet<ObjectId> = std::collections::HashSet::new();
    for entry in entries {
        if seen.insert(entry.oid) {
            inputs.push(PackInput::new(entry.obj_type, entry.data));
        }
    }
    for base in external {
        if seen.insert(base.oid) {
            inputs.push(PackInput::new(base.obj_type, base.data));
        }
    }
    let count = inputs.len() as u32;

    std::fs::create_dir_all(pack_dir)?;
    let staging = tempfile::tempdir_in(pack_dir)?;
    let tmp_pack = staging.path().join("incoming.pack");
    let (checksum, written) = write_pack_file(&tmp_pack, inputs, &WriteOptions::default())?;

    let rows: Vec<IndexEntry> = written
        .iter()
        .map(|e| IndexEntry {
            oid: e.oid,
            offset: e.offset,
            crc32: e.crc32,
        })
        .collect();
    let tmp_idx = staging.path().join("incoming.idx");
    write_index_file(&tmp_idx, &rows, &checksum)?;

    let final_pack = pack_dir.join(format!("pack-{}.pack", checksum.to_hex()));
    let final_idx = pack_dir.join(format!("pack-{}.idx", checksum.to_hex()));
    // Index first: a pack without an index is invisible, the reverse is a
    // broken store.
    std::fs::rename(&tmp_idx, &final_idx)?;
    std::fs::rename(&tmp_pack, &final_pack)?;

    Ok((final_pack, checksum, count))
}
