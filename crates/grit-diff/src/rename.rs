//! Rename and copy detection over tree change lists.
//!
//! Exact matches (same OID) pair first. The remaining add/delete pairs are
//! scored by content similarity: both blobs are cut into blocks of at most
//! 64 bytes, split at newlines, and the score is the byte volume of shared
//! block hashes over the larger blob's size, scaled to 0..=100.

use std::collections::HashMap;

use grit_hash::ObjectId;
use grit_object::Object;
use grit_odb::ObjectDatabase;

use crate::{ChangeKind, DiffError, TreeChange};

/// Scores are 0..=100.
const MAX_SCORE: u32 = 100;

/// Block length cap for the similarity hash.
const BLOCK_LEN: usize = 64;

/// Tuning for rename detection.
#[derive(Debug, Clone)]
pub struct RenameConfig {
    /// Minimum similarity for an add/delete pair to become a rename.
    pub rename_threshold: u8,
    /// Content scoring is skipped (exact matches only) when either side
    /// exceeds this many files.
    pub max_files: usize,
    /// When set, a modify scoring below this is split into delete + add.
    pub rewrite_threshold: Option<u8>,
    /// Also consider unmodified files as copy sources.
    pub find_copies_harder: bool,
}

impl Default for RenameConfig {
    fn default() -> Self {
        Self {
            rename_threshold: 60,
            max_files: 200,
            rewrite_threshold: None,
            find_copies_harder: false,
        }
    }
}

/// Rewrites a change list, promoting add/delete pairs to renames and
/// copies.
pub struct RenameDetector<'a> {
    db: &'a ObjectDatabase,
    config: RenameConfig,
}

impl<'a> RenameDetector<'a> {
    pub fn new(db: &'a ObjectDatabase) -> Self {
        Self::with_config(db, RenameConfig::default())
    }

    pub fn with_config(db: &'a ObjectDatabase, config: RenameConfig) -> Self {
        Self { db, config }
    }

    pub fn detect(&self, changes: Vec<TreeChange>) -> Result<Vec<TreeChange>, DiffError> {
        let mut deletes: Vec<TreeChange> = Vec::new();
        let mut adds: Vec<TreeChange> = Vec::new();
        let mut rest: Vec<TreeChange> = Vec::new();

        for change in changes {
            match change.kind {
                ChangeKind::Delete => deletes.push(change),
                ChangeKind::Add => adds.push(change),
                ChangeKind::Modify => {
                    if let Some(split) = self.try_split_rewrite(&change)? {
                        let (delete, add) = split;
                        deletes.push(delete);
                        adds.push(add);
                    } else {
                        rest.push(change);
                    }
                }
                _ => rest.push(change),
            }
        }

        let mut out = rest;
        self.pair_exact(&mut deletes, &mut adds, &mut out);

        let oversized =
            deletes.len() > self.config.max_files || adds.len() > self.config.max_files;
        if !oversized {
            self.pair_by_content(&mut deletes, &mut adds, &mut out)?;
        }
        if self.config.find_copies_harder && !oversized {
            self.find_copies(&out.clone(), &mut adds, &mut out)?;
        }

        out.extend(deletes);
        out.extend(adds);
        out.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(out)
    }

    /// A modify below the rewrite threshold becomes delete + add so the
    /// halves can pair with better partners.
    fn try_split_rewrite(
        &self,
        change: &TreeChange,
    ) -> Result<Option<(TreeChange, TreeChange)>, DiffError> {
        let Some(threshold) = self.config.rewrite_threshold else {
            return Ok(None);
        };
        let (Some(old), Some(new)) = (&change.old, &change.new) else {
            return Ok(None);
        };
        let score = self.score(&old.oid, &new.oid)?;
        if score < u32::from(threshold) {
            Ok(Some((
                TreeChange::delete(old.clone()),
                TreeChange::add(new.clone()),
            )))
        } else {
            Ok(None)
        }
    }

    /// Same-OID pairing; leftovers matching an already-consumed delete
    /// become copies.
    fn pair_exact(
        &self,
        deletes: &mut Vec<TreeChange>,
        adds: &mut Vec<TreeChange>,
        out: &mut Vec<TreeChange>,
    ) {
        let mut delete_by_oid: HashMap<ObjectId, TreeChange> = HashMap::new();
        let mut consumed: HashMap<ObjectId, TreeChange> = HashMap::new();
        for delete in deletes.drain(..) {
            let oid = delete.old.as_ref().expect("delete has old side").oid;
            delete_by_oid.entry(oid).or_insert(delete);
        }

        let mut remaining_adds = Vec::new();
        for add in adds.drain(..) {
            let oid = add.new.as_ref().expect("add has new side").oid;
            if let Some(delete) = delete_by_oid.remove(&oid) {
                let rename = TreeChange {
                    kind: ChangeKind::Rename,
                    old: delete.old.clone(),
                    new: add.new,
                    similarity: Some(MAX_SCORE as u8),
                };
                consumed.insert(oid, delete);
                out.push(rename);
            } else if let Some(source) = consumed.get(&oid) {
                // Second add of the same content: a copy of the old path.
                out.push(TreeChange {
                    kind: ChangeKind::Copy,
                    old: source.old.clone(),
                    new: add.new,
                    similarity: Some(MAX_SCORE as u8),
                });
            } else {
                remaining_adds.push(add);
            }
        }

        *adds = remaining_adds;
        deletes.extend(delete_by_oid.into_values());
        deletes.sort_by(|a, b| a.path().cmp(b.path()));
    }

    /// Score all remaining pairs, best first, greedily pairing above the
    /// threshold.
    fn pair_by_content(
        &self,
        deletes: &mut Vec<TreeChange>,
        adds: &mut Vec<TreeChange>,
        out: &mut Vec<TreeChange>,
    ) -> Result<(), DiffError> {
        if deletes.is_empty() || adds.is_empty() {
            return Ok(());
        }

        let mut scored: Vec<(u32, usize, usize)> = Vec::new();
        for (di, delete) in deletes.iter().enumerate() {
            let old = delete.old.as_ref().expect("delete has old side");
            for (ai, add) in adds.iter().enumerate() {
                let new = add.new.as_ref().expect("add has new side");
                if old.mode.is_blob() != new.mode.is_blob() {
                    continue;
                }
                let score = self.score(&old.oid, &new.oid)?;
                if score >= u32::from(self.config.rename_threshold) {
                    scored.push((score, di, ai));
                }
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut used_deletes = vec![false; deletes.len()];
        let mut used_adds = vec![false; adds.len()];
        for (score, di, ai) in scored {
            if used_deletes[di] || used_adds[ai] {
                continue;
            }
            used_deletes[di] = true;
            used_adds[ai] = true;
            out.push(TreeChange {
                kind: ChangeKind::Rename,
                old: deletes[di].old.clone(),
                new: adds[ai].new.clone(),
                similarity: Some(score as u8),
            });
        }

        let mut di = 0;
        deletes.retain(|_| {
            let keep = !used_deletes[di];
            di += 1;
            keep
        });
        let mut ai = 0;
        adds.retain(|_| {
            let keep = !used_adds[ai];
            ai += 1;
            keep
        });
        Ok(())
    }

    /// Copy sources among unchanged/modified survivors for the adds that
    /// found no rename partner.
    fn find_copies(
        &self,
        sources: &[TreeChange],
        adds: &mut Vec<TreeChange>,
        out: &mut Vec<TreeChange>,
    ) -> Result<(), DiffError> {
        let mut remaining = Vec::new();
        'adds: for add in adds.drain(..) {
            let new = add.new.as_ref().expect("add has new side");
            for source in sources {
                let Some(src) = source.old.as_ref() else {
                    continue;
                };
                let score = self.score(&src.oid, &new.oid)?;
                if score >= u32::from(self.config.rename_threshold) {
                    out.push(TreeChange {
                        kind: ChangeKind::Copy,
                        old: Some(src.clone()),
                        new: add.new,
                        similarity: Some(score as u8),
                    });
                    continue 'adds;
                }
            }
            remaining.push(add);
        }
        *adds = remaining;
        Ok(())
    }

    fn score(&self, old: &ObjectId, new: &ObjectId) -> Result<u32, DiffError> {
        if old == new {
            return Ok(MAX_SCORE);
        }
        let old_data = self.read_blob(old)?;
        let new_data = self.read_blob(new)?;
        Ok(similarity_score(&old_data, &new_data))
    }

    fn read_blob(&self, oid: &ObjectId) -> Result<Vec<u8>, DiffError> {
        match self.db.get_required(oid)? {
            Object::Blob(blob) => Ok(blob.data.to_vec()),
            _ => Err(DiffError::NotABlob(*oid)),
        }
    }
}

/// Similarity of two byte strings, 0..=100.
pub fn similarity_score(old: &[u8], new: &[u8]) -> u32 {
    let max_size = old.len().max(new.len());
    if max_size == 0 {
        return MAX_SCORE;
    }

    let old_blocks = count_blocks(old);
    let new_blocks = count_blocks(new);

    let mut common: u64 = 0;
    for (hash, old_bytes) in &old_blocks {
        if let Some(new_bytes) = new_blocks.get(hash) {
            common += u64::from(*old_bytes.min(new_bytes));
        }
    }
    (common * u64::from(MAX_SCORE) / max_size as u64) as u32
}

/// Cut `data` into blocks of at most [`BLOCK_LEN`] bytes, split at
/// newlines, and tally bytes per block hash. FNV-1a keeps the hash
/// deterministic across platforms.
fn count_blocks(data: &[u8]) -> HashMap<u64, u32> {
    let mut counts: HashMap<u64, u32> = HashMap::new();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut len: u32 = 0;

    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        len += 1;
        if byte == b'\n' || len == BLOCK_LEN as u32 {
            *counts.entry(hash).or_insert(0) += len;
            hash = 0xcbf2_9ce4_8422_2325;
            len = 0;
        }
    }
    if len > 0 {
        *counts.entry(hash).or_insert(0) += len;
    }
    counts
}
