//! Delta computation.
//!
//! Indexes every 16-byte window of the source, then scans the target:
//! a window found in the index becomes a copy (greedily extended forward),
//! everything else accumulates into insert runs. The minimum match length
//! of 16 always beats the at-most-8-byte cost of a copy instruction, so a
//! found match is always worth emitting.

use std::collections::HashMap;

use super::{encode_copy, encode_insert, write_size, MAX_COPY_LEN, MAX_INSERT_LEN};

/// Window size for source indexing.
const BLOCK_SIZE: usize = 16;

/// Compute a delta transforming `source` into `target`.
pub fn compute_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    let mut delta = write_size(source.len());
    delta.extend_from_slice(&write_size(target.len()));

    if target.is_empty() {
        return delta;
    }

    let index = index_source(source);

    let mut pending: Vec<u8> = Vec::new();
    let mut tpos = 0;
    while tpos < target.len() {
        if target.len() - tpos >= BLOCK_SIZE {
            if let Some(&src_off) = index.get(&target[tpos..tpos + BLOCK_SIZE]) {
                let len = extend_match(source, src_off, target, tpos);
                flush_inserts(&mut delta, &mut pending);
                emit_copy(&mut delta, src_off, len);
                tpos += len;
                continue;
            }
        }

        pending.push(target[tpos]);
        tpos += 1;
        if pending.len() == MAX_INSERT_LEN {
            flush_inserts(&mut delta, &mut pending);
        }
    }
    flush_inserts(&mut delta, &mut pending);

    delta
}

/// Map each BLOCK_SIZE window of the source to its earliest offset.
fn index_source(source: &[u8]) -> HashMap<&[u8], usize> {
    let mut index = HashMap::new();
    if source.len() >= BLOCK_SIZE {
        for offset in 0..=source.len() - BLOCK_SIZE {
            index
                .entry(&source[offset..offset + BLOCK_SIZE])
                .or_insert(offset);
        }
    }
    index
}

/// Extend a BLOCK_SIZE match forward as far as the data agrees.
fn extend_match(source: &[u8], src_off: usize, target: &[u8], tgt_off: usize) -> usize {
    let max = (source.len() - src_off).min(target.len() - tgt_off);
    let mut len = BLOCK_SIZE;
    while len < max && source[src_off + len] == target[tgt_off + len] {
        len += 1;
    }
    len
}

fn flush_inserts(delta: &mut Vec<u8>, pending: &mut Vec<u8>) {
    for chunk in pending.chunks(MAX_INSERT_LEN) {
        delta.extend_from_slice(&encode_insert(chunk));
    }
    pending.clear();
}

/// Emit a copy, splitting runs longer than the encodable maximum.
fn emit_copy(delta: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let chunk = len.min(MAX_COPY_LEN);
        delta.extend_from_slice(&encode_copy(offset, chunk));
        offset += chunk;
        len -= chunk;
    }
}
