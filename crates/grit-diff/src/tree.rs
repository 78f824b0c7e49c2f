//! Recursive tree-to-tree comparison.

use bstr::BString;
use grit_hash::ObjectId;
use grit_object::{Object, Tree, TreeEntry};
use grit_odb::ObjectDatabase;

use crate::{ChangeEntry, ChangeKind, DiffError, TreeChange};

/// Compare two trees (either side `None` = empty tree), producing flat
/// change records with full paths. With `include_unchanged`, identical
/// entries are reported too (copy detection wants them as sources).
pub fn tree_changes(
    db: &ObjectDatabase,
    old_tree: Option<&ObjectId>,
    new_tree: Option<&ObjectId>,
    include_unchanged: bool,
) -> Result<Vec<TreeChange>, DiffError> {
    let mut changes = Vec::new();
    walk(
        db,
        old_tree,
        new_tree,
        &BString::from(""),
        include_unchanged,
        &mut changes,
    )?;
    Ok(changes)
}

/// Changes a merge commit's tree introduces against all its parents.
///
/// A path is reported only when it differs from every parent; the result
/// groups the per-parent changes for each such path, parents in order.
pub fn tree_changes_for_merge(
    db: &ObjectDatabase,
    parent_trees: &[ObjectId],
    tree: &ObjectId,
) -> Result<Vec<Vec<TreeChange>>, DiffError> {
    let per_parent: Vec<Vec<TreeChange>> = parent_trees
        .iter()
        .map(|parent| tree_changes(db, Some(parent), Some(tree), false))
        .collect::<Result<_, _>>()?;

    if per_parent.is_empty() {
        return Ok(tree_changes(db, None, Some(tree), false)?
            .into_iter()
            .map(|c| vec![c])
            .collect());
    }

    // Group by result path; keep paths changed against every parent.
    let mut grouped: Vec<Vec<TreeChange>> = Vec::new();
    for candidate in &per_parent[0] {
        let path = candidate.path().clone();
        let mut group = vec![candidate.clone()];
        for other in &per_parent[1..] {
            match other.iter().find(|c| *c.path() == path) {
                Some(change) => group.push(change.clone()),
                None => {
                    group.clear();
                    break;
                }
            }
        }
        if !group.is_empty() {
            grouped.push(group);
        }
    }
    Ok(grouped)
}

fn read_tree(db: &ObjectDatabase, oid: &ObjectId) -> Result<Tree, DiffError> {
    match db.get_required(oid)? {
        Object::Tree(tree) => Ok(tree),
        _ => Err(DiffError::NotATree(*oid)),
    }
}

fn join(prefix: &BString, name: &[u8]) -> BString {
    if prefix.is_empty() {
        BString::from(name)
    } else {
        let mut path = prefix.clone();
        path.push(b'/');
        path.extend_from_slice(name);
        path
    }
}

fn entry_at(prefix: &BString, entry: &TreeEntry) -> ChangeEntry {
    ChangeEntry {
        path: join(prefix, &entry.name),
        mode: entry.mode,
        oid: entry.oid,
    }
}

fn walk(
    db: &ObjectDatabase,
    old_oid: Option<&ObjectId>,
    new_oid: Option<&ObjectId>,
    prefix: &BString,
    include_unchanged: bool,
    out: &mut Vec<TreeChange>,
) -> Result<(), DiffError> {
    let old = old_oid.map(|oid| read_tree(db, oid)).transpose()?;
    let new = new_oid.map(|oid| read_tree(db, oid)).transpose()?;
    let old_entries = old.as_ref().map_or(&[][..], |t| &t.entries);
    let new_entries = new.as_ref().map_or(&[][..], |t| &t.entries);

    let mut oi = 0;
    let mut ni = 0;
    loop {
        match (old_entries.get(oi), new_entries.get(ni)) {
            (Some(o), Some(n)) => match TreeEntry::cmp_entries(o, n) {
                std::cmp::Ordering::Less => {
                    emit_deleted(db, o, prefix, out)?;
                    oi += 1;
                }
                std::cmp::Ordering::Greater => {
                    emit_added(db, n, prefix, out)?;
                    ni += 1;
                }
                std::cmp::Ordering::Equal => {
                    emit_pair(db, o, n, prefix, include_unchanged, out)?;
                    oi += 1;
                    ni += 1;
                }
            },
            (Some(o), None) => {
                emit_deleted(db, o, prefix, out)?;
                oi += 1;
            }
            (None, Some(n)) => {
                emit_added(db, n, prefix, out)?;
                ni += 1;
            }
            (None, None) => return Ok(()),
        }
    }
}

fn emit_deleted(
    db: &ObjectDatabase,
    entry: &TreeEntry,
    prefix: &BString,
    out: &mut Vec<TreeChange>,
) -> Result<(), DiffError> {
    if entry.mode.is_directory() {
        let path = join(prefix, &entry.name);
        walk(db, Some(&entry.oid), None, &path, false, out)
    } else {
        out.push(TreeChange::delete(entry_at(prefix, entry)));
        Ok(())
    }
}

fn emit_added(
    db: &ObjectDatabase,
    entry: &TreeEntry,
    prefix: &BString,
    out: &mut Vec<TreeChange>,
) -> Result<(), DiffError> {
    if entry.mode.is_directory() {
        let path = join(prefix, &entry.name);
        walk(db, None, Some(&entry.oid), &path, false, out)
    } else {
        out.push(TreeChange::add(entry_at(prefix, entry)));
        Ok(())
    }
}

fn emit_pair(
    db: &ObjectDatabase,
    old: &TreeEntry,
    new: &TreeEntry,
    prefix: &BString,
    include_unchanged: bool,
    out: &mut Vec<TreeChange>,
) -> Result<(), DiffError> {
    match (old.mode.is_directory(), new.mode.is_directory()) {
        (true, true) => {
            if old.oid != new.oid {
                let path = join(prefix, &old.name);
                walk(db, Some(&old.oid), Some(&new.oid), &path, include_unchanged, out)?;
            } else if include_unchanged {
                // Unchanged subtree contents are only materialized when a
                // caller (copy detection) wants all sources.
                let path = join(prefix, &old.name);
                walk(db, Some(&old.oid), Some(&new.oid), &path, true, out)?;
            }
            Ok(())
        }
        (true, false) => {
            // Directory replaced by a file.
            let path = join(prefix, &old.name);
            walk(db, Some(&old.oid), None, &path, false, out)?;
            out.push(TreeChange::add(entry_at(prefix, new)));
            Ok(())
        }
        (false, true) => {
            out.push(TreeChange::delete(entry_at(prefix, old)));
            let path = join(prefix, &new.name);
            walk(db, None, Some(&new.oid), &path, false, out)
        }
        (false, false) => {
            if old.oid != new.oid || old.mode != new.mode {
                out.push(TreeChange::modify(
                    entry_at(prefix, old),
                    entry_at(prefix, new),
                ));
            } else if include_unchanged {
                out.push(TreeChange::unchanged(entry_at(prefix, old)));
            }
            Ok(())
        }
    }
}
