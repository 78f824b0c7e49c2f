//! The missing-objects finder: what must be sent so a peer holding
//! `haves` ends up with everything reachable from `wants`.
//!
//! Commits reachable from the haves are "common"; their entire tree
//! closures are marked as already present so no tree or blob the peer can
//! already reach is re-sent. The remaining commits are walked lazily,
//! trees unfolding into subtrees and blobs as the iterator is pulled.

use std::collections::{HashMap, HashSet, VecDeque};

use bstr::BString;
use grit_hash::ObjectId;
use grit_object::{Object, ObjectType};

use crate::{ObjectDatabase, OdbError};

/// Grouping hint handed to the pack writer: the object's type and the last
/// path component it was reached through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackHint {
    pub obj_type: Option<ObjectType>,
    pub name: Option<BString>,
}

/// Walk ancestors of `heads`, stopping at anything in `common` and at
/// shallow boundaries. Returns `(ancestors, common_encountered)`.
pub fn collect_ancestors(
    db: &ObjectDatabase,
    heads: &HashSet<ObjectId>,
    common: &HashSet<ObjectId>,
    shallow: &HashSet<ObjectId>,
) -> Result<(HashSet<ObjectId>, HashSet<ObjectId>), OdbError> {
    let mut ancestors = HashSet::new();
    let mut bases = HashSet::new();
    let mut queue: VecDeque<ObjectId> = heads.iter().copied().collect();

    while let Some(oid) = queue.pop_front() {
        if common.contains(&oid) {
            bases.insert(oid);
        } else if ancestors.insert(oid) {
            if shallow.contains(&oid) {
                continue;
            }
            if let Object::Commit(commit) = db.get_required(&oid)? {
                queue.extend(commit.parents.iter().copied());
            }
        }
    }
    Ok((ancestors, bases))
}

/// True when `ancestor` is reachable from `descendant`.
pub fn is_ancestor(
    db: &ObjectDatabase,
    ancestor: &ObjectId,
    descendant: &ObjectId,
) -> Result<bool, OdbError> {
    if ancestor == descendant {
        return Ok(true);
    }
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*descendant]);
    while let Some(oid) = queue.pop_front() {
        if oid == *ancestor {
            return Ok(true);
        }
        if !seen.insert(oid) {
            continue;
        }
        match db.get(&oid)? {
            Some(Object::Commit(commit)) => queue.extend(commit.parents.iter().copied()),
            _ => continue,
        }
    }
    Ok(false)
}

/// Partition OIDs into commits, tags, and everything else; tags peel into
/// the commit set. Unknown OIDs are skipped or rejected per `ignore_unknown`.
fn split_commits_and_tags(
    db: &ObjectDatabase,
    oids: &HashSet<ObjectId>,
    ignore_unknown: bool,
) -> Result<(HashSet<ObjectId>, HashSet<ObjectId>, HashSet<ObjectId>), OdbError> {
    let mut commits = HashSet::new();
    let mut tags = HashSet::new();
    let mut others = HashSet::new();

    let mut queue: VecDeque<ObjectId> = oids.iter().copied().collect();
    while let Some(oid) = queue.pop_front() {
        match db.get(&oid)? {
            Some(Object::Commit(_)) => {
                commits.insert(oid);
            }
            Some(Object::Tag(tag)) => {
                if tags.insert(oid) {
                    queue.push_back(tag.object);
                }
            }
            Some(_) => {
                others.insert(oid);
            }
            None => {
                if !ignore_unknown {
                    return Err(OdbError::NotFound(oid));
                }
            }
        }
    }
    Ok((commits, tags, others))
}

/// Add every tree and blob under `tree_oid` to `set` (gitlinks excluded).
fn collect_tree_closure(
    db: &ObjectDatabase,
    tree_oid: &ObjectId,
    set: &mut HashSet<ObjectId>,
) -> Result<(), OdbError> {
    if !set.insert(*tree_oid) {
        return Ok(());
    }
    let tree = match db.get_required(tree_oid)? {
        Object::Tree(tree) => tree,
        other => {
            return Err(OdbError::TypeMismatch {
                oid: *tree_oid,
                expected: ObjectType::Tree,
                actual: other.object_type(),
            })
        }
    };
    for entry in tree.iter() {
        if entry.mode.is_gitlink() {
            continue;
        }
        if entry.mode.is_directory() {
            collect_tree_closure(db, &entry.oid, set)?;
        } else {
            set.insert(entry.oid);
        }
    }
    Ok(())
}

struct QueueItem {
    oid: ObjectId,
    name: Option<BString>,
    obj_type: Option<ObjectType>,
    /// Leaves are yielded without being opened.
    leaf: bool,
}

/// Iterator over the `(oid, hint)` stream a peer is missing.
pub struct MissingObjectsFinder<'a> {
    db: &'a ObjectDatabase,
    to_send: Vec<QueueItem>,
    sha_done: HashSet<ObjectId>,
    /// peeled OID -> annotated tag OID, for `include-tag`.
    tagged: HashMap<ObjectId, ObjectId>,
}

impl<'a> MissingObjectsFinder<'a> {
    pub fn new(
        db: &'a ObjectDatabase,
        haves: &HashSet<ObjectId>,
        wants: &HashSet<ObjectId>,
        shallow: &HashSet<ObjectId>,
    ) -> Result<Self, OdbError> {
        Self::with_tagged(db, haves, wants, shallow, HashMap::new())
    }

    pub fn with_tagged(
        db: &'a ObjectDatabase,
        haves: &HashSet<ObjectId>,
        wants: &HashSet<ObjectId>,
        shallow: &HashSet<ObjectId>,
        tagged: HashMap<ObjectId, ObjectId>,
    ) -> Result<Self, OdbError> {
        let (have_commits, have_tags, have_others) =
            split_commits_and_tags(db, haves, true)?;
        let (want_commits, want_tags, want_others) =
            split_commits_and_tags(db, wants, false)?;

        let empty = HashSet::new();
        let (all_ancestors, _) = collect_ancestors(db, &have_commits, &empty, shallow)?;
        let (missing_commits, common_commits) =
            collect_ancestors(db, &want_commits, &all_ancestors, shallow)?;

        let mut remote_has: HashSet<ObjectId> = HashSet::new();
        for oid in &common_commits {
            remote_has.insert(*oid);
            if let Object::Commit(commit) = db.get_required(oid)? {
                collect_tree_closure(db, &commit.tree, &mut remote_has)?;
            }
        }
        remote_has.extend(have_tags.iter().copied());

        let mut to_send: Vec<QueueItem> = Vec::new();
        for oid in missing_commits {
            to_send.push(QueueItem {
                oid,
                name: None,
                obj_type: Some(ObjectType::Commit),
                leaf: false,
            });
        }
        for oid in want_tags.difference(&have_tags) {
            to_send.push(QueueItem {
                oid: *oid,
                name: None,
                obj_type: Some(ObjectType::Tag),
                leaf: false,
            });
        }
        for oid in want_others.difference(&have_others) {
            to_send.push(QueueItem {
                oid: *oid,
                name: None,
                obj_type: None,
                leaf: false,
            });
        }

        Ok(Self {
            db,
            to_send,
            sha_done: remote_has,
            tagged,
        })
    }

    /// Collect the remaining stream into `(oid, hint)` pairs.
    pub fn collect_all(mut self) -> Result<Vec<(ObjectId, PackHint)>, OdbError> {
        let mut out = Vec::new();
        for item in self.by_ref() {
            out.push(item?);
        }
        Ok(out)
    }

    fn expand(&mut self, oid: &ObjectId) -> Result<(), OdbError> {
        match self.db.get_required(oid)? {
            Object::Commit(commit) => {
                self.to_send.push(QueueItem {
                    oid: commit.tree,
                    name: Some(BString::from("")),
                    obj_type: Some(ObjectType::Tree),
                    leaf: false,
                });
            }
            Object::Tree(tree) => {
                for entry in tree.iter() {
                    if entry.mode.is_gitlink() {
                        continue;
                    }
                    self.to_send.push(QueueItem {
                        oid: entry.oid,
                        name: Some(entry.name.clone()),
                        obj_type: Some(if entry.mode.is_directory() {
                            ObjectType::Tree
                        } else {
                            ObjectType::Blob
                        }),
                        leaf: !entry.mode.is_directory(),
                    });
                }
            }
            Object::Tag(tag) => {
                self.to_send.push(QueueItem {
                    oid: tag.object,
                    name: None,
                    obj_type: Some(tag.object_type),
                    leaf: false,
                });
            }
            Object::Blob(_) => {}
        }
        Ok(())
    }
}

impl Iterator for MissingObjectsFinder<'_> {
    type Item = Result<(ObjectId, PackHint), OdbError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = self.to_send.pop()?;
            if !self.sha_done.insert(item.oid) {
                continue;
            }

            if !item.leaf {
                if let Err(e) = self.expand(&item.oid) {
                    return Some(Err(e));
                }
            }
            if let Some(tag_oid) = self.tagged.get(&item.oid).copied() {
                self.to_send.push(QueueItem {
                    oid: tag_oid,
                    name: None,
                    obj_type: Some(ObjectType::Tag),
                    leaf: true,
                });
            }

            return Some(Ok((
                item.oid,
                PackHint {
                    obj_type: item.obj_type,
                    name: item.name,
                },
            )));
        }
    }
}
