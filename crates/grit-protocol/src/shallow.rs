//! Shallow boundary computation for `deepen` requests.

use std::collections::{HashSet, VecDeque};

use grit_hash::ObjectId;
use grit_object::Object;
use grit_odb::ObjectDatabase;

use crate::ProtocolError;

/// Bounded BFS from `heads`: commits at exactly `depth` hops become the
/// shallow boundary, everything nearer is definitely not shallow. A depth
/// of one keeps only the heads themselves.
pub fn find_shallow(
    db: &ObjectDatabase,
    heads: &[ObjectId],
    depth: u32,
) -> Result<(HashSet<ObjectId>, HashSet<ObjectId>), ProtocolError> {
    let mut shallow = HashSet::new();
    let mut not_shallow = HashSet::new();
    // (commit, remaining depth); a commit reachable along several paths
    // keeps the largest remaining budget.
    let mut best: std::collections::HashMap<ObjectId, u32> = std::collections::HashMap::new();
    let mut queue: VecDeque<(ObjectId, u32)> =
        heads.iter().map(|oid| (*oid, depth.max(1))).collect();

    while let Some((oid, budget)) = queue.pop_front() {
        match best.get(&oid) {
            Some(&seen) if seen >= budget => continue,
            _ => {}
        }
        best.insert(oid, budget);

        if budget == 1 {
            shallow.insert(oid);
            continue;
        }
        not_shallow.insert(oid);
        if let Some(Object::Commit(commit)) = db.get(&oid)? {
            for parent in &commit.parents {
                queue.push_back((*parent, budget - 1));
            }
        }
    }

    // A commit reachable both within and at the boundary is not shallow.
    shallow.retain(|oid| !not_shallow.contains(oid));
    Ok((shallow, not_shallow))
}

/// Boundary for `deepen-since`: commits at or after `since` are kept; a
/// kept commit with a parent older than `since` is the boundary.
pub fn find_shallow_since(
    db: &ObjectDatabase,
    heads: &[ObjectId],
    since: i64,
) -> Result<(HashSet<ObjectId>, HashSet<ObjectId>), ProtocolError> {
    let mut shallow = HashSet::new();
    let mut not_shallow = HashSet::new();
    let mut queue: VecDeque<ObjectId> = heads.iter().copied().collect();
    let mut seen: HashSet<ObjectId> = HashSet::new();

    while let Some(oid) = queue.pop_front() {
        if !seen.insert(oid) {
            continue;
        }
        let Some(Object::Commit(commit)) = db.get(&oid)? else {
            continue;
        };

        let mut cut = false;
        for parent in &commit.parents {
            let parent_time = match db.get(parent)? {
                Some(Object::Commit(p)) => p.commit_time(),
                _ => continue,
            };
            if parent_time < since {
                cut = true;
            } else {
                queue.push_back(*parent);
            }
        }
        if cut || commit.parents.is_empty() {
            shallow.insert(oid);
        }
        if !cut {
            not_shallow.insert(oid);
        }
    }

    // Root commits with full history present are complete, not shallow.
    shallow.retain(|oid| match db.get(oid) {
        Ok(Some(Object::Commit(c))) => !c.parents.is_empty(),
        _ => true,
    });
    Ok((shallow, not_shallow))
}

/// Boundary for `deepen-not`: everything reachable from `excluded` tips is
/// cut away; kept commits whose parent falls in the cut are the boundary.
pub fn find_shallow_not(
    db: &ObjectDatabase,
    heads: &[ObjectId],
    excluded_tips: &[ObjectId],
) -> Result<(HashSet<ObjectId>, HashSet<ObjectId>), ProtocolError> {
    let tips: HashSet<ObjectId> = excluded_tips.iter().copied().collect();
    let (excluded, _) =
        grit_odb::missing::collect_ancestors(db, &tips, &HashSet::new(), &HashSet::new())?;

    let mut shallow = HashSet::new();
    let mut not_shallow = HashSet::new();
    let mut queue: VecDeque<ObjectId> = heads.iter().copied().collect();
    let mut seen: HashSet<ObjectId> = HashSet::new();

    while let Some(oid) = queue.pop_front() {
        if excluded.contains(&oid) || !seen.insert(oid) {
            continue;
        }
        not_shallow.insert(oid);
        let Some(Object::Commit(commit)) = db.get(&oid)? else {
            continue;
        };
        let mut cut = false;
        for parent in &commit.parents {
            if excluded.contains(parent) {
                cut = true;
            } else {
                queue.push_back(*parent);
            }
        }
        if cut {
            shallow.insert(oid);
        }
    }
    Ok((shallow, not_shallow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::BString;
    use grit_object::{Blob, Commit, FileMode, Tree, TreeEntry};
    use grit_utils::date::{GitDate, Signature};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: ObjectDatabase,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = ObjectDatabase::open(dir.path()).unwrap();
            Self { _dir: dir, db }
        }

        fn commit(&self, marker: u8, parents: Vec<ObjectId>, time: i64) -> ObjectId {
            let blob = self
                .db
                .add(&Object::Blob(Blob::new(vec![marker])))
                .unwrap();
            let tree = self
                .db
                .add(&Object::Tree(Tree {
                    entries: vec![TreeEntry {
                        mode: FileMode::Regular,
                        name: BString::from("f"),
                        oid: blob,
                    }],
                }))
                .unwrap();
            let sig = Signature::new("S", "s@x", GitDate::new(time, 0));
            self.db
                .add(&Object::Commit(Commit {
                    tree,
                    parents,
                    author: sig.clone(),
                    committer: sig,
                    encoding: None,
                    extra_headers: Vec::new(),
                    gpgsig: None,
                    message: BString::from("m\n"),
                }))
                .unwrap()
        }
    }

    #[test]
    fn depth_one_keeps_only_heads() {
        let f = Fixture::new();
        let a = f.commit(1, vec![], 100);
        let b = f.commit(2, vec![a], 200);

        let (shallow, not_shallow) = find_shallow(&f.db, &[b], 1).unwrap();
        assert_eq!(shallow, [b].into_iter().collect());
        assert!(not_shallow.is_empty());
    }

    #[test]
    fn depth_two_cuts_grandparents() {
        let f = Fixture::new();
        let a = f.commit(1, vec![], 100);
        let b = f.commit(2, vec![a], 200);
        let c = f.commit(3, vec![b], 300);

        let (shallow, not_shallow) = find_shallow(&f.db, &[c], 2).unwrap();
        assert_eq!(shallow, [b].into_iter().collect());
        assert_eq!(not_shallow, [c].into_iter().collect());
    }

    #[test]
    fn multiple_paths_prefer_not_shallow() {
        let f = Fixture::new();
        let a = f.commit(1, vec![], 100);
        let b = f.commit(2, vec![a], 200);
        // c merges b and a: a is both 2 hops (via b) and 1 hop away.
        let c = f.commit(3, vec![b, a], 300);

        let (shallow, not_shallow) = find_shallow(&f.db, &[c], 3).unwrap();
        assert!(not_shallow.contains(&a));
        assert!(!shallow.contains(&a));
    }

    #[test]
    fn since_boundary() {
        let f = Fixture::new();
        let old = f.commit(1, vec![], 100);
        let mid = f.commit(2, vec![old], 200);
        let new = f.commit(3, vec![mid], 300);

        let (shallow, not_shallow) = find_shallow_since(&f.db, &[new], 150).unwrap();
        assert_eq!(shallow, [mid].into_iter().collect());
        assert!(not_shallow.contains(&new));
        assert!(!not_shallow.contains(&old));
    }

    #[test]
    fn deepen_not_boundary() {
        let f = Fixture::new();
        let base = f.commit(1, vec![], 100);
        let feature = f.commit(2, vec![base], 200);
        let tip = f.commit(3, vec![feature], 300);

        let (shallow, not_shallow) = find_shallow_not(&f.db, &[tip], &[base]).unwrap();
        assert_eq!(shallow, [feature].into_iter().collect());
        assert!(not_shallow.contains(&tip));
        assert!(!not_shallow.contains(&base));
    }
}
