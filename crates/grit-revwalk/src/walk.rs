//! The walk iterator.

use std::cmp;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use bstr::BString;
use grit_diff::{tree_changes, tree_changes_for_merge, ChangeKind, RenameDetector, TreeChange};
use grit_hash::ObjectId;
use grit_object::{Commit, Object};
use grit_odb::ObjectDatabase;

use crate::RevWalkError;

/// Out-of-order commits drained past the `since` cutoff before the walk
/// stops; commit times are not monotonic across parents.
const MAX_EXTRA_COMMITS: usize = 5;

/// Output ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ordering {
    /// Commit-time descending, ties broken by OID descending.
    #[default]
    Date,
    /// Date order re-sorted so no commit precedes an ancestor.
    Topo,
}

/// Walk configuration.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub order: Ordering,
    /// Yield only commits whose changes touch one of these path prefixes.
    pub paths: Vec<BString>,
    /// Rewrite the path filter through renames as the walk crosses them.
    pub follow: bool,
    /// Stop (modulo stragglers) below this commit time.
    pub since: Option<i64>,
    pub max_entries: Option<usize>,
}

/// One yielded commit.
pub struct WalkEntry<'a> {
    db: &'a ObjectDatabase,
    pub oid: ObjectId,
    pub commit: Commit,
}

/// Changes a commit introduces relative to its parent(s).
#[derive(Debug, Clone)]
pub enum EntryChanges {
    /// Against the first parent (or the empty tree for roots).
    Single(Vec<TreeChange>),
    /// For merges: per-path groups of per-parent changes.
    Merge(Vec<Vec<TreeChange>>),
}

impl EntryChanges {
    /// Does anything here touch one of the path prefixes?
    pub fn touches(&self, paths: &[BString]) -> bool {
        let hit = |change: &TreeChange| paths.iter().any(|p| change.touches_prefix(p));
        match self {
            Self::Single(changes) => changes.iter().any(hit),
            Self::Merge(groups) => groups.iter().flatten().any(hit),
        }
    }
}

impl WalkEntry<'_> {
    /// Lazily diff this commit against its parent(s).
    pub fn changes(&self) -> Result<EntryChanges, RevWalkError> {
        if self.commit.parents.len() > 1 {
            let parent_trees: Vec<ObjectId> = self
                .commit
                .parents
                .iter()
                .map(|p| self.parent_tree(p))
                .collect::<Result<_, _>>()?;
            Ok(EntryChanges::Merge(tree_changes_for_merge(
                self.db,
                &parent_trees,
                &self.commit.tree,
            )?))
        } else {
            let parent_tree = match self.commit.first_parent() {
                Some(parent) => Some(self.parent_tree(parent)?),
                None => None,
            };
            Ok(EntryChanges::Single(tree_changes(
                self.db,
                parent_tree.as_ref(),
                Some(&self.commit.tree),
                false,
            )?))
        }
    }

    fn parent_tree(&self, parent: &ObjectId) -> Result<ObjectId, RevWalkError> {
        match self.db.get(parent)? {
            Some(Object::Commit(c)) => Ok(c.tree),
            Some(_) => Err(RevWalkError::NotACommit(*parent)),
            None => Err(RevWalkError::CommitNotFound(*parent)),
        }
    }
}

struct QueueEntry {
    commit_time: i64,
    oid: ObjectId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid && self.commit_time == other.commit_time
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // Max-heap: newest first, then larger OID.
        self.commit_time
            .cmp(&other.commit_time)
            .then_with(|| self.oid.cmp(&other.oid))
    }
}

/// Lazy commit iterator.
pub struct Walker<'a> {
    db: &'a ObjectDatabase,
    queue: BinaryHeap<QueueEntry>,
    seen: HashSet<ObjectId>,
    excluded: HashSet<ObjectId>,
    shallow: HashSet<ObjectId>,
    options: WalkOptions,
    /// Mutated as `follow` crosses renames.
    active_paths: Vec<BString>,
    extra_budget: usize,
    yielded: usize,
    /// Pre-computed output for topo order.
    topo_out: Option<VecDeque<ObjectId>>,
    finished: bool,
}

impl<'a> Walker<'a> {
    pub fn new(
        db: &'a ObjectDatabase,
        include: &[ObjectId],
        exclude: &[ObjectId],
        options: WalkOptions,
    ) -> Result<Self, RevWalkError> {
        Self::with_shallow(db, include, exclude, &HashSet::new(), options)
    }

    pub fn with_shallow(
        db: &'a ObjectDatabase,
        include: &[ObjectId],
        exclude: &[ObjectId],
        shallow: &HashSet<ObjectId>,
        options: WalkOptions,
    ) -> Result<Self, RevWalkError> {
        // Exclusion propagates to all ancestors up front; the yield check
        // is then a plain set lookup.
        let exclude_heads: HashSet<ObjectId> = exclude.iter().copied().collect();
        let (excluded, _) =
            grit_odb::missing::collect_ancestors(db, &exclude_heads, &HashSet::new(), shallow)?;

        let active_paths = options.paths.clone();
        let mut walker = Self {
            db,
            queue: BinaryHeap::new(),
            seen: HashSet::new(),
            excluded,
            shallow: shallow.clone(),
            options,
            active_paths,
            extra_budget: MAX_EXTRA_COMMITS,
            yielded: 0,
            topo_out: None,
            finished: false,
        };
        for oid in include {
            walker.push(*oid)?;
        }
        Ok(walker)
    }

    fn push(&mut self, oid: ObjectId) -> Result<(), RevWalkError> {
        if !self.seen.insert(oid) {
            return Ok(());
        }
        let commit = self.read_commit(&oid)?;
        self.queue.push(QueueEntry {
            commit_time: commit.commit_time(),
            oid,
        });
        Ok(())
    }

    fn read_commit(&self, oid: &ObjectId) -> Result<Commit, RevWalkError> {
        match self.db.get(oid)? {
            Some(Object::Commit(c)) => Ok(c),
            Some(_) => Err(RevWalkError::NotACommit(*oid)),
            None => Err(RevWalkError::CommitNotFound(*oid)),
        }
    }

    /// Date-order pop: returns the next in-range commit, enqueuing its
    /// parents, honoring shallow cuts and the `since` straggler budget.
    fn next_date(&mut self) -> Result<Option<(ObjectId, Commit)>, RevWalkError> {
        while let Some(entry) = self.queue.pop() {
            let commit = self.read_commit(&entry.oid)?;

            if let Some(since) = self.options.since {
                if commit.commit_time() < since {
                    // Out-of-order straggler: spend budget, don't descend.
                    if self.extra_budget == 0 {
                        self.queue.clear();
                        return Ok(None);
                    }
                    self.extra_budget -= 1;
                    continue;
                }
            }

            if !self.shallow.contains(&entry.oid) {
                for parent in commit.parents.clone() {
                    self.push(parent)?;
                }
            }

            if self.excluded.contains(&entry.oid) {
                continue;
            }
            return Ok(Some((entry.oid, commit)));
        }
        Ok(None)
    }

    /// Topo order: run the date walk to completion, then Kahn's algorithm
    /// so every commit precedes all of its ancestors in the output.
    fn prepare_topo(&mut self) -> Result<VecDeque<ObjectId>, RevWalkError> {
        let mut collected: Vec<(ObjectId, Commit)> = Vec::new();
        while let Some(pair) = self.next_date()? {
            collected.push(pair);
        }

        let in_set: HashSet<ObjectId> = collected.iter().map(|(oid, _)| *oid).collect();
        let mut indegree: std::collections::HashMap<ObjectId, usize> =
            in_set.iter().map(|oid| (*oid, 0)).collect();
        for (_, commit) in &collected {
            for parent in &commit.parents {
                if let Some(count) = indegree.get_mut(parent) {
                    *count += 1;
                }
            }
        }

        // Tips first; `collected` is already date-ordered, which keeps the
        // ready queue deterministic.
        let mut parents_of: std::collections::HashMap<ObjectId, Vec<ObjectId>> =
            std::collections::HashMap::new();
        for (oid, commit) in &collected {
            parents_of.insert(
                *oid,
                commit
                    .parents
                    .iter()
                    .filter(|p| in_set.contains(p))
                    .copied()
                    .collect(),
            );
        }

        let mut ready: VecDeque<ObjectId> = collected
            .iter()
            .map(|(oid, _)| *oid)
            .filter(|oid| indegree[oid] == 0)
            .collect();
        let mut out = VecDeque::with_capacity(collected.len());
        while let Some(oid) = ready.pop_front() {
            out.push_back(oid);
            for parent in &parents_of[&oid] {
                let count = indegree.get_mut(parent).expect("parent in set");
                *count -= 1;
                if *count == 0 {
                    ready.push_back(*parent);
                }
            }
        }
        Ok(out)
    }

    fn next_ordered(&mut self) -> Result<Option<(ObjectId, Commit)>, RevWalkError> {
        match self.options.order {
            Ordering::Date => self.next_date(),
            Ordering::Topo => {
                if self.topo_out.is_none() {
                    self.topo_out = Some(self.prepare_topo()?);
                }
                match self.topo_out.as_mut().expect("prepared").pop_front() {
                    Some(oid) => {
                        let commit = self.read_commit(&oid)?;
                        Ok(Some((oid, commit)))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Path filtering, including the `follow` rewrite across renames.
    fn passes_path_filter(&mut self, oid: &ObjectId, commit: &Commit) -> Result<bool, RevWalkError> {
        if self.active_paths.is_empty() {
            return Ok(true);
        }
        let entry = WalkEntry {
            db: self.db,
            oid: *oid,
            commit: commit.clone(),
        };
        let changes = entry.changes()?;

        if !changes.touches(&self.active_paths) {
            return Ok(false);
        }
        if self.options.follow {
            if let EntryChanges::Single(list) = &changes {
                let detected = RenameDetector::new(self.db).detect(list.clone())?;
                for change in detected {
                    if change.kind != ChangeKind::Rename {
                        continue;
                    }
                    let (Some(old), Some(new)) = (&change.old, &change.new) else {
                        continue;
                    };
                    // Older commits know the file by its previous name.
                    if let Some(slot) = self.active_paths.iter_mut().find(|p| **p == new.path) {
                        *slot = old.path.clone();
                    }
                }
            }
        }
        Ok(true)
    }
}

impl<'a> Iterator for Walker<'a> {
    type Item = Result<WalkEntry<'a>, RevWalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(max) = self.options.max_entries {
            if self.yielded >= max {
                self.finished = true;
                return None;
            }
        }

        loop {
            let (oid, commit) = match self.next_ordered() {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };

            match self.passes_path_filter(&oid, &commit) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }

            self.yielded += 1;
            return Some(Ok(WalkEntry {
                db: self.db,
                oid,
                commit,
            }));
        }
    }
}
