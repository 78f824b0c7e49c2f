//! The files ref backend: loose refs shadowing `packed-refs`.
//!
//! Every mutation follows the same shape: take the lock file for the loose
//! ref path, re-read the current value under the lock, compare, write, and
//! journal to the reflog. A failed compare writes nothing, including no
//! reflog line.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use grit_hash::ObjectId;
use grit_utils::date::Signature;
use grit_utils::lockfile::LockFile;

use crate::name::RefName;
use crate::packed::PackedRefs;
use crate::reflog::{self, ReflogEntry};
use crate::{RefError, RefValue};

/// Symbolic indirections followed before giving up.
pub const MAX_SYMREF_DEPTH: usize = 5;

pub struct FilesRefStore {
    git_dir: PathBuf,
}

/// A held per-ref lock with the value seen at acquisition time.
pub struct RefLock {
    lock: LockFile,
    name: RefName,
    current: Option<ObjectId>,
}

impl RefLock {
    pub fn name(&self) -> &RefName {
        &self.name
    }

    /// The direct value the ref held when the lock was taken.
    pub fn current(&self) -> Option<ObjectId> {
        self.current
    }
}

impl FilesRefStore {
    pub fn new(git_dir: impl AsRef<Path>) -> Self {
        Self {
            git_dir: git_dir.as_ref().to_path_buf(),
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn ref_path(&self, name: &RefName) -> PathBuf {
        self.git_dir.join(name.as_str())
    }

    /// Read the raw value without following symrefs.
    pub fn read(&self, name: &RefName) -> Result<Option<RefValue>, RefError> {
        match fs::read(self.ref_path(name)) {
            Ok(data) => parse_ref_file(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let packed = PackedRefs::load(&self.git_dir)?;
                Ok(packed.find(name).map(|r| RefValue::Direct(r.oid)))
            }
            Err(e) => Err(RefError::Io(e)),
        }
    }

    /// Follow symrefs to an OID. `Ok(None)` for missing or unborn refs;
    /// more than [`MAX_SYMREF_DEPTH`] indirections is a loop.
    pub fn resolve(&self, name: &RefName) -> Result<Option<ObjectId>, RefError> {
        let mut current = name.clone();
        for _ in 0..=MAX_SYMREF_DEPTH {
            match self.read(&current)? {
                None => return Ok(None),
                Some(RefValue::Direct(oid)) => return Ok(Some(oid)),
                Some(RefValue::Symbolic(target)) => current = target,
            }
        }
        Err(RefError::SymrefLoop(name.to_string()))
    }

    /// The ref a chain of symrefs lands on; the last name in the chain
    /// when it dangles (an unborn branch).
    pub fn canonical(&self, name: &RefName) -> Result<RefName, RefError> {
        let mut current = name.clone();
        for _ in 0..=MAX_SYMREF_DEPTH {
            match self.read(&current)? {
                Some(RefValue::Symbolic(target)) => current = target,
                _ => return Ok(current),
            }
        }
        Err(RefError::SymrefLoop(name.to_string()))
    }

    /// Point `name` at another ref. The target may not exist yet (this is
    /// how HEAD points at an unborn branch).
    pub fn set_symbolic(&self, name: &RefName, target: &RefName) -> Result<(), RefError> {
        let mut lock = LockFile::acquire(self.ref_path(name))?;
        writeln!(lock, "ref: {target}")?;
        lock.commit()?;
        Ok(())
    }

    /// Atomic compare-and-swap.
    ///
    /// `expected = None` writes unconditionally. The zero OID stands for
    /// "must not exist" (and a missing ref compares equal to it), so ref
    /// creation is a CAS like any other. Returns whether the swap applied;
    /// the reflog gains a line only on success. Symrefs are followed
    /// first, so updating `HEAD` updates the branch it points at.
    pub fn set_if_equals(
        &self,
        name: &RefName,
        expected: Option<ObjectId>,
        new: ObjectId,
        committer: &Signature,
        message: &str,
    ) -> Result<bool, RefError> {
        let target = self.canonical(name)?;
        let lock = LockFile::acquire(self.ref_path(&target))?;

        let current = self.read_direct_locked(&target)?;
        if !expectation_met(expected, current) {
            drop(lock);
            return Ok(false);
        }

        self.commit_value(lock, new)?;

        let entry = ReflogEntry {
            old_oid: current.unwrap_or(ObjectId::NULL_SHA1),
            new_oid: new,
            committer: committer.clone(),
            message: message.into(),
        };
        reflog::append(&self.git_dir, &target, &entry)?;
        if target != *name {
            reflog::append(&self.git_dir, name, &entry)?;
        }
        Ok(true)
    }

    /// CAS against non-existence.
    pub fn add_if_new(
        &self,
        name: &RefName,
        new: ObjectId,
        committer: &Signature,
        message: &str,
    ) -> Result<bool, RefError> {
        self.set_if_equals(name, Some(ObjectId::NULL_SHA1), new, committer, message)
    }

    /// Atomic conditional delete. Removes the loose file and the
    /// packed-refs entry; the reflog is dropped with the ref.
    pub fn remove_if_equals(
        &self,
        name: &RefName,
        expected: Option<ObjectId>,
    ) -> Result<bool, RefError> {
        let target = self.canonical(name)?;
        let path = self.ref_path(&target);
        let lock = LockFile::acquire(&path)?;

        let current = self.read_direct_locked(&target)?;
        if current.is_none() && expected.is_none() {
            // Deleting a ref that is not there.
            drop(lock);
            return Ok(false);
        }
        if !expectation_met(expected, current) {
            drop(lock);
            return Ok(false);
        }

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RefError::Io(e)),
        }

        let mut packed = PackedRefs::load(&self.git_dir)?;
        if packed.remove(&target) {
            packed.write(&self.git_dir)?;
        }

        reflog::remove(&self.git_dir, &target)?;
        lock.rollback()?;
        Ok(true)
    }

    /// Move loose refs into packed-refs. `peel` supplies the fully-peeled
    /// target for annotated tags; `prune` deletes the loose files after.
    pub fn pack_refs_with(
        &self,
        prune: bool,
        peel: impl Fn(&ObjectId) -> Option<ObjectId>,
    ) -> Result<usize, RefError> {
        let mut packed = PackedRefs::load(&self.git_dir)?;
        let mut moved = Vec::new();

        for (name, value) in self.iter(Some("refs/"))? {
            if let RefValue::Direct(oid) = value {
                // Only loose refs need moving.
                if self.ref_path(&name).is_file() {
                    packed.upsert(name.clone(), oid, peel(&oid));
                    moved.push((name, oid));
                }
            }
        }
        if moved.is_empty() {
            return Ok(0);
        }
        packed.write(&self.git_dir)?;

        if prune {
            for (name, oid) in &moved {
                let path = self.ref_path(name);
                let lock = LockFile::acquire(&path)?;
                // Only prune if the loose value did not move underneath us.
                if self.read_loose_direct(name)? == Some(*oid) {
                    fs::remove_file(&path)?;
                }
                lock.rollback()?;
            }
        }
        Ok(moved.len())
    }

    /// [`pack_refs_with`](Self::pack_refs_with) without tag peeling.
    pub fn pack_refs(&self, prune: bool) -> Result<usize, RefError> {
        self.pack_refs_with(prune, |_| None)
    }

    /// All refs under `prefix` (or everything under `refs/`), loose
    /// shadowing packed, sorted by name. `HEAD` is not included.
    pub fn iter(&self, prefix: Option<&str>) -> Result<Vec<(RefName, RefValue)>, RefError> {
        let prefix = prefix.unwrap_or("refs/");
        let mut out: Vec<(RefName, RefValue)> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        let root = self.git_dir.join("refs");
        if root.is_dir() {
            let mut stack = vec![root];
            while let Some(dir) = stack.pop() {
                for entry in fs::read_dir(&dir)? {
                    let entry = entry?;
                    let path = entry.path();
                    if entry.file_type()?.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    let rel = path
                        .strip_prefix(&self.git_dir)
                        .expect("path under git_dir")
                        .to_string_lossy()
                        .replace('\\', "/");
                    if rel.ends_with(".lock") || !rel.starts_with(prefix) {
                        continue;
                    }
                    let name = RefName::new_unchecked(rel.clone());
                    if let Ok(value) = parse_ref_file(&fs::read(&path)?) {
                        seen.insert(rel);
                        out.push((name, value));
                    }
                }
            }
        }

        let packed = PackedRefs::load(&self.git_dir)?;
        for r in packed.refs() {
            if r.name.as_str().starts_with(prefix) && !seen.contains(r.name.as_str()) {
                out.push((r.name.clone(), RefValue::Direct(r.oid)));
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// All refs resolved to OIDs, symrefs followed, unborn refs skipped.
    pub fn iter_resolved(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<(RefName, ObjectId)>, RefError> {
        let mut out = Vec::new();
        for (name, value) in self.iter(prefix)? {
            match value {
                RefValue::Direct(oid) => out.push((name, oid)),
                RefValue::Symbolic(_) => {
                    if let Some(oid) = self.resolve(&name)? {
                        out.push((name, oid));
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn reflog(&self, name: &RefName) -> Result<Vec<ReflogEntry>, RefError> {
        reflog::read(&self.git_dir, name)
    }

    /// Take the lock for `name` (symrefs followed) and snapshot its value.
    ///
    /// Used by atomic multi-ref updates: every involved ref is locked
    /// before the first is written, so concurrent readers observe either
    /// the whole batch or none of it. Lock in sorted name order to avoid
    /// deadlocks between concurrent batches.
    pub fn lock_ref(&self, name: &RefName) -> Result<RefLock, RefError> {
        let target = self.canonical(name)?;
        let lock = LockFile::acquire(self.ref_path(&target))?;
        let current = self.read_direct_locked(&target)?;
        Ok(RefLock {
            lock,
            name: target,
            current,
        })
    }

    /// Write `new` through a held lock and journal the transition.
    pub fn commit_locked(
        &self,
        held: RefLock,
        new: ObjectId,
        committer: &Signature,
        message: &str,
    ) -> Result<(), RefError> {
        let RefLock {
            lock,
            name,
            current,
        } = held;
        self.commit_value(lock, new)?;
        reflog::append(
            &self.git_dir,
            &name,
            &ReflogEntry {
                old_oid: current.unwrap_or(ObjectId::NULL_SHA1),
                new_oid: new,
                committer: committer.clone(),
                message: message.into(),
            },
        )?;
        Ok(())
    }

    /// Delete the ref behind a held lock (loose file, packed entry, log).
    pub fn delete_locked(&self, held: RefLock) -> Result<(), RefError> {
        let RefLock { lock, name, .. } = held;
        let path = self.ref_path(&name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RefError::Io(e)),
        }
        let mut packed = PackedRefs::load(&self.git_dir)?;
        if packed.remove(&name) {
            packed.write(&self.git_dir)?;
        }
        reflog::remove(&self.git_dir, &name)?;
        lock.rollback()?;
        Ok(())
    }

    /// The direct value visible while holding the ref's lock.
    fn read_direct_locked(&self, name: &RefName) -> Result<Option<ObjectId>, RefError> {
        if let Some(oid) = self.read_loose_direct(name)? {
            return Ok(Some(oid));
        }
        let packed = PackedRefs::load(&self.git_dir)?;
        Ok(packed.find(name).map(|r| r.oid))
    }

    fn read_loose_direct(&self, name: &RefName) -> Result<Option<ObjectId>, RefError> {
        match fs::read(self.ref_path(name)) {
            Ok(data) => match parse_ref_file(&data)? {
                RefValue::Direct(oid) => Ok(Some(oid)),
                RefValue::Symbolic(_) => Ok(None),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RefError::Io(e)),
        }
    }

    fn commit_value(&self, mut lock: LockFile, oid: ObjectId) -> Result<(), RefError> {
        writeln!(lock, "{}", oid.to_hex())?;
        lock.commit()?;
        Ok(())
    }
}

/// `true` when `current` satisfies the caller's expectation. A missing ref
/// compares equal to the zero OID.
fn expectation_met(expected: Option<ObjectId>, current: Option<ObjectId>) -> bool {
    match expected {
        None => true,
        Some(exp) if exp.is_null() => current.is_none(),
        Some(exp) => current == Some(exp),
    }
}

fn parse_ref_file(data: &[u8]) -> Result<RefValue, RefError> {
    let text = std::str::from_utf8(data).map_err(|_| RefError::Parse {
        what: "ref file".into(),
        reason: "not UTF-8".into(),
    })?;
    let text = text.trim_end();
    if let Some(target) = text.strip_prefix("ref: ") {
        return Ok(RefValue::Symbolic(RefName::new(target.trim())?));
    }
    Ok(RefValue::Direct(ObjectId::from_hex(text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use grit_utils::date::GitDate;

    fn committer() -> Signature {
        Signature::new("T", "t@x", GitDate::new(1_700_000_000, 0))
    }

    fn oid(b: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = b;
        ObjectId::from_bytes(&bytes, grit_hash::HashAlgorithm::Sha1).unwrap()
    }

    fn store(dir: &Path) -> FilesRefStore {
        FilesRefStore::new(dir)
    }

    fn main_ref() -> RefName {
        RefName::new("refs/heads/main").unwrap()
    }

    #[test]
    fn create_read_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        assert!(s
            .add_if_new(&main_ref(), oid(1), &committer(), "created")
            .unwrap());
        assert_eq!(
            s.read(&main_ref()).unwrap(),
            Some(RefValue::Direct(oid(1)))
        );
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(1)));
    }

    #[test]
    fn add_if_new_fails_on_existing() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s
            .add_if_new(&main_ref(), oid(1), &committer(), "a")
            .unwrap());
        assert!(!s
            .add_if_new(&main_ref(), oid(2), &committer(), "b")
            .unwrap());
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(1)));
    }

    #[test]
    fn cas_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add_if_new(&main_ref(), oid(1), &committer(), "init")
            .unwrap();

        // Matching expectation swaps.
        assert!(s
            .set_if_equals(&main_ref(), Some(oid(1)), oid(2), &committer(), "ok")
            .unwrap());
        // A stale expectation does not.
        assert!(!s
            .set_if_equals(&main_ref(), Some(oid(1)), oid(3), &committer(), "stale")
            .unwrap());
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(2)));

        // Exactly two reflog lines: init and the successful swap.
        let log = s.reflog(&main_ref()).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].old_oid, oid(1));
        assert_eq!(log[1].new_oid, oid(2));
    }

    #[test]
    fn unconditional_set() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add_if_new(&main_ref(), oid(1), &committer(), "init")
            .unwrap();
        assert!(s
            .set_if_equals(&main_ref(), None, oid(9), &committer(), "force")
            .unwrap());
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(9)));
    }

    #[test]
    fn update_through_head_follows_symref() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let head = RefName::new("HEAD").unwrap();
        s.set_symbolic(&head, &main_ref()).unwrap();

        assert!(s
            .set_if_equals(&head, None, oid(5), &committer(), "via HEAD")
            .unwrap());
        // The branch moved, HEAD still points at it symbolically.
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(5)));
        assert_eq!(
            s.read(&head).unwrap(),
            Some(RefValue::Symbolic(main_ref()))
        );
        // Both logs got the line.
        assert_eq!(s.reflog(&main_ref()).unwrap().len(), 1);
        assert_eq!(s.reflog(&head).unwrap().len(), 1);
    }

    #[test]
    fn unborn_head_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let head = RefName::new("HEAD").unwrap();
        s.set_symbolic(&head, &main_ref()).unwrap();
        assert_eq!(s.resolve(&head).unwrap(), None);
        assert!(s.read(&head).unwrap().unwrap().is_symbolic());
    }

    #[test]
    fn symref_chain_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        // a0 -> a1 -> ... -> a5 (direct): five indirections resolve.
        for i in 0..5 {
            let from = RefName::new(format!("refs/heads/a{i}")).unwrap();
            let to = RefName::new(format!("refs/heads/a{}", i + 1)).unwrap();
            s.set_symbolic(&from, &to).unwrap();
        }
        let tip = RefName::new("refs/heads/a5").unwrap();
        s.add_if_new(&tip, oid(5), &committer(), "tip").unwrap();
        assert_eq!(
            s.resolve(&RefName::new("refs/heads/a0").unwrap()).unwrap(),
            Some(oid(5))
        );

        // One more hop fails.
        let b0 = RefName::new("refs/heads/b0").unwrap();
        for i in 0..6 {
            let from = RefName::new(format!("refs/heads/b{i}")).unwrap();
            let to = RefName::new(format!("refs/heads/b{}", i + 1)).unwrap();
            s.set_symbolic(&from, &to).unwrap();
        }
        let b6 = RefName::new("refs/heads/b6").unwrap();
        s.add_if_new(&b6, oid(6), &committer(), "tip").unwrap();
        assert!(matches!(s.resolve(&b0), Err(RefError::SymrefLoop(_))));
    }

    #[test]
    fn symref_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let a = RefName::new("refs/heads/a").unwrap();
        let b = RefName::new("refs/heads/b").unwrap();
        s.set_symbolic(&a, &b).unwrap();
        s.set_symbolic(&b, &a).unwrap();
        assert!(matches!(s.resolve(&a), Err(RefError::SymrefLoop(_))));
    }

    #[test]
    fn loose_shadows_packed() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let mut packed = PackedRefs::default();
        packed.upsert(main_ref(), oid(1), None);
        packed.write(dir.path()).unwrap();
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(1)));

        // An update creates a loose ref shadowing the packed entry.
        assert!(s
            .set_if_equals(&main_ref(), Some(oid(1)), oid(2), &committer(), "up")
            .unwrap());
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(2)));
        let packed = PackedRefs::load(dir.path()).unwrap();
        assert_eq!(packed.find(&main_ref()).unwrap().oid, oid(1));
    }

    #[test]
    fn remove_deletes_loose_packed_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let mut packed = PackedRefs::default();
        packed.upsert(main_ref(), oid(1), None);
        packed.write(dir.path()).unwrap();
        s.set_if_equals(&main_ref(), None, oid(2), &committer(), "loose")
            .unwrap();

        assert!(s.remove_if_equals(&main_ref(), Some(oid(2))).unwrap());
        assert_eq!(s.read(&main_ref()).unwrap(), None);
        assert!(PackedRefs::load(dir.path())
            .unwrap()
            .find(&main_ref())
            .is_none());
        assert!(s.reflog(&main_ref()).unwrap().is_empty());
    }

    #[test]
    fn remove_with_stale_expectation_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add_if_new(&main_ref(), oid(1), &committer(), "init")
            .unwrap();
        assert!(!s.remove_if_equals(&main_ref(), Some(oid(9))).unwrap());
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(1)));
    }

    #[test]
    fn contended_lock_reported() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add_if_new(&main_ref(), oid(1), &committer(), "init")
            .unwrap();

        let _held = LockFile::acquire(dir.path().join("refs/heads/main")).unwrap();
        assert!(matches!(
            s.set_if_equals(&main_ref(), Some(oid(1)), oid(2), &committer(), "x"),
            Err(RefError::LockContended(_))
        ));
    }

    #[test]
    fn pack_refs_moves_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.add_if_new(&main_ref(), oid(1), &committer(), "a").unwrap();
        let other = RefName::new("refs/tags/v1").unwrap();
        s.add_if_new(&other, oid(2), &committer(), "b").unwrap();

        let moved = s.pack_refs_with(true, |o| (*o == oid(2)).then(|| oid(3))).unwrap();
        assert_eq!(moved, 2);

        // Loose files gone, still resolvable, tag peeled in packed-refs.
        assert!(!dir.path().join("refs/heads/main").is_file());
        assert_eq!(s.resolve(&main_ref()).unwrap(), Some(oid(1)));
        let packed = PackedRefs::load(dir.path()).unwrap();
        assert_eq!(packed.find(&other).unwrap().peeled, Some(oid(3)));
    }

    #[test]
    fn iter_merges_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let mut packed = PackedRefs::default();
        packed.upsert(RefName::new("refs/tags/v1").unwrap(), oid(7), None);
        packed.upsert(main_ref(), oid(1), None);
        packed.write(dir.path()).unwrap();
        // Shadow main with a loose value.
        s.set_if_equals(&main_ref(), None, oid(2), &committer(), "shadow")
            .unwrap();

        let refs = s.iter(None).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0.as_str(), "refs/heads/main");
        assert_eq!(refs[0].1, RefValue::Direct(oid(2)));
        assert_eq!(refs[1].0.as_str(), "refs/tags/v1");

        let heads = s.iter(Some("refs/heads/")).unwrap();
        assert_eq!(heads.len(), 1);
    }

    #[test]
    fn non_ascii_ref_name_survives() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let name = RefName::new("refs/heads/日本語").unwrap();
        s.add_if_new(&name, oid(4), &committer(), "utf8").unwrap();
        assert_eq!(s.resolve(&name).unwrap(), Some(oid(4)));
        let refs = s.iter(None).unwrap();
        assert_eq!(refs[0].0.as_str(), "refs/heads/日本語");
    }
}
