//! The `packed-refs` file.
//!
//! Format:
//!
//! ```text
//! # pack-refs with: peeled fully-peeled sorted
//! <hex-oid> <refname>
//! ^<hex-oid>            (peeled target of the annotated tag above)
//! ```
//!
//! Rewrites go through `packed-refs.lock`, making updates of the file
//! globally linearizable.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bstr::ByteSlice;
use grit_hash::ObjectId;
use grit_utils::lockfile::LockFile;

use crate::name::RefName;
use crate::RefError;

#[derive(Debug, Clone)]
pub struct PackedRef {
    pub name: RefName,
    pub oid: ObjectId,
    /// For annotated tags: the fully-peeled target.
    pub peeled: Option<ObjectId>,
}

/// In-memory image of the packed-refs file.
#[derive(Debug, Clone, Default)]
pub struct PackedRefs {
    refs: Vec<PackedRef>,
    sorted: bool,
}

impl PackedRefs {
    pub fn parse(data: &[u8]) -> Result<Self, RefError> {
        let mut refs: Vec<PackedRef> = Vec::new();
        let mut sorted = false;

        for line in data.lines() {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(b"#") {
                if line.find(b"sorted").is_some() {
                    sorted = true;
                }
                continue;
            }
            if let Some(peeled_hex) = line.strip_prefix(b"^") {
                let peeled = parse_oid(peeled_hex)?;
                match refs.last_mut() {
                    Some(last) => last.peeled = Some(peeled),
                    None => {
                        return Err(RefError::Parse {
                            what: "packed-refs".into(),
                            reason: "peeled line before any ref".into(),
                        })
                    }
                }
                continue;
            }

            let space = line.find_byte(b' ').ok_or_else(|| RefError::Parse {
                what: "packed-refs".into(),
                reason: format!("malformed line: {:?}", line.as_bstr()),
            })?;
            let oid = parse_oid(&line[..space])?;
            let name_str =
                std::str::from_utf8(&line[space + 1..]).map_err(|_| RefError::Parse {
                    what: "packed-refs".into(),
                    reason: "non-UTF-8 ref name".into(),
                })?;
            refs.push(PackedRef {
                name: RefName::new(name_str.trim_end())?,
                oid,
                peeled: None,
            });
        }

        Ok(Self { refs, sorted })
    }

    /// Load from `git_dir`; an absent file is an empty set.
    pub fn load(git_dir: &Path) -> Result<Self, RefError> {
        match fs::read(path_in(git_dir)) {
            Ok(data) => Self::parse(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                refs: Vec::new(),
                sorted: true,
            }),
            Err(e) => Err(RefError::Io(e)),
        }
    }

    pub fn find(&self, name: &RefName) -> Option<&PackedRef> {
        if self.sorted {
            self.refs
                .binary_search_by(|r| r.name.cmp(name))
                .ok()
                .map(|i| &self.refs[i])
        } else {
            self.refs.iter().find(|r| r.name == *name)
        }
    }

    pub fn upsert(&mut self, name: RefName, oid: ObjectId, peeled: Option<ObjectId>) {
        match self.refs.iter_mut().find(|r| r.name == name) {
            Some(existing) => {
                existing.oid = oid;
                existing.peeled = peeled;
            }
            None => {
                self.refs.push(PackedRef { name, oid, peeled });
                self.refs.sort_by(|a, b| a.name.cmp(&b.name));
                self.sorted = true;
            }
        }
    }

    pub fn remove(&mut self, name: &RefName) -> bool {
        let before = self.refs.len();
        self.refs.retain(|r| r.name != *name);
        self.refs.len() < before
    }

    pub fn refs(&self) -> &[PackedRef] {
        &self.refs
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Rewrite the file under `packed-refs.lock`.
    pub fn write(&self, git_dir: &Path) -> Result<(), RefError> {
        let mut lock = LockFile::acquire(path_in(git_dir))?;

        lock.write_all(b"# pack-refs with: peeled fully-peeled sorted \n")?;

        let mut sorted = self.refs.clone();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        for r in &sorted {
            writeln!(lock, "{} {}", r.oid.to_hex(), r.name)?;
            if let Some(peeled) = &r.peeled {
                writeln!(lock, "^{}", peeled.to_hex())?;
            }
        }

        lock.commit()?;
        Ok(())
    }
}

fn parse_oid(hex: &[u8]) -> Result<ObjectId, RefError> {
    let hex = std::str::from_utf8(hex).map_err(|_| RefError::Parse {
        what: "packed-refs".into(),
        reason: "non-UTF-8 OID".into(),
    })?;
    Ok(ObjectId::from_hex(hex.trim())?)
}

fn path_in(git_dir: &Path) -> PathBuf {
    git_dir.join("packed-refs")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(b: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = b;
        ObjectId::from_bytes(&bytes, grit_hash::HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn parse_header_and_refs() {
        let data = b"# pack-refs with: peeled fully-peeled sorted \n\
                     aa00000000000000000000000000000000000000 refs/heads/main\n\
                     bb00000000000000000000000000000000000000 refs/tags/v1\n\
                     ^cc00000000000000000000000000000000000000\n";
        let packed = PackedRefs::parse(data).unwrap();
        assert_eq!(packed.refs().len(), 2);

        let tag = packed.find(&RefName::new("refs/tags/v1").unwrap()).unwrap();
        assert_eq!(tag.oid, oid(0xbb));
        assert_eq!(tag.peeled, Some(oid(0xcc)));

        let main = packed
            .find(&RefName::new("refs/heads/main").unwrap())
            .unwrap();
        assert_eq!(main.peeled, None);
    }

    #[test]
    fn orphan_peeled_line_rejected() {
        assert!(PackedRefs::parse(b"^aa00000000000000000000000000000000000000\n").is_err());
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let packed = PackedRefs::load(dir.path()).unwrap();
        assert!(packed.is_empty());
    }

    #[test]
    fn write_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut packed = PackedRefs::default();
        packed.upsert(RefName::new("refs/heads/main").unwrap(), oid(1), None);
        packed.upsert(
            RefName::new("refs/tags/v1").unwrap(),
            oid(2),
            Some(oid(3)),
        );
        packed.write(dir.path()).unwrap();

        let loaded = PackedRefs::load(dir.path()).unwrap();
        assert_eq!(loaded.refs().len(), 2);
        assert_eq!(
            loaded
                .find(&RefName::new("refs/tags/v1").unwrap())
                .unwrap()
                .peeled,
            Some(oid(3))
        );
        // No stray lock left behind.
        assert!(!dir.path().join("packed-refs.lock").exists());
    }

    #[test]
    fn upsert_updates_in_place() {
        let mut packed = PackedRefs::default();
        let name = RefName::new("refs/heads/x").unwrap();
        packed.upsert(name.clone(), oid(1), None);
        packed.upsert(name.clone(), oid(2), None);
        assert_eq!(packed.refs().len(), 1);
        assert_eq!(packed.find(&name).unwrap().oid, oid(2));
        assert!(packed.remove(&name));
        assert!(!packed.remove(&name));
    }

    #[test]
    fn concurrent_write_blocked_by_lock() {
        let dir = tempfile::tempdir().unwrap();
        let _held = LockFile::acquire(dir.path().join("packed-refs")).unwrap();

        let packed = PackedRefs::default();
        assert!(matches!(
            packed.write(dir.path()),
            Err(RefError::LockContended(_))
        ));
    }
}
