use std::cmp::Ordering;

use bstr::{BStr, BString, ByteSlice};
use grit_hash::{HashAlgorithm, ObjectId};

use crate::{ObjectError, ParseOptions};

/// File mode of a tree entry.
///
/// The canonical set is closed; `Unknown` only survives lenient parsing so
/// historical objects keep their exact bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMode {
    /// Regular file (100644).
    Regular,
    /// Executable file (100755).
    Executable,
    /// Symbolic link (120000).
    Symlink,
    /// Submodule commit reference (160000).
    Gitlink,
    /// Subdirectory (40000).
    Directory,
    /// Out-of-set mode preserved for round-trip (lenient parsing only).
    Unknown(u32),
}

impl FileMode {
    /// Parse octal ASCII (e.g. `b"100644"`).
    pub fn from_bytes(s: &[u8]) -> Result<Self, ObjectError> {
        let raw = parse_octal(s)
            .ok_or_else(|| ObjectError::InvalidFileMode(String::from_utf8_lossy(s).into()))?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0o100644 => Self::Regular,
            0o100755 => Self::Executable,
            0o120000 => Self::Symlink,
            0o160000 => Self::Gitlink,
            0o040000 => Self::Directory,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Symlink => 0o120000,
            Self::Gitlink => 0o160000,
            Self::Directory => 0o40000,
            Self::Unknown(v) => *v,
        }
    }

    /// Octal ASCII form, no leading zeros (git writes `40000`, not `040000`).
    pub fn as_bytes(&self) -> BString {
        BString::from(format!("{:o}", self.raw()))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory)
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Self::Regular | Self::Executable)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Self::Symlink)
    }

    pub fn is_gitlink(&self) -> bool {
        matches!(self, Self::Gitlink)
    }

    fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

fn parse_octal(s: &[u8]) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    let mut val: u32 = 0;
    for &b in s {
        if !(b'0'..=b'7').contains(&b) {
            return None;
        }
        val = val.checked_mul(8)?.checked_add(u32::from(b - b'0'))?;
    }
    Some(val)
}

/// One entry of a tree: mode, name, and the referenced OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub name: BString,
    pub oid: ObjectId,
}

impl TreeEntry {
    /// Git's tree ordering: directories compare as if their name had a
    /// trailing `/`, so `foo` (dir) sorts after `foo.c` but a file `foo`
    /// sorts before it.
    pub fn cmp_entries(a: &TreeEntry, b: &TreeEntry) -> Ordering {
        sort_key_compare(
            a.name.as_ref(),
            a.mode.is_directory(),
            b.name.as_ref(),
            b.mode.is_directory(),
        )
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::cmp_entries(self, other)
    }
}

/// Compare names after the shared prefix, substituting `/` for
/// end-of-string on directories (C git's `base_name_compare`).
fn sort_key_compare(name1: &[u8], is_dir1: bool, name2: &[u8], is_dir2: bool) -> Ordering {
    let min_len = name1.len().min(name2.len());
    match name1[..min_len].cmp(&name2[..min_len]) {
        Ordering::Equal => {}
        other => return other,
    }
    let next = |name: &[u8], is_dir: bool| -> u8 {
        if name.len() > min_len {
            name[min_len]
        } else if is_dir {
            b'/'
        } else {
            0
        }
    };
    next(name1, is_dir1).cmp(&next(name2, is_dir2))
}

/// A tree: an ordered directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict parse: known modes, strictly increasing entry order.
    pub fn parse(body: &[u8]) -> Result<Self, ObjectError> {
        Self::parse_with(body, ParseOptions::strict())
    }

    /// Parse the binary body: repeated `<octal-mode> <name>\0<raw-oid>`.
    pub fn parse_with(body: &[u8], opts: ParseOptions) -> Result<Self, ObjectError> {
        let oid_len = HashAlgorithm::Sha1.digest_len();
        let mut entries: Vec<TreeEntry> = Vec::new();
        let mut pos = 0;

        while pos < body.len() {
            let space = body[pos..]
                .find_byte(b' ')
                .map(|p| p + pos)
                .ok_or_else(|| ObjectError::InvalidTreeEntry {
                    offset: pos,
                    reason: "missing space after mode".into(),
                })?;

            let mode =
                FileMode::from_bytes(&body[pos..space]).map_err(|_| {
                    ObjectError::InvalidTreeEntry {
                        offset: pos,
                        reason: "unparseable mode".into(),
                    }
                })?;
            if !opts.lenient && !mode.is_known() {
                return Err(ObjectError::InvalidTreeEntry {
                    offset: pos,
                    reason: format!("mode {:o} not in the canonical set", mode.raw()),
                });
            }

            let name_start = space + 1;
            let nul = body[name_start..]
                .find_byte(0)
                .map(|p| p + name_start)
                .ok_or_else(|| ObjectError::InvalidTreeEntry {
                    offset: name_start,
                    reason: "missing NUL after name".into(),
                })?;
            let name = BString::from(&body[name_start..nul]);
            if name.is_empty() {
                return Err(ObjectError::InvalidTreeEntry {
                    offset: name_start,
                    reason: "empty name".into(),
                });
            }

            let oid_start = nul + 1;
            if oid_start + oid_len > body.len() {
                return Err(ObjectError::InvalidTreeEntry {
                    offset: oid_start,
                    reason: "truncated OID".into(),
                });
            }
            let oid = ObjectId::from_bytes(&body[oid_start..oid_start + oid_len], HashAlgorithm::Sha1)?;

            let entry = TreeEntry { mode, name, oid };
            if !opts.lenient {
                if let Some(prev) = entries.last() {
                    match TreeEntry::cmp_entries(prev, &entry) {
                        Ordering::Less => {}
                        Ordering::Equal => {
                            return Err(ObjectError::InvalidTreeEntry {
                                offset: pos,
                                reason: format!("duplicate entry {:?}", entry.name),
                            });
                        }
                        Ordering::Greater => {
                            return Err(ObjectError::InvalidTreeEntry {
                                offset: pos,
                                reason: format!("entry {:?} out of order", entry.name),
                            });
                        }
                    }
                }
            }
            entries.push(entry);
            pos = oid_start + oid_len;
        }

        Ok(Self { entries })
    }

    /// Canonical body: entries in sort order, `<mode> <name>\0<raw-oid>`.
    pub fn serialize_body(&self) -> Vec<u8> {
        let mut sorted = self.entries.clone();
        sorted.sort();

        let mut out = Vec::new();
        for entry in &sorted {
            out.extend_from_slice(&entry.mode.as_bytes());
            out.push(b' ');
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.oid.as_bytes());
        }
        out
    }

    pub fn sort(&mut self) {
        self.entries.sort();
    }

    pub fn find(&self, name: &BStr) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name.as_bstr() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
