//! Reflogs: append-only journals of ref transitions.
//!
//! One file per ref at `logs/<refname>`. Each line is
//! `<old-sha> <new-sha> <ident> <ts> <tz>\t<message>\n`, with the zero SHA
//! standing in for "did not exist" on creation and deletion.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use bstr::{BStr, BString, ByteSlice};
use grit_hash::ObjectId;
use grit_utils::date::Signature;

use crate::name::RefName;
use crate::RefError;

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    pub old_oid: ObjectId,
    pub new_oid: ObjectId,
    pub committer: Signature,
    pub message: BString,
}

impl ReflogEntry {
    /// Parse one `\n`-stripped reflog line.
    pub fn parse(line: &BStr) -> Result<Self, RefError> {
        let tab = line.find_byte(b'\t').unwrap_or(line.len());
        let (head, message) = if tab < line.len() {
            (&line[..tab], BString::from(&line[tab + 1..]))
        } else {
            (&line[..], BString::new(Vec::new()))
        };

        let bad = |reason: &str| RefError::Parse {
            what: "reflog line".into(),
            reason: reason.into(),
        };

        if head.len() < 82 || head[40] != b' ' {
            return Err(bad("too short"));
        }
        let old_oid = ObjectId::from_hex(
            std::str::from_utf8(&head[..40]).map_err(|_| bad("non-UTF-8 old OID"))?,
        )?;
        let new_oid = ObjectId::from_hex(
            std::str::from_utf8(&head[41..81]).map_err(|_| bad("non-UTF-8 new OID"))?,
        )?;
        let committer = Signature::parse(BStr::new(&head[82..]))
            .map_err(|e| bad(&format!("bad identity: {e}")))?;

        Ok(Self {
            old_oid,
            new_oid,
            committer,
            message,
        })
    }

    pub fn to_line(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.old_oid.to_hex().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.new_oid.to_hex().as_bytes());
        out.push(b' ');
        out.extend_from_slice(&self.committer.to_bytes());
        out.push(b'\t');
        out.extend_from_slice(&self.message);
        out.push(b'\n');
        out
    }
}

pub(crate) fn log_path(git_dir: &Path, name: &RefName) -> PathBuf {
    git_dir.join("logs").join(name.as_str())
}

/// Append one entry, creating the log file and parents as needed.
pub fn append(git_dir: &Path, name: &RefName, entry: &ReflogEntry) -> Result<(), RefError> {
    let path = log_path(git_dir, name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    file.write_all(&entry.to_line())?;
    Ok(())
}

/// Read all entries, oldest first. An absent log is an empty history.
pub fn read(git_dir: &Path, name: &RefName) -> Result<Vec<ReflogEntry>, RefError> {
    let data = match std::fs::read(log_path(git_dir, name)) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RefError::Io(e)),
    };
    data.lines()
        .filter(|l| !l.is_empty())
        .map(|l| ReflogEntry::parse(l.as_bstr()))
        .collect()
}

/// Drop a ref's log (on ref deletion).
pub fn remove(git_dir: &Path, name: &RefName) -> Result<(), RefError> {
    match std::fs::remove_file(log_path(git_dir, name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RefError::Io(e)),
    }
}
