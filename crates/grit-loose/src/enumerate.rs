use std::fs;
use std::path::PathBuf;

use grit_hash::ObjectId;

use crate::{LooseError, LooseStore};

/// Iterator over every loose OID in an objects directory.
///
/// Walks the two-hex-char fan-out directories in sorted order; non-hex
/// file names (tempfiles and the like) are skipped.
pub struct LooseIter {
    dirs: Vec<PathBuf>,
    dir_index: usize,
    current: Vec<String>,
    entry_index: usize,
    prefix: String,
}

impl LooseIter {
    fn new(objects_dir: &std::path::Path) -> Result<Self, LooseError> {
        let mut dirs = Vec::new();
        if objects_dir.is_dir() {
            for entry in fs::read_dir(objects_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.len() == 2
                    && name.bytes().all(|b| b.is_ascii_hexdigit())
                    && entry.file_type()?.is_dir()
                {
                    dirs.push(entry.path());
                }
            }
        }
        dirs.sort();

        Ok(Self {
            dirs,
            dir_index: 0,
            current: Vec::new(),
            entry_index: 0,
            prefix: String::new(),
        })
    }

    fn advance_dir(&mut self) -> Result<bool, LooseError> {
        while self.dir_index < self.dirs.len() {
            let dir = &self.dirs[self.dir_index];
            self.dir_index += 1;
            self.prefix = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();

            let mut names: Vec<String> = Vec::new();
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();

            if !names.is_empty() {
                self.current = names;
                self.entry_index = 0;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Iterator for LooseIter {
    type Item = Result<ObjectId, LooseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.entry_index < self.current.len() {
                let name = &self.current[self.entry_index];
                self.entry_index += 1;

                if !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                    continue;
                }
                match ObjectId::from_hex(&format!("{}{}", self.prefix, name)) {
                    Ok(oid) => return Some(Ok(oid)),
                    Err(_) => continue,
                }
            }

            match self.advance_dir() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl LooseStore {
    /// Enumerate all loose OIDs, sorted.
    pub fn iter(&self) -> Result<LooseIter, LooseError> {
        LooseIter::new(&self.objects_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grit_hash::HashAlgorithm;
    use grit_object::{Blob, Object};

    #[test]
    fn iterates_written_objects_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::open(dir.path(), HashAlgorithm::Sha1);

        let mut written: Vec<ObjectId> = (0..5u8)
            .map(|i| {
                store
                    .write(&Object::Blob(Blob::new(vec![b'x', i])))
                    .unwrap()
            })
            .collect();
        written.sort();

        let seen: Vec<ObjectId> = store.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(seen, written);
    }

    #[test]
    fn skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::open(dir.path(), HashAlgorithm::Sha1);
        let oid = store
            .write(&Object::Blob(Blob::new(&b"keep"[..])))
            .unwrap();

        // Pack dir and stray files must not confuse enumeration.
        fs::create_dir_all(dir.path().join("pack")).unwrap();
        fs::create_dir_all(dir.path().join("info")).unwrap();
        fs::write(dir.path().join(format!("{:02x}", oid.first_byte())).join("not-hex!"), b"x")
            .unwrap();

        let seen: Vec<ObjectId> = store.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(seen, vec![oid]);
    }

    #[test]
    fn empty_store_is_empty_iter() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::open(dir.path(), HashAlgorithm::Sha1);
        assert_eq!(store.iter().unwrap().count(), 0);
    }
}
