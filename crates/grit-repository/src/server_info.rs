//! Dumb-HTTP index files.
//!
//! Clients without the smart protocol discover refs through `info/refs`
//! and packs through `objects/info/packs`; both are flat text files that
//! must be regenerated after refs move or packs land.

use std::io::Write;

use grit_utils::lockfile::LockFile;

use crate::{RepoError, Repository};

impl Repository {
    /// Regenerate `info/refs` and `objects/info/packs`.
    pub fn update_server_info(&self) -> Result<(), RepoError> {
        self.write_info_refs()?;
        self.write_info_packs()?;
        Ok(())
    }

    fn write_info_refs(&self) -> Result<(), RepoError> {
        let path = self.git_dir().join("info").join("refs");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut lock = LockFile::acquire(&path)?;
        for (name, oid) in self.refs().iter_resolved(None)? {
            writeln!(lock, "{}\t{}", oid.to_hex(), name)?;
        }
        lock.commit()?;
        Ok(())
    }

    fn write_info_packs(&self) -> Result<(), RepoError> {
        let pack_dir = self.odb().pack_dir();
        let mut names: Vec<String> = Vec::new();
        if pack_dir.is_dir() {
            for entry in std::fs::read_dir(&pack_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".pack") {
                    names.push(name);
                }
            }
        }
        names.sort();

        let path = self.git_dir().join("objects").join("info").join("packs");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut lock = LockFile::acquire(&path)?;
        for name in names {
            writeln!(lock, "P {name}")?;
        }
        writeln!(lock)?;
        lock.commit()?;
        Ok(())
    }
}
