//! Alternate object databases.
//!
//! `objects/info/alternates` lists further objects directories, one per
//! line, absolute or relative to the objects directory. Lines starting
//! with `#` are comments. Alternates may have alternates of their own;
//! nesting is capped the way C git caps it.

use std::path::Path;

use crate::{ObjectDatabase, OdbError};

/// Maximum alternate nesting depth.
pub const MAX_DEPTH: usize = 5;

pub(crate) fn load(objects_dir: &Path, depth: usize) -> Result<Vec<ObjectDatabase>, OdbError> {
    let path = objects_dir.join("info").join("alternates");
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(OdbError::Io(e)),
    };

    // Beyond the cap the chain is ignored rather than failing the open,
    // which also terminates circular chains.
    if depth >= MAX_DEPTH {
        return Ok(Vec::new());
    }

    let mut alternates = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let alt_dir = if Path::new(line).is_absolute() {
            Path::new(line).to_path_buf()
        } else {
            objects_dir.join(line)
        };
        if !alt_dir.is_dir() {
            // Dangling alternates are skipped, matching C git's tolerance.
            continue;
        }
        alternates.push(ObjectDatabase::open_depth(&alt_dir, depth + 1)?);
    }
    Ok(alternates)
}
