//! Repository creation.

use std::path::{Path, PathBuf};

use crate::RepoError;

/// Directories every control dir carries.
const SKELETON: &[&str] = &[
    "objects",
    "objects/info",
    "objects/pack",
    "refs",
    "refs/heads",
    "refs/tags",
    "info",
];

/// Create a repository at `path`. Non-bare init creates `<path>/.git`;
/// bare init uses `path` itself. Returns the control directory.
pub fn init(path: impl AsRef<Path>, bare: bool) -> Result<PathBuf, RepoError> {
    let git_dir = if bare {
        path.as_ref().to_path_buf()
    } else {
        path.as_ref().join(".git")
    };

    if git_dir.join("HEAD").exists() {
        return Err(RepoError::AlreadyExists(git_dir));
    }

    for dir in SKELETON {
        std::fs::create_dir_all(git_dir.join(dir))?;
    }

    // HEAD starts as a symref to a branch that does not exist yet.
    std::fs::write(git_dir.join("HEAD"), "ref: refs/heads/master\n")?;
    std::fs::write(git_dir.join("config"), config_skeleton(bare))?;
    std::fs::write(
        git_dir.join("description"),
        "Unnamed repository; edit this file 'description' to name the repository.\n",
    )?;

    Ok(git_dir)
}

fn config_skeleton(bare: bool) -> String {
    format!(
        "[core]\n\
         \trepositoryformatversion = 0\n\
         \tfilemode = true\n\
         \tbare = {bare}\n"
    )
}
