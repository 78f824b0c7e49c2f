//! The repository handle.
//!
//! Owns the control directory layout and glues the object database and
//! ref store together. Everything callers see of `.git` on disk
//! (`HEAD`, `objects/`, `refs/`, `packed-refs`, `shallow`, `info/`) is
//! created and maintained here.

pub mod init;
pub mod server_info;

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use bstr::BString;
use grit_hash::ObjectId;
use grit_object::{Commit, Object};
use grit_odb::ObjectDatabase;
use grit_ref::{FilesRefStore, RefName, RefValue};
use grit_utils::date::Signature;
use grit_utils::lockfile::LockFile;

/// Errors from repository-level operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("not a git repository (or any parent): {0}")]
    NotARepository(PathBuf),

    #[error("repository already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error(transparent)]
    Odb(#[from] grit_odb::OdbError),

    #[error(transparent)]
    Ref(#[from] grit_ref::RefError),

    #[error(transparent)]
    Hash(#[from] grit_hash::HashError),

    #[error(transparent)]
    Util(#[from] grit_utils::UtilError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An open repository.
pub struct Repository {
    git_dir: PathBuf,
    odb: ObjectDatabase,
    refs: FilesRefStore,
}

impl Repository {
    /// Open the repository whose control directory is at or above `path`:
    /// `<path>/.git`, `path` itself when bare, else walking up parents.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let start = path.as_ref().to_path_buf();
        let mut candidate = Some(start.clone());
        while let Some(dir) = candidate {
            let dotgit = dir.join(".git");
            if is_control_dir(&dotgit) {
                return Self::open_git_dir(dotgit);
            }
            if is_control_dir(&dir) {
                return Self::open_git_dir(dir);
            }
            candidate = dir.parent().map(Path::to_path_buf);
        }
        Err(RepoError::NotARepository(start))
    }

    /// Open an exact control directory.
    pub fn open_git_dir(git_dir: impl AsRef<Path>) -> Result<Self, RepoError> {
        let git_dir = git_dir.as_ref().to_path_buf();
        if !is_control_dir(&git_dir) {
            return Err(RepoError::NotARepository(git_dir));
        }
        let odb = ObjectDatabase::open(git_dir.join("objects"))?;
        let refs = FilesRefStore::new(&git_dir);
        Ok(Self {
            git_dir,
            odb,
            refs,
        })
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn odb(&self) -> &ObjectDatabase {
        &self.odb
    }

    pub fn refs(&self) -> &FilesRefStore {
        &self.refs
    }

    /// The commit HEAD resolves to; `None` on an unborn branch.
    pub fn head(&self) -> Result<Option<ObjectId>, RepoError> {
        Ok(self.refs.resolve(&RefName::new("HEAD")?)?)
    }

    /// The branch HEAD points at, when it is symbolic.
    pub fn current_branch(&self) -> Result<Option<RefName>, RepoError> {
        match self.refs.read(&RefName::new("HEAD")?)? {
            Some(RefValue::Symbolic(target)) => Ok(Some(target)),
            _ => Ok(None),
        }
    }

    /// Record a commit object; plumbing for tests and porcelain.
    pub fn commit_tree(
        &self,
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: &Signature,
        message: &str,
    ) -> Result<ObjectId, RepoError> {
        let commit = Commit {
            tree,
            parents,
            author: author.clone(),
            committer: author.clone(),
            encoding: None,
            extra_headers: Vec::new(),
            gpgsig: None,
            message: BString::from(message),
        };
        Ok(self.odb.add(&Object::Commit(commit))?)
    }

    /// The shallow boundary set from the `shallow` file.
    pub fn shallow(&self) -> Result<HashSet<ObjectId>, RepoError> {
        let path = self.git_dir.join("shallow");
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(RepoError::Io(e)),
        };
        let mut set = HashSet::new();
        for line in contents.lines() {
            let line = line.trim();
            if !line.is_empty() {
                set.insert(ObjectId::from_hex(line)?);
            }
        }
        Ok(set)
    }

    /// Rewrite the `shallow` file under its lock; an empty set removes it.
    pub fn write_shallow(&self, set: &HashSet<ObjectId>) -> Result<(), RepoError> {
        let path = self.git_dir.join("shallow");
        if set.is_empty() {
            let lock = LockFile::acquire(&path)?;
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RepoError::Io(e)),
            }
            lock.rollback()?;
            return Ok(());
        }

        let mut lock = LockFile::acquire(&path)?;
        let mut lines: Vec<String> = set.iter().map(|oid| oid.to_hex()).collect();
        lines.sort();
        for line in lines {
            writeln!(lock, "{line}")?;
        }
        lock.commit()?;
        Ok(())
    }

    /// Fold a fetch's shallow/unshallow answer into the local set.
    pub fn update_shallow(
        &self,
        new_shallow: &[ObjectId],
        new_unshallow: &[ObjectId],
    ) -> Result<(), RepoError> {
        let mut set = self.shallow()?;
        for oid in new_unshallow {
            set.remove(oid);
        }
        set.extend(new_shallow.iter().copied());
        self.write_shallow(&set)
    }
}

/// A directory is a control dir when it has the object store skeleton.
fn is_control_dir(path: &Path) -> bool {
    path.join("objects").is_dir() && path.join("HEAD").is_file()
}
