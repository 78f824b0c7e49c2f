//! The unified object database.
//!
//! Presents one `get`/`contains`/`add` surface over three storage tiers:
//! the loose directory, mmap'd packs (newest first), and alternate object
//! databases (recursively). Pack handles and decompressed delta bases are
//! cached; the pack directory is re-scanned on lookup miss so freshly
//! installed packs become visible without restarting.

pub mod alternates;
pub mod cache;
pub mod missing;
pub mod prefix;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use grit_hash::{HashAlgorithm, ObjectId};
use grit_loose::LooseStore;
use grit_object::{Object, ObjectType, ParseOptions};
use grit_pack::pack::{Pack, PackData};
use grit_pack::resolve::complete_thin_pack;

use cache::{BaseCache, ObjectCache, PackBaseCache};

pub use missing::{MissingObjectsFinder, PackHint};

/// Errors from object database operations.
#[derive(Debug, thiserror::Error)]
pub enum OdbError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("ambiguous prefix {prefix}: {count} matches")]
    AmbiguousPrefix { prefix: String, count: usize },

    #[error("no object matches prefix {0}")]
    PrefixNotFound(String),

    #[error("corrupt object {oid}: {reason}")]
    Corrupt { oid: ObjectId, reason: String },

    #[error("expected {expected} at {oid}, found {actual}")]
    TypeMismatch {
        oid: ObjectId,
        expected: ObjectType,
        actual: ObjectType,
    },

    #[error(transparent)]
    Loose(#[from] grit_loose::LooseError),

    #[error(transparent)]
    Pack(#[from] grit_pack::PackError),

    #[error(transparent)]
    Object(#[from] grit_object::ObjectError),

    #[error(transparent)]
    Hash(#[from] grit_hash::HashError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Header-only object info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub obj_type: ObjectType,
    pub size: usize,
}

struct OpenPack {
    name: String,
    pack: Pack,
}

/// Union over loose objects, packs, and alternates.
pub struct ObjectDatabase {
    loose: LooseStore,
    packs: RwLock<Vec<Arc<OpenPack>>>,
    alternates: Vec<ObjectDatabase>,
    object_cache: Mutex<ObjectCache>,
    base_cache: Mutex<BaseCache>,
    objects_dir: PathBuf,
    hash_algo: HashAlgorithm,
}

impl ObjectDatabase {
    pub fn open(objects_dir: impl AsRef<Path>) -> Result<Self, OdbError> {
        Self::open_depth(objects_dir.as_ref(), 0)
    }

    pub(crate) fn open_depth(objects_dir: &Path, depth: usize) -> Result<Self, OdbError> {
        let objects_dir = objects_dir.to_path_buf();
        let hash_algo = HashAlgorithm::Sha1;
        let loose = LooseStore::open(&objects_dir, hash_algo);
        let packs = scan_packs(&objects_dir)?;
        let alternates = alternates::load(&objects_dir, depth)?;

        Ok(Self {
            loose,
            packs: RwLock::new(packs),
            alternates,
            object_cache: Mutex::new(ObjectCache::new(1024)),
            base_cache: Mutex::new(BaseCache::default()),
            objects_dir,
            hash_algo,
        })
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub fn pack_dir(&self) -> PathBuf {
        self.objects_dir.join("pack")
    }

    pub fn hash_algo(&self) -> HashAlgorithm {
        self.hash_algo
    }

    /// Fetch and parse an object: loose, then packs, then alternates.
    pub fn get(&self, oid: &ObjectId) -> Result<Option<Object>, OdbError> {
        {
            let mut cache = self.object_cache.lock().expect("cache lock");
            if let Some(obj) = cache.get(oid) {
                return Ok(Some(obj.clone()));
            }
        }

        let found = match self.get_raw(oid)? {
            Some((obj_type, data)) => {
                Some(Object::parse_body_with(obj_type, &data, ParseOptions::lenient())?)
            }
            None => None,
        };

        if let Some(ref obj) = found {
            let mut cache = self.object_cache.lock().expect("cache lock");
            cache.insert(*oid, obj.clone());
        }
        Ok(found)
    }

    /// `get`, erroring on absence.
    pub fn get_required(&self, oid: &ObjectId) -> Result<Object, OdbError> {
        self.get(oid)?.ok_or(OdbError::NotFound(*oid))
    }

    /// Fetch the unparsed body with its type.
    pub fn get_raw(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, OdbError> {
        // Loose first: cheapest to probe and always newest data.
        if let Some(raw) = self.loose.read_raw(oid)? {
            let (obj_type, size, header_len) = grit_object::header::parse_header(&raw)?;
            if raw.len() < header_len + size {
                return Err(OdbError::Corrupt {
                    oid: *oid,
                    reason: "loose object shorter than its header claims".into(),
                });
            }
            let body = raw[header_len..header_len + size].to_vec();
            return Ok(Some((obj_type, body)));
        }

        if let Some(found) = self.read_from_packs(oid)? {
            return Ok(Some(found));
        }

        // A pack may have landed since the last scan.
        if self.refresh()? {
            if let Some(found) = self.read_from_packs(oid)? {
                return Ok(Some(found));
            }
        }

        for alt in &self.alternates {
            if let Some(found) = alt.get_raw(oid)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Header-only lookup.
    pub fn get_info(&self, oid: &ObjectId) -> Result<Option<ObjectInfo>, OdbError> {
        if let Some((obj_type, size)) = self.loose.read_header(oid)? {
            return Ok(Some(ObjectInfo { obj_type, size }));
        }
        match self.get_raw(oid)? {
            Some((obj_type, data)) => Ok(Some(ObjectInfo {
                obj_type,
                size: data.len(),
            })),
            None => Ok(None),
        }
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        if self.loose.contains(oid) {
            return true;
        }
        {
            let packs = self.packs.read().expect("packs lock");
            if packs.iter().any(|p| p.pack.contains(oid)) {
                return true;
            }
        }
        if self.refresh().unwrap_or(false) {
            let packs = self.packs.read().expect("packs lock");
            if packs.iter().any(|p| p.pack.contains(oid)) {
                return true;
            }
        }
        self.alternates.iter().any(|alt| alt.contains(oid))
    }

    /// Store a new object loose; returns its OID.
    pub fn add(&self, obj: &Object) -> Result<ObjectId, OdbError> {
        Ok(self.loose.write(obj)?)
    }

    /// Store a pre-serialized body loose.
    pub fn add_raw(&self, obj_type: ObjectType, body: &[u8]) -> Result<ObjectId, OdbError> {
        Ok(self.loose.write_raw(obj_type, body)?)
    }

    /// Ingest a received (possibly thin) pack: complete it against this
    /// store, install the pack/index pair, and pick it up.
    pub fn install_pack(&self, data: &PackData) -> Result<(PathBuf, u32), OdbError> {
        let (path, _checksum, count) = complete_thin_pack(
            data,
            |oid| self.get_raw(oid).ok().flatten(),
            &self.pack_dir(),
        )?;
        self.refresh()?;
        Ok((path, count))
    }

    /// Re-scan the pack directory; true if the pack set changed.
    pub fn refresh(&self) -> Result<bool, OdbError> {
        let current: Vec<String> = {
            let packs = self.packs.read().expect("packs lock");
            packs.iter().map(|p| p.name.clone()).collect()
        };
        let on_disk = list_pack_names(&self.objects_dir)?;
        if current == on_disk {
            return Ok(false);
        }
        let fresh = scan_packs(&self.objects_dir)?;
        *self.packs.write().expect("packs lock") = fresh;
        Ok(true)
    }

    /// Every OID in this store and its alternates. Order is unspecified;
    /// duplicates are possible when an object is both loose and packed.
    pub fn iter_all_oids(&self) -> Result<Vec<ObjectId>, OdbError> {
        let mut oids = Vec::new();
        for oid in self.loose.iter()? {
            oids.push(oid?);
        }
        {
            let packs = self.packs.read().expect("packs lock");
            for open in packs.iter() {
                oids.extend(open.pack.index().iter().map(|(oid, _, _)| oid));
            }
        }
        for alt in &self.alternates {
            oids.extend(alt.iter_all_oids()?);
        }
        Ok(oids)
    }

    /// Resolve a hex prefix to the unique matching OID.
    pub fn resolve_prefix(&self, hex_prefix: &str) -> Result<ObjectId, OdbError> {
        prefix::resolve(self, hex_prefix)
    }

    fn read_from_packs(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, OdbError> {
        let packs = self.packs.read().expect("packs lock");
        for open in packs.iter() {
            if open.pack.contains(oid) {
                let mut base_cache = self.base_cache.lock().expect("base cache lock");
                let mut adapter = PackBaseCache {
                    cache: &mut base_cache,
                    pack_name: &open.name,
                };
                if let Some(found) = open.pack.read_object_cached(oid, &mut adapter)? {
                    return Ok(Some((found.obj_type, found.data)));
                }
            }
        }
        Ok(None)
    }
}

/// Pack basenames on disk, newest first. The same ordering is used for
/// lookups and for change detection in `refresh`.
fn list_pack_names(objects_dir: &Path) -> Result<Vec<String>, OdbError> {
    let pack_dir = objects_dir.join("pack");
    if !pack_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut named: Vec<(std::time::SystemTime, String)> = Vec::new();
    for entry in std::fs::read_dir(&pack_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "pack") {
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            named.push((mtime, entry.file_name().to_string_lossy().into_owned()));
        }
    }
    named.sort_by(|a, b| b.cmp(a));
    Ok(named.into_iter().map(|(_, name)| name).collect())
}

fn scan_packs(objects_dir: &Path) -> Result<Vec<Arc<OpenPack>>, OdbError> {
    let pack_dir = objects_dir.join("pack");
    let mut packs = Vec::new();
    for name in list_pack_names(objects_dir)? {
        let path = pack_dir.join(&name);
        match Pack::open(&path) {
            Ok(pack) => packs.push(Arc::new(OpenPack { name, pack })),
            // A pack mid-install (index not yet renamed) is simply not
            // visible yet.
            Err(_) => continue,
        }
    }
    Ok(packs)
}
