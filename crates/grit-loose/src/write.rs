use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use grit_hash::hasher::Hasher;
use grit_hash::ObjectId;
use grit_object::{header, Object, ObjectType};

use crate::{LooseError, LooseStore};

impl LooseStore {
    /// Write an object; returns its OID. Idempotent: an already-present
    /// object is left untouched.
    pub fn write(&self, obj: &Object) -> Result<ObjectId, LooseError> {
        self.write_raw(obj.object_type(), &obj.serialize_body())
    }

    /// Write a pre-serialized body with a known type.
    pub fn write_raw(&self, obj_type: ObjectType, body: &[u8]) -> Result<ObjectId, LooseError> {
        let hdr = header::write_header(obj_type, body.len());

        let oid = {
            let mut hasher = Hasher::new(self.hash_algo());
            hasher.update(&hdr);
            hasher.update(body);
            hasher.finalize()?
        };

        if self.contains(&oid) {
            return Ok(oid);
        }

        let final_path = self.object_path(&oid);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Deflate into a tempfile on the same filesystem, fsync, then
        // rename into place so readers never see a partial object.
        let tmp = tempfile::NamedTempFile::new_in(self.objects_dir())?;
        let mut encoder = ZlibEncoder::new(tmp, self.compression);
        encoder.write_all(&hdr)?;
        encoder.write_all(body)?;
        let tmp = encoder.finish()?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o444))?;
        }

        persist_object(tmp, &final_path)?;
        Ok(oid)
    }
}

/// Move the tempfile into place. Losing the rename race to another writer
/// is success: the content is identical by address.
fn persist_object(tmp: tempfile::NamedTempFile, final_path: &Path) -> Result<(), LooseError> {
    match tmp.persist(final_path) {
        Ok(_) => Ok(()),
        Err(e) if final_path.is_file() => {
            drop(e);
            Ok(())
        }
        Err(e) => Err(LooseError::Io(e.error)),
    }
}
