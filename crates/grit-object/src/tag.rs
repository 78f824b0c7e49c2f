use bstr::{BStr, BString, ByteSlice};
use grit_hash::ObjectId;
use grit_utils::date::Signature;

use crate::{ObjectError, ObjectType};

const PGP_SIGNATURE_BEGIN: &[u8] = b"-----BEGIN PGP SIGNATURE-----";

/// An annotated tag object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// The tagged object and its type.
    pub object: ObjectId,
    pub object_type: ObjectType,
    /// The tag name (`v1.0`, not `refs/tags/v1.0`).
    pub name: BString,
    /// Missing only in tags created before git recorded taggers.
    pub tagger: Option<Signature>,
    pub message: BString,
    /// Trailing PGP block, stored apart from the message so verification
    /// can hash the payload without it.
    pub signature: Option<BString>,
}

impl Tag {
    /// Parse a tag body: `object`/`type`/`tag`/`tagger?` headers, blank
    /// line, message, optional trailing signature block.
    pub fn parse(body: &[u8]) -> Result<Self, ObjectError> {
        let mut object: Option<ObjectId> = None;
        let mut object_type: Option<ObjectType> = None;
        let mut name: Option<BString> = None;
        let mut tagger: Option<Signature> = None;

        let mut pos = 0;
        while pos < body.len() {
            if body[pos] == b'\n' {
                pos += 1;
                break;
            }
            let line_end = body[pos..]
                .find_byte(b'\n')
                .map(|p| p + pos)
                .unwrap_or(body.len());
            let line = &body[pos..line_end];

            let space = line.find_byte(b' ').ok_or_else(|| {
                ObjectError::InvalidHeader(format!("malformed tag header at offset {pos}"))
            })?;
            let key = &line[..space];
            let value = &line[space + 1..];

            match key {
                b"object" => {
                    let hex = std::str::from_utf8(value)
                        .map_err(|_| ObjectError::InvalidHeader("non-UTF-8 object OID".into()))?;
                    object = Some(ObjectId::from_hex(hex.trim_end())?);
                }
                b"type" => object_type = Some(ObjectType::from_bytes(value)?),
                b"tag" => name = Some(BString::from(value)),
                b"tagger" => {
                    tagger = Some(
                        Signature::parse(BStr::new(value))
                            .map_err(|e| ObjectError::InvalidSignature(e.to_string()))?,
                    );
                }
                _ => {
                    // Unknown tag headers are not preserved; nothing in the
                    // wild writes them.
                }
            }
            pos = line_end + 1;
        }

        let object = object.ok_or(ObjectError::MissingTagField { field: "object" })?;
        let object_type = object_type.ok_or(ObjectError::MissingTagField { field: "type" })?;
        let name = name.ok_or(ObjectError::MissingTagField { field: "tag" })?;

        let rest = &body[pos..];
        let (message, signature) = match rest.find(PGP_SIGNATURE_BEGIN) {
            Some(sig_start) => (
                BString::from(&rest[..sig_start]),
                Some(BString::from(&rest[sig_start..])),
            ),
            None => (BString::from(rest), None),
        };

        Ok(Self {
            object,
            object_type,
            name,
            tagger,
            message,
            signature,
        })
    }

    pub fn serialize_body(&self) -> Vec<u8> {
        let mut out = self.signed_payload();
        if let Some(ref sig) = self.signature {
            out.extend_from_slice(sig);
        }
        out
    }

    /// The bytes a tag signature covers: everything before the signature
    /// block.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"object ");
        out.extend_from_slice(self.object.to_hex().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(b"type ");
        out.extend_from_slice(self.object_type.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(b"tag ");
        out.extend_from_slice(&self.name);
        out.push(b'\n');
        if let Some(ref tagger) = self.tagger {
            out.extend_from_slice(b"tagger ");
            out.extend_from_slice(&tagger.to_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }
}
