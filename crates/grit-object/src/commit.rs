use bstr::{BStr, BString, ByteSlice};
use grit_hash::ObjectId;
use grit_utils::date::Signature;

use crate::{ObjectError, ParseOptions};

/// A commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Root tree OID.
    pub tree: ObjectId,
    /// Parent OIDs; empty for a root commit, three or more for an octopus.
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    /// Optional `encoding` header (e.g. `ISO-8859-1`).
    pub encoding: Option<BString>,
    /// Extra headers (`mergetag` and friends), preserved in order.
    pub extra_headers: Vec<(BString, BString)>,
    /// Detached GPG signature block, if the commit is signed.
    pub gpgsig: Option<BString>,
    /// Everything after the blank separator line.
    pub message: BString,
}

impl Commit {
    pub fn parse(body: &[u8]) -> Result<Self, ObjectError> {
        Self::parse_with(body, ParseOptions::strict())
    }

    pub fn parse_with(body: &[u8], opts: ParseOptions) -> Result<Self, ObjectError> {
        let mut tree: Option<ObjectId> = None;
        let mut parents = Vec::new();
        let mut author: Option<Signature> = None;
        let mut committer: Option<Signature> = None;
        let mut encoding: Option<BString> = None;
        let mut gpgsig: Option<BString> = None;
        let mut extra_headers: Vec<(BString, BString)> = Vec::new();

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
                ObjectError::InvalidCommit(format!("malformed header line at offset {pos}"))
            })?;
            let key = &line[..space];
            let value = &line[space + 1..];

            match key {
                b"tree" => tree = Some(parse_oid_value(value)?),
                b"parent" => parents.push(parse_oid_value(value)?),
                b"author" => author = Some(parse_signature(value)?),
                b"committer" => committer = Some(parse_signature(value)?),
                b"encoding" => encoding = Some(BString::from(value)),
                b"gpgsig" => {
                    let (sig, next) = read_folded_value(body, value, line_end);
                    gpgsig = Some(sig);
                    pos = next;
                    continue;
                }
                _ => {
                    // Multi-line extra headers (mergetag carries a whole
                    // embedded tag object).
                    let (val, next) = read_folded_value(body, value, line_end);
                    extra_headers.push((BString::from(key), val));
                    pos = next;
                    continue;
                }
            }
            pos = line_end + 1;
        }

        let tree = tree.ok_or(ObjectError::MissingCommitField { field: "tree" })?;
        let author = author.ok_or(ObjectError::MissingCommitField { field: "author" })?;
        let committer = committer.ok_or(ObjectError::MissingCommitField { field: "committer" })?;

        if !opts.lenient && encoding.is_none() {
            for (what, sig) in [("author", &author), ("committer", &committer)] {
                if sig.name.to_str().is_err() || sig.email.to_str().is_err() {
                    return Err(ObjectError::InvalidCommit(format!(
                        "non-UTF-8 {what} identity without an encoding header"
                    )));
                }
            }
        }

        Ok(Self {
            tree,
            parents,
            author,
            committer,
            encoding,
            extra_headers,
            gpgsig,
            message: BString::from(&body[pos..]),
        })
    }

    /// Canonical body. Header order is fixed: `tree`, `parent*`, `author`,
    /// `committer`, `encoding?`, extra headers, `gpgsig?`, blank, message.
    pub fn serialize_body(&self) -> Vec<u8> {
        self.serialize_inner(true)
    }

    /// The bytes a signature covers: the serialization with the `gpgsig`
    /// block elided and everything else untouched.
    pub fn signed_payload(&self) -> Vec<u8> {
        self.serialize_inner(false)
    }

    fn serialize_inner(&self, with_signature: bool) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(b"tree ");
        out.extend_from_slice(self.tree.to_hex().as_bytes());
        out.push(b'\n');

        for parent in &self.parents {
            out.extend_from_slice(b"parent ");
            out.extend_from_slice(parent.to_hex().as_bytes());
            out.push(b'\n');
        }

        out.extend_from_slice(b"author ");
        out.extend_from_slice(&self.author.to_bytes());
        out.push(b'\n');

        out.extend_from_slice(b"committer ");
        out.extend_from_slice(&self.committer.to_bytes());
        out.push(b'\n');

        if let Some(ref enc) = self.encoding {
            out.extend_from_slice(b"encoding ");
            out.extend_from_slice(enc);
            out.push(b'\n');
        }

        for (key, val) in &self.extra_headers {
            out.extend_from_slice(key);
            out.push(b' ');
            write_folded_value(&mut out, val);
        }

        if with_signature {
            if let Some(ref sig) = self.gpgsig {
                out.extend_from_slice(b"gpgsig ");
                write_folded_value(&mut out, sig);
            }
        }

        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    pub fn first_parent(&self) -> Option<&ObjectId> {
        self.parents.first()
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// Committer timestamp, the ordering key for graph walks.
    pub fn commit_time(&self) -> i64 {
        self.committer.date.timestamp
    }

    /// First line of the message.
    pub fn summary(&self) -> &BStr {
        let msg: &[u8] = self.message.as_ref();
        match msg.find_byte(b'\n') {
            Some(pos) => BStr::new(&msg[..pos]),
            None => BStr::new(msg),
        }
    }
}

fn parse_oid_value(value: &[u8]) -> Result<ObjectId, ObjectError> {
    let hex = std::str::from_utf8(value)
        .map_err(|_| ObjectError::InvalidCommit("non-UTF-8 OID header".into()))?;
    Ok(ObjectId::from_hex(hex.trim_end())?)
}

fn parse_signature(value: &[u8]) -> Result<Signature, ObjectError> {
    Signature::parse(BStr::new(value)).map_err(|e| ObjectError::InvalidSignature(e.to_string()))
}

/// Read a possibly multi-line header value; continuation lines start with a
/// space. Returns the unfolded value and the offset just past it.
fn read_folded_value(body: &[u8], first: &[u8], line_end: usize) -> (BString, usize) {
    let mut value = Vec::from(first);
    let mut next = line_end + 1;
    while next < body.len() && body[next] == b' ' {
        value.push(b'\n');
        let cont_end = body[next..]
            .find_byte(b'\n')
            .map(|p| p + next)
            .unwrap_or(body.len());
        value.extend_from_slice(&body[next + 1..cont_end]);
        next = cont_end + 1;
    }
    (BString::from(value), next)
}

/// Write a header value, folding embedded newlines as continuation lines.
fn write_folded_value(out: &mut Vec<u8>, value: &[u8]) {
    for (i, line) in value.split(|&b| b == b'\n').enumerate() {
        if i > 0 {
            out.push(b'\n');
            out.push(b' ');
        }
        out.extend_from_slice(line);
    }
    out.push(b'\n');
}
