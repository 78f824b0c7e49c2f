//! Protocol v2 fetch client.
//!
//! v2 is command-oriented: each request names a command, carries
//! capabilities, then arguments after a delimiter. Responses come in
//! delimiter-separated sections. Only the client side exists here; the
//! servers in this crate speak v1.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::PathBuf;

use grit_hash::ObjectId;
use grit_object::Object;
use grit_odb::ObjectDatabase;
use grit_pack::pack::PackData;

use crate::pktline::{strip_newline, Pkt, PktReader, PktWriter};
use crate::sideband::{BAND_DATA, BAND_FATAL, BAND_PROGRESS};
use crate::{ProtocolError, AGENT};

/// One ref as reported by `ls-refs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub name: String,
    pub oid: ObjectId,
    /// `peeled:` attribute for annotated tags.
    pub peeled: Option<ObjectId>,
    /// `symref-target:` attribute (HEAD, typically).
    pub symref_target: Option<String>,
}

/// Run an `ls-refs` command. `prefixes` limit the listing server-side.
pub fn ls_refs<R: Read, W: Write>(
    input: R,
    output: W,
    prefixes: &[String],
) -> Result<Vec<RemoteRef>, ProtocolError> {
    let mut reader = PktReader::new(input);
    let mut writer = PktWriter::new(output);

    writer.text_pkt("command=ls-refs")?;
    writer.text_pkt(AGENT)?;
    writer.delim_pkt()?;
    writer.text_pkt("peel")?;
    writer.text_pkt("symrefs")?;
    for prefix in prefixes {
        writer.text_pkt(&format!("ref-prefix {prefix}"))?;
    }
    writer.flush_pkt()?;

    let mut refs = Vec::new();
    loop {
        match reader.read_pkt()? {
            Pkt::Flush | Pkt::ResponseEnd => break,
            Pkt::Delim => continue,
            Pkt::Data(line) => {
                let line = strip_newline(&line);
                let text = std::str::from_utf8(line)
                    .map_err(|_| ProtocolError::Violation("non-UTF-8 ref line".into()))?;
                let mut fields = text.split(' ');
                let oid = fields
                    .next()
                    .ok_or_else(|| ProtocolError::Violation("empty ref line".into()))
                    .and_then(|hex| {
                        ObjectId::from_hex(hex)
                            .map_err(|e| ProtocolError::Violation(format!("bad OID: {e}")))
                    })?;
                let name = fields
                    .next()
                    .ok_or_else(|| ProtocolError::Violation("ref line without name".into()))?
                    .to_string();

                let mut peeled = None;
                let mut symref_target = None;
                for attr in fields {
                    if let Some(hex) = attr.strip_prefix("peeled:") {
                        peeled = Some(ObjectId::from_hex(hex).map_err(|e| {
                            ProtocolError::Violation(format!("bad peeled OID: {e}"))
                        })?);
                    } else if let Some(target) = attr.strip_prefix("symref-target:") {
                        symref_target = Some(target.to_string());
                    }
                }
                refs.push(RemoteRef {
                    name,
                    oid,
                    peeled,
                    symref_target,
                });
            }
        }
    }
    Ok(refs)
}

/// v2 fetch options.
#[derive(Debug, Clone, Default)]
pub struct FetchV2Config {
    pub depth: Option<u32>,
    pub deepen_since: Option<i64>,
    /// Partial-clone filter spec (e.g. `blob:none`), passed through.
    pub filter: Option<String>,
}

/// v2 fetch outcome.
#[derive(Debug)]
pub struct FetchV2Result {
    pub new_shallow: Vec<ObjectId>,
    pub new_unshallow: Vec<ObjectId>,
    pub pack_path: Option<PathBuf>,
    pub object_count: u32,
}

/// Run one stateless v2 `fetch` round-trip: wants, every have we can
/// offer, `done`, then parse the sectioned response and install the pack.
pub fn fetch_v2<R: Read, W: Write>(
    db: &ObjectDatabase,
    input: R,
    output: W,
    wants: &[ObjectId],
    local_tips: &[ObjectId],
    config: &FetchV2Config,
) -> Result<FetchV2Result, ProtocolError> {
    let mut reader = PktReader::new(input);
    let mut writer = PktWriter::new(output);

    writer.text_pkt("command=fetch")?;
    writer.text_pkt(AGENT)?;
    writer.delim_pkt()?;
    writer.text_pkt("thin-pack")?;
    writer.text_pkt("ofs-delta")?;
    if let Some(depth) = config.depth {
        writer.text_pkt(&format!("deepen {depth}"))?;
    }
    if let Some(since) = config.deepen_since {
        writer.text_pkt(&format!("deepen-since {since}"))?;
    }
    if let Some(filter) = &config.filter {
        writer.text_pkt(&format!("filter {filter}"))?;
    }
    for want in wants {
        writer.text_pkt(&format!("want {want}"))?;
    }
    for have in collect_haves(db, local_tips)? {
        writer.text_pkt(&format!("have {have}"))?;
    }
    writer.text_pkt("done")?;
    writer.flush_pkt()?;

    let mut result = FetchV2Result {
        new_shallow: Vec::new(),
        new_unshallow: Vec::new(),
        pack_path: None,
        object_count: 0,
    };

    // ---- Sectioned response ----
    let mut section = String::new();
    let mut pack_bytes: Vec<u8> = Vec::new();
    loop {
        match reader.read_pkt() {
            Ok(Pkt::Flush) | Ok(Pkt::ResponseEnd) => break,
            Ok(Pkt::Delim) => continue,
            Err(ProtocolError::Hangup) if !pack_bytes.is_empty() => break,
            Err(e) => return Err(e),
            Ok(Pkt::Data(payload)) => {
                if section == "packfile" {
                    let Some((&band, rest)) = payload.split_first() else {
                        continue;
                    };
                    match band {
                        BAND_DATA => pack_bytes.extend_from_slice(rest),
                        BAND_PROGRESS => {}
                        BAND_FATAL => {
                            return Err(ProtocolError::Remote(
                                String::from_utf8_lossy(rest).trim_end().to_string(),
                            ))
                        }
                        other => {
                            return Err(ProtocolError::Violation(format!(
                                "unknown sideband channel {other}"
                            )))
                        }
                    }
                    continue;
                }

                let line = strip_newline(&payload);
                match line {
                    b"shallow-info" | b"acknowledgments" | b"wanted-refs" | b"packfile" => {
                        section = String::from_utf8_lossy(line).into_owned();
                    }
                    _ if section == "shallow-info" => {
                        if let Some(rest) = line.strip_prefix(b"shallow ") {
                            result.new_shallow.push(parse_oid(rest)?);
                        } else if let Some(rest) = line.strip_prefix(b"unshallow ") {
                            result.new_unshallow.push(parse_oid(rest)?);
                        }
                    }
                    // With `done` sent, acknowledgment lines carry nothing
                    // the client still needs.
                    _ if section == "acknowledgments" => {}
                    _ => {
                        return Err(ProtocolError::Violation(format!(
                            "unexpected v2 response line {:?}",
                            String::from_utf8_lossy(line)
                        )))
                    }
                }
            }
        }
    }

    if !pack_bytes.is_empty() {
        let data = PackData::from_bytes(pack_bytes)?;
        if data.num_objects() > 0 {
            let (path, count) = db.install_pack(&data)?;
            result.pack_path = Some(path);
            result.object_count = count;
        }
    }
    Ok(result)
}

/// Every commit reachable from the local tips, newest first, capped so a
/// huge history does not flood one stateless request.
fn collect_haves(
    db: &ObjectDatabase,
    tips: &[ObjectId],
) -> Result<Vec<ObjectId>, ProtocolError> {
    const CAP: usize = 256;
    let mut haves = Vec::new();
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue: Vec<ObjectId> = tips.to_vec();
    while let Some(oid) = queue.pop() {
        if haves.len() >= CAP {
            break;
        }
        if !seen.insert(oid) {
            continue;
        }
        if let Some(Object::Commit(commit)) = db.get(&oid)? {
            haves.push(oid);
            queue.extend(commit.parents.iter().copied());
        }
    }
    Ok(haves)
}

fn parse_oid(bytes: &[u8]) -> Result<ObjectId, ProtocolError> {
    let hex = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::Violation("non-UTF-8 OID".into()))?;
    ObjectId::from_hex(hex.trim())
        .map_err(|e| ProtocolError::Violation(format!("bad OID: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ls_refs_request_and_response() {
        // Server response: two refs with attributes.
        let mut response = Vec::new();
        {
            let mut w = PktWriter::new(&mut response);
            w.text_pkt(
                "aa00000000000000000000000000000000000000 HEAD symref-target:refs/heads/main",
            )
            .unwrap();
            w.text_pkt(
                "bb00000000000000000000000000000000000000 refs/tags/v1 peeled:cc00000000000000000000000000000000000000",
            )
            .unwrap();
            w.flush_pkt().unwrap();
        }

        let mut request = Vec::new();
        let refs = ls_refs(
            Cursor::new(response),
            &mut request,
            &["refs/heads/".to_string()],
        )
        .unwrap();

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "HEAD");
        assert_eq!(
            refs[0].symref_target.as_deref(),
            Some("refs/heads/main")
        );
        assert_eq!(
            refs[1].peeled,
            Some(ObjectId::from_hex("cc00000000000000000000000000000000000000").unwrap())
        );

        // The request names the command, delimits, and passes arguments.
        let text = String::from_utf8_lossy(&request);
        assert!(text.contains("command=ls-refs"));
        assert!(text.contains("0001"));
        assert!(text.contains("ref-prefix refs/heads/"));
        assert!(text.ends_with("0000"));
    }

    #[test]
    fn fetch_v2_parses_shallow_info_and_packfile() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDatabase::open(dir.path()).unwrap();

        // A one-blob pack to carry over the packfile section.
        let mut pack = Vec::new();
        grit_pack::write::write_pack(
            &mut pack,
            vec![grit_pack::write::PackInput::new(
                grit_object::ObjectType::Blob,
                b"v2 payload".to_vec(),
            )],
            &grit_pack::write::WriteOptions::default(),
        )
        .unwrap();

        let shallow_oid = ObjectId::from_hex("ab00000000000000000000000000000000000000").unwrap();
        let mut response = Vec::new();
        {
            let mut w = PktWriter::new(&mut response);
            w.text_pkt("shallow-info").unwrap();
            w.text_pkt(&format!("shallow {shallow_oid}")).unwrap();
            w.delim_pkt().unwrap();
            w.text_pkt("packfile").unwrap();
            let mut chunk = vec![BAND_DATA];
            chunk.extend_from_slice(&pack);
            w.data_pkt(&chunk).unwrap();
            w.flush_pkt().unwrap();
        }

        let want = ObjectId::from_hex("ee00000000000000000000000000000000000000").unwrap();
        let mut request = Vec::new();
        let result = fetch_v2(
            &db,
            Cursor::new(response),
            &mut request,
            &[want],
            &[],
            &FetchV2Config {
                depth: Some(1),
                ..FetchV2Config::default()
            },
        )
        .unwrap();

        assert_eq!(result.new_shallow, vec![shallow_oid]);
        assert_eq!(result.object_count, 1);
        assert!(result.pack_path.is_some());

        let text = String::from_utf8_lossy(&request);
        assert!(text.contains("command=fetch"));
        assert!(text.contains(&format!("want {want}")));
        assert!(text.contains("deepen 1"));
        assert!(text.contains("done"));
    }

    #[test]
    fn fetch_v2_surfaces_remote_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObjectDatabase::open(dir.path()).unwrap();

        let mut response = Vec::new();
        {
            let mut w = PktWriter::new(&mut response);
            w.text_pkt("packfile").unwrap();
            let mut chunk = vec![BAND_FATAL];
            chunk.extend_from_slice(b"no such repository\n");
            w.data_pkt(&chunk).unwrap();
            w.flush_pkt().unwrap();
        }

        let want = ObjectId::from_hex("ee00000000000000000000000000000000000000").unwrap();
        let result = fetch_v2(
            &db,
            Cursor::new(response),
            &mut Vec::new(),
            &[want],
            &[],
            &FetchV2Config::default(),
        );
        assert!(matches!(result, Err(ProtocolError::Remote(msg)) if msg == "no such repository"));
    }
}
