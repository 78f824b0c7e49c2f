//! The upload-pack server: the serving half of fetch/clone.
//!
//! States run in wire order: advertise refs, collect wants and shallow
//! bounds, negotiate common history over have/ACK rounds, then stream the
//! pack. The negotiated capability set picks the ACK dialect and the
//! framing of the pack stream.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use grit_hash::ObjectId;
use grit_object::Object;
use grit_odb::missing::collect_ancestors;
use grit_odb::{MissingObjectsFinder, ObjectDatabase};
use grit_pack::write::{write_pack, PackInput, WriteOptions};
use grit_ref::{FilesRefStore, RefName, RefValue};

use crate::capability::{AckMode, Capabilities};
use crate::pktline::{strip_newline, Pkt, PktReader, PktWriter};
use crate::sideband::{write_band, SidebandSink, BAND_FATAL, BAND_PROGRESS};
use crate::{shallow, ProtocolError, AGENT};

/// Server-side policy knobs.
#[derive(Debug, Clone, Default)]
pub struct UploadPackConfig {
    /// Accept wants naming any advertised tip even if hidden, per the
    /// `allow-tip-sha1-in-want` capability.
    pub allow_tip_sha1_in_want: bool,
    /// Accept wants naming any commit reachable from a tip.
    pub allow_reachable_sha1_in_want: bool,
}

/// One advertised ref, with its peeled target for annotated tags.
struct Advertised {
    name: String,
    oid: ObjectId,
    peeled: Option<ObjectId>,
}

/// Run a complete upload-pack session over the byte streams.
pub fn serve_upload_pack<R: Read, W: Write>(
    db: &ObjectDatabase,
    refs: &FilesRefStore,
    input: R,
    output: W,
    config: &UploadPackConfig,
) -> Result<(), ProtocolError> {
    let mut reader = PktReader::new(input);
    let mut writer = PktWriter::new(output);

    let advertised = advertise_refs(db, refs, &mut writer, config)?;

    // ---- Want phase ----
    let mut wants: Vec<ObjectId> = Vec::new();
    let mut caps = Capabilities::new();
    let mut client_shallow: HashSet<ObjectId> = HashSet::new();
    let mut deepen: Option<Deepen> = None;
    let mut filter: Option<BlobFilter> = None;

    loop {
        match reader.read_pkt()? {
            Pkt::Flush => break,
            Pkt::Data(line) => {
                let line = strip_newline(&line);
                if let Some(rest) = line.strip_prefix(b"want ") {
                    // The first want carries the capability list after a
                    // space (unlike the NUL of the advertisement).
                    let (hex, cap_part) = match rest.iter().position(|&b| b == b' ') {
                        Some(sp) => (&rest[..sp], Some(&rest[sp + 1..])),
                        None => (rest, None),
                    };
                    if wants.is_empty() {
                        if let Some(cap_part) = cap_part {
                            caps = Capabilities::parse(&String::from_utf8_lossy(cap_part));
                        }
                    }
                    wants.push(parse_oid(hex)?);
                } else if let Some(rest) = line.strip_prefix(b"shallow ") {
                    client_shallow.insert(parse_oid(rest)?);
                } else if let Some(rest) = line.strip_prefix(b"deepen ") {
                    let depth: u32 = parse_ascii(rest)?;
                    deepen = Some(Deepen::Depth(depth));
                } else if let Some(rest) = line.strip_prefix(b"deepen-since ") {
                    let ts: i64 = parse_ascii(rest)?;
                    deepen = Some(Deepen::Since(ts));
                } else if let Some(rest) = line.strip_prefix(b"deepen-not ") {
                    let tip = resolve_deepen_not(refs, rest)?;
                    match deepen {
                        Some(Deepen::Not(ref mut tips)) => tips.push(tip),
                        _ => deepen = Some(Deepen::Not(vec![tip])),
                    }
                } else if let Some(rest) = line.strip_prefix(b"filter ") {
                    filter = Some(BlobFilter::parse(rest)?);
                } else {
                    return Err(ProtocolError::Violation(format!(
                        "unexpected command in want phase: {:?}",
                        String::from_utf8_lossy(line)
                    )));
                }
            }
            other => {
                return Err(ProtocolError::Violation(format!(
                    "unexpected control packet {other:?} in want phase"
                )))
            }
        }
    }

    if wants.is_empty() {
        // Pure ref listing; the session is complete.
        return Ok(());
    }

    validate_wants(db, &advertised, &wants, config, &mut writer)?;

    // ---- Shallow phase ----
    let mut session_shallow: HashSet<ObjectId> = client_shallow.clone();
    if let Some(deepen) = deepen {
        let (new_shallow, not_shallow) = match deepen {
            Deepen::Depth(depth) => shallow::find_shallow(db, &wants, depth)?,
            Deepen::Since(ts) => shallow::find_shallow_since(db, &wants, ts)?,
            Deepen::Not(tips) => shallow::find_shallow_not(db, &wants, &tips)?,
        };

        let mut shallow_lines: Vec<ObjectId> = new_shallow
            .difference(&client_shallow)
            .copied()
            .collect();
        shallow_lines.sort();
        for oid in &shallow_lines {
            writer.text_pkt(&format!("shallow {oid}"))?;
        }
        let mut unshallow_lines: Vec<ObjectId> = client_shallow
            .intersection(&not_shallow)
            .copied()
            .collect();
        unshallow_lines.sort();
        for oid in &unshallow_lines {
            writer.text_pkt(&format!("unshallow {oid}"))?;
        }
        writer.flush_pkt()?;

        let unshallowed: HashSet<ObjectId> = unshallow_lines.into_iter().collect();
        session_shallow = client_shallow
            .difference(&unshallowed)
            .copied()
            .chain(new_shallow.iter().copied())
            .collect();
    }

    // ---- Negotiation phase ----
    let want_set: HashSet<ObjectId> = wants.iter().copied().collect();
    let common = negotiate(db, &mut reader, &mut writer, &caps, &want_set, &session_shallow)?;

    // ---- Pack phase ----
    send_pack(
        db,
        &advertised,
        &common,
        &want_set,
        &session_shallow,
        filter,
        &caps,
        &mut writer,
    )
}

enum Deepen {
    Depth(u32),
    Since(i64),
    Not(Vec<ObjectId>),
}

/// Partial-clone object filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlobFilter {
    /// `blob:none`: no blobs at all.
    NoBlobs,
    /// `blob:limit=<n>`: only blobs up to n bytes.
    Limit(usize),
}

impl BlobFilter {
    fn parse(arg: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(arg)
            .map_err(|_| ProtocolError::Violation("non-UTF-8 filter".into()))?
            .trim();
        if text == "blob:none" {
            return Ok(Self::NoBlobs);
        }
        if let Some(limit) = text.strip_prefix("blob:limit=") {
            let limit: usize = limit.parse().map_err(|_| {
                ProtocolError::Violation(format!("bad filter limit: {limit:?}"))
            })?;
            return Ok(Self::Limit(limit));
        }
        Err(ProtocolError::Violation(format!(
            "unsupported filter: {text:?}"
        )))
    }

    fn excludes(&self, obj_type: grit_object::ObjectType, size: usize) -> bool {
        obj_type == grit_object::ObjectType::Blob
            && match self {
                Self::NoBlobs => true,
                Self::Limit(limit) => size > *limit,
            }
    }
}

fn server_capabilities(config: &UploadPackConfig, head_target: Option<&RefName>) -> String {
    let mut caps = String::from(
        "multi_ack thin-pack side-band side-band-64k ofs-delta shallow \
         deepen-since deepen-not no-progress include-tag multi_ack_detailed no-done filter",
    );
    if config.allow_tip_sha1_in_want {
        caps.push_str(" allow-tip-sha1-in-want");
    }
    if config.allow_reachable_sha1_in_want {
        caps.push_str(" allow-reachable-sha1-in-want");
    }
    if let Some(target) = head_target {
        caps.push_str(&format!(" symref=HEAD:{target}"));
    }
    caps.push(' ');
    caps.push_str(AGENT);
    caps
}

/// Fully peel an OID through annotated tags.
fn peel(db: &ObjectDatabase, oid: &ObjectId) -> Result<Option<ObjectId>, ProtocolError> {
    let mut current = *oid;
    let mut peeled = None;
    loop {
        match db.get(&current)? {
            Some(Object::Tag(tag)) => {
                current = tag.object;
                peeled = Some(current);
            }
            _ => return Ok(peeled),
        }
    }
}

fn advertise_refs<W: Write>(
    db: &ObjectDatabase,
    refs: &FilesRefStore,
    writer: &mut PktWriter<W>,
    config: &UploadPackConfig,
) -> Result<Vec<Advertised>, ProtocolError> {
    let head = RefName::new("HEAD")?;
    let head_value = refs.read(&head)?;
    let head_target = match &head_value {
        Some(RefValue::Symbolic(target)) => Some(target.clone()),
        _ => None,
    };

    let mut list: Vec<Advertised> = Vec::new();
    if let Some(oid) = refs.resolve(&head)? {
        list.push(Advertised {
            name: "HEAD".into(),
            oid,
            peeled: None,
        });
    }
    for (name, oid) in refs.iter_resolved(None)? {
        list.push(Advertised {
            name: name.as_str().to_string(),
            oid,
            peeled: peel(db, &oid)?,
        });
    }

    let caps = server_capabilities(config, head_target.as_ref());
    if list.is_empty() {
        writer.data_pkt(
            format!(
                "{} capabilities^{{}}\0{}\n",
                ObjectId::NULL_SHA1.to_hex(),
                caps
            )
            .as_bytes(),
        )?;
    } else {
        for (i, entry) in list.iter().enumerate() {
            if i == 0 {
                writer.data_pkt(format!("{} {}\0{}\n", entry.oid, entry.name, caps).as_bytes())?;
            } else {
                writer.text_pkt(&format!("{} {}", entry.oid, entry.name))?;
            }
            // Annotated tags advertise their peeled target too.
            if let Some(peeled) = entry.peeled {
                writer.text_pkt(&format!("{} {}^{{}}", peeled, entry.name))?;
            }
        }
    }
    writer.flush_pkt()?;
    Ok(list)
}

fn validate_wants<W: Write>(
    db: &ObjectDatabase,
    advertised: &[Advertised],
    wants: &[ObjectId],
    config: &UploadPackConfig,
    writer: &mut PktWriter<W>,
) -> Result<(), ProtocolError> {
    let tips: HashSet<ObjectId> = advertised
        .iter()
        .flat_map(|a| [Some(a.oid), a.peeled].into_iter().flatten())
        .collect();

    for want in wants {
        let ok = tips.contains(want)
            || config.allow_tip_sha1_in_want
            || (config.allow_reachable_sha1_in_want && reachable_from_tips(db, &tips, want)?);
        if !ok {
            let msg = format!("ERR upload-pack: not our ref {want}");
            let _ = writer.text_pkt(&msg);
            let _ = writer.flush();
            return Err(ProtocolError::Violation(format!("not our ref: {want}")));
        }
    }
    Ok(())
}

fn reachable_from_tips(
    db: &ObjectDatabase,
    tips: &HashSet<ObjectId>,
    want: &ObjectId,
) -> Result<bool, ProtocolError> {
    for tip in tips {
        if grit_odb::missing::is_ancestor(db, want, tip)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Run the have/ACK exchange; returns the common OIDs.
fn negotiate<R: Read, W: Write>(
    db: &ObjectDatabase,
    reader: &mut PktReader<R>,
    writer: &mut PktWriter<W>,
    caps: &Capabilities,
    wants: &HashSet<ObjectId>,
    session_shallow: &HashSet<ObjectId>,
) -> Result<HashSet<ObjectId>, ProtocolError> {
    let ack_mode = caps.ack_mode();
    let no_done = caps.has("no-done");

    let mut common: Vec<ObjectId> = Vec::new();
    let mut acked_any = false;
    let mut ready_sent = false;

    loop {
        match reader.read_pkt()? {
            Pkt::Data(line) => {
                let line = strip_newline(&line);
                if let Some(rest) = line.strip_prefix(b"have ") {
                    let oid = parse_oid(rest)?;
                    if db.contains(&oid) {
                        common.push(oid);
                        match ack_mode {
                            AckMode::Single => {
                                if !acked_any {
                                    writer.text_pkt(&format!("ACK {oid}"))?;
                                    acked_any = true;
                                }
                            }
                            AckMode::MultiAck => {
                                writer.text_pkt(&format!("ACK {oid} continue"))?;
                                acked_any = true;
                            }
                            AckMode::MultiAckDetailed => {
                                writer.text_pkt(&format!("ACK {oid} common"))?;
                                acked_any = true;
                                if !ready_sent
                                    && all_wants_satisfied(db, wants, &common, session_shallow)?
                                {
                                    writer.text_pkt(&format!("ACK {oid} ready"))?;
                                    ready_sent = true;
                                }
                            }
                        }
                    }
                } else if line == b"done" {
                    match ack_mode {
                        AckMode::Single => {
                            if !acked_any {
                                writer.text_pkt("NAK")?;
                            }
                        }
                        AckMode::MultiAck | AckMode::MultiAckDetailed => {
                            match common.last() {
                                Some(last) => writer.text_pkt(&format!("ACK {last}"))?,
                                None => writer.text_pkt("NAK")?,
                            }
                        }
                    }
                    writer.flush()?;
                    break;
                } else {
                    return Err(ProtocolError::Violation(format!(
                        "unexpected command during negotiation: {:?}",
                        String::from_utf8_lossy(line)
                    )));
                }
            }
            Pkt::Flush => {
                // End of one have round. With `ready` out and no-done
                // negotiated the pack may follow without an explicit done;
                // otherwise every round closes with a NAK and the client
                // keeps talking.
                if ready_sent && no_done {
                    writer.flush()?;
                    break;
                }
                writer.text_pkt("NAK")?;
                writer.flush()?;
            }
            other => {
                return Err(ProtocolError::Violation(format!(
                    "unexpected control packet {other:?} during negotiation"
                )))
            }
        }
    }

    Ok(common.into_iter().collect())
}

/// Every want reachable from the acknowledged commons?
fn all_wants_satisfied(
    db: &ObjectDatabase,
    wants: &HashSet<ObjectId>,
    common: &[ObjectId],
    session_shallow: &HashSet<ObjectId>,
) -> Result<bool, ProtocolError> {
    if common.is_empty() {
        return Ok(false);
    }
    let heads: HashSet<ObjectId> = common.iter().copied().collect();
    let (reachable, _) = collect_ancestors(db, &heads, &HashSet::new(), session_shallow)?;
    Ok(wants.iter().all(|w| reachable.contains(w)))
}

fn send_pack<W: Write>(
    db: &ObjectDatabase,
    advertised: &[Advertised],
    common: &HashSet<ObjectId>,
    wants: &HashSet<ObjectId>,
    session_shallow: &HashSet<ObjectId>,
    filter: Option<BlobFilter>,
    caps: &Capabilities,
    writer: &mut PktWriter<W>,
) -> Result<(), ProtocolError> {
    // Tag inclusion map: peeled target -> the annotated tag object.
    let tagged: HashMap<ObjectId, ObjectId> = if caps.has("include-tag") {
        advertised
            .iter()
            .filter_map(|a| {
                a.peeled.and_then(|peeled| {
                    matches!(db.get(&a.oid), Ok(Some(Object::Tag(_))))
                        .then_some((peeled, a.oid))
                })
            })
            .collect()
    } else {
        HashMap::new()
    };

    let result =
        build_and_stream_pack(db, common, wants, session_shallow, filter, tagged, caps, writer);
    if let Err(ref err) = result {
        // Best-effort fatal notification on channel 3.
        if let Some(max) = caps.sideband() {
            let msg = format!("fatal: {err}\n");
            let _ = write_band(writer, BAND_FATAL, max, msg.as_bytes());
            let _ = writer.flush_pkt();
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn build_and_stream_pack<W: Write>(
    db: &ObjectDatabase,
    common: &HashSet<ObjectId>,
    wants: &HashSet<ObjectId>,
    session_shallow: &HashSet<ObjectId>,
    filter: Option<BlobFilter>,
    tagged: HashMap<ObjectId, ObjectId>,
    caps: &Capabilities,
    writer: &mut PktWriter<W>,
) -> Result<(), ProtocolError> {
    let finder =
        MissingObjectsFinder::with_tagged(db, common, wants, session_shallow, tagged)?;
    let mut inputs: Vec<PackInput> = Vec::new();
    for item in finder {
        let (oid, hint) = item?;
        let (obj_type, data) = db
            .get_raw(&oid)?
            .ok_or(grit_odb::OdbError::NotFound(oid))?;
        if let Some(filter) = filter {
            if filter.excludes(obj_type, data.len()) {
                continue;
            }
        }
        inputs.push(PackInput::with_hint(obj_type, data, hint.name));
    }

    let sideband = caps.sideband();
    let progress_allowed = sideband.is_some() && !caps.has("no-progress");
    if progress_allowed {
        let msg = format!("Counting objects: {}, done.\n", inputs.len());
        write_band(writer, BAND_PROGRESS, sideband.expect("sideband"), msg.as_bytes())?;
    }

    let opts = WriteOptions {
        ofs_delta: caps.has("ofs-delta"),
        ..WriteOptions::default()
    };
    match sideband {
        Some(max) => {
            let mut sink = SidebandSink::new(writer, max);
            write_pack(&mut sink, inputs, &opts)?;
            writer.flush_pkt()?;
        }
        None => {
            writer.flush()?;
            write_pack(writer.get_mut(), inputs, &opts)?;
            writer.get_mut().flush()?;
        }
    }
    Ok(())
}

fn parse_oid(bytes: &[u8]) -> Result<ObjectId, ProtocolError> {
    let hex = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::Violation("non-UTF-8 OID".into()))?;
    ObjectId::from_hex(hex.trim())
        .map_err(|e| ProtocolError::Violation(format!("bad OID: {e}")))
}

fn parse_ascii<T: std::str::FromStr>(bytes: &[u8]) -> Result<T, ProtocolError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            ProtocolError::Violation(format!(
                "bad numeric argument: {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

/// `deepen-not` takes a ref name or a raw OID.
fn resolve_deepen_not(refs: &FilesRefStore, arg: &[u8]) -> Result<ObjectId, ProtocolError> {
    if let Ok(oid) = parse_oid(arg) {
        return Ok(oid);
    }
    let name = std::str::from_utf8(arg)
        .map_err(|_| ProtocolError::Violation("non-UTF-8 deepen-not ref".into()))?;
    let name = RefName::new(name.trim())?;
    refs.resolve(&name)?
        .ok_or_else(|| ProtocolError::Violation(format!("deepen-not: unknown ref {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::BString;
    use grit_object::{Blob, Commit, FileMode, Tag, Tree, TreeEntry};
    use grit_utils::date::{GitDate, Signature};
    use std::io::Cursor;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: ObjectDatabase,
        refs: FilesRefStore,
    }

    fn sig() -> Signature {
        Signature::new("U", "u@x", GitDate::new(1_700_000_000, 0))
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("objects")).unwrap();
            let db = ObjectDatabase::open(dir.path().join("objects")).unwrap();
            let refs = FilesRefStore::new(dir.path());
            Self {
                _dir: dir,
                db,
                refs,
            }
        }

        fn commit(&self, content: &[u8]) -> ObjectId {
            let blob = self.db.add(&Object::Blob(Blob::new(content))).unwrap();
            let tree = self
                .db
                .add(&Object::Tree(Tree {
                    entries: vec![TreeEntry {
                        mode: FileMode::Regular,
                        name: BString::from("f"),
                        oid: blob,
                    }],
                }))
                .unwrap();
            self.db
                .add(&Object::Commit(Commit {
                    tree,
                    parents: vec![],
                    author: sig(),
                    committer: sig(),
                    encoding: None,
                    extra_headers: Vec::new(),
                    gpgsig: None,
                    message: BString::from("m\n"),
                }))
                .unwrap()
        }
    }

    fn advert_lines(output: &[u8]) -> Vec<String> {
        let mut reader = PktReader::new(Cursor::new(output.to_vec()));
        reader
            .read_until_flush()
            .unwrap()
            .into_iter()
            .map(|l| String::from_utf8_lossy(&l).into_owned())
            .collect()
    }

    #[test]
    fn advertisement_lists_head_refs_and_peeled_tags() {
        let f = Fixture::new();
        let commit = f.commit(b"tip\n");
        let tag_oid = f
            .db
            .add(&Object::Tag(Tag {
                object: commit,
                object_type: grit_object::ObjectType::Commit,
                name: BString::from("v1"),
                tagger: Some(sig()),
                message: BString::from("first\n"),
                signature: None,
            }))
            .unwrap();

        let main = RefName::new("refs/heads/main").unwrap();
        f.refs
            .set_if_equals(&main, None, commit, &sig(), "init")
            .unwrap();
        let tag_ref = RefName::new("refs/tags/v1").unwrap();
        f.refs
            .set_if_equals(&tag_ref, None, tag_oid, &sig(), "tag")
            .unwrap();
        f.refs
            .set_symbolic(&RefName::new("HEAD").unwrap(), &main)
            .unwrap();

        // A session that only lists refs: the client just flushes.
        let mut output = Vec::new();
        serve_upload_pack(
            &f.db,
            &f.refs,
            Cursor::new(b"0000".to_vec()),
            &mut output,
            &UploadPackConfig::default(),
        )
        .unwrap();

        let lines = advert_lines(&output);
        // HEAD first, with the capability list after a NUL.
        assert!(lines[0].starts_with(&format!("{commit} HEAD\0")));
        assert!(lines[0].contains("multi_ack_detailed"));
        assert!(lines[0].contains("side-band-64k"));
        assert!(lines[0].contains("shallow"));
        assert!(lines[0].contains("no-done"));
        assert!(lines[0].contains("symref=HEAD:refs/heads/main"));
        // Branch, tag, and the tag's peeled line.
        assert!(lines.iter().any(|l| l.trim_end() == format!("{commit} refs/heads/main")));
        assert!(lines.iter().any(|l| l.trim_end() == format!("{tag_oid} refs/tags/v1")));
        assert!(lines
            .iter()
            .any(|l| l.trim_end() == format!("{commit} refs/tags/v1^{{}}")));
    }

    #[test]
    fn empty_repository_advertises_placeholder() {
        let f = Fixture::new();
        let mut output = Vec::new();
        serve_upload_pack(
            &f.db,
            &f.refs,
            Cursor::new(b"0000".to_vec()),
            &mut output,
            &UploadPackConfig::default(),
        )
        .unwrap();

        let lines = advert_lines(&output);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(
            "0000000000000000000000000000000000000000 capabilities^{}\0"
        ));
    }

    #[test]
    fn unknown_want_is_rejected() {
        let f = Fixture::new();
        let commit = f.commit(b"tip\n");
        let main = RefName::new("refs/heads/main").unwrap();
        f.refs
            .set_if_equals(&main, None, commit, &sig(), "init")
            .unwrap();

        let mut input = Vec::new();
        {
            let mut w = PktWriter::new(&mut input);
            w.text_pkt(
                "want 1111111111111111111111111111111111111111 multi_ack_detailed",
            )
            .unwrap();
            w.flush_pkt().unwrap();
        }

        let mut output = Vec::new();
        let result = serve_upload_pack(
            &f.db,
            &f.refs,
            Cursor::new(input),
            &mut output,
            &UploadPackConfig::default(),
        );
        assert!(matches!(result, Err(ProtocolError::Violation(_))));
        assert!(String::from_utf8_lossy(&output).contains("ERR upload-pack: not our ref"));
    }

    #[test]
    fn blob_none_filter_omits_blobs() {
        let f = Fixture::new();
        let commit = f.commit(b"filtered away\n");
        let main = RefName::new("refs/heads/main").unwrap();
        f.refs
            .set_if_equals(&main, None, commit, &sig(), "init")
            .unwrap();

        let mut input = Vec::new();
        {
            let mut w = PktWriter::new(&mut input);
            w.text_pkt(&format!("want {commit}")).unwrap();
            w.text_pkt("filter blob:none").unwrap();
            w.flush_pkt().unwrap();
            w.text_pkt("done").unwrap();
            w.flush().unwrap();
        }

        let mut output = Vec::new();
        serve_upload_pack(
            &f.db,
            &f.refs,
            Cursor::new(input),
            &mut output,
            &UploadPackConfig::default(),
        )
        .unwrap();

        let mut reader = PktReader::new(Cursor::new(output));
        reader.read_until_flush().unwrap(); // advertisement
        reader.read_line().unwrap().unwrap(); // NAK

        let pack = grit_pack::pack::read_pack_stream(reader.get_mut()).unwrap();
        let data = grit_pack::pack::PackData::from_bytes(pack).unwrap();
        // The commit and its tree, but no blob.
        assert_eq!(data.num_objects(), 2);
    }

    #[test]
    fn unsupported_filter_rejected() {
        let f = Fixture::new();
        let commit = f.commit(b"tip\n");
        let main = RefName::new("refs/heads/main").unwrap();
        f.refs
            .set_if_equals(&main, None, commit, &sig(), "init")
            .unwrap();

        let mut input = Vec::new();
        {
            let mut w = PktWriter::new(&mut input);
            w.text_pkt(&format!("want {commit}")).unwrap();
            w.text_pkt("filter tree:0").unwrap();
            w.flush_pkt().unwrap();
        }

        let result = serve_upload_pack(
            &f.db,
            &f.refs,
            Cursor::new(input),
            &mut Vec::new(),
            &UploadPackConfig::default(),
        );
        assert!(matches!(result, Err(ProtocolError::Violation(_))));
    }

    #[test]
    fn single_want_done_yields_raw_pack() {
        // No sideband negotiated: the pack follows the final NAK raw.
        let f = Fixture::new();
        let commit = f.commit(b"tip\n");
        let main = RefName::new("refs/heads/main").unwrap();
        f.refs
            .set_if_equals(&main, None, commit, &sig(), "init")
            .unwrap();

        let mut input = Vec::new();
        {
            let mut w = PktWriter::new(&mut input);
            w.text_pkt(&format!("want {commit}")).unwrap();
            w.flush_pkt().unwrap();
            w.text_pkt("done").unwrap();
            w.flush().unwrap();
        }

        let mut output = Vec::new();
        serve_upload_pack(
            &f.db,
            &f.refs,
            Cursor::new(input),
            &mut output,
            &UploadPackConfig::default(),
        )
        .unwrap();

        // Skip advertisement, then the NAK, then raw pack bytes.
        let mut reader = PktReader::new(Cursor::new(output));
        reader.read_until_flush().unwrap(); // advertisement
        let nak = reader.read_line().unwrap().unwrap();
        assert_eq!(nak, b"NAK\n");

        let pack = grit_pack::pack::read_pack_stream(reader.get_mut()).unwrap();
        let data = grit_pack::pack::PackData::from_bytes(pack).unwrap();
        assert_eq!(data.num_objects(), 3);
        data.verify_checksum().unwrap();
    }
}
