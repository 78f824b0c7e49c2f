//! The fetch client.
//!
//! Mirrors upload-pack from the requesting side: parse the advertisement,
//! pick wants, drive the graph walker through have rounds, and ingest the
//! resulting pack as a thin pack against the local store.

use std::collections::{BinaryHeap, HashSet};
use std::io::{Read, Write};
use std::path::PathBuf;

use grit_hash::ObjectId;
use grit_object::Object;
use grit_odb::ObjectDatabase;
use grit_pack::pack::{read_pack_stream, PackData};

use crate::capability::{split_caps, Capabilities};
use crate::pktline::{strip_newline, Pkt, PktReader, PktWriter};
use crate::sideband::{BAND_DATA, BAND_FATAL, BAND_PROGRESS};
use crate::{ProtocolError, AGENT};

/// Haves per negotiation round.
const HAVES_PER_ROUND: usize = 256;
/// Total have budget before the client gives up finding a base.
const MAX_HAVES: usize = 4096;

/// Client fetch options.
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Exact ref names to fetch; empty means everything advertised.
    pub wanted_refs: Vec<String>,
    pub depth: Option<u32>,
    pub deepen_since: Option<i64>,
    /// Ref names (or hex OIDs) whose history to exclude.
    pub deepen_not: Vec<String>,
    /// Ask the server to include annotated tags pointing into the pack.
    pub include_tags: bool,
    /// OIDs currently in the local shallow file.
    pub client_shallow: Vec<ObjectId>,
}

/// What a fetch brought home.
#[derive(Debug)]
pub struct FetchResult {
    /// Every advertised ref (peeled `^{}` entries excluded).
    pub refs: Vec<(String, ObjectId)>,
    /// Symref advertisements, e.g. `("HEAD", "refs/heads/main")`.
    pub symrefs: Vec<(String, String)>,
    /// Commits newly shallow / no longer shallow after a deepen.
    pub new_shallow: Vec<ObjectId>,
    pub new_unshallow: Vec<ObjectId>,
    /// Installed pack, when any objects came over.
    pub pack_path: Option<PathBuf>,
    pub object_count: u32,
}

/// Parsed v1 advertisement.
pub struct Advertisement {
    pub refs: Vec<(String, ObjectId)>,
    pub peeled: Vec<(String, ObjectId)>,
    pub symrefs: Vec<(String, String)>,
    pub caps: Capabilities,
}

/// Read a v1 ref advertisement off the stream.
pub fn read_advertisement<R: Read>(
    reader: &mut PktReader<R>,
) -> Result<Advertisement, ProtocolError> {
    let mut refs = Vec::new();
    let mut peeled = Vec::new();
    let mut caps = Capabilities::new();
    let mut first = true;

    loop {
        match reader.read_pkt()? {
            Pkt::Flush => break,
            Pkt::Data(line) => {
                let line = strip_newline(&line);
                if line.starts_with(b"#") || line.is_empty() {
                    continue;
                }
                let payload = if first {
                    first = false;
                    let (payload, line_caps) = split_caps(line);
                    caps = line_caps;
                    payload
                } else {
                    line
                };

                let text = std::str::from_utf8(payload)
                    .map_err(|_| ProtocolError::Violation("non-UTF-8 ref line".into()))?;
                let (hex, name) = text.split_once(' ').ok_or_else(|| {
                    ProtocolError::Violation(format!("malformed ref line {text:?}"))
                })?;
                let oid = ObjectId::from_hex(hex)
                    .map_err(|e| ProtocolError::Violation(format!("bad OID: {e}")))?;

                if name == "capabilities^{}" {
                    // Placeholder advertisement of an empty repository.
                    continue;
                }
                match name.strip_suffix("^{}") {
                    Some(base) => peeled.push((base.to_string(), oid)),
                    None => refs.push((name.to_string(), oid)),
                }
            }
            other => {
                return Err(ProtocolError::Violation(format!(
                    "unexpected control packet {other:?} in advertisement"
                )))
            }
        }
    }

    let symrefs = caps
        .get("symref")
        .into_iter()
        .filter_map(|v| v.split_once(':'))
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect();

    Ok(Advertisement {
        refs,
        peeled,
        symrefs,
        caps,
    })
}

/// List the remote's refs without requesting anything.
pub fn ls_remote<R: Read, W: Write>(input: R, output: W) -> Result<Advertisement, ProtocolError> {
    let mut reader = PktReader::new(input);
    let mut writer = PktWriter::new(output);
    let advert = read_advertisement(&mut reader)?;
    writer.flush_pkt()?;
    Ok(advert)
}

/// Run a full fetch over the byte streams. `local_tips` seed the have
/// walker (usually every local ref tip).
pub fn fetch<R: Read, W: Write>(
    db: &ObjectDatabase,
    local_tips: &[ObjectId],
    input: R,
    output: W,
    config: &FetchConfig,
) -> Result<FetchResult, ProtocolError> {
    let mut reader = PktReader::new(input);
    let mut writer = PktWriter::new(output);

    let advert = read_advertisement(&mut reader)?;
    let wants = determine_wants(db, &advert, config)?;

    let mut result = FetchResult {
        refs: advert.refs.clone(),
        symrefs: advert.symrefs.clone(),
        new_shallow: Vec::new(),
        new_unshallow: Vec::new(),
        pack_path: None,
        object_count: 0,
    };

    if wants.is_empty() {
        // Nothing to ask for: close the session politely.
        writer.flush_pkt()?;
        return Ok(result);
    }

    let caps = client_caps(&advert.caps, config)?;
    let deepen_requested =
        config.depth.is_some() || config.deepen_since.is_some() || !config.deepen_not.is_empty();

    // ---- Wants ----
    for (i, want) in wants.iter().enumerate() {
        if i == 0 {
            // Capabilities ride space-separated on the first want line.
            writer.text_pkt(&format!("want {want} {caps}"))?;
        } else {
            writer.text_pkt(&format!("want {want}"))?;
        }
    }
    for oid in &config.client_shallow {
        writer.text_pkt(&format!("shallow {oid}"))?;
    }
    if let Some(depth) = config.depth {
        writer.text_pkt(&format!("deepen {depth}"))?;
    }
    if let Some(since) = config.deepen_since {
        writer.text_pkt(&format!("deepen-since {since}"))?;
    }
    for not in &config.deepen_not {
        writer.text_pkt(&format!("deepen-not {not}"))?;
    }
    writer.flush_pkt()?;

    // ---- Shallow response ----
    if deepen_requested {
        for line in reader.read_until_flush()? {
            let line = strip_newline(&line);
            if let Some(rest) = line.strip_prefix(b"shallow ") {
                result.new_shallow.push(parse_oid(rest)?);
            } else if let Some(rest) = line.strip_prefix(b"unshallow ") {
                result.new_unshallow.push(parse_oid(rest)?);
            }
        }
    }

    // ---- Negotiation ----
    negotiate(db, local_tips, &mut reader, &mut writer)?;

    // ---- Pack ----
    let pack_bytes = receive_pack_bytes(&mut reader, &caps)?;
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

fn determine_wants(
    db: &ObjectDatabase,
    advert: &Advertisement,
    config: &FetchConfig,
) -> Result<Vec<ObjectId>, ProtocolError> {
    let mut wants: Vec<ObjectId> = Vec::new();
    for (name, oid) in &advert.refs {
        let selected = if config.wanted_refs.is_empty() {
            true
        } else {
            config.wanted_refs.iter().any(|w| w == name)
        };
        // A tip we already hold completely is not worth requesting.
        if selected && !db.contains(oid) && !wants.contains(oid) {
            wants.push(*oid);
        }
    }
    Ok(wants)
}

fn client_caps(server: &Capabilities, config: &FetchConfig) -> Result<Capabilities, ProtocolError> {
    let mut caps = Capabilities::new();
    for name in ["multi_ack_detailed", "multi_ack"] {
        if server.has(name) {
            caps.add(name);
            break;
        }
    }
    if server.has("side-band-64k") {
        caps.add("side-band-64k");
    } else if server.has("side-band") {
        caps.add("side-band");
    }
    for name in ["thin-pack", "ofs-delta"] {
        if server.has(name) {
            caps.add(name);
        }
    }
    if config.include_tags {
        if !server.has("include-tag") {
            return Err(ProtocolError::CapabilityMissing("include-tag".into()));
        }
        caps.add("include-tag");
    }
    let deepen_requested =
        config.depth.is_some() || config.deepen_since.is_some() || !config.deepen_not.is_empty();
    if deepen_requested {
        if !server.has("shallow") {
            return Err(ProtocolError::CapabilityMissing("shallow".into()));
        }
        caps.add("shallow");
    }
    if config.deepen_since.is_some() && !server.has("deepen-since") {
        return Err(ProtocolError::CapabilityMissing("deepen-since".into()));
    }
    if !config.deepen_not.is_empty() && !server.has("deepen-not") {
        return Err(ProtocolError::CapabilityMissing("deepen-not".into()));
    }
    let (name, value) = AGENT.split_once('=').expect("agent constant");
    caps.set(name, Some(value));
    Ok(caps)
}

/// Emit haves from the walker in rounds, processing ACKs, until the
/// server is ready, the walker dries up, or the budget is spent; then
/// send `done` and swallow the final status line.
fn negotiate<R: Read, W: Write>(
    db: &ObjectDatabase,
    local_tips: &[ObjectId],
    reader: &mut PktReader<R>,
    writer: &mut PktWriter<W>,
) -> Result<(), ProtocolError> {
    let mut walker = HaveWalker::new(db, local_tips)?;
    let mut sent_total = 0usize;
    let mut ready = false;

    while !ready && sent_total < MAX_HAVES {
        let mut sent_this_round = 0;
        while sent_this_round < HAVES_PER_ROUND {
            match walker.next()? {
                Some(oid) => {
                    writer.text_pkt(&format!("have {oid}"))?;
                    sent_this_round += 1;
                    sent_total += 1;
                }
                None => break,
            }
        }
        if sent_this_round == 0 {
            break;
        }
        writer.flush_pkt()?;

        // One response block per round, closed by NAK.
        loop {
            let Some(line) = reader.read_line()? else {
                continue;
            };
            let line = strip_newline(&line);
            if line == b"NAK" {
                break;
            }
            if let Some(rest) = line.strip_prefix(b"ACK ") {
                let mut fields = rest.splitn(2, |&b| b == b' ');
                let oid = parse_oid(fields.next().unwrap_or_default())?;
                match fields.next() {
                    Some(rest) if rest == b"common" || rest == b"continue" => {
                        walker.ack(&oid)?;
                    }
                    Some(rest) if rest == b"ready" => {
                        walker.ack(&oid)?;
                        ready = true;
                    }
                    // Bare ACK: a single-ack server found its base.
                    _ => {
                        walker.ack(&oid)?;
                        ready = true;
                    }
                }
            }
        }
    }

    writer.text_pkt("done")?;
    writer.flush()?;

    // Final status after done: one ACK or NAK line.
    let line = reader
        .read_line()?
        .ok_or_else(|| ProtocolError::Violation("missing final ACK/NAK".into()))?;
    let line = strip_newline(&line);
    if !(line == b"NAK" || line.starts_with(b"ACK ")) {
        return Err(ProtocolError::Violation(format!(
            "expected final ACK/NAK, got {:?}",
            String::from_utf8_lossy(line)
        )));
    }
    Ok(())
}

/// Receive the pack: sideband-demuxed when negotiated, raw otherwise.
fn receive_pack_bytes<R: Read>(
    reader: &mut PktReader<R>,
    caps: &Capabilities,
) -> Result<Vec<u8>, ProtocolError> {
    if caps.sideband().is_some() {
        let mut pack = Vec::new();
        loop {
            match reader.read_pkt() {
                Ok(Pkt::Flush) => break,
                // The stream may simply end after the pack.
                Err(ProtocolError::Hangup) if !pack.is_empty() => break,
                Err(e) => return Err(e),
                Ok(Pkt::Data(payload)) => {
                    let Some((&band, rest)) = payload.split_first() else {
                        continue;
                    };
                    match band {
                        BAND_DATA => pack.extend_from_slice(rest),
                        BAND_PROGRESS => {} // informational
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
                }
                Ok(_) => continue,
            }
        }
        Ok(pack)
    } else {
        match read_pack_stream(reader.get_mut()) {
            Ok(bytes) => Ok(bytes),
            // No pack at all (nothing to send) is fine.
            Err(grit_pack::PackError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Client-side graph walker: pops local history newest-first, emitting
/// candidates for `have` lines; an ACK marks the whole ancestry common so
/// the walk stops descending there.
struct HaveWalker<'a> {
    db: &'a ObjectDatabase,
    queue: BinaryHeap<(i64, ObjectId)>,
    seen: HashSet<ObjectId>,
    common: HashSet<ObjectId>,
}

impl<'a> HaveWalker<'a> {
    fn new(db: &'a ObjectDatabase, tips: &[ObjectId]) -> Result<Self, ProtocolError> {
        let mut walker = Self {
            db,
            queue: BinaryHeap::new(),
            seen: HashSet::new(),
            common: HashSet::new(),
        };
        for tip in tips {
            walker.push(*tip)?;
        }
        Ok(walker)
    }

    fn push(&mut self, oid: ObjectId) -> Result<(), ProtocolError> {
        if !self.seen.insert(oid) {
            return Ok(());
        }
        if let Some(Object::Commit(commit)) = self.db.get(&oid)? {
            self.queue.push((commit.commit_time(), oid));
        }
        Ok(())
    }

    fn next(&mut self) -> Result<Option<ObjectId>, ProtocolError> {
        while let Some((_, oid)) = self.queue.pop() {
            if self.common.contains(&oid) {
                continue;
            }
            if let Some(Object::Commit(commit)) = self.db.get(&oid)? {
                for parent in &commit.parents {
                    self.push(*parent)?;
                }
            }
            return Ok(Some(oid));
        }
        Ok(None)
    }

    /// The server has everything reachable from `oid`.
    fn ack(&mut self, oid: &ObjectId) -> Result<(), ProtocolError> {
        let heads: HashSet<ObjectId> = [*oid].into_iter().collect();
        let (ancestors, _) = grit_odb::missing::collect_ancestors(
            self.db,
            &heads,
            &HashSet::new(),
            &HashSet::new(),
        )?;
        self.common.extend(ancestors);
        Ok(())
    }
}

fn parse_oid(bytes: &[u8]) -> Result<ObjectId, ProtocolError> {
    let hex = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::Violation("non-UTF-8 OID".into()))?;
    ObjectId::from_hex(hex.trim())
        .map_err(|e| ProtocolError::Violation(format!("bad OID: {e}")))
}
