//! The push client (send-pack).
//!
//! Reads the receive-pack advertisement, emits old/new/name commands,
//! streams a pack of the objects the remote is missing, and parses the
//! report-status block.

use std::collections::HashSet;
use std::io::{Read, Write};

use grit_hash::ObjectId;
use grit_odb::missing::is_ancestor;
use grit_odb::{MissingObjectsFinder, ObjectDatabase};
use grit_pack::write::{write_pack, PackInput, WriteOptions};

use crate::capability::Capabilities;
use crate::fetch::{read_advertisement, Advertisement};
use crate::pktline::{strip_newline, PktReader, PktWriter};
use crate::sideband::SidebandReader;
use crate::{ProtocolError, AGENT};

/// One requested ref change.
#[derive(Debug, Clone)]
pub struct PushUpdate {
    pub name: String,
    /// `None` deletes the remote ref.
    pub new: Option<ObjectId>,
    /// Skip the local fast-forward check.
    pub force: bool,
}

/// Push options.
#[derive(Debug, Clone, Default)]
pub struct PushConfig {
    /// All-or-nothing application on the remote.
    pub atomic: bool,
}

/// Outcome for one pushed ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefStatus {
    Ok,
    Rejected(String),
}

/// Overall push outcome.
#[derive(Debug)]
pub struct PushResult {
    pub ok: bool,
    pub ref_status: Vec<(String, RefStatus)>,
}

/// Run a push session over the byte streams.
pub fn push<R: Read, W: Write>(
    db: &ObjectDatabase,
    updates: &[PushUpdate],
    input: R,
    output: W,
    config: &PushConfig,
) -> Result<PushResult, ProtocolError> {
    let mut reader = PktReader::new(input);
    let mut writer = PktWriter::new(output);

    let advert = read_advertisement(&mut reader)?;

    if updates.is_empty() {
        writer.flush_pkt()?;
        return Ok(PushResult {
            ok: true,
            ref_status: Vec::new(),
        });
    }

    let caps = client_caps(&advert.caps, updates, config)?;

    // Local fast-forward check: refuse to send an update we can already
    // tell the server would have to rewrite, unless forced.
    let mut ref_status: Vec<(String, RefStatus)> = Vec::new();
    let mut commands: Vec<(ObjectId, ObjectId, String)> = Vec::new();
    for update in updates {
        let old = advertised_value(&advert, &update.name).unwrap_or(ObjectId::NULL_SHA1);
        let new = update.new.unwrap_or(ObjectId::NULL_SHA1);

        if !update.force && !old.is_null() && !new.is_null() && db.contains(&old) {
            if !is_ancestor(db, &old, &new)? {
                ref_status.push((
                    update.name.clone(),
                    RefStatus::Rejected("non-fast-forward".into()),
                ));
                continue;
            }
        }
        commands.push((old, new, update.name.clone()));
    }

    if commands.is_empty() {
        // Everything was rejected locally; never open the session.
        writer.flush_pkt()?;
        return Ok(PushResult {
            ok: false,
            ref_status,
        });
    }

    // ---- Commands ----
    for (i, (old, new, name)) in commands.iter().enumerate() {
        if i == 0 {
            writer.data_pkt(format!("{old} {new} {name}\0{caps}\n").as_bytes())?;
        } else {
            writer.text_pkt(&format!("{old} {new} {name}"))?;
        }
    }
    writer.flush_pkt()?;

    // ---- Pack (only when something besides deletes is pushed) ----
    if commands.iter().any(|(_, new, _)| !new.is_null()) {
        let haves: HashSet<ObjectId> = advert
            .refs
            .iter()
            .map(|(_, oid)| *oid)
            .filter(|oid| db.contains(oid))
            .collect();
        let wants: HashSet<ObjectId> = commands
            .iter()
            .filter(|(_, new, _)| !new.is_null())
            .map(|(_, new, _)| *new)
            .collect();

        let finder = MissingObjectsFinder::new(db, &haves, &wants, &HashSet::new())?;
        let mut inputs = Vec::new();
        for item in finder {
            let (oid, hint) = item?;
            let (obj_type, data) = db
                .get_raw(&oid)?
                .ok_or(grit_odb::OdbError::NotFound(oid))?;
            inputs.push(PackInput::with_hint(obj_type, data, hint.name));
        }

        let opts = WriteOptions {
            ofs_delta: advert.caps.has("ofs-delta"),
            ..WriteOptions::default()
        };
        writer.flush()?;
        write_pack(writer.get_mut(), inputs, &opts)?;
        writer.get_mut().flush()?;
    }

    // ---- Report ----
    if caps.has("report-status") {
        let mut remote = parse_report(&mut reader, &caps)?;
        ref_status.append(&mut remote);
    } else {
        for (_, _, name) in &commands {
            ref_status.push((name.clone(), RefStatus::Ok));
        }
    }

    let ok = ref_status.iter().all(|(_, s)| *s == RefStatus::Ok);
    Ok(PushResult { ok, ref_status })
}

fn advertised_value(advert: &Advertisement, name: &str) -> Option<ObjectId> {
    advert
        .refs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, oid)| *oid)
}

fn client_caps(
    server: &Capabilities,
    updates: &[PushUpdate],
    config: &PushConfig,
) -> Result<Capabilities, ProtocolError> {
    let mut caps = Capabilities::new();
    if server.has("report-status") {
        caps.add("report-status");
    }
    if server.has("side-band-64k") {
        caps.add("side-band-64k");
    }
    if server.has("ofs-delta") {
        caps.add("ofs-delta");
    }
    if updates.iter().any(|u| u.new.is_none()) && !server.has("delete-refs") {
        return Err(ProtocolError::CapabilityMissing("delete-refs".into()));
    }
    if config.atomic {
        if !server.has("atomic") {
            return Err(ProtocolError::CapabilityMissing("atomic".into()));
        }
        caps.add("atomic");
    }
    let (name, value) = AGENT.split_once('=').expect("agent constant");
    caps.set(name, Some(value));
    Ok(caps)
}

/// Parse `unpack`/`ok`/`ng` lines, demuxing sideband when negotiated.
fn parse_report<R: Read>(
    reader: &mut PktReader<R>,
    caps: &Capabilities,
) -> Result<Vec<(String, RefStatus)>, ProtocolError> {
    let lines: Vec<Vec<u8>> = if caps.sideband().is_some() {
        let mut sideband = SidebandReader::new(reader);
        let block = sideband.read_to_end()?;
        let mut inner = PktReader::new(std::io::Cursor::new(block));
        inner.read_until_flush()?
    } else {
        reader.read_until_flush()?
    };

    let mut statuses = Vec::new();
    for line in &lines {
        let line = strip_newline(line);
        let text = String::from_utf8_lossy(line);
        if let Some(rest) = text.strip_prefix("unpack ") {
            if rest != "ok" {
                return Err(ProtocolError::Remote(format!("unpack failed: {rest}")));
            }
        } else if let Some(name) = text.strip_prefix("ok ") {
            statuses.push((name.to_string(), RefStatus::Ok));
        } else if let Some(rest) = text.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
            statuses.push((name.to_string(), RefStatus::Rejected(reason.to_string())));
        }
    }
    Ok(statuses)
}
