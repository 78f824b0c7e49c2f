//! The receive-pack server: the serving half of push.
//!
//! Advertise, read old/new/name command triples, ingest the incoming
//! (possibly thin) pack, apply the commands through ref CAS, and report
//! per-command status. With `atomic`, all involved refs are locked before
//! the first write so a concurrent reader sees the whole batch or nothing.

use std::collections::HashSet;
use std::io::{Read, Write};

use grit_hash::ObjectId;
use grit_odb::missing::is_ancestor;
use grit_odb::ObjectDatabase;
use grit_pack::pack::{read_pack_stream, PackData};
use grit_ref::{FilesRefStore, RefLock, RefName, RefValue};
use grit_utils::date::Signature;

use crate::capability::{split_caps, Capabilities};
use crate::pktline::{strip_newline, Pkt, PktReader, PktWriter};
use crate::sideband::{write_band, BAND_DATA};
use crate::{ProtocolError, AGENT};

/// Server-side policy for pushes.
#[derive(Debug, Clone)]
pub struct ReceivePackConfig {
    /// Identity journaled into reflogs for applied updates.
    pub identity: Signature,
    /// Reject updates whose old value is not an ancestor of the new one.
    pub deny_non_fast_forwards: bool,
    /// Refuse deleting the branch HEAD points at.
    pub deny_delete_current: bool,
    /// Advertise and accept ref deletions.
    pub allow_deletes: bool,
}

impl ReceivePackConfig {
    pub fn new(identity: Signature) -> Self {
        Self {
            identity,
            deny_non_fast_forwards: true,
            deny_delete_current: true,
            allow_deletes: true,
        }
    }
}

/// One parsed update command.
#[derive(Debug, Clone)]
struct Command {
    old: ObjectId,
    new: ObjectId,
    /// The raw name; validated during apply so a bad name yields
    /// `ng <name> funny refname` instead of killing the session.
    raw_name: String,
}

impl Command {
    fn is_create(&self) -> bool {
        self.old.is_null() && !self.new.is_null()
    }

    fn is_delete(&self) -> bool {
        self.new.is_null()
    }
}

/// Per-command outcome, as reported to the client.
pub type CommandStatus = (String, Result<(), String>);

/// Run a complete receive-pack session. Returns the per-command statuses
/// (also sent to the client when `report-status` was negotiated).
pub fn serve_receive_pack<R: Read, W: Write>(
    db: &ObjectDatabase,
    refs: &FilesRefStore,
    input: R,
    output: W,
    config: &ReceivePackConfig,
) -> Result<Vec<CommandStatus>, ProtocolError> {
    let mut reader = PktReader::new(input);
    let mut writer = PktWriter::new(output);

    advertise_refs(refs, &mut writer, config)?;

    // ---- Command phase ----
    let mut commands: Vec<Command> = Vec::new();
    let mut caps = Capabilities::new();
    loop {
        match reader.read_pkt()? {
            Pkt::Flush => break,
            Pkt::Data(line) => {
                let line = strip_newline(&line);
                let (payload, line_caps) = split_caps(line);
                if commands.is_empty() {
                    caps = line_caps;
                }
                commands.push(parse_command(payload)?);
            }
            other => {
                return Err(ProtocolError::Violation(format!(
                    "unexpected control packet {other:?} in command phase"
                )))
            }
        }
    }

    if commands.is_empty() {
        return Ok(Vec::new());
    }

    // ---- Pack phase (skipped when every command is a delete) ----
    let needs_pack = commands.iter().any(|c| !c.is_delete());
    let unpack_result: Result<(), String> = if needs_pack {
        ingest_pack(db, reader.get_mut())
    } else {
        Ok(())
    };

    // ---- Apply phase ----
    let statuses = match &unpack_result {
        Ok(()) => apply_commands(db, refs, &commands, &caps, config),
        Err(_) => commands
            .iter()
            .map(|c| (c.raw_name.clone(), Err("unpacker error".to_string())))
            .collect(),
    };

    // ---- Report phase ----
    if caps.has("report-status") {
        report_status(&mut writer, &caps, &unpack_result, &statuses)?;
    }
    Ok(statuses)
}

fn advertise_refs<W: Write>(
    refs: &FilesRefStore,
    writer: &mut PktWriter<W>,
    config: &ReceivePackConfig,
) -> Result<(), ProtocolError> {
    let mut caps = String::from("report-status ofs-delta side-band-64k atomic");
    if config.allow_deletes {
        caps.push_str(" delete-refs");
    }
    caps.push(' ');
    caps.push_str(AGENT);

    let list = refs.iter_resolved(None)?;
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
        for (i, (name, oid)) in list.iter().enumerate() {
            if i == 0 {
                writer.data_pkt(format!("{oid} {name}\0{caps}\n").as_bytes())?;
            } else {
                writer.text_pkt(&format!("{oid} {name}"))?;
            }
        }
    }
    writer.flush_pkt()?;
    Ok(())
}

fn parse_command(payload: &[u8]) -> Result<Command, ProtocolError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| ProtocolError::Violation("non-UTF-8 update command".into()))?;
    let mut parts = text.splitn(3, ' ');
    let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ProtocolError::Violation(format!(
            "malformed update command: {text:?}"
        )));
    };
    Ok(Command {
        old: ObjectId::from_hex(old)
            .map_err(|e| ProtocolError::Violation(format!("bad old OID: {e}")))?,
        new: ObjectId::from_hex(new)
            .map_err(|e| ProtocolError::Violation(format!("bad new OID: {e}")))?,
        raw_name: name.to_string(),
    })
}

/// Pull the pack off the wire and complete it against the local store.
fn ingest_pack(db: &ObjectDatabase, input: &mut impl Read) -> Result<(), String> {
    let bytes = read_pack_stream(input).map_err(|e| e.to_string())?;
    let data = PackData::from_bytes(bytes).map_err(|e| e.to_string())?;
    db.install_pack(&data).map(|_| ()).map_err(|e| e.to_string())
}

fn apply_commands(
    db: &ObjectDatabase,
    refs: &FilesRefStore,
    commands: &[Command],
    caps: &Capabilities,
    config: &ReceivePackConfig,
) -> Vec<CommandStatus> {
    // Validation is common to both modes.
    let mut validated: Vec<(usize, RefName, Result<(), String>)> = Vec::new();
    let current_branch = current_branch(refs);

    for (i, command) in commands.iter().enumerate() {
        let name = match RefName::new(command.raw_name.clone()) {
            Ok(name) => name,
            Err(_) => {
                validated.push((
                    i,
                    RefName::new("refs/heads/invalid").expect("static name"),
                    Err("funny refname".into()),
                ));
                continue;
            }
        };

        let verdict = validate_command(db, command, &name, &current_branch, config);
        validated.push((i, name, verdict));
    }

    if caps.has("atomic") {
        apply_atomic(refs, commands, validated, config)
    } else {
        apply_one_by_one(refs, commands, validated, config)
    }
}

fn validate_command(
    db: &ObjectDatabase,
    command: &Command,
    name: &RefName,
    current_branch: &Option<RefName>,
    config: &ReceivePackConfig,
) -> Result<(), String> {
    if command.is_delete() {
        if !config.allow_deletes {
            return Err("deletion prohibited".into());
        }
        if config.deny_delete_current && Some(name) == current_branch.as_ref() {
            return Err("deletion of the current branch prohibited".into());
        }
        return Ok(());
    }

    if !db.contains(&command.new) {
        return Err("missing necessary objects".into());
    }

    if !command.is_create() && config.deny_non_fast_forwards {
        match is_ancestor(db, &command.old, &command.new) {
            Ok(true) => {}
            Ok(false) => return Err("non-fast-forward".into()),
            // The old value may predate our history (e.g. was pushed
            // around us); without it the check cannot pass.
            Err(_) => return Err("non-fast-forward".into()),
        }
    }
    Ok(())
}

fn apply_one_by_one(
    refs: &FilesRefStore,
    commands: &[Command],
    validated: Vec<(usize, RefName, Result<(), String>)>,
    config: &ReceivePackConfig,
) -> Vec<CommandStatus> {
    let mut statuses = Vec::with_capacity(commands.len());
    for (i, name, verdict) in validated {
        let command = &commands[i];
        if let Err(reason) = verdict {
            statuses.push((command.raw_name.clone(), Err(reason)));
            continue;
        }

        let outcome = if command.is_delete() {
            refs.remove_if_equals(&name, Some(command.old))
                .map_err(|e| e.to_string())
                .and_then(|ok| ok.then_some(()).ok_or_else(|| "failed to delete".into()))
        } else {
            refs.set_if_equals(
                &name,
                Some(command.old),
                command.new,
                &config.identity,
                "push",
            )
            .map_err(|e| e.to_string())
            .and_then(|ok| ok.then_some(()).ok_or_else(|| "failed to update ref".into()))
        };
        statuses.push((command.raw_name.clone(), outcome));
    }
    statuses
}

/// Atomic apply: lock every ref (sorted, to avoid deadlocks between
/// concurrent batches), verify every expectation under lock, then write.
/// Any failure before the write phase rejects the whole batch.
fn apply_atomic(
    refs: &FilesRefStore,
    commands: &[Command],
    validated: Vec<(usize, RefName, Result<(), String>)>,
    config: &ReceivePackConfig,
) -> Vec<CommandStatus> {
    let reject_all = |reason_for: usize, reason: String| -> Vec<CommandStatus> {
        commands
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let msg = if i == reason_for {
                    reason.clone()
                } else {
                    "atomic transaction failed".to_string()
                };
                (c.raw_name.clone(), Err(msg))
            })
            .collect()
    };

    for (i, _, verdict) in &validated {
        if let Err(reason) = verdict {
            return reject_all(*i, reason.clone());
        }
    }

    let mut order: Vec<(usize, RefName)> = validated
        .into_iter()
        .map(|(i, name, _)| (i, name))
        .collect();
    order.sort_by(|a, b| a.1.cmp(&b.1));

    let mut locks: Vec<(usize, RefLock)> = Vec::with_capacity(order.len());
    for (i, name) in &order {
        match refs.lock_ref(name) {
            Ok(lock) => {
                let expected = commands[*i].old;
                let current = lock.current().unwrap_or(ObjectId::NULL_SHA1);
                if current != expected {
                    return reject_all(*i, "failed to update ref".into());
                }
                locks.push((*i, lock));
            }
            Err(e) => return reject_all(*i, e.to_string()),
        }
    }

    // Every precondition holds and every lock is ours: write the batch.
    let mut statuses: Vec<Option<Result<(), String>>> = vec![None; commands.len()];
    for (i, lock) in locks {
        let command = &commands[i];
        let outcome = if command.is_delete() {
            refs.delete_locked(lock).map_err(|e| e.to_string())
        } else {
            refs.commit_locked(lock, command.new, &config.identity, "push")
                .map_err(|e| e.to_string())
        };
        statuses[i] = Some(outcome);
    }

    commands
        .iter()
        .zip(statuses)
        .map(|(c, s)| (c.raw_name.clone(), s.unwrap_or(Ok(()))))
        .collect()
}

/// The branch HEAD points at, if it is symbolic.
fn current_branch(refs: &FilesRefStore) -> Option<RefName> {
    let head = RefName::new("HEAD").ok()?;
    match refs.read(&head).ok()?? {
        RefValue::Symbolic(target) => Some(target),
        RefValue::Direct(_) => None,
    }
}

fn report_status<W: Write>(
    writer: &mut PktWriter<W>,
    caps: &Capabilities,
    unpack_result: &Result<(), String>,
    statuses: &[CommandStatus],
) -> Result<(), ProtocolError> {
    // Render the report as its own pkt-line stream first.
    let mut report = Vec::new();
    {
        let mut inner = PktWriter::new(&mut report);
        match unpack_result {
            Ok(()) => inner.text_pkt("unpack ok")?,
            Err(e) => inner.text_pkt(&format!("unpack {e}"))?,
        }
        for (name, status) in statuses {
            match status {
                Ok(()) => inner.text_pkt(&format!("ok {name}"))?,
                Err(reason) => inner.text_pkt(&format!("ng {name} {reason}"))?,
            }
        }
        inner.flush_pkt()?;
    }

    match caps.sideband() {
        Some(max) => {
            write_band(writer, BAND_DATA, max, &report)?;
            writer.flush_pkt()?;
        }
        None => {
            writer.flush()?;
            writer.get_mut().write_all(&report)?;
            writer.get_mut().flush()?;
        }
    }
    Ok(())
}

/// Deduplicate helper for tests and callers inspecting statuses.
pub fn rejected(statuses: &[CommandStatus]) -> HashSet<&str> {
    statuses
        .iter()
        .filter(|(_, s)| s.is_err())
        .map(|(name, _)| name.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use grit_utils::date::GitDate;
    use std::io::Cursor;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: ObjectDatabase,
        refs: FilesRefStore,
    }

    fn sig() -> Signature {
        Signature::new("P", "p@x", GitDate::new(1_700_000_000, 0))
    }

    fn oid(b: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = b;
        ObjectId::from_bytes(&bytes, grit_hash::HashAlgorithm::Sha1).unwrap()
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
    }

    fn run(
        f: &Fixture,
        commands: &[String],
    ) -> (Vec<CommandStatus>, Vec<u8>) {
        let mut input = Vec::new();
        {
            let mut w = PktWriter::new(&mut input);
            for (i, command) in commands.iter().enumerate() {
                if i == 0 {
                    w.data_pkt(format!("{command}\0report-status\n").as_bytes())
                        .unwrap();
                } else {
                    w.text_pkt(command).unwrap();
                }
            }
            w.flush_pkt().unwrap();
        }

        let mut output = Vec::new();
        let statuses = serve_receive_pack(
            &f.db,
            &f.refs,
            Cursor::new(input),
            &mut output,
            &ReceivePackConfig::new(sig()),
        )
        .unwrap();
        (statuses, output)
    }

    #[test]
    fn delete_only_push_needs_no_pack() {
        let f = Fixture::new();
        let name = RefName::new("refs/heads/doomed").unwrap();
        f.refs
            .set_if_equals(&name, None, oid(5), &sig(), "init")
            .unwrap();

        let zero = ObjectId::NULL_SHA1;
        let (statuses, output) = run(
            &f,
            &[format!("{} {} refs/heads/doomed", oid(5), zero)],
        );

        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].1.is_ok());
        assert_eq!(f.refs.read(&name).unwrap(), None);

        // The report-status block confirms the deletion.
        let mut reader = PktReader::new(Cursor::new(output));
        reader.read_until_flush().unwrap(); // advertisement
        let report = reader.read_until_flush().unwrap();
        let text: Vec<String> = report
            .iter()
            .map(|l| String::from_utf8_lossy(l).trim_end().to_string())
            .collect();
        assert_eq!(text[0], "unpack ok");
        assert_eq!(text[1], "ok refs/heads/doomed");
    }

    #[test]
    fn funny_refname_rejected_without_touching_store() {
        let f = Fixture::new();
        let zero = ObjectId::NULL_SHA1;
        // Delete of a bogus name: no pack needed, validation still runs.
        let (statuses, _) = run(&f, &[format!("{} {} refs/heads/bad..name", oid(5), zero)]);

        assert_eq!(statuses.len(), 1);
        assert_eq!(
            statuses[0].1.as_ref().unwrap_err().as_str(),
            "funny refname"
        );
    }

    #[test]
    fn stale_expected_value_fails_the_command() {
        let f = Fixture::new();
        let name = RefName::new("refs/heads/main").unwrap();
        f.refs
            .set_if_equals(&name, None, oid(7), &sig(), "init")
            .unwrap();

        // The client believes the ref still holds oid(5).
        let zero = ObjectId::NULL_SHA1;
        let (statuses, _) = run(&f, &[format!("{} {} refs/heads/main", oid(5), zero)]);

        assert!(statuses[0].1.is_err());
        assert_eq!(f.refs.resolve(&name).unwrap(), Some(oid(7)));
    }

    #[test]
    fn empty_session_is_a_noop() {
        let f = Fixture::new();
        let mut output = Vec::new();
        let statuses = serve_receive_pack(
            &f.db,
            &f.refs,
            Cursor::new(b"0000".to_vec()),
            &mut output,
            &ReceivePackConfig::new(sig()),
        )
        .unwrap();
        assert!(statuses.is_empty());
    }

    #[test]
    fn current_branch_deletion_denied() {
        let f = Fixture::new();
        let main = RefName::new("refs/heads/main").unwrap();
        f.refs
            .set_if_equals(&main, None, oid(3), &sig(), "init")
            .unwrap();
        f.refs
            .set_symbolic(&RefName::new("HEAD").unwrap(), &main)
            .unwrap();

        let zero = ObjectId::NULL_SHA1;
        let (statuses, _) = run(&f, &[format!("{} {} refs/heads/main", oid(3), zero)]);

        assert_eq!(
            statuses[0].1.as_ref().unwrap_err().as_str(),
            "deletion of the current branch prohibited"
        );
        assert_eq!(f.refs.resolve(&main).unwrap(), Some(oid(3)));
    }
}
