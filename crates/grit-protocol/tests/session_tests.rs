//! Full client/server sessions over an in-memory duplex pipe.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use bstr::BString;
use grit_hash::ObjectId;
use grit_object::{Blob, Commit, FileMode, Object, Tree, TreeEntry};
use grit_odb::ObjectDatabase;
use grit_protocol::fetch::{fetch, FetchConfig};
use grit_protocol::push::{push, PushConfig, PushUpdate, RefStatus};
use grit_protocol::receive_pack::{serve_receive_pack, ReceivePackConfig};
use grit_protocol::upload_pack::{serve_upload_pack, UploadPackConfig};
use grit_ref::{FilesRefStore, RefName};
use grit_utils::date::{GitDate, Signature};

// ---- In-memory pipe ----

struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Clone)]
struct Pipe {
    state: Arc<(Mutex<PipeState>, Condvar)>,
}

struct PipeReader(Pipe);
struct PipeWriter(Pipe);

fn pipe() -> (PipeWriter, PipeReader) {
    let pipe = Pipe {
        state: Arc::new((
            Mutex::new(PipeState {
                buf: VecDeque::new(),
                closed: false,
            }),
            Condvar::new(),
        )),
    };
    (PipeWriter(pipe.clone()), PipeReader(pipe))
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let (lock, cond) = &*self.0.state;
        let mut state = lock.lock().unwrap();
        while state.buf.is_empty() && !state.closed {
            state = cond.wait(state).unwrap();
        }
        let n = out.len().min(state.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = state.buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let (lock, cond) = &*self.0.state;
        let mut state = lock.lock().unwrap();
        state.buf.extend(data);
        cond.notify_all();
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let (lock, cond) = &*self.0.state;
        lock.lock().unwrap().closed = true;
        cond.notify_all();
    }
}

// ---- Repository fixtures ----

struct Repo {
    _dir: tempfile::TempDir,
    db: ObjectDatabase,
    refs: FilesRefStore,
}

fn sig() -> Signature {
    Signature::new("E", "e@x", GitDate::new(1_700_000_000, 0))
}

impl Repo {
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

    fn commit(&self, content: &[u8], parents: Vec<ObjectId>, time: i64) -> ObjectId {
        let blob = self.db.add(&Object::Blob(Blob::new(content))).unwrap();
        let tree = self
            .db
            .add(&Object::Tree(Tree {
                entries: vec![TreeEntry {
                    mode: FileMode::Regular,
                    name: BString::from("file"),
                    oid: blob,
                }],
            }))
            .unwrap();
        let s = Signature::new("E", "e@x", GitDate::new(time, 0));
        self.db
            .add(&Object::Commit(Commit {
                tree,
                parents,
                author: s.clone(),
                committer: s,
                encoding: None,
                extra_headers: Vec::new(),
                gpgsig: None,
                message: BString::from("e2e\n"),
            }))
            .unwrap()
    }

    fn set_ref(&self, name: &str, oid: ObjectId) {
        let name = RefName::new(name).unwrap();
        self.refs
            .set_if_equals(&name, None, oid, &sig(), "test")
            .unwrap();
    }
}

// ---- Fetch sessions ----

#[test]
fn fetch_negotiation_sends_only_missing_objects() {
    // Server history: A <- B; client already has A.
    let server = Repo::new();
    let a = server.commit(b"v1\n", vec![], 100);
    let b = server.commit(b"v2\n", vec![a], 200);
    server.set_ref("refs/heads/main", b);
    server
        .refs
        .set_symbolic(&RefName::new("HEAD").unwrap(), &RefName::new("refs/heads/main").unwrap())
        .unwrap();

    let client = Repo::new();
    let client_a = client.commit(b"v1\n", vec![], 100);
    assert_eq!(client_a, a);
    client.set_ref("refs/heads/main", a);

    let (client_to_server_w, client_to_server_r) = pipe();
    let (server_to_client_w, server_to_client_r) = pipe();

    let server_thread = std::thread::spawn(move || {
        serve_upload_pack(
            &server.db,
            &server.refs,
            client_to_server_r,
            server_to_client_w,
            &UploadPackConfig::default(),
        )
        .unwrap();
        server
    });

    let result = fetch(
        &client.db,
        &[a],
        server_to_client_r,
        client_to_server_w,
        &FetchConfig::default(),
    )
    .unwrap();
    let _server = server_thread.join().unwrap();

    // The server acknowledged A and sent exactly B's commit, tree, blob.
    assert_eq!(result.object_count, 3);
    assert!(client.db.contains(&b));
    assert!(result.refs.iter().any(|(name, oid)| name == "refs/heads/main" && *oid == b));
    assert!(result
        .symrefs
        .iter()
        .any(|(from, to)| from == "HEAD" && to == "refs/heads/main"));
}

#[test]
fn clone_from_scratch_brings_full_history() {
    let server = Repo::new();
    let a = server.commit(b"one\n", vec![], 100);
    let b = server.commit(b"two\n", vec![a], 200);
    let c = server.commit(b"three\n", vec![b], 300);
    server.set_ref("refs/heads/main", c);

    let client = Repo::new();
    let (ctos_w, ctos_r) = pipe();
    let (stoc_w, stoc_r) = pipe();

    let server_thread = std::thread::spawn(move || {
        serve_upload_pack(
            &server.db,
            &server.refs,
            ctos_r,
            stoc_w,
            &UploadPackConfig::default(),
        )
        .unwrap();
    });

    let result = fetch(&client.db, &[], stoc_r, ctos_w, &FetchConfig::default()).unwrap();
    server_thread.join().unwrap();

    // 3 commits, 3 trees, 3 blobs.
    assert_eq!(result.object_count, 9);
    for oid in [a, b, c] {
        assert!(client.db.contains(&oid));
    }
}

#[test]
fn fetch_with_nothing_missing_sends_no_pack() {
    let server = Repo::new();
    let a = server.commit(b"v1\n", vec![], 100);
    server.set_ref("refs/heads/main", a);

    let client = Repo::new();
    client.commit(b"v1\n", vec![], 100);
    client.set_ref("refs/heads/main", a);

    let (ctos_w, ctos_r) = pipe();
    let (stoc_w, stoc_r) = pipe();
    let server_thread = std::thread::spawn(move || {
        serve_upload_pack(
            &server.db,
            &server.refs,
            ctos_r,
            stoc_w,
            &UploadPackConfig::default(),
        )
        .unwrap();
    });

    let result = fetch(&client.db, &[a], stoc_r, ctos_w, &FetchConfig::default()).unwrap();
    server_thread.join().unwrap();

    assert_eq!(result.object_count, 0);
    assert!(result.pack_path.is_none());
}

#[test]
fn shallow_fetch_cuts_history() {
    let server = Repo::new();
    let a = server.commit(b"one\n", vec![], 100);
    let b = server.commit(b"two\n", vec![a], 200);
    let c = server.commit(b"three\n", vec![b], 300);
    server.set_ref("refs/heads/main", c);

    let client = Repo::new();
    let (ctos_w, ctos_r) = pipe();
    let (stoc_w, stoc_r) = pipe();
    let server_thread = std::thread::spawn(move || {
        serve_upload_pack(
            &server.db,
            &server.refs,
            ctos_r,
            stoc_w,
            &UploadPackConfig::default(),
        )
        .unwrap();
    });

    let config = FetchConfig {
        depth: Some(2),
        ..FetchConfig::default()
    };
    let result = fetch(&client.db, &[], stoc_r, ctos_w, &config).unwrap();
    server_thread.join().unwrap();

    // b is the shallow boundary; a never crosses the wire.
    assert_eq!(result.new_shallow, vec![b]);
    assert!(client.db.contains(&c));
    assert!(client.db.contains(&b));
    assert!(!client.db.contains(&a));
}

// ---- Push sessions ----

#[test]
fn fast_forward_push_updates_ref() {
    let server = Repo::new();
    let x = server.commit(b"v1\n", vec![], 100);
    server.set_ref("refs/heads/main", x);

    let client = Repo::new();
    let client_x = client.commit(b"v1\n", vec![], 100);
    assert_eq!(client_x, x);
    let y = client.commit(b"v2\n", vec![x], 200);

    let (ctos_w, ctos_r) = pipe();
    let (stoc_w, stoc_r) = pipe();
    let server_thread = std::thread::spawn(move || {
        let statuses = serve_receive_pack(
            &server.db,
            &server.refs,
            ctos_r,
            stoc_w,
            &ReceivePackConfig::new(sig()),
        )
        .unwrap();
        (server, statuses)
    });

    let result = push(
        &client.db,
        &[PushUpdate {
            name: "refs/heads/main".into(),
            new: Some(y),
            force: false,
        }],
        stoc_r,
        ctos_w,
        &PushConfig::default(),
    )
    .unwrap();
    let (server, statuses) = server_thread.join().unwrap();

    assert!(result.ok, "push failed: {:?}", result.ref_status);
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].1.is_ok());

    // The server ref moved and the objects arrived.
    let main = RefName::new("refs/heads/main").unwrap();
    assert_eq!(server.refs.resolve(&main).unwrap(), Some(y));
    assert!(server.db.contains(&y));
}

#[test]
fn non_fast_forward_push_is_rejected_and_ref_unchanged() {
    let server = Repo::new();
    let x = server.commit(b"v1\n", vec![], 100);
    server.set_ref("refs/heads/main", x);

    // The client's y does not descend from x.
    let client = Repo::new();
    client.commit(b"v1\n", vec![], 100);
    let y = client.commit(b"rewritten\n", vec![], 300);

    let (ctos_w, ctos_r) = pipe();
    let (stoc_w, stoc_r) = pipe();
    let server_thread = std::thread::spawn(move || {
        let statuses = serve_receive_pack(
            &server.db,
            &server.refs,
            ctos_r,
            stoc_w,
            &ReceivePackConfig::new(sig()),
        )
        .unwrap();
        (server, statuses)
    });

    // force bypasses the client-side check, exercising the server's.
    let result = push(
        &client.db,
        &[PushUpdate {
            name: "refs/heads/main".into(),
            new: Some(y),
            force: true,
        }],
        stoc_r,
        ctos_w,
        &PushConfig::default(),
    )
    .unwrap();
    let (server, _statuses) = server_thread.join().unwrap();

    assert!(!result.ok);
    assert_eq!(
        result.ref_status,
        vec![(
            "refs/heads/main".to_string(),
            RefStatus::Rejected("non-fast-forward".into())
        )]
    );
    let main = RefName::new("refs/heads/main").unwrap();
    assert_eq!(server.refs.resolve(&main).unwrap(), Some(x));
}

#[test]
fn push_creates_new_branch() {
    let server = Repo::new();
    let base = server.commit(b"base\n", vec![], 100);
    server.set_ref("refs/heads/main", base);

    let client = Repo::new();
    client.commit(b"base\n", vec![], 100);
    let feature = client.commit(b"feature\n", vec![base], 200);

    let (ctos_w, ctos_r) = pipe();
    let (stoc_w, stoc_r) = pipe();
    let server_thread = std::thread::spawn(move || {
        serve_receive_pack(
            &server.db,
            &server.refs,
            ctos_r,
            stoc_w,
            &ReceivePackConfig::new(sig()),
        )
        .unwrap();
        server
    });

    let result = push(
        &client.db,
        &[PushUpdate {
            name: "refs/heads/feature".into(),
            new: Some(feature),
            force: false,
        }],
        stoc_r,
        ctos_w,
        &PushConfig::default(),
    )
    .unwrap();
    let server = server_thread.join().unwrap();

    assert!(result.ok);
    let name = RefName::new("refs/heads/feature").unwrap();
    assert_eq!(server.refs.resolve(&name).unwrap(), Some(feature));
    // Creation journaled with the zero old value.
    let log = server.refs.reflog(&name).unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].old_oid.is_null());
}

#[test]
fn push_deletes_branch() {
    let server = Repo::new();
    let base = server.commit(b"base\n", vec![], 100);
    server.set_ref("refs/heads/main", base);
    server.set_ref("refs/heads/gone", base);

    let client = Repo::new();
    client.commit(b"base\n", vec![], 100);

    let (ctos_w, ctos_r) = pipe();
    let (stoc_w, stoc_r) = pipe();
    let server_thread = std::thread::spawn(move || {
        serve_receive_pack(
            &server.db,
            &server.refs,
            ctos_r,
            stoc_w,
            &ReceivePackConfig::new(sig()),
        )
        .unwrap();
        server
    });

    let result = push(
        &client.db,
        &[PushUpdate {
            name: "refs/heads/gone".into(),
            new: None,
            force: false,
        }],
        stoc_r,
        ctos_w,
        &PushConfig::default(),
    )
    .unwrap();
    let server = server_thread.join().unwrap();

    assert!(result.ok, "delete failed: {:?}", result.ref_status);
    let name = RefName::new("refs/heads/gone").unwrap();
    assert_eq!(server.refs.read(&name).unwrap(), None);
}

#[test]
fn atomic_push_rejects_whole_batch() {
    let server = Repo::new();
    let x = server.commit(b"v1\n", vec![], 100);
    server.set_ref("refs/heads/main", x);

    let client = Repo::new();
    client.commit(b"v1\n", vec![], 100);
    let good = client.commit(b"good\n", vec![x], 200);
    let bad = client.commit(b"unrelated\n", vec![], 300);

    let (ctos_w, ctos_r) = pipe();
    let (stoc_w, stoc_r) = pipe();
    let server_thread = std::thread::spawn(move || {
        serve_receive_pack(
            &server.db,
            &server.refs,
            ctos_r,
            stoc_w,
            &ReceivePackConfig::new(sig()),
        )
        .unwrap();
        server
    });

    let result = push(
        &client.db,
        &[
            PushUpdate {
                name: "refs/heads/ok".into(),
                new: Some(good),
                force: false,
            },
            PushUpdate {
                // Non-fast-forward against main, poisoning the batch.
                name: "refs/heads/main".into(),
                new: Some(bad),
                force: true,
            },
        ],
        stoc_r,
        ctos_w,
        &PushConfig { atomic: true },
    )
    .unwrap();
    let server = server_thread.join().unwrap();

    assert!(!result.ok);
    // Neither ref changed: the batch failed as a unit.
    assert_eq!(
        server
            .refs
            .read(&RefName::new("refs/heads/ok").unwrap())
            .unwrap(),
        None
    );
    assert_eq!(
        server
            .refs
            .resolve(&RefName::new("refs/heads/main").unwrap())
            .unwrap(),
        Some(x)
    );
}
