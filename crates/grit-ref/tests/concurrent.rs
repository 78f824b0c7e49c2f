//! Concurrency behavior of ref CAS updates.

use std::sync::{Arc, Barrier};

use grit_hash::ObjectId;
use grit_ref::{FilesRefStore, RefName};
use grit_utils::date::{GitDate, Signature};

fn committer() -> Signature {
    Signature::new("T", "t@x", GitDate::new(1_700_000_000, 0))
}

fn oid(b: u8) -> ObjectId {
    let mut bytes = [0u8; 20];
    bytes[0] = b;
    ObjectId::from_bytes(&bytes, grit_hash::HashAlgorithm::Sha1).unwrap()
}

#[test]
fn racing_cas_updates_let_exactly_one_win() {
    let dir = tempfile::tempdir().unwrap();
    let name = RefName::new("refs/heads/main").unwrap();
    let store = FilesRefStore::new(dir.path());
    store
        .add_if_new(&name, oid(0x10), &committer(), "init")
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let dir_path = dir.path().to_path_buf();

    let handles: Vec<_> = [0xaa_u8, 0xbb]
        .into_iter()
        .map(|new_byte| {
            let barrier = Arc::clone(&barrier);
            let dir_path = dir_path.clone();
            std::thread::spawn(move || {
                let store = FilesRefStore::new(&dir_path);
                let name = RefName::new("refs/heads/main").unwrap();
                barrier.wait();
                // Lock contention counts as "did not win".
                match store.set_if_equals(&name, Some(oid(0x10)), oid(new_byte), &committer(), "race")
                {
                    Ok(won) => won,
                    Err(grit_ref::RefError::LockContended(_)) => false,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            })
        })
        .collect();

    let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|&&won| won).count();
    assert_eq!(winners, 1, "exactly one CAS must win");

    // The ref holds one of the two candidate values...
    let final_value = store.resolve(&name).unwrap().unwrap();
    assert!(final_value == oid(0xaa) || final_value == oid(0xbb));

    // ...and the reflog records exactly one transition away from the
    // original value.
    let log = store.reflog(&name).unwrap();
    let transitions: Vec<_> = log.iter().filter(|e| e.old_oid == oid(0x10)).collect();
    assert_eq!(transitions.len(), 1, "exactly one swap away from the base");
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].new_oid, final_value);
}

#[test]
fn sequential_updates_read_back_last_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = FilesRefStore::new(dir.path());
    let name = RefName::new("refs/heads/seq").unwrap();

    store
        .add_if_new(&name, oid(0), &committer(), "init")
        .unwrap();
    for i in 1..20u8 {
        assert!(store
            .set_if_equals(&name, Some(oid(i - 1)), oid(i), &committer(), "step")
            .unwrap());
    }
    assert_eq!(store.resolve(&name).unwrap(), Some(oid(19)));

    let log = store.reflog(&name).unwrap();
    assert_eq!(log.len(), 20);
    assert_eq!(log.last().unwrap().new_oid, oid(19));
}
