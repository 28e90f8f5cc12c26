//! Tag store durability and lifecycle.
use std::fs;

use hostwatch_agent::store::{BlobStore, StoreError, TagStore};
use tracing::Span;

fn prepared(root: &std::path::Path) -> TagStore {
    let store = TagStore::new(root, Span::none());
    store.prepare().expect("prepare");
    store
}

#[test]
fn saved_blob_survives_a_restart() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("state");

    let first = prepared(&root);
    first.save("x", b"hello").unwrap();
    first.clean().unwrap();

    let second = prepared(&root);
    assert_eq!(second.load("x").unwrap(), b"hello");
    second.clean().unwrap();
}

#[test]
fn save_replaces_previous_content() {
    let td = tempfile::tempdir().unwrap();
    let store = prepared(td.path());

    store.save("usage_peer", b"one").unwrap();
    store.save("usage_peer", b"two, longer").unwrap();
    assert_eq!(store.load("usage_peer").unwrap(), b"two, longer");
}

#[test]
fn missing_tag_is_not_found() {
    let td = tempfile::tempdir().unwrap();
    let store = prepared(td.path());
    assert!(matches!(store.load("nope"), Err(StoreError::NotFound(t)) if t == "nope"));
}

#[test]
fn interrupted_save_leaves_previous_blob_intact() {
    let td = tempfile::tempdir().unwrap();
    let store = prepared(td.path());
    store.save("x", b"committed").unwrap();

    let staged = store.stage("x", b"half written").unwrap();
    let temp_path = staged.temp_path().to_path_buf();
    assert!(temp_path.starts_with(store.work_dir().unwrap()));
    assert_eq!(store.load("x").unwrap(), b"committed");

    // crash before the rename
    drop(staged);
    assert!(!temp_path.exists());
    assert_eq!(store.load("x").unwrap(), b"committed");
}

#[test]
fn stray_scratch_files_are_not_visible() {
    let td = tempfile::tempdir().unwrap();
    let store = prepared(td.path());
    store.save("x", b"good").unwrap();

    let work = store.work_dir().unwrap();
    fs::write(work.join("x.partial"), b"garbage").unwrap();
    assert_eq!(store.load("x").unwrap(), b"good");
}

#[test]
fn commit_publishes_staged_blob() {
    let td = tempfile::tempdir().unwrap();
    let store = prepared(td.path());

    let staged = store.stage("x", b"new").unwrap();
    assert!(matches!(store.load("x"), Err(StoreError::NotFound(_))));
    staged.commit().unwrap();
    assert_eq!(store.load("x").unwrap(), b"new");
}

#[test]
fn clean_removes_only_the_working_dir() {
    let td = tempfile::tempdir().unwrap();
    let store = prepared(td.path());
    store.save("x", b"kept").unwrap();
    let work = store.work_dir().unwrap();
    assert!(work.is_dir());

    store.clean().unwrap();
    assert!(!work.exists());
    assert_eq!(fs::read(td.path().join("x")).unwrap(), b"kept");

    assert!(matches!(store.clean(), Err(StoreError::NotReady)));
    assert!(matches!(store.load("x"), Err(StoreError::NotReady)));
}

#[test]
fn each_run_gets_its_own_working_dir() {
    let td = tempfile::tempdir().unwrap();
    let a = prepared(td.path());
    let b = prepared(td.path());
    assert_ne!(a.work_dir(), b.work_dir());
}

#[test]
fn concurrent_saves_of_different_tags() {
    let td = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(prepared(td.path()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                let tag = format!("tag{i}");
                for round in 0..10 {
                    store.save(&tag, format!("{i}:{round}").as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for i in 0..8 {
        assert_eq!(store.load(&format!("tag{i}")).unwrap(), format!("{i}:9").as_bytes());
    }
}
