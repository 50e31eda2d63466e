use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use super::{DeadLetterArchive, SledArchive};
use crate::broker::{DeadLetterEntry, DeadLetterStore, Message};

fn dead_message(id: &str, destination: &str) -> Message {
    Message {
        id: id.to_string(),
        destination: destination.to_string(),
        payload: b"payload".to_vec(),
        headers: HashMap::from([("tenant".to_string(), "acme".to_string())]),
        priority: 2,
        enqueued_at: Utc.timestamp_opt(1_725_000_000, 0).unwrap(),
        expires_at: None,
        attempts: 3,
        max_attempts: 3,
        replayed: false,
    }
}

fn entry(id: &str, destination: &str) -> DeadLetterEntry {
    DeadLetterEntry::new(
        dead_message(id, destination),
        None,
        "boom",
        Utc.timestamp_opt(1_725_000_100, 0).unwrap(),
    )
}

#[test]
fn store_and_load_entries_in_failure_order() {
    let dir = tempdir().unwrap();
    let archive = SledArchive::open(dir.path().to_str().unwrap()).unwrap();

    let first = entry("m-1", "orders");
    let second = entry("m-2", "orders");
    archive.store(&first).unwrap();
    archive.store(&second).unwrap();

    let loaded = archive.load().unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0], first);
    assert_eq!(loaded[1], second);
    assert_eq!(loaded[0].message.headers["tenant"], "acme");
}

#[test]
fn remove_deletes_and_tolerates_missing_ids() {
    let dir = tempdir().unwrap();
    let archive = SledArchive::open(dir.path().to_str().unwrap()).unwrap();

    let stored = entry("m-1", "orders");
    archive.store(&stored).unwrap();
    archive.remove(&stored.id).unwrap();
    archive.remove("never-stored").unwrap();

    assert!(archive.is_empty());
}

#[test]
fn dead_letter_store_restores_from_archive() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    let first_id = {
        let archive = Arc::new(SledArchive::open(&path).unwrap());
        let store = DeadLetterStore::with_archive(10, archive.clone()).unwrap();
        let id = store.push(entry("m-1", "orders"));
        store.push(entry("m-2", "events"));
        archive.flush().unwrap();
        id
    };

    let archive = Arc::new(SledArchive::open(&path).unwrap());
    let store = DeadLetterStore::with_archive(10, archive.clone()).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.list("orders").len(), 1);

    store.take(&first_id).unwrap();
    assert_eq!(archive.len(), 1);
}

#[test]
fn restore_trims_archive_to_capacity() {
    let dir = tempdir().unwrap();
    let archive = Arc::new(SledArchive::open(dir.path().to_str().unwrap()).unwrap());
    for n in 0..5 {
        archive.store(&entry(&format!("m-{n}"), "orders")).unwrap();
    }

    let store = DeadLetterStore::with_archive(3, archive.clone()).unwrap();
    assert_eq!(store.len(), 3);
    assert_eq!(archive.len(), 3);
    let kept: Vec<String> = store.list("orders").into_iter().map(|e| e.message.id).collect();
    assert_eq!(kept, vec!["m-2", "m-3", "m-4"]);
}
