//! Lock Protocol Tests
//!
//! This test suite covers:
//! - Lock on missing, unlocked and locked records
//! - Release with and without an update, in process and over the wire
//! - Exact ownership checks leaving the record unchanged
//! - Mutual exclusion under concurrent lock attempts
//! - No lost updates under concurrent read-modify-write

use bytes::BytesMut;
use chrono::{TimeZone, Utc};
use latch_core::error::OwnershipViolation;
use latch_store::prelude::*;
use latch_store::{
    LockProcessor, Release, SessionItems, SessionRequest, SessionResponse, SetAndUnlockProcessor,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

fn token(node_id: NodeId, lock_id: i64, millis: i64) -> LockToken {
    LockToken::new(node_id, lock_id, Utc.timestamp_millis_opt(millis).unwrap())
}

fn record_with(pairs: &[(&str, &str)], timeout: i32) -> SessionRecord {
    let mut items = SessionItems::new();
    for (k, v) in pairs {
        items.set(*k, v.as_bytes().to_vec());
    }
    SessionRecord::with_items(items, Some(vec![1, 2, 3]), timeout)
}

fn lock(store: &MemoryStore, key: &str, token: LockToken) -> LockResult {
    store.invoke(key, &LockProcessor::new(token)).unwrap()
}

// ==============================================================================
// Acquire Tests
// ==============================================================================

#[test]
fn test_lock_missing_record() {
    let store = MemoryStore::new();
    let result = lock(&store, "sess-1", token(NodeId::new(), 7, 1_000));

    assert!(!result.acquired);
    assert!(result.record.is_none());
    assert!(result.lock_time.is_none());
    assert!(store.get("sess-1").is_none());
}

#[test]
fn test_lock_then_contend() {
    let store = MemoryStore::new();
    store.put("sess-2", record_with(&[("a", "1")], 10));

    let a = token(NodeId::new(), 1, 1_000);
    let first = lock(&store, "sess-2", a);
    assert!(first.acquired);
    let locked = first.record.unwrap();
    assert_eq!(locked.lock_token(), Some(&a));
    assert_eq!(store.get("sess-2").unwrap(), locked);

    let b = token(NodeId::new(), 2, 2_000);
    let second = lock(&store, "sess-2", b);
    assert!(!second.acquired);
    assert!(second.record.is_none());
    assert_eq!(second.lock_time, Some(a.time));
    assert_eq!(store.get("sess-2").unwrap().lock_token(), Some(&a));
}

// ==============================================================================
// Release Tests
// ==============================================================================

#[test]
fn test_update_and_release() {
    let store = MemoryStore::new();
    store.put("sess-2", record_with(&[("a", "1")], 10));

    let a = token(NodeId::new(), 1, 1_000);
    assert!(lock(&store, "sess-2", a).acquired);

    let mut delta = SessionItems::new();
    delta.set("b", b"2".to_vec());
    let mut update = SessionRecord::with_items(delta, Some(Vec::new()), 20);
    update.set_lock(Some(a));

    store
        .invoke("sess-2", &SetAndUnlockProcessor::update(update))
        .unwrap();

    let stored = store.get("sess-2").unwrap();
    assert!(!stored.is_locked());
    assert_eq!(stored.lock_time(), None);
    assert_eq!(
        stored.items().iter().collect::<Vec<_>>(),
        vec![("a", &b"1"[..]), ("b", &b"2"[..])]
    );
    assert_eq!(stored.static_objects(), Some(&b""[..]));
    assert_eq!(stored.timeout(), 20);
}

// ==============================================================================
// Release Over The Wire
// ==============================================================================

/// Lock through the dispatcher and return the record as the client decodes it
fn lock_remote(dispatcher: &Dispatcher<MemoryStore>, key: &str, token: LockToken) -> SessionRecord {
    let mut buf = BytesMut::new();
    SessionRequest::Lock {
        key: key.to_string(),
        token,
    }
    .encode(&mut buf);

    let mut out = BytesMut::new();
    let handle = dispatcher.process(&buf, &mut out).unwrap();
    SessionResponse::read_lock_result(handle, &out)
        .unwrap()
        .record
        .unwrap()
}

fn release_remote(dispatcher: &Dispatcher<MemoryStore>, key: &str, record: SessionRecord) {
    let mut buf = BytesMut::new();
    SessionRequest::SetAndUnlock {
        key: key.to_string(),
        release: Release::Update(record),
    }
    .encode(&mut buf);

    let mut out = BytesMut::new();
    dispatcher.process(&buf, &mut out).unwrap();
}

fn stored_items(store: &MemoryStore, key: &str) -> Vec<(String, Vec<u8>)> {
    store
        .get(key)
        .unwrap()
        .items()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_vec()))
        .collect()
}

fn pairs(expected: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
    expected
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect()
}

#[test]
fn test_remote_release_single_item() {
    let store = Arc::new(MemoryStore::new());
    store.put("s", record_with(&[("counter", "0")], 10));
    let dispatcher = Dispatcher::new(Arc::clone(&store));

    let mut record = lock_remote(&dispatcher, "s", token(NodeId::new(), 1, 1_000));
    record.items_mut().set("counter", b"1".to_vec());
    assert!(record.items().writes_full());
    release_remote(&dispatcher, "s", record);

    assert_eq!(stored_items(&store, "s"), pairs(&[("counter", "1")]));
    assert!(!store.get("s").unwrap().is_locked());
}

#[test]
fn test_remote_release_full_form_replaces() {
    let store = Arc::new(MemoryStore::new());
    store.put("s", record_with(&[("a", "1"), ("b", "2")], 10));
    let dispatcher = Dispatcher::new(Arc::clone(&store));

    let mut record = lock_remote(&dispatcher, "s", token(NodeId::new(), 1, 1_000));
    record.items_mut().clear();
    record.items_mut().set("c", b"3".to_vec());
    release_remote(&dispatcher, "s", record);

    assert_eq!(stored_items(&store, "s"), pairs(&[("c", "3")]));
}

#[test]
fn test_remote_release_diff_form_merges() {
    let store = Arc::new(MemoryStore::new());
    store.put("s", record_with(&[("a", "1"), ("b", "2"), ("keep", "k")], 10));
    let dispatcher = Dispatcher::new(Arc::clone(&store));

    let mut record = lock_remote(&dispatcher, "s", token(NodeId::new(), 1, 1_000));
    record.items_mut().set("b", b"20".to_vec());
    record.items_mut().set("c", b"3".to_vec());
    record.items_mut().remove("a");
    assert!(!record.items().writes_full());
    release_remote(&dispatcher, "s", record);

    assert_eq!(
        stored_items(&store, "s"),
        pairs(&[("b", "20"), ("keep", "k"), ("c", "3")])
    );
}

#[test]
fn test_release_by_wrong_holder() {
    let store = MemoryStore::new();
    store.put("sess-2", record_with(&[("a", "1")], 10));

    let a = token(NodeId::new(), 1, 1_000);
    lock(&store, "sess-2", a);
    let before = store.get("sess-2").unwrap();

    let b = NodeId::new();
    let err = store
        .invoke("sess-2", &SetAndUnlockProcessor::unlock(b, 2))
        .unwrap_err();
    assert!(err.is_ownership_violation());
    assert!(matches!(
        err.ownership_violation(),
        Some(OwnershipViolation::LockNodeMismatch { .. })
    ));

    let after = store.get("sess-2").unwrap();
    assert_eq!(after, before);
    assert_eq!(after.lock_token(), Some(&a));
}

#[test]
fn test_ownership_check_is_exact() {
    let store = MemoryStore::new();
    store.put("s", record_with(&[("a", "1")], 10));

    let holder = token(NodeId::new(), 5, 1_000);
    lock(&store, "s", holder);

    let attempts = [
        (NodeId::new(), 5),
        (holder.node_id, 4),
        (holder.node_id, 6),
        (NodeId::new(), 6),
    ];

    for (node_id, lock_id) in attempts {
        let mut update = record_with(&[("z", "9")], 99);
        update.set_lock(Some(LockToken::new(node_id, lock_id, holder.time)));

        let unlock = store.invoke("s", &SetAndUnlockProcessor::unlock(node_id, lock_id));
        let with_data = store.invoke("s", &SetAndUnlockProcessor::update(update));

        assert!(unlock.unwrap_err().is_ownership_violation());
        assert!(with_data.unwrap_err().is_ownership_violation());

        let stored = store.get("s").unwrap();
        assert_eq!(stored.lock_token(), Some(&holder));
        assert_eq!(stored.timeout(), 10);
        assert!(stored.items().get("z").is_none());
    }
}

#[test]
fn test_release_unlocked_record() {
    let store = MemoryStore::new();
    store.put("s", record_with(&[], 10));

    let err = store
        .invoke("s", &SetAndUnlockProcessor::unlock(NodeId::new(), 1))
        .unwrap_err();
    assert_eq!(err.ownership_violation(), Some(&OwnershipViolation::NotLocked));
    assert!(!store.get("s").unwrap().is_locked());
}

#[test]
fn test_unlock_only_keeps_contents() {
    let store = MemoryStore::new();
    let original = record_with(&[("a", "1"), ("b", "2")], 15);
    store.put("s", original.clone());

    for lock_id in 1..=3 {
        let t = token(NodeId::new(), lock_id, 1_000 * lock_id);
        assert!(lock(&store, "s", t).acquired);
        store
            .invoke("s", &SetAndUnlockProcessor::unlock(t.node_id, lock_id))
            .unwrap();

        let stored = store.get("s").unwrap();
        assert_eq!(stored, original);
        assert_eq!(stored.static_objects(), Some(&[1u8, 2, 3][..]));
        assert_eq!(stored.timeout(), 15);
    }
}

// ==============================================================================
// Concurrency Tests
// ==============================================================================

#[test]
fn test_mutual_exclusion() {
    const THREADS: usize = 8;
    const ATTEMPTS: i64 = 200;

    let store = Arc::new(MemoryStore::new());
    store.put("shared", SessionRecord::new(20));

    let holders = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let grants = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = Arc::clone(&store);
            let holders = Arc::clone(&holders);
            let overlaps = Arc::clone(&overlaps);
            let grants = Arc::clone(&grants);

            thread::spawn(move || {
                let node_id = NodeId::new();
                for lock_id in 1..=ATTEMPTS {
                    let result = store
                        .invoke("shared", &LockProcessor::new(LockToken::now(node_id, lock_id)))
                        .unwrap();
                    if !result.acquired {
                        continue;
                    }

                    if holders.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    grants.fetch_add(1, Ordering::SeqCst);
                    holders.fetch_sub(1, Ordering::SeqCst);

                    store
                        .invoke("shared", &SetAndUnlockProcessor::unlock(node_id, lock_id))
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(grants.load(Ordering::SeqCst) > 0);
    assert!(!store.get("shared").unwrap().is_locked());
}

#[test]
fn test_no_lost_updates() {
    const THREADS: usize = 6;
    const ROUNDS: usize = 50;

    let store = Arc::new(MemoryStore::new());
    let mut initial = SessionRecord::new(20);
    initial.items_mut().set("n", 0u64.to_le_bytes().to_vec());
    store.put("counter", initial);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let node_id = NodeId::new();
                let mut lock_id = 0;
                let mut done = 0;

                while done < ROUNDS {
                    lock_id += 1;
                    let result = store
                        .invoke("counter", &LockProcessor::new(LockToken::now(node_id, lock_id)))
                        .unwrap();
                    let Some(mut record) = result.record else {
                        thread::yield_now();
                        continue;
                    };

                    let raw = record.items().get("n").unwrap();
                    let n = u64::from_le_bytes(raw.try_into().unwrap());
                    record.items_mut().set("n", (n + 1).to_le_bytes().to_vec());

                    store
                        .invoke("counter", &SetAndUnlockProcessor::update(record))
                        .unwrap();
                    done += 1;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stored = store.get("counter").unwrap();
    let n = u64::from_le_bytes(stored.items().get("n").unwrap().try_into().unwrap());
    assert_eq!(n, (THREADS * ROUNDS) as u64);
    assert!(!stored.is_locked());

    let stats = store.statistics();
    assert_eq!(stats.failures, 0);
}
