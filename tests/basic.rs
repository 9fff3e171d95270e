use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use shmap::{Error, Map};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(1);

/// Five keys whose CRC32 all land on slot 3 of an 8-slot directory.
const COLLIDERS: [&[u8]; 5] = [b"col0", b"col12", b"col19", b"col25", b"col31"];

fn open(path: &Path, map_cap: usize) -> Map {
    Map::create(path, map_cap, 15, 16, 0, WAIT).unwrap()
}

#[test]
fn create_insert_persist_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    {
        let map = Map::create(&path, 16, 15, 16, 20, WAIT).unwrap();
        let mut v = map.get(b"hello", true).unwrap();
        assert_eq!(v.len(), 16);
        v[0] = 0x11;
        map.close().unwrap();
    }

    let map = Map::create(&path, 16, 15, 16, 20, WAIT).unwrap();
    assert_eq!(map.len(), 1);
    let v = map.get(b"hello", false).unwrap();
    assert_eq!(v[0], 0x11);
}

#[test]
fn map_cap_rounds_up() {
    let dir = tempdir().unwrap();
    let map = open(&dir.path().join("t.db"), 3);
    assert_eq!(map.cap(), 8);
}

#[test]
fn repeated_add_returns_the_same_bucket() {
    let dir = tempdir().unwrap();
    let map = open(&dir.path().join("t.db"), 16);

    let first = map.get(b"stable", true).unwrap().as_ptr();
    let second = map.get(b"stable", true).unwrap().as_ptr();
    let third = map.get(b"stable", false).unwrap().as_ptr();
    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(map.len(), 1);
}

#[test]
fn full_map_then_delete_reclaims() {
    let dir = tempdir().unwrap();
    let map = open(&dir.path().join("t.db"), 8);

    for i in 0..8 {
        let key = format!("key-{i}");
        map.get(key.as_bytes(), true).unwrap();
    }
    assert_eq!(map.len(), 8);
    assert!(matches!(map.get(b"ninth", true), Err(Error::DbFull)));

    assert!(map.delete(b"key-3"));
    assert_eq!(map.len(), 7);

    // the freed bucket makes room for exactly one more distinct key
    map.get(b"ninth", true).unwrap();
    assert!(matches!(map.get(b"tenth", true), Err(Error::DbFull)));
    assert_eq!(map.len(), 8);
}

#[test]
fn collision_chain_operations() {
    let dir = tempdir().unwrap();
    let map = open(&dir.path().join("t.db"), 8);

    for key in COLLIDERS {
        let mut v = map.get(key, true).unwrap();
        v[0] = key.len() as u8;
    }
    assert_eq!(map.len(), 5);

    let mut seen = HashSet::new();
    map.for_each(|k, _| {
        seen.insert(k.to_vec());
        true
    });
    assert_eq!(seen.len(), 5);
    for key in COLLIDERS {
        assert!(seen.contains(key));
    }

    // delete from the middle of the chain
    assert!(map.delete(b"col19"));
    assert!(matches!(map.get(b"col19", false), Err(Error::KeyNot)));
    for key in COLLIDERS {
        if key == b"col19" {
            continue;
        }
        let v = map.get(key, false).unwrap();
        assert_eq!(v[0], key.len() as u8);
    }
    assert_eq!(map.len(), 4);
}

#[test]
fn reopen_with_mismatched_geometry_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    Map::create(&path, 16, 15, 16, 0, WAIT)
        .unwrap()
        .close()
        .unwrap();

    // different key area
    assert!(matches!(
        Map::create(&path, 16, 31, 16, 0, WAIT),
        Err(Error::DbSize)
    ));
    // different value area (changes the bucket stride)
    assert!(matches!(
        Map::create(&path, 16, 15, 32, 0, WAIT),
        Err(Error::DbSize)
    ));
    // different capacity
    assert!(matches!(
        Map::create(&path, 32, 15, 16, 0, WAIT),
        Err(Error::DbSize)
    ));

    // matching parameters still open fine afterwards
    let map = Map::create(&path, 16, 15, 16, 0, WAIT).unwrap();
    assert_eq!(map.cap(), 16);
}

#[test]
fn delete_is_idempotent() {
    let dir = tempdir().unwrap();
    let map = open(&dir.path().join("t.db"), 16);

    map.get(b"gone", true).unwrap();
    assert!(map.delete(b"gone"));
    assert!(map.delete(b"gone"));
    assert!(matches!(map.get(b"gone", false), Err(Error::KeyNot)));
    assert!(map.delete(b"never-there"));
    assert_eq!(map.len(), 0);
}

#[test]
fn for_each_stops_on_false() {
    let dir = tempdir().unwrap();
    let map = open(&dir.path().join("t.db"), 16);

    for i in 0..5 {
        map.get(format!("k{i}").as_bytes(), true).unwrap();
    }
    let mut visited = 0;
    map.for_each(|_, _| {
        visited += 1;
        visited < 2
    });
    assert_eq!(visited, 2);
}

#[test]
fn for_each_sees_values_in_place() {
    let dir = tempdir().unwrap();
    let map = open(&dir.path().join("t.db"), 16);

    for i in 0..4u8 {
        let mut v = map.get(format!("k{i}").as_bytes(), true).unwrap();
        v[0] = i + 10;
    }
    let mut sum = 0u32;
    map.for_each(|_, v| {
        sum += u32::from(v[0]);
        true
    });
    assert_eq!(sum, 10 + 11 + 12 + 13);
}

#[test]
fn two_handles_share_one_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    let writer = open(&path, 16);
    let reader = open(&path, 16);

    let mut v = writer.get(b"shared", true).unwrap();
    v.copy_from_slice(&[0xCD; 16]);

    let seen = reader.get(b"shared", false).unwrap();
    assert_eq!(&seen[..], &[0xCD; 16]);
    assert_eq!(reader.len(), 1);

    assert!(reader.delete(b"shared"));
    assert!(matches!(writer.get(b"shared", false), Err(Error::KeyNot)));
    assert_eq!(writer.len(), 0);
}

#[test]
fn values_survive_flush_and_reopen_after_delete_churn() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    {
        let map = open(&path, 8);
        for i in 0..8 {
            let key = format!("key-{i}");
            let mut v = map.get(key.as_bytes(), true).unwrap();
            v[0] = i as u8;
        }
        // churn the free list so reopened state includes recycled buckets
        assert!(map.delete(b"key-2"));
        assert!(map.delete(b"key-5"));
        let mut v = map.get(b"replacement", true).unwrap();
        v[0] = 0x77;
        map.flush().unwrap();
        map.close().unwrap();
    }

    let map = open(&path, 8);
    assert_eq!(map.len(), 7);
    assert_eq!(map.get(b"replacement", false).unwrap()[0], 0x77);
    assert!(matches!(map.get(b"key-2", false), Err(Error::KeyNot)));
    assert_eq!(map.get(b"key-7", false).unwrap()[0], 7);
}
