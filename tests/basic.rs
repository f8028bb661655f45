use std::sync::atomic::Ordering;

use nbmap::{ignore, BoxKeys, FnKeys, Map};

mod common;
use common::{word, CountKeys};

fn string_map() -> Map<BoxKeys<String>> {
    Map::with_keys(BoxKeys::default())
}

fn key(s: &str) -> *mut () {
    BoxKeys::alloc(s.to_string())
}

#[test]
fn new() {
    drop(string_map());
}

#[test]
fn get_empty() {
    let map = string_map();

    let probe = "missing".to_string();
    assert!(unsafe { map.get(word(&probe)) }.is_null());
    assert_eq!(map.size(), 0);
}

#[test]
fn put_get_update_delete() {
    let map = string_map();
    let (a, b) = (0u8, 0u8);

    let prev = unsafe { map.put_if(key("hello"), word(&a), ignore()) };
    assert!(prev.is_null());
    assert_eq!(map.size(), 1);

    let probe = "hello".to_string();
    assert_eq!(unsafe { map.get(word(&probe)) }, word(&a));

    // Conditional update against the mapped value.
    let prev = unsafe { map.put_if(key("hello"), word(&b), word(&a)) };
    assert_eq!(prev, word(&a));
    assert_eq!(unsafe { map.get(word(&probe)) }, word(&b));

    let prev = unsafe { map.remove(key("hello")) };
    assert_eq!(prev, word(&b));
    assert!(unsafe { map.get(word(&probe)) }.is_null());
    assert_eq!(map.size(), 0);
}

#[test]
fn conditional_miss_leaves_mapping() {
    let map = string_map();
    let (a, b, c) = (0u8, 0u8, 0u8);

    assert!(unsafe { map.put_if(key("k"), word(&a), ignore()) }.is_null());

    // The expected value does not match; the mapping must be untouched.
    let prev = unsafe { map.put_if(key("k"), word(&c), word(&b)) };
    assert_eq!(prev, word(&a));

    let probe = "k".to_string();
    assert_eq!(unsafe { map.get(word(&probe)) }, word(&a));
    assert_eq!(map.size(), 1);
}

#[test]
fn cas_chain() {
    let map = string_map();
    let (a, b, c) = (0u8, 0u8, 0u8);

    assert!(unsafe { map.put_if(key("k"), word(&a), ignore()) }.is_null());
    assert_eq!(unsafe { map.put_if(key("k"), word(&b), word(&a)) }, word(&a));

    // A stale expectation fails and reports the value that beat it.
    assert_eq!(unsafe { map.put_if(key("k"), word(&c), word(&a)) }, word(&b));

    let probe = "k".to_string();
    assert_eq!(unsafe { map.get(word(&probe)) }, word(&b));
}

#[test]
fn reput_returns_prior() {
    let map = string_map();
    let v = 0u8;

    assert!(unsafe { map.put(key("k"), word(&v)) }.is_null());
    assert_eq!(unsafe { map.put(key("k"), word(&v)) }, word(&v));
    assert_eq!(map.size(), 1);
}

#[test]
fn delete_absent_is_noop() {
    let map = string_map();
    let v = 0u8;
    let names = ["foo1", "foo2", "foo3", "foo4"];

    for name in names {
        assert!(unsafe { map.remove(key(name)) }.is_null());
    }
    assert_eq!(map.size(), 0);

    for name in names {
        unsafe { map.put(key(name), word(&v)) };
    }
    assert_eq!(map.size(), 4);

    for name in names {
        assert_eq!(unsafe { map.remove(key(name)) }, word(&v));

        // Deleting a tombstone is a no-op.
        assert!(unsafe { map.remove(key(name)) }.is_null());
    }
    assert_eq!(map.size(), 0);
}

unsafe fn u32_equals(stored: *mut (), key: *const ()) -> bool {
    unsafe { *stored.cast::<u32>() == *key.cast::<u32>() }
}

unsafe fn u32_destroy(key: *mut ()) {
    drop(unsafe { Box::from_raw(key.cast::<u32>()) });
}

unsafe fn zero_hash(_key: *const ()) -> u32 {
    0
}

#[test]
fn zero_hash_is_remapped() {
    let map = Map::with_keys(FnKeys {
        hash: zero_hash,
        equals: u32_equals,
        destroy: u32_destroy,
    });
    let v = 0u8;

    let k = Box::into_raw(Box::new(7u32)).cast::<()>();
    assert!(unsafe { map.put(k, word(&v)) }.is_null());

    let probe = 7u32;
    assert_eq!(unsafe { map.get(word(&probe)) }, word(&v));
    assert_eq!(map.size(), 1);
}

unsafe fn colliding_hash(key: *const ()) -> u32 {
    // Collides modulo every table length up to 256.
    unsafe { *key.cast::<u32>() << 8 }
}

#[test]
fn colliding_inserts_force_resize() {
    let map = Map::with_keys(FnKeys {
        hash: colliding_hash,
        equals: u32_equals,
        destroy: u32_destroy,
    });
    assert_eq!(map.capacity(), 4);

    let values: Vec<u32> = (1..=64).collect();
    for (i, v) in values.iter().enumerate() {
        let k = Box::into_raw(Box::new((i + 1) as u32)).cast::<()>();
        assert!(unsafe { map.put(k, word(v)) }.is_null());
    }

    assert_eq!(map.size(), 64);
    assert!(map.capacity() >= 128);

    for (i, v) in values.iter().enumerate() {
        let probe = (i + 1) as u32;
        assert_eq!(unsafe { map.get(word(&probe)) }, word(v));
    }
}

#[test]
fn tombstone_compaction_keeps_capacity() {
    let (keys, destroyed) = CountKeys::<String>::new();
    let map = Map::with_keys(keys);
    let v = 0u8;

    // Fill the initial table with tombstones and one live mapping.
    for name in ["t1", "t2", "t3"] {
        unsafe { map.put(key(name), word(&v)) };
        unsafe { map.remove(key(name)) };
    }
    unsafe { map.put(key("live"), word(&v)) };
    assert_eq!(map.capacity(), 4);

    // The next insert runs out of reprobes in a table that is mostly
    // tombstones: it must compact at the same length, not double.
    unsafe { map.put(key("next"), word(&v)) };
    assert_eq!(map.capacity(), 4);
    assert_eq!(map.size(), 2);

    // The tombstone keys died with the copy; the delete calls already
    // consumed their redundant copies.
    assert_eq!(destroyed.load(Ordering::Relaxed), 6);

    let probe = "live".to_string();
    assert_eq!(unsafe { map.get(word(&probe)) }, word(&v));
}

#[test]
fn keys_destroyed_exactly_once() {
    let (keys, destroyed) = CountKeys::<String>::new();
    let map = Map::with_keys(keys);
    let v = 0u8;

    let mut handed = 0;
    for i in 0..100 {
        unsafe { map.put(key(&format!("key-{i}")), word(&v)) };
        handed += 1;
    }

    // Redundant puts: the fresh copy dies with the call.
    for i in 0..50 {
        unsafe { map.put(key(&format!("key-{i}")), word(&v)) };
        handed += 1;
    }

    // Deletes leave tombstones that keep owning their original keys.
    for i in 0..25 {
        unsafe { map.remove(key(&format!("key-{i}"))) };
        handed += 1;
    }

    assert_eq!(map.size(), 75);

    drop(map);
    assert_eq!(destroyed.load(Ordering::Relaxed), handed);
}

#[test]
fn failed_conditional_consumes_the_key() {
    let (keys, destroyed) = CountKeys::<String>::new();
    let map = Map::with_keys(keys);
    let (a, b, c) = (0u8, 0u8, 0u8);

    assert!(unsafe { map.put_if(key("k"), word(&a), ignore()) }.is_null());
    assert_eq!(destroyed.load(Ordering::Relaxed), 0);

    // The refused key is destroyed, not leaked and not handed back.
    assert_eq!(unsafe { map.put_if(key("k"), word(&c), word(&b)) }, word(&a));
    assert_eq!(destroyed.load(Ordering::Relaxed), 1);

    drop(map);
    assert_eq!(destroyed.load(Ordering::Relaxed), 2);
}

#[test]
fn debug_reports_size_and_capacity() {
    let map = string_map();
    let v = 0u8;
    unsafe { map.put(key("k"), word(&v)) };

    let rendered = format!("{map:?}");
    assert!(rendered.contains("size: 1"));
    assert!(rendered.contains("capacity: 4"));
}
