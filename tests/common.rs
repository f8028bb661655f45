#![allow(dead_code)]

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nbmap::{BoxKeys, Keys};

/// Casts a reference to the opaque word the map traffics in.
pub fn word<T>(r: &T) -> *mut () {
    r as *const T as *mut ()
}

/// Boxed keys that count how many times the map destroys one.
pub struct CountKeys<K> {
    keys: BoxKeys<K>,
    destroyed: Arc<AtomicUsize>,
}

impl<K> CountKeys<K> {
    pub fn new() -> (CountKeys<K>, Arc<AtomicUsize>) {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let keys = CountKeys {
            keys: BoxKeys::default(),
            destroyed: destroyed.clone(),
        };
        (keys, destroyed)
    }
}

// Safety: forwarded to `BoxKeys`; counting does not touch the key.
unsafe impl<K: Hash + Eq> Keys for CountKeys<K> {
    unsafe fn hash(&self, key: *const ()) -> u32 {
        unsafe { self.keys.hash(key) }
    }

    unsafe fn equals(&self, stored: *mut (), key: *const ()) -> bool {
        unsafe { self.keys.equals(stored, key) }
    }

    unsafe fn destroy(&self, key: *mut ()) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        unsafe { self.keys.destroy(key) }
    }
}

/// Keys that point into caller-owned storage which outlives the map.
///
/// A key the map "destroys" stays readable, so `equals` is safe even when
/// a racing resize retires a key while a reader is comparing against it.
/// Destruction only counts.
pub struct ArenaKeys {
    hasher: ahash::RandomState,
    destroyed: Arc<AtomicUsize>,
}

impl ArenaKeys {
    pub fn new() -> (ArenaKeys, Arc<AtomicUsize>) {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let keys = ArenaKeys {
            hasher: ahash::RandomState::new(),
            destroyed: destroyed.clone(),
        };
        (keys, destroyed)
    }
}

// Safety: keys are `u64` cells owned by the test; the map never frees them.
unsafe impl Keys for ArenaKeys {
    unsafe fn hash(&self, key: *const ()) -> u32 {
        let v = unsafe { *key.cast::<u64>() };
        let hash = self.hasher.hash_one(v);
        (hash ^ (hash >> 32)) as u32
    }

    unsafe fn equals(&self, stored: *mut (), key: *const ()) -> bool {
        unsafe { *stored.cast::<u64>() == *key.cast::<u64>() }
    }

    unsafe fn destroy(&self, _key: *mut ()) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}
