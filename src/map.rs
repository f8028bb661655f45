use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;

use crate::raw::{self, ignore};

use ahash::RandomState;

/// Key capabilities for a [`Map`].
///
/// The map stores keys as opaque words and needs to be told how to hash
/// them, compare them, and release them. A capability value is injected at
/// construction and lives as long as the map.
///
/// # Safety
///
/// Implementations must uphold the capability contract:
///
/// - `hash` and `equals` must be consistent: equal keys hash equally, and
///   `equals` must be reflexive for any key handed to the map.
/// - `equals` may be invoked with a `stored` key that a racing resize has
///   already destroyed (see the [crate documentation](crate#key-ownership)).
///   It must return without faulting on such a key; its verdict is
///   discarded.
/// - If the implementation is `Send`/`Sync`, the keys it manages must be
///   sound to destroy and compare from any thread.
pub unsafe trait Keys {
    /// Hashes a key.
    ///
    /// Called once per map operation. A result of zero is remapped by the
    /// map, so the full `u32` range may be used.
    ///
    /// # Safety
    ///
    /// `key` points to a live key.
    unsafe fn hash(&self, key: *const ()) -> u32;

    /// Compares a key stored in the map against a probe key.
    ///
    /// # Safety
    ///
    /// `key` points to a live key. `stored` was stored by the map but may
    /// already have been destroyed; the implementation must tolerate that.
    unsafe fn equals(&self, stored: *mut (), key: *const ()) -> bool;

    /// Releases a key the map no longer uses.
    ///
    /// Called at most once for every key the map ever owned.
    ///
    /// # Safety
    ///
    /// `key` points to a live key owned by the map.
    unsafe fn destroy(&self, key: *mut ());
}

/// Key capabilities as three bare function pointers.
#[derive(Clone, Copy)]
pub struct FnKeys {
    /// Hashes a key.
    pub hash: unsafe fn(*const ()) -> u32,

    /// Compares a stored key against a probe key. The stored key may
    /// already have been destroyed; see [`Keys::equals`].
    pub equals: unsafe fn(*mut (), *const ()) -> bool,

    /// Releases a key.
    pub destroy: unsafe fn(*mut ()),
}

// Safety: forwarded to the function pointers, which carry the contract.
unsafe impl Keys for FnKeys {
    unsafe fn hash(&self, key: *const ()) -> u32 {
        unsafe { (self.hash)(key) }
    }

    unsafe fn equals(&self, stored: *mut (), key: *const ()) -> bool {
        unsafe { (self.equals)(stored, key) }
    }

    unsafe fn destroy(&self, key: *mut ()) {
        unsafe { (self.destroy)(key) }
    }
}

/// Key capabilities for boxed keys of type `K`.
///
/// Keys are `Box<K>` allocations turned into words with [`BoxKeys::alloc`],
/// hashed through the hasher `S` and compared with `Eq`.
///
/// Note that `equals` dereferences the stored key, so workloads where
/// deletions or racing updates meet a resize are exposed to the
/// destroyed-key read described in the
/// [crate documentation](crate#key-ownership). Keep keys alive
/// independently (an arena, an interner) if that window matters.
pub struct BoxKeys<K, S = RandomState> {
    hasher: S,
    _keys: PhantomData<K>,
}

impl<K> BoxKeys<K> {
    /// Boxes a key into a word the map can own.
    pub fn alloc(key: K) -> *mut () {
        Box::into_raw(Box::new(key)).cast()
    }
}

impl<K, S> BoxKeys<K, S> {
    /// Creates the capability with the given hasher.
    pub fn with_hasher(hasher: S) -> BoxKeys<K, S> {
        BoxKeys {
            hasher,
            _keys: PhantomData,
        }
    }
}

impl<K, S: Default> Default for BoxKeys<K, S> {
    fn default() -> BoxKeys<K, S> {
        BoxKeys::with_hasher(S::default())
    }
}

// Safety: hashing and comparison go through `K`'s `Hash`/`Eq`, and a key is
// destroyed by reconstituting the box exactly once.
unsafe impl<K, S> Keys for BoxKeys<K, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    unsafe fn hash(&self, key: *const ()) -> u32 {
        // Safety: the capability contract guarantees a live key.
        let key = unsafe { &*key.cast::<K>() };

        // Fold the high bits in rather than truncating them away.
        let hash = self.hasher.hash_one(key);
        (hash ^ (hash >> 32)) as u32
    }

    unsafe fn equals(&self, stored: *mut (), key: *const ()) -> bool {
        // Safety: `key` is live. `stored` may be dangling under a racing
        // tombstone migration; that is this adapter's documented exposure.
        unsafe { *stored.cast::<K>() == *key.cast::<K>() }
    }

    unsafe fn destroy(&self, key: *mut ()) {
        // Safety: allocated by `BoxKeys::alloc`, owned by the map,
        // destroyed at most once.
        drop(unsafe { Box::from_raw(key.cast::<K>()) });
    }
}

/// A lock-free concurrent hash map from opaque key words to opaque value
/// words.
///
/// Reads and updates never take a lock; a resize is finished cooperatively
/// by whichever threads run into it. Everything a thread does before
/// updating a mapping happens-before another thread reading that mapping.
///
/// The map owns its keys through the [`Keys`] capability; it never owns
/// values. The null word is the absent value, and updating a mapping to
/// null deletes it. See the [crate documentation](crate) for the ownership
/// rules and an example.
pub struct Map<C: Keys> {
    raw: raw::Map<C>,
}

// Safety: all shared state is reached through atomics; the keys the map
// owns are managed solely through `C`, which carries its own thread-safety
// bounds per the `Keys` contract.
unsafe impl<C: Keys + Send> Send for Map<C> {}
unsafe impl<C: Keys + Sync> Sync for Map<C> {}

impl<C: Keys> Map<C> {
    /// Creates an empty map using the given key capabilities.
    pub fn with_keys(keys: C) -> Map<C> {
        Map {
            raw: raw::Map::new(keys),
        }
    }

    /// Returns the number of live mappings.
    ///
    /// The count may lag concurrent updates; it is exact once the map is
    /// quiescent.
    pub fn size(&self) -> usize {
        self.raw.size()
    }

    /// Returns the capacity of the current table.
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Returns the value mapped to `key`, or null if there is no mapping.
    ///
    /// The key is only borrowed; the caller keeps ownership.
    ///
    /// # Safety
    ///
    /// `key` must be valid for the map's [`Keys`] capability.
    pub unsafe fn get(&self, key: *const ()) -> *mut () {
        unsafe { self.raw.get(key) }
    }

    /// Maps `key` to `val` if the current value equals `oldval`, returning
    /// the value mapped immediately before the call resolved.
    ///
    /// Passing [`ignore()`](crate::ignore) as `oldval` makes the update
    /// unconditional; a null `val` deletes the mapping. The update happened
    /// exactly when the returned value equals `oldval`; otherwise the
    /// mapping was left untouched.
    ///
    /// # Safety
    ///
    /// `key` must be valid for the map's [`Keys`] capability. Ownership of
    /// the key transfers to the map on the call, whether or not the update
    /// happens: the map either stores the key or destroys it.
    pub unsafe fn put_if(&self, key: *mut (), val: *mut (), oldval: *mut ()) -> *mut () {
        unsafe { self.raw.put_if(key, val, oldval) }
    }

    /// Unconditionally maps `key` to `val`, returning the prior value.
    ///
    /// # Safety
    ///
    /// As [`Map::put_if`].
    pub unsafe fn put(&self, key: *mut (), val: *mut ()) -> *mut () {
        unsafe { self.raw.put_if(key, val, ignore()) }
    }

    /// Deletes the mapping for `key`, returning the prior value.
    ///
    /// # Safety
    ///
    /// As [`Map::put_if`].
    pub unsafe fn remove(&self, key: *mut ()) -> *mut () {
        unsafe { self.raw.put_if(key, ptr::null_mut(), ignore()) }
    }
}

impl<C: Keys> fmt::Debug for Map<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}
