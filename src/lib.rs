//! A lock-free concurrent hash map.
//!
//! [`Map`] maps opaque key words to opaque value words. It never takes a
//! global lock: readers, writers, and deleters all make progress against
//! each other, and a table that grows full is resized cooperatively by
//! whichever threads run into the resize. Everything a thread does before
//! updating a mapping is guaranteed to happen-before another thread reading
//! the updated mapping.
//!
//! The map is built from a [`Keys`] capability describing how to hash,
//! compare, and release keys — either your own implementation, the bare
//! function pointers of [`FnKeys`], or the boxed-key adapter [`BoxKeys`].
//!
//! # Key ownership
//!
//! The map owns its keys. Every update transfers the key to the map on the
//! call boundary: the map either stores it, or destroys it through the
//! capability when the key turns out to be redundant. Each key the map ever
//! owned is destroyed exactly once. Lookups only borrow their key.
//!
//! One consequence of lock-freedom deserves a warning: when a resize
//! migrates a deleted mapping, its key is destroyed while a reader on the
//! superseded table may still be comparing against it, and an update whose
//! half-built slot was swept up by the copy the same way retries with that
//! key. [`Keys::equals`] must therefore tolerate a stored key that is no
//! longer live, and key memory must stay readable while the map is in use —
//! compare out of an arena, an interner, or any store with that property.
//! The comparison's verdict never matters in that window, because the
//! reader will find the slot migrated and retry on the new table.
//!
//! # Values
//!
//! Values are borrowed words. The map never destroys a value; the null word
//! means "no mapping", and updating a mapping to null deletes it. The
//! sentinel returned by [`ignore()`] is reserved, as is any word equal to
//! it.
//!
//! # Examples
//!
//! ```
//! use nbmap::{BoxKeys, Map};
//!
//! let map = Map::with_keys(BoxKeys::<String>::default());
//!
//! // Values are borrowed; keep them alive yourself.
//! let bye = "bye world".to_string();
//! let soon = "see you soon".to_string();
//!
//! // Every update hands a key over to the map.
//! let key = BoxKeys::alloc("hello world".to_string());
//! let prev = unsafe { map.put(key, &bye as *const String as *mut ()) };
//! assert!(prev.is_null());
//!
//! // Updating an existing mapping returns the previous value.
//! let key = BoxKeys::alloc("hello world".to_string());
//! let prev = unsafe { map.put(key, &soon as *const String as *mut ()) };
//! assert_eq!(prev, &bye as *const String as *mut ());
//! assert_eq!(map.size(), 1);
//!
//! // Lookups borrow their key.
//! let probe = "hello world".to_string();
//! let val = unsafe { map.get(&probe as *const String as *const ()) };
//! assert_eq!(val, &soon as *const String as *mut ());
//!
//! // Conditional updates: delete only if still mapped to `val`.
//! let key = BoxKeys::alloc("hello world".to_string());
//! let prev = unsafe { map.put_if(key, std::ptr::null_mut(), val) };
//! assert_eq!(prev, val);
//! assert_eq!(map.size(), 0);
//! ```

#![warn(unsafe_op_in_unsafe_fn)]

mod map;
mod raw;

pub use map::{BoxKeys, FnKeys, Keys, Map};
pub use raw::ignore;
