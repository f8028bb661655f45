//! The core table engine.
//!
//! A slot is a `(key, hash, value)` triple whose fields are published in
//! that order. The legal states, and the transitions out of them:
//!
//! ```text
//! (0, _, _)  free         claimed by an insert, or finalized by a resize
//! (k, 0, _)  partial      key claimed, hash not yet published; readers wait
//! (k, h, v)  value        live mapping; a null v is a tombstone
//! (S, _, _)  sized-free   migrated; probes restart on the successor table
//! (k, h, S)  sized-value  migrated; probes restart on the successor table
//! ```
//!
//! Nothing here blocks, but a thread occasionally yields to a peer that
//! announced work and has not yet finished it: waiting for a claimed slot's
//! hash, for a resize winner to publish the new table, for a block cohort
//! to drain, and for promotion of the new table. Each such promise is
//! fulfilled in a bounded number of the peer's own steps.
//!
//! When a tombstone migrates during a resize its key is destroyed, while a
//! reader on the old table may still be comparing against it. The equals
//! capability is required to tolerate that; the reader's verdict does not
//! matter because the slot's value reads as migrated and the reader
//! restarts on the successor.

mod alloc;
mod utils;

use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use self::alloc::{Slot, Table};
use crate::map::Keys;

/// Capacity of a freshly created map.
const INITIAL_LEN: usize = 4;

/// How far an update probes before declaring the table overcrowded.
const REPROBE_LIMIT: usize = 17;

/// Slots zeroed or copied per claimed unit of cooperative resize work.
const BLOCK_SIZE: usize = 8192;

/// Seconds a superseded table is held for stragglers still probing it.
const RETIRE_AFTER_SECS: u64 = 30;

// Process-unique sentinel addresses. The distinct values keep the linker
// from ever merging them. They are compared, never dereferenced.
static SIZED: u64 = 1;
static IGNORE: u64 = 2;
static PROMISE: u64 = 3;

/// The slot-migrated marker.
#[inline]
fn sized() -> *mut () {
    &SIZED as *const u64 as *mut ()
}

/// Returns the word that, passed as `oldval`, makes an update
/// unconditional.
#[inline]
pub fn ignore() -> *mut () {
    &IGNORE as *const u64 as *mut ()
}

/// Occupies the in-progress table pointer while the resize winner
/// allocates.
#[inline]
fn promise() -> *mut Table {
    &PROMISE as *const u64 as *mut Table
}

/// The engine behind [`Map`](crate::Map).
pub struct Map<C: Keys> {
    /// The current table.
    table: AtomicPtr<Table>,

    /// The new table while a resize is in flight, so that any thread can
    /// help.
    ///
    /// Null when no resize is running, or [`promise()`] after a winner has
    /// announced itself but not yet produced the table.
    next: AtomicPtr<Table>,

    /// The number of live mappings. Dips below zero when removals are
    /// counted before the inserts they outran; reads clamp.
    size: AtomicIsize,

    /// Counts modifications, as a heuristic for choosing between doubling
    /// and compacting on resize. Lost updates are fine.
    changes: AtomicUsize,

    /// The caller-supplied key capabilities.
    ops: C,
}

/// The result of probing a single table.
enum Lookup {
    /// The mapped value, or null if there is no mapping.
    Value(*mut ()),

    /// The table is being superseded; retry on its successor.
    Sized,
}

/// The result of a conditional update against a single table.
enum Update {
    /// The value mapped immediately before the update (or the refusal).
    Prior(*mut ()),

    /// The table is being superseded; retry on its successor.
    Sized,

    /// Copy mode only: the migrated mapping was a tombstone and its key is
    /// dead.
    Deleted,
}

impl Slot {
    /// Reads the memoized hash, waiting out the claim handshake: a racing
    /// claimer has published the key but not yet the hash.
    #[inline]
    fn wait_hash(&self) -> u32 {
        let mut hash = self.hash.load(Ordering::Acquire);

        while hash == 0 {
            thread::yield_now();
            hash = self.hash.load(Ordering::Acquire);
        }

        hash
    }
}

#[inline]
fn blocks(len: usize) -> usize {
    1 + (len - 1) / BLOCK_SIZE
}

impl<C: Keys> Map<C> {
    /// Creates a map with the given key capabilities.
    pub fn new(ops: C) -> Map<C> {
        Map {
            table: AtomicPtr::new(Table::alloc_zeroed(INITIAL_LEN)),
            next: AtomicPtr::new(ptr::null_mut()),
            size: AtomicIsize::new(0),
            changes: AtomicUsize::new(0),
            ops,
        }
    }

    /// Returns the number of live mappings.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed).max(0) as usize
    }

    /// Returns the length of the current table.
    pub fn capacity(&self) -> usize {
        // Safety: the current table pointer always refers to a live table.
        unsafe { (*self.table.load(Ordering::Acquire)).len }
    }

    /// Returns the value mapped to `key`, or null.
    ///
    /// # Safety
    ///
    /// `key` must be valid for the capability callbacks.
    pub unsafe fn get(&self, key: *const ()) -> *mut () {
        // Safety: forwarded contract.
        let hash = unsafe { self.hash_of(key) };

        let mut table = self.table.load(Ordering::Acquire);
        loop {
            // Safety: `table` is a published table; the key contract is
            // forwarded.
            match unsafe { self.lookup(table, key, hash) } {
                Lookup::Value(value) => return value,
                Lookup::Sized => {
                    // Safety: `table` was the current table.
                    unsafe { self.help_resize(table) };
                    table = self.table.load(Ordering::Acquire);
                }
            }
        }
    }

    /// Maps `key` to `val` if the current value is `oldval`, returning the
    /// prior value.
    ///
    /// # Safety
    ///
    /// `key` must be valid for the capability callbacks, and ownership of
    /// it transfers to the map.
    pub unsafe fn put_if(&self, key: *mut (), val: *mut (), oldval: *mut ()) -> *mut () {
        debug_assert!(!key.is_null());

        // Safety: forwarded contract.
        let hash = unsafe { self.hash_of(key as *const ()) };

        let mut table = self.table.load(Ordering::Acquire);
        loop {
            // Safety: as in `get`.
            match unsafe { self.update(table, key, hash, val, oldval, false) } {
                Update::Prior(prior) => return prior,
                Update::Sized => {
                    // Safety: `table` was the current table.
                    unsafe { self.help_resize(table) };
                    table = self.table.load(Ordering::Acquire);
                }
                Update::Deleted => unreachable!("copy-mode result outside a copy"),
            }
        }
    }

    /// # Safety
    ///
    /// `key` must be live.
    unsafe fn hash_of(&self, key: *const ()) -> u32 {
        // Zero marks an unpublished hash and may never escape the
        // capability.
        match unsafe { self.ops.hash(key) } {
            0 => 1,
            hash => hash,
        }
    }

    /// Searches `table` for the mapping of `key`.
    unsafe fn lookup(&self, table: *mut Table, key: *const (), hash: u32) -> Lookup {
        let len = unsafe { (*table).len };
        let mut idx = hash as usize & (len - 1);

        for _ in 0..len {
            // Safety: the index is masked to the table length, and a
            // published table has fully initialized slots.
            let slot = unsafe { Table::slot(table, idx) };

            let k = slot.key.load(Ordering::Acquire);

            // Updates publish the key before the value, so a free slot
            // terminates the probe chain.
            if k.is_null() {
                return Lookup::Value(ptr::null_mut());
            }

            if k == sized() {
                return Lookup::Sized;
            }

            // Check the memoized hash before the possibly expensive equals.
            //
            // Safety: the acquire load of the key orders the claimer's
            // writes to the key's pointee before `equals`.
            if slot.wait_hash() == hash && unsafe { self.ops.equals(k, key) } {
                let value = slot.value.load(Ordering::Acquire);

                if value == sized() {
                    return Lookup::Sized;
                }

                return Lookup::Value(value);
            }

            idx = (idx + 1) & (len - 1);
        }

        // A full circle without a match: there is no mapping.
        Lookup::Value(ptr::null_mut())
    }

    /// The conditional-update engine: maps `key` to `val` in `table` if the
    /// current value is `oldval`.
    ///
    /// In copy mode (`copying`) the call migrates a mapping into a fresh
    /// table: reprobing is unbounded, the size and change counters stay
    /// untouched, and a tombstone answers [`Update::Deleted`] instead of
    /// claiming a slot.
    unsafe fn update(
        &self,
        table: *mut Table,
        key: *mut (),
        hash: u32,
        val: *mut (),
        oldval: *mut (),
        copying: bool,
    ) -> Update {
        let len = unsafe { (*table).len };
        let mut idx = hash as usize & (len - 1);

        // Set when an equal key already occupies the slot; the caller's
        // copy is then redundant and destroyed once the update resolves.
        let mut redundant = false;

        // Find the slot holding the key, or claim a free one.
        let mut reprobes = 0;
        let slot = loop {
            // Safety: as in `lookup`.
            let slot = unsafe { Table::slot(table, idx) };
            let mut k = slot.key.load(Ordering::Acquire);

            if k.is_null() {
                // Deleting a mapping that does not exist needs no slot.
                if val.is_null() && (oldval == ignore() || oldval.is_null()) {
                    if copying {
                        // The migrated mapping was a tombstone.
                        return Update::Deleted;
                    }

                    // Confirm the slot is still free before answering.
                    if slot
                        .key
                        .compare_exchange(
                            ptr::null_mut(),
                            ptr::null_mut(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        // Safety: ownership of `key` transferred to us.
                        unsafe { self.ops.destroy(key) };
                        return Update::Prior(ptr::null_mut());
                    }
                }

                // Claim the slot. The release ordering publishes the key's
                // pointee along with the key itself.
                match slot.key.compare_exchange(
                    ptr::null_mut(),
                    key,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // Ours; finish the handshake by publishing the
                        // hash.
                        slot.hash.store(hash, Ordering::Release);
                        break slot;
                    }

                    // Lost to a racing claimer; re-examine the slot.
                    Err(found) => k = found,
                }
            }

            if k == sized() {
                return Update::Sized;
            }

            // Safety: as in `lookup`.
            if slot.wait_hash() == hash && unsafe { self.ops.equals(k, key) } {
                redundant = true;
                break slot;
            }

            reprobes += 1;
            if !copying && reprobes >= REPROBE_LIMIT {
                // The chain is too long; trade this table for a bigger one.
                // A copy instead probes on: the new table is large enough
                // by construction.
                //
                // Safety: `table` was the current table.
                return unsafe { self.resize(table) };
            }

            idx = (idx + 1) & (len - 1);
        };

        // Update the slot's value.
        let mut v = slot.value.load(Ordering::Acquire);

        if v == sized() {
            return Update::Sized;
        }

        if !copying && !v.is_null() {
            // A resize may have left this table behind; answering from it
            // would waste work racing the copy. Right after promotion the
            // new table can briefly equal the current one.
            let next = self.next.load(Ordering::Acquire);
            if !next.is_null() && next != table {
                return Update::Sized;
            }
            if self.table.load(Ordering::Acquire) != table {
                return Update::Sized;
            }
        }

        loop {
            if oldval != ignore() && v != oldval {
                // The condition failed; the mapping is untouched.
                if copying {
                    panic!("migrated mapping changed during copy");
                }

                if redundant {
                    // Ownership transferred on the call boundary, and the
                    // slot keeps its own equal key: the caller's copy dies
                    // here rather than leaking.
                    //
                    // Safety: the copy is ours and was never published.
                    unsafe { self.ops.destroy(key) };
                }

                return Update::Prior(v);
            }

            match slot
                .value
                .compare_exchange(v, val, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if !copying {
                        // Only tombstone-to-live transitions (and back)
                        // move the size.
                        if v.is_null() && !val.is_null() {
                            self.size.fetch_add(1, Ordering::Relaxed);
                        } else if !v.is_null() && val.is_null() {
                            self.size.fetch_sub(1, Ordering::Relaxed);
                        }

                        self.changes.fetch_add(1, Ordering::Relaxed);
                    }

                    if redundant {
                        // Safety: as above.
                        unsafe { self.ops.destroy(key) };
                    }

                    return Update::Prior(v);
                }

                // Lost the race; retry against the value that won.
                Err(found) => {
                    v = found;

                    if v == sized() {
                        return Update::Sized;
                    }
                }
            }
        }
    }

    /// Produces and installs the successor table.
    ///
    /// Called by the update engine when it runs out of reprobes, and by
    /// helpers that find no resize left to help. Always answers `Sized`;
    /// the caller retries on whatever table is current afterwards.
    unsafe fn resize(&self, old: *mut Table) -> Update {
        // Somebody else already produced a new table, or promoted one.
        if !self.next.load(Ordering::Acquire).is_null() {
            return Update::Sized;
        }
        if self.table.load(Ordering::Acquire) != old {
            return Update::Sized;
        }

        // Race to announce the resize.
        if self
            .next
            .compare_exchange(
                ptr::null_mut(),
                promise(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Update::Sized;
        }

        if self.table.load(Ordering::Acquire) != old {
            // Very late: a whole resize completed since we last looked.
            // Withdraw the announcement and let the caller retry.
            if self
                .next
                .compare_exchange(
                    promise(),
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                panic!("failed to withdraw a late resize promise");
            }
            return Update::Sized;
        }

        let len = unsafe { (*old).len };
        let size = self.size();
        let changes = self.changes.load(Ordering::Relaxed);

        // A table that has seen plenty of churn yet holds few live
        // mappings is mostly tombstones: copy it at the same length to
        // shed them. Otherwise double.
        let new = if changes > len / 4 && (size as f64) < 0.3 * len as f64 {
            Table::alloc(len)
        } else if let Some(doubled) = len.checked_mul(2) {
            Table::alloc(doubled)
        } else {
            panic!("table exceeded maximum capacity");
        };

        // Helpers looping in `zero_block` may have pushed these beyond the
        // zero-phase totals; from here they meter the copy out of the old
        // table.
        unsafe {
            (*old).todo.store(0, Ordering::Relaxed);
            (*old).done.store(0, Ordering::Relaxed);
        }

        // Publish the new table so other threads can help.
        self.next.store(new, Ordering::Release);

        // Safety: `new` was just published as in-progress, `old` is still
        // current.
        unsafe {
            while self.zero_block(new) {}
            while self.copy_block(old, new) {}

            // The copy is complete. Hold the old table for readers still
            // parked on its slots.
            self.retire(new, old);
        }

        // Promotion order matters: helpers treat a null `next` as "no
        // resize running", so the current table has to change first.
        if self
            .table
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("lost the race to promote the table we resized");
        }
        if self
            .next
            .compare_exchange(new, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("lost the race to finish the resize we won");
        }

        self.changes.store(0, Ordering::Relaxed);

        Update::Sized
    }

    /// Helps a resize of `old` run to completion.
    ///
    /// Returns once `old` is no longer the current table. If no winner has
    /// materialized, becomes the winner; this compensates for announcers
    /// that withdrew late promises.
    ///
    /// # Safety
    ///
    /// `old` must have been observed as the current table.
    unsafe fn help_resize(&self, old: *mut Table) {
        if self.table.load(Ordering::Acquire) != old {
            return;
        }

        let mut new = self.next.load(Ordering::Acquire);
        while new.is_null() || new == promise() {
            if self.table.load(Ordering::Acquire) != old {
                return;
            }

            if new.is_null() {
                // Safety: `old` was just re-observed as current.
                unsafe { self.resize(old) };
                return;
            }

            // The winner is allocating; give it room.
            thread::yield_now();
            new = self.next.load(Ordering::Acquire);
        }

        // Safety: `new` is the published in-progress table for `old`.
        unsafe {
            while self.table.load(Ordering::Acquire) == old && self.zero_block(new) {}
            while self.table.load(Ordering::Acquire) == old && self.copy_block(old, new) {}
        }

        // Wait for the winner to promote.
        while self.table.load(Ordering::Acquire) == old {
            thread::yield_now();
        }
    }

    /// Claims and zeroes one block of the new table.
    ///
    /// Returns false once the whole table is known to be initialized, at
    /// which point every helper's zero work is also visible.
    unsafe fn zero_block(&self, new: *mut Table) -> bool {
        let len = unsafe { (*new).len };
        let todo = blocks(len);

        let block = unsafe { (*new).todo.fetch_add(1, Ordering::Relaxed) };
        if block >= todo {
            // Out of work; wait for the cohort so that no slot is touched
            // before it is initialized.
            while unsafe { (*new).done.load(Ordering::Acquire) } < todo {
                thread::yield_now();
            }
            return false;
        }

        let start = block * BLOCK_SIZE;
        let n = BLOCK_SIZE.min(len - start);

        // Safety: blocks are claimed uniquely, so this range is ours, and
        // zeroed memory is a valid free slot.
        unsafe { ptr::write_bytes(Table::slots(new).add(start), 0, n) };

        unsafe { (*new).done.fetch_add(1, Ordering::Release) + 1 < todo }
    }

    /// Claims and migrates one block of the old table.
    ///
    /// Returns false once the whole table is known to be copied.
    unsafe fn copy_block(&self, old: *mut Table, new: *mut Table) -> bool {
        let len = unsafe { (*old).len };
        let todo = blocks(len);

        let block = unsafe { (*old).todo.fetch_add(1, Ordering::Relaxed) };
        if block >= todo {
            while unsafe { (*old).done.load(Ordering::Acquire) } < todo {
                thread::yield_now();
            }
            return false;
        }

        let start = block * BLOCK_SIZE;
        let end = start + BLOCK_SIZE.min(len - start);

        for i in start..end {
            // Safety: `i` is in bounds and both tables are live.
            unsafe { self.copy_slot(new, Table::slot(old, i)) };
        }

        unsafe { (*old).done.fetch_add(1, Ordering::Release) + 1 < todo }
    }

    /// Migrates a single slot, leaving it finalized: `(SIZED, _, _)` if it
    /// was never claimed, `(k, h, SIZED)` otherwise.
    unsafe fn copy_slot(&self, new: *mut Table, slot: &Slot) {
        loop {
            let k = slot.key.load(Ordering::Acquire);

            if k.is_null() {
                // Finalize the free slot so probes move on to the
                // successor.
                if slot
                    .key
                    .compare_exchange(
                        ptr::null_mut(),
                        sized(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return;
                }

                // A racing claim beat us to the slot.
                continue;
            }

            // Freeze the value, then move the mapping over.
            let v = slot.value.load(Ordering::Acquire);
            if slot
                .value
                .compare_exchange(v, sized(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // A racing update went through first.
                continue;
            }

            // Safety: the frozen mapping is ours to migrate; `new` is the
            // in-progress table.
            match unsafe { self.update(new, k, slot.wait_hash(), v, ptr::null_mut(), true) } {
                // The mapping was a tombstone: nothing moves, and the key
                // dies with this table. Racing probes may still be
                // comparing against the key, so mark the slot migrated
                // before destroying it.
                Update::Deleted => {
                    if slot
                        .key
                        .compare_exchange(k, sized(), Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        panic!("migrated slot changed keys");
                    }

                    // Safety: the old table owned the key, and its slot no
                    // longer references it.
                    unsafe { self.ops.destroy(k) };
                }

                Update::Prior(_) => {}

                // A copy never reprobes out of the new table, and nothing
                // in it can be marked migrated yet.
                Update::Sized => unreachable!("copy ran into a nested resize"),
            }

            return;
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Chains `old` under `new` for delayed freeing, and frees retirees
    /// that have sat out the full quiescence window.
    ///
    /// # Safety
    ///
    /// Must only be called by the resize winner, after the copy out of
    /// `old` has completed.
    unsafe fn retire(&self, new: *mut Table, old: *mut Table) {
        unsafe {
            (*new).prev.store(old, Ordering::Release);

            // The old table is done with block accounting; `todo` becomes
            // its retirement timestamp.
            (*old).todo.store(Self::now() as usize, Ordering::Relaxed);

            let cutoff = Self::now().saturating_sub(RETIRE_AFTER_SECS);
            if Self::sweep((*new).prev.load(Ordering::Relaxed), cutoff) {
                (*new).prev.store(ptr::null_mut(), Ordering::Relaxed);
            }
        }
    }

    /// Frees the tail of the retirement chain older than `cutoff`, oldest
    /// first. Returns true if `table` itself was freed, meaning the link
    /// pointing at it can be cleared.
    ///
    /// # Safety
    ///
    /// As [`Map::retire`]; only the resize winner walks the chain.
    unsafe fn sweep(table: *mut Table, cutoff: u64) -> bool {
        if table.is_null() {
            return true;
        }

        unsafe {
            if Self::sweep((*table).prev.load(Ordering::Relaxed), cutoff) {
                (*table).prev.store(ptr::null_mut(), Ordering::Relaxed);

                if ((*table).todo.load(Ordering::Relaxed) as u64) < cutoff {
                    // Nobody has been pointed at this table for a full
                    // window; stragglers are assumed gone.
                    Table::dealloc(table);
                    return true;
                }
            }
        }

        false
    }

    /// Frees an entire retirement chain, oldest first.
    ///
    /// # Safety
    ///
    /// Requires exclusive access to the map.
    unsafe fn drain(table: *mut Table) {
        if table.is_null() {
            return;
        }

        unsafe {
            Self::drain((*table).prev.load(Ordering::Relaxed));
            Table::dealloc(table);
        }
    }
}

impl<C: Keys> Drop for Map<C> {
    fn drop(&mut self) {
        // Exclusive access: no resize can be in flight.
        debug_assert!(self.next.get_mut().is_null());

        let table = *self.table.get_mut();

        unsafe {
            // Whatever remains of the retirement chain owns no keys.
            Self::drain((*table).prev.load(Ordering::Relaxed));

            // The current table still owns its keys. Values are borrowed
            // and stay with the caller.
            for i in 0..(*table).len {
                let slot = Table::slot(table, i);
                let k = slot.key.load(Ordering::Relaxed);
                debug_assert!(k != sized());

                if !k.is_null() {
                    self.ops.destroy(k);
                }
            }

            Table::dealloc(table);
        }
    }
}
