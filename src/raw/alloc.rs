use std::alloc::{self, Layout};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize};

use super::utils::CachePadded;

/// A slot in the table, a `(key, hash, value)` triple.
///
/// The fields must be written, and read, in key, hash, value order; see the
/// state machine in the [module documentation](super).
pub struct Slot {
    /// The key word. Null means the slot was never claimed.
    pub key: AtomicPtr<()>,

    /// The memoized hash. Zero means the claimer has not published it yet.
    pub hash: AtomicU32,

    /// The value word. Null is the tombstone.
    pub value: AtomicPtr<()>,
}

/// A table: a fixed-capacity slot array behind a header, in a single
/// allocation.
///
/// `todo` and `done` sit on their own cache lines: during a resize every
/// helper hammers `todo` with fetch-adds while others spin on `done`.
#[repr(C)]
pub struct Table {
    /// The next block of cooperative work to claim.
    ///
    /// A table's counters live three lives: they meter the zeroing of the
    /// table while it is new, are reset to meter the copy out of it when it
    /// is superseded, and finally `todo` holds the retirement timestamp in
    /// seconds.
    pub todo: CachePadded<AtomicUsize>,

    /// The number of slots, always a power of two.
    pub len: usize,

    /// Older tables held for stragglers still probing them.
    pub prev: AtomicPtr<Table>,

    /// Blocks of cooperative work fully processed.
    pub done: CachePadded<AtomicUsize>,

    slots: [Slot; 0],
}

impl Table {
    /// Allocates a table whose slots are left uninitialized.
    ///
    /// The slots must be zeroed, block by block, before any of them is
    /// accessed; the resize protocol shares that work among helpers.
    pub fn alloc(len: usize) -> *mut Table {
        // Safety: slots are uninitialized, per the contract above.
        unsafe { Table::alloc_in(len, alloc::alloc) }
    }

    /// Allocates a table with all slots in the free state.
    pub fn alloc_zeroed(len: usize) -> *mut Table {
        // Safety: zeroed memory is a valid free slot (null key, zero hash,
        // null value).
        unsafe { Table::alloc_in(len, alloc::alloc_zeroed) }
    }

    unsafe fn alloc_in(len: usize, allocate: unsafe fn(Layout) -> *mut u8) -> *mut Table {
        assert!(len.is_power_of_two());

        let layout = Table::layout(len);

        // Safety: the layout has non-zero size.
        let ptr = unsafe { allocate(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }

        let table = ptr.cast::<Table>();

        // Write the header. The slot array is left to the caller.
        //
        // Safety: `ptr` is valid for writes of the full layout.
        unsafe {
            table.write(Table {
                todo: CachePadded::new(AtomicUsize::new(0)),
                len,
                prev: AtomicPtr::new(ptr::null_mut()),
                done: CachePadded::new(AtomicUsize::new(0)),
                slots: [],
            });
        }

        table
    }

    /// Returns a pointer to the start of the slot array.
    ///
    /// # Safety
    ///
    /// `table` must point to a live table allocation.
    #[inline]
    pub unsafe fn slots(table: *mut Table) -> *mut Slot {
        unsafe { ptr::addr_of_mut!((*table).slots).cast::<Slot>() }
    }

    /// Returns a reference to slot `i`.
    ///
    /// # Safety
    ///
    /// `table` must point to a live table allocation, `i` must be in
    /// bounds, and the slot must have been initialized.
    #[inline]
    pub unsafe fn slot<'a>(table: *mut Table, i: usize) -> &'a Slot {
        debug_assert!(i < unsafe { (*table).len });
        unsafe { &*Table::slots(table).add(i) }
    }

    /// Frees the allocation. Any keys the slots still reference are the
    /// caller's responsibility.
    ///
    /// # Safety
    ///
    /// `table` must point to a live table allocation no other thread can
    /// reach anymore.
    pub unsafe fn dealloc(table: *mut Table) {
        let layout = Table::layout(unsafe { (*table).len });

        // Safety: allocated in `alloc_in` with the same layout.
        unsafe { alloc::dealloc(table.cast::<u8>(), layout) }
    }

    fn layout(len: usize) -> Layout {
        let size = mem::size_of::<Table>() + len * mem::size_of::<Slot>();
        Layout::from_size_align(size, mem::align_of::<Table>()).unwrap()
    }
}

#[test]
fn layout() {
    unsafe {
        let table = Table::alloc_zeroed(16);
        assert_eq!((*table).len, 16);

        // The slot array starts at the end of the header, correctly aligned.
        let slots = Table::slots(table);
        assert_eq!(slots as usize, table as usize + mem::size_of::<Table>());
        assert_eq!(slots as usize % mem::align_of::<Slot>(), 0);

        // A zeroed slot is a free slot.
        let slot = Table::slot(table, 15);
        assert!(slot.key.load(std::sync::atomic::Ordering::Relaxed).is_null());
        assert_eq!(slot.hash.load(std::sync::atomic::Ordering::Relaxed), 0);

        Table::dealloc(table);
    }
}
