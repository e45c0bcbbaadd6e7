//! Software scale model of Sv39 paging, for tests and development.
//!
//! This architecture runs on any host and keeps the shape of Sv39 while
//! shrinking every field:
//! - 15-bit addresses (vs. 39-bit)
//! - 3 levels of page tables, like Sv39
//! - 3-bit indexes (8 entries per table, vs. 9-bit/512 entries)
//! - 6-bit page offset (64-byte pages, vs. 12-bit/4 KiB pages)
//!
//! Page-table behavior stays realistic (multi-level walks, leaf permission
//! bits, on-demand intermediate tables) while a whole address space fits in
//! a few kilobytes of emulated RAM.

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};

/// Number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 15;

/// Number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 15;

/// Page size in bytes (64 bytes = 2^6).
pub const PAGE_SIZE: usize = 64;

/// Number of page-table levels (levels 2, 1 and 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Returns the page-table index of `address` at the given level.
///
/// - Level 0: bits 6-8 (leaf table)
/// - Level 1: bits 9-11
/// - Level 2: bits 12-14 (root)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range (0-2)");
    (address >> (6 + level * 3)) & 0x7
}

/// Invalidates cached address translations.
///
/// The software model translates on every access, so there is nothing to
/// invalidate; this marks the points where hardware would need a fence.
pub fn flush_address_cache() {}

/// Emulated physical memory for the software architecture.
///
/// Stands in for RAM so that page tables and frame contents live in a real
/// buffer: "physical" addresses are offsets into it. Blocks are handed out by
/// a bump allocator and never returned; callers that need reuse (the frame
/// allocator) run their own free lists on top of a reserved region.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
    /// Next free offset for the bump allocator.
    next: AtomicUsize,
}

impl EmulatedMemory {
    /// Creates an emulated memory region of `size` bytes, zeroed.
    ///
    /// The buffer itself is page-aligned on the host: page tables are
    /// referenced in place inside it, so `PageTable`'s alignment must hold
    /// for host pointers as well as for emulated physical addresses.
    ///
    /// # Panics
    /// Panics if `size` is zero or overflows a layout.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "emulated memory must not be empty");
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .expect("emulated memory size overflows a layout");
        // SAFETY: the layout has non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));
        Self {
            base,
            layout,
            next: AtomicUsize::new(0),
        }
    }

    /// Reserves a block, returning its physical address, or `None` when the
    /// region is exhausted.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned + size;
            if end > self.size() {
                return None;
            }
            if self
                .next
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    /// Panics if the address is outside the emulated region.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of emulated range");
        // SAFETY: the buffer outlives the translator and the offset is in
        // bounds; aliasing is the caller's concern, as with real RAM.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a pointer into the buffer back to a physical address.
    ///
    /// # Panics
    /// Panics if the pointer is not within the emulated region.
    pub fn offset_of(&self, ptr: *const u8) -> usize {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= base && addr - base < self.size(),
            "pointer not within emulated memory"
        );
        addr - base
    }

    /// Returns the size of the emulated region in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: base was allocated with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_split_the_address() {
        // 0b110_101_100_110100 = L2 index 6, L1 index 5, L0 index 4, offset 52.
        let addr = 0b110_101_100_110100;
        assert_eq!(page_index(addr, 0), 4);
        assert_eq!(page_index(addr, 1), 5);
        assert_eq!(page_index(addr, 2), 6);
    }

    #[test]
    fn bump_allocator_respects_alignment() {
        let mem = EmulatedMemory::new(4 * PAGE_SIZE);
        let a = mem.allocate(10, 1).unwrap();
        let b = mem.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert!(a < b);
        assert_eq!(b % PAGE_SIZE, 0);
    }

    #[test]
    fn buffer_carries_page_alignment() {
        let mem = EmulatedMemory::new(4 * PAGE_SIZE);
        assert_eq!(mem.translate(0) as usize % PAGE_SIZE, 0);

        // Page-aligned blocks must be page-aligned as host pointers too;
        // page tables are referenced in place inside the buffer.
        let table = mem.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(mem.translate(table) as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mem = EmulatedMemory::new(PAGE_SIZE);
        assert!(mem.allocate(PAGE_SIZE, PAGE_SIZE).is_some());
        assert!(mem.allocate(1, 1).is_none());
    }
}
