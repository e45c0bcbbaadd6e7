//! Page-table structure for the software scale model.

use super::entry::PageEntry;

/// Entries per table: 3-bit indexes give 8 entries.
const ENTRY_COUNT: usize = 8;

/// One page table of the software scale model.
///
/// With 8 entries of 8 bytes each, a table is exactly one 64-byte page, just
/// as an Sv39 table is exactly one 4 KiB page. Tables below the root are
/// placed in emulated physical memory so that entries can refer to them by
/// physical address.
#[repr(C, align(64))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Creates an empty page table (no entry valid).
    pub fn new() -> Self {
        Self {
            entries: [PageEntry::default(); ENTRY_COUNT],
        }
    }

    /// Returns the entry at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page-table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page-table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns the number of entries in a table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    /// Returns true if no entry in this table is valid.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| !entry.is_valid())
    }

    /// Makes this table the active root table.
    ///
    /// # Safety
    /// Activating a table that does not map the kernel would be fatal on real
    /// hardware; the software model has no hardware register to load, so this
    /// is a no-op kept for interface parity with Sv39.
    pub unsafe fn activate(&self) {}
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
