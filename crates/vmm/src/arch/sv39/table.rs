//! Page-table structure for Sv39.

use crate::address::AddressTranslator;
use crate::PhysicalAddress;

use super::entry::PageEntry;

/// Entries per table: 9-bit indexes give 512 entries.
const ENTRY_COUNT: usize = 512;

/// One Sv39 page table: 512 entries of 8 bytes, exactly one 4 KiB page.
#[repr(C, align(4096))]
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

    /// Returns the physical address of this table, suitable for a parent
    /// entry or the satp register.
    pub fn physical_address(&self) -> PhysicalAddress {
        let virt = self.entries.as_ptr() as usize;
        PhysicalAddress::new(AddressTranslator::current().virt_to_phys(virt))
    }

    /// Makes this table the active root table and fences.
    ///
    /// # Safety
    /// The table must map the kernel's own text, data and stack, or the next
    /// instruction fetch will fault unrecoverably.
    pub unsafe fn activate(&self) {
        let ppn = self.physical_address().as_usize() >> 12;
        unsafe {
            riscv::register::satp::set(riscv::register::satp::Mode::Sv39, 0, ppn);
        }
        super::flush_address_cache();
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
