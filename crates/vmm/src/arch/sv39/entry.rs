//! Page-table entry for Sv39.

use crate::PhysicalAddress;

use super::flags::PageFlags;
use super::PAGE_SIZE;

/// A single Sv39 page-table entry.
///
/// - Bits 0-7: flags (V, R, W, X, U, G, A, D)
/// - Bits 8-9: reserved for software
/// - Bits 10-53: physical page number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const FLAGS_MASK: usize = 0xFF;
    const PPN_SHIFT: usize = 10;
    const PPN_MASK: usize = (1 << 44) - 1;

    /// Creates an entry mapping `address` with `flags`.
    ///
    /// The physical address must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_aligned(PAGE_SIZE),
            "physical address must be page-aligned"
        );
        let ppn = (address.as_usize() / PAGE_SIZE) & Self::PPN_MASK;
        Self((ppn << Self::PPN_SHIFT) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    /// Returns the frame address stored in this entry, or `None` if the entry
    /// is not valid.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_valid() {
            let ppn = (self.0 >> Self::PPN_SHIFT) & Self::PPN_MASK;
            Some(PhysicalAddress::new(ppn * PAGE_SIZE))
        } else {
            None
        }
    }

    /// Returns the flags of this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    /// Replaces the flags of this entry, preserving the frame address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & !Self::FLAGS_MASK) | (flags.to_raw() & Self::FLAGS_MASK);
    }

    /// Returns whether this entry is valid.
    pub fn is_valid(self) -> bool {
        self.flags().is_valid()
    }

    /// Returns whether this entry is a leaf (maps a frame rather than
    /// pointing at a next-level table).
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().is_leaf()
    }

    /// Clears this entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self(0)
    }
}
