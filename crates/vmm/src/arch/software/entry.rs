//! Page-table entry for the software scale model.

use crate::PhysicalAddress;

use super::flags::PageFlags;
use super::PAGE_SIZE;

/// A single page-table entry.
///
/// The layout scales down Sv39: the flags sit in the low 8 bits and the frame
/// number above them.
/// - Bits 0-7: flags
/// - Bits 8+: physical frame number (physical address >> 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const FLAGS_MASK: usize = 0xFF;
    const FRAME_SHIFT: usize = 8;

    /// Creates an entry mapping `address` with `flags`.
    ///
    /// The physical address must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_aligned(PAGE_SIZE),
            "physical address must be page-aligned"
        );
        let frame = address.as_usize() / PAGE_SIZE;
        Self((frame << Self::FRAME_SHIFT) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    /// Returns the frame address stored in this entry, or `None` if the entry
    /// is not valid.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_valid() {
            Some(PhysicalAddress::new((self.0 >> Self::FRAME_SHIFT) * PAGE_SIZE))
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
