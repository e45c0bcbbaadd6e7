//! Sv39 paging for riscv64 kernels.
//!
//! Three levels of 512-entry tables, 4 KiB pages, 39-bit virtual addresses.
//! Entry and flag layouts follow the RISC-V privileged specification.

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

/// Number of bits in a physical address (Sv39 supports up to 56).
pub const MAX_PHYSICAL_BITS: usize = 56;

/// Number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 39;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of page-table levels (levels 2, 1 and 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Returns the page-table index of `address` at the given level.
///
/// - Level 0: bits 12-20 (leaf table)
/// - Level 1: bits 21-29
/// - Level 2: bits 30-38 (root)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range (0-2)");
    (address >> (12 + level * 9)) & 0x1FF
}

/// Invalidates all cached address translations on this hart.
pub fn flush_address_cache() {
    riscv::asm::sfence_vma_all();
}
