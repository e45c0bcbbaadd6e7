//! Per-process address-space state.

use crate::arch;
use crate::cow::GroupId;
use crate::heap::{HeapLimits, HeapTracker};
use crate::page_directory::PageDirectory;
use crate::VirtualAddress;

use alloc::string::String;

/// The memory-management view of one process: its page table, the extent of
/// its binary image, its heap region and tracker, and its fork group.
///
/// All fault handling takes `&mut Process`, so a process's state is only ever
/// mutated by the one core running it.
pub struct Process {
    /// Name of the backing executable image.
    pub name: String,
    pub page_table: PageDirectory,
    /// Bytes of address space covered by the binary image, from address zero.
    pub size: usize,
    /// First address of the heap region.
    pub heap_base: VirtualAddress,
    /// End of the grown heap (exclusive). Equal to `heap_base` until the
    /// first `grow_heap`.
    pub heap_extent: VirtualAddress,
    pub heap: HeapTracker,
    /// Fork group, populated by the first fork involving this process.
    pub cow_group: Option<GroupId>,
}

impl Process {
    /// Creates a process with an empty address space.
    ///
    /// # Panics
    /// Panics if `heap_base` is not page-aligned.
    pub fn new(name: &str, heap_base: VirtualAddress, limits: HeapLimits) -> Self {
        assert!(
            heap_base.is_aligned(arch::PAGE_SIZE),
            "heap base must be page-aligned"
        );
        Self {
            name: String::from(name),
            page_table: PageDirectory::new(),
            size: 0,
            heap_base,
            heap_extent: heap_base,
            heap: HeapTracker::new(limits),
            cow_group: None,
        }
    }

    /// Extends the heap region by `bytes` without allocating anything, in
    /// the manner of `sbrk`. Pages materialize on first touch. Returns the
    /// previous extent.
    pub fn grow_heap(&mut self, bytes: usize) -> VirtualAddress {
        let old = self.heap_extent;
        self.heap_extent = self.heap_extent + bytes;
        old
    }

    /// Returns true if `address` lies inside the grown heap region.
    pub fn heap_region_contains(&self, address: VirtualAddress) -> bool {
        address >= self.heap_base && address < self.heap_extent
    }
}
