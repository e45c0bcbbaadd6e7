//! Architecture-independent page-table management.
//!
//! `PageDirectory` owns the root table of one address space and provides the
//! mapping primitives the fault paths are built on: single-page map/unmap,
//! bulk unmapping, translation, demand allocation of a virtual range, and
//! copying kernel bytes out into mapped user pages.

use crate::address::AddressTranslator;
use crate::arch::{self, PageEntry, PageFlags, PageTable};
use crate::frame_allocator::FrameAllocator;
use crate::{PhysicalAddress, VirtualAddress, VmError};

#[cfg(not(any(test, feature = "software-emulation")))]
use alloc::boxed::Box;

/// Allocates a next-level page table in physical memory, returning its
/// physical address.
///
/// Under emulation, tables come from the emulated RAM arena so that entries
/// can refer to them by physical address; exhaustion of the arena is reported
/// as frame exhaustion.
#[cfg(any(test, feature = "software-emulation"))]
fn alloc_page_table() -> Result<PhysicalAddress, VmError> {
    let translator = AddressTranslator::current();
    let phys = translator
        .allocate(core::mem::size_of::<PageTable>(), arch::PAGE_SIZE)
        .ok_or(VmError::OutOfFrames)?;
    // SAFETY: the block was just reserved for exactly one PageTable and is
    // suitably aligned.
    unsafe { translator.phys_to_ptr::<PageTable>(phys).write(PageTable::new()) };
    Ok(PhysicalAddress::new(phys))
}

/// Allocates a next-level page table from the kernel heap, which is
/// direct-mapped and therefore physically addressable.
#[cfg(not(any(test, feature = "software-emulation")))]
fn alloc_page_table() -> Result<PhysicalAddress, VmError> {
    let table = Box::into_raw(Box::new(PageTable::new()));
    let phys = AddressTranslator::current().virt_to_phys(table as usize);
    Ok(PhysicalAddress::new(phys))
}

/// The page tables of one address space.
///
/// Owns the root table and walks the hierarchy for every operation,
/// allocating intermediate tables on demand.
pub struct PageDirectory {
    root: PageTable,
}

impl PageDirectory {
    /// Creates a page directory with an empty root table.
    pub fn new() -> Self {
        Self {
            root: PageTable::new(),
        }
    }

    /// Returns the leaf entry for `virt`, or `None` if any table on the way
    /// down is missing.
    ///
    /// # Panics
    /// Panics if `virt` is not page-aligned.
    pub fn walk(&mut self, virt: VirtualAddress) -> Option<&mut PageEntry> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );

        let mut table = &mut self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = table.entry_mut(arch::page_index(virt.as_usize(), level));
            if !entry.is_valid() {
                return None;
            }
            let next = entry.address()?;
            let ptr = AddressTranslator::current().phys_to_ptr::<PageTable>(next.as_usize());
            // SAFETY: only alloc_page_table addresses are ever written into
            // non-leaf entries, so the pointer refers to a live table.
            table = unsafe { &mut *ptr };
        }

        Some(table.entry_mut(arch::page_index(virt.as_usize(), 0)))
    }

    /// Returns the leaf entry for `virt`, allocating intermediate tables as
    /// needed.
    fn walk_or_create(&mut self, virt: VirtualAddress) -> Result<&mut PageEntry, VmError> {
        let mut table = &mut self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = table.entry_mut(arch::page_index(virt.as_usize(), level));
            if !entry.is_valid() {
                let next = alloc_page_table()?;
                let mut flags = PageFlags::empty();
                flags.set_valid(true);
                *entry = PageEntry::new(next, flags);
            }
            let next = entry.address().expect("intermediate entry lost its table");
            let ptr = AddressTranslator::current().phys_to_ptr::<PageTable>(next.as_usize());
            // SAFETY: the entry was either just written from alloc_page_table
            // or was written by an earlier walk_or_create.
            table = unsafe { &mut *ptr };
        }

        Ok(table.entry_mut(arch::page_index(virt.as_usize(), 0)))
    }

    /// Maps the page at `virt` to the frame at `phys`.
    ///
    /// The valid bit is set regardless of `flags`.
    ///
    /// # Panics
    /// Panics if either address is unaligned, or if the page is already
    /// mapped: remapping over a live frame would leak it.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );
        assert!(
            phys.is_aligned(arch::PAGE_SIZE),
            "physical address must be page-aligned"
        );

        let entry = self.walk_or_create(virt)?;
        assert!(!entry.is_valid(), "remap of an already-mapped page");
        let mut flags = flags;
        flags.set_valid(true);
        *entry = PageEntry::new(phys, flags);
        Ok(())
    }

    /// Unmaps the page at `virt`, returning the frame it mapped, or `None`
    /// if the page was not mapped.
    ///
    /// # Panics
    /// Panics if `virt` is not page-aligned.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.walk(virt)?;
        let phys = entry.address()?;
        entry.clear();
        Some(phys)
    }

    /// Unmaps `pages` consecutive pages starting at `virt`, skipping holes.
    ///
    /// When `frames` is given, every unmapped frame is returned to it.
    pub fn unmap_range(
        &mut self,
        virt: VirtualAddress,
        pages: usize,
        mut frames: Option<&mut FrameAllocator>,
    ) {
        for i in 0..pages {
            if let Some(phys) = self.unmap(virt + i * arch::PAGE_SIZE) {
                if let Some(allocator) = frames.as_deref_mut() {
                    allocator.free(phys);
                }
            }
        }
    }

    /// Returns the frame mapped at the page `virt`, or `None` if unmapped.
    pub fn translate(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.walk(virt)?.address()
    }

    /// Maps fresh zeroed frames over `[lo, hi)`, growing the range one page
    /// at a time.
    ///
    /// On any failure the pages mapped so far are unmapped and their frames
    /// freed, and the error is returned.
    ///
    /// # Panics
    /// Panics if `lo` is not page-aligned or `lo > hi`.
    pub fn allocate_range(
        &mut self,
        frames: &mut FrameAllocator,
        lo: VirtualAddress,
        hi: VirtualAddress,
        flags: PageFlags,
    ) -> Result<VirtualAddress, VmError> {
        assert!(lo.is_aligned(arch::PAGE_SIZE), "range base must be page-aligned");
        assert!(lo <= hi, "range must not be inverted");

        let mut virt = lo;
        while virt < hi {
            let phys = match frames.allocate() {
                Ok(phys) => phys,
                Err(err) => {
                    self.unmap_range(lo, (virt - lo) / arch::PAGE_SIZE, Some(frames));
                    return Err(err);
                }
            };
            if let Err(err) = self.map(virt, phys, flags) {
                frames.free(phys);
                self.unmap_range(lo, (virt - lo) / arch::PAGE_SIZE, Some(frames));
                return Err(err);
            }
            virt = virt + arch::PAGE_SIZE;
        }
        Ok(hi)
    }

    /// Copies `bytes` into this address space starting at `virt`, writing
    /// through the physical frames page by page.
    ///
    /// Fails with [`VmError::NotMapped`] if any page in the range is not
    /// mapped. Write permission is not required: the copy bypasses the
    /// permission bits, as kernel stores into user memory do.
    pub fn copy_out(&mut self, virt: VirtualAddress, bytes: &[u8]) -> Result<(), VmError> {
        let mut remaining = bytes;
        let mut virt = virt;
        while !remaining.is_empty() {
            let page = virt.page_base();
            let offset = virt - page;
            let chunk = core::cmp::min(arch::PAGE_SIZE - offset, remaining.len());
            let phys = self.translate(page).ok_or(VmError::NotMapped)?;
            AddressTranslator::current().write_frame(phys, offset, &remaining[..chunk]);
            remaining = &remaining[chunk..];
            virt = virt + chunk;
        }
        Ok(())
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * arch::PAGE_SIZE));
        }
    }

    fn rw_flags() -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_readable(true);
        flags.set_writable(true);
        flags
    }

    fn frame_pool(frames: usize) -> FrameAllocator {
        let base = AddressTranslator::current()
            .allocate(frames * arch::PAGE_SIZE, arch::PAGE_SIZE)
            .expect("emulated arena too small");
        FrameAllocator::new(PhysicalAddress::new(base), frames)
    }

    #[test]
    fn map_then_translate() {
        setup();
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(3 * arch::PAGE_SIZE);
        let phys = PhysicalAddress::new(2 * arch::PAGE_SIZE);

        dir.map(virt, phys, rw_flags()).unwrap();
        assert_eq!(dir.translate(virt), Some(phys));
    }

    #[test]
    fn unmap_returns_the_frame() {
        setup();
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(arch::PAGE_SIZE);
        let phys = PhysicalAddress::new(4 * arch::PAGE_SIZE);

        dir.map(virt, phys, rw_flags()).unwrap();
        assert_eq!(dir.unmap(virt), Some(phys));
        assert_eq!(dir.translate(virt), None);
    }

    #[test]
    fn unmap_of_unmapped_page_is_none() {
        setup();
        let mut dir = PageDirectory::new();
        assert_eq!(dir.unmap(VirtualAddress::new(arch::PAGE_SIZE)), None);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remapping_a_mapped_page_panics() {
        setup();
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(arch::PAGE_SIZE);
        dir.map(virt, PhysicalAddress::new(0), rw_flags()).unwrap();
        let _ = dir.map(virt, PhysicalAddress::new(arch::PAGE_SIZE), rw_flags());
    }

    #[test]
    fn allocate_range_maps_zeroed_writable_pages() {
        setup();
        let mut dir = PageDirectory::new();
        let mut frames = frame_pool(4);
        let lo = VirtualAddress::new(0);
        let hi = VirtualAddress::new(3 * arch::PAGE_SIZE);

        assert_eq!(dir.allocate_range(&mut frames, lo, hi, rw_flags()), Ok(hi));
        assert_eq!(frames.free_frames(), 1);
        for page in 0..3 {
            let virt = VirtualAddress::new(page * arch::PAGE_SIZE);
            let phys = dir.translate(virt).expect("page should be mapped");
            let mut buf = alloc::vec![0xAAu8; arch::PAGE_SIZE];
            AddressTranslator::current().read_frame(phys, 0, &mut buf);
            assert!(buf.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn allocate_range_rolls_back_on_exhaustion() {
        setup();
        let mut dir = PageDirectory::new();
        let mut frames = frame_pool(2);
        let lo = VirtualAddress::new(0);
        let hi = VirtualAddress::new(4 * arch::PAGE_SIZE);

        assert_eq!(
            dir.allocate_range(&mut frames, lo, hi, rw_flags()),
            Err(VmError::OutOfFrames)
        );
        // Everything mapped before the failure is unwound and freed.
        assert_eq!(frames.free_frames(), 2);
        for page in 0..4 {
            assert_eq!(dir.translate(VirtualAddress::new(page * arch::PAGE_SIZE)), None);
        }
    }

    #[test]
    fn copy_out_spans_page_boundaries() {
        setup();
        let mut dir = PageDirectory::new();
        let mut frames = frame_pool(2);
        let lo = VirtualAddress::new(0);
        let hi = VirtualAddress::new(2 * arch::PAGE_SIZE);
        dir.allocate_range(&mut frames, lo, hi, rw_flags()).unwrap();

        let data: alloc::vec::Vec<u8> = (0..arch::PAGE_SIZE + 10).map(|i| i as u8).collect();
        let start = VirtualAddress::new(arch::PAGE_SIZE / 2);
        dir.copy_out(start, &data).unwrap();

        let mut buf = alloc::vec![0u8; data.len()];
        let first = dir.translate(lo).unwrap();
        let second = dir.translate(VirtualAddress::new(arch::PAGE_SIZE)).unwrap();
        let translator = AddressTranslator::current();
        translator.read_frame(first, arch::PAGE_SIZE / 2, &mut buf[..arch::PAGE_SIZE / 2]);
        translator.read_frame(second, 0, &mut buf[arch::PAGE_SIZE / 2..]);
        assert_eq!(buf, data);
    }

    #[test]
    fn copy_out_to_unmapped_page_fails() {
        setup();
        let mut dir = PageDirectory::new();
        assert_eq!(
            dir.copy_out(VirtualAddress::new(0), &[1, 2, 3]),
            Err(VmError::NotMapped)
        );
    }
}
