//! Page-fault dispatch.
//!
//! Every user page fault lands here and is classified by where the faulting
//! address falls: a tracked heap page (resident or swapped), an untouched
//! page of the grown heap, or the binary image below the heap. Each class has
//! one resolution path, and every path ends with an address-cache flush
//! before the process resumes.

use crate::address::AddressTranslator;
use crate::arch::{self, PageFlags};
use crate::clock::Clock;
use crate::cow::{self, CowRegistry};
use crate::frame_allocator::FrameAllocator;
use crate::heap::Residency;
use crate::image::ImageStore;
use crate::loader;
use crate::process::Process;
use crate::swap::{BlockDevice, SwapSlot, SwapStore, BLOCK_SIZE};
use crate::{VirtualAddress, VmError};

use alloc::vec;

/// How a page fault was classified and resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The page is a resident heap page; faulting on it is a permission
    /// violation, never a reason to map anything.
    HeapResident,
    /// A tracked heap page brought back from swap.
    HeapSwapped,
    /// A first touch of a page inside the grown heap region.
    HeapNew,
    /// A page of the binary image, loaded from the executable.
    BinaryBacked,
}

/// The machine-wide memory manager: the frame pool, swap arena, fork-group
/// registry and tick clock shared by every process.
///
/// Methods take `&self` plus `&mut Process`; the shared structures carry
/// their own locks, and the process argument serializes everything
/// per-process.
pub struct MemoryManager<D, I> {
    frames: spin::Mutex<FrameAllocator>,
    swap: SwapStore<D>,
    cow: CowRegistry,
    clock: Clock,
    images: I,
}

impl<D: BlockDevice, I: ImageStore> MemoryManager<D, I> {
    /// Creates a manager over the given frame pool, swap store and image
    /// store.
    pub fn new(frames: FrameAllocator, swap: SwapStore<D>, images: I) -> Self {
        Self {
            frames: spin::Mutex::new(frames),
            swap,
            cow: CowRegistry::new(),
            clock: Clock::new(),
            images,
        }
    }

    /// Returns the tick clock driving heap-page timestamps.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Returns the fork-group registry.
    pub fn cow_groups(&self) -> &CowRegistry {
        &self.cow
    }

    /// Returns the swap store.
    pub fn swap_store(&self) -> &SwapStore<D> {
        &self.swap
    }

    /// Returns the number of free physical frames.
    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    /// Classifies and resolves a page fault at `fault_address`.
    ///
    /// Copy-on-write faults never reach this path: the trap handler routes
    /// write faults on present pages to [`MemoryManager::handle_cow_fault`]
    /// first.
    pub fn handle_page_fault(
        &self,
        proc: &mut Process,
        fault_address: VirtualAddress,
    ) -> Result<FaultKind, VmError> {
        let page = fault_address.page_base();
        let result = match self.classify(proc, page) {
            Some(FaultKind::HeapResident) => Err(VmError::ProtectionFault),
            Some(FaultKind::HeapSwapped) => {
                let Some(Residency::Swapped { slot }) = proc.heap.lookup(page) else {
                    unreachable!("classified as swapped without a swap slot");
                };
                self.retrieve_heap_page(proc, page, slot)
                    .map(|()| FaultKind::HeapSwapped)
            }
            Some(FaultKind::HeapNew) => {
                self.map_new_heap_page(proc, page).map(|()| FaultKind::HeapNew)
            }
            Some(FaultKind::BinaryBacked) => {
                let mut frames = self.frames.lock();
                loader::load_binary_page(&self.images, &mut frames, proc, page)
                    .map(|()| FaultKind::BinaryBacked)
            }
            None => Err(VmError::UnresolvedFault),
        };
        arch::flush_address_cache();
        if let Ok(kind) = result {
            log::trace!("{}: fault at {fault_address} resolved as {kind:?}", proc.name);
        }
        result
    }

    fn classify(&self, proc: &Process, page: VirtualAddress) -> Option<FaultKind> {
        if let Some(residency) = proc.heap.lookup(page) {
            return Some(match residency {
                Residency::Resident { .. } => FaultKind::HeapResident,
                Residency::Swapped { .. } => FaultKind::HeapSwapped,
            });
        }
        if proc.heap_region_contains(page) {
            return Some(FaultKind::HeapNew);
        }
        if page < proc.heap_base {
            return Some(FaultKind::BinaryBacked);
        }
        None
    }

    /// Makes room for one incoming heap page, evicting if the process sits
    /// at its residency cap.
    fn ensure_heap_capacity(&self, proc: &mut Process) -> Result<(), VmError> {
        if proc.heap.at_resident_cap() {
            self.evict_one_heap_page(proc)?;
        }
        Ok(())
    }

    /// Writes the process's oldest-loaded heap page out to swap and unmaps
    /// it.
    ///
    /// # Panics
    /// Panics if the process has no resident heap page, or the victim is not
    /// mapped; both would mean the tracker and page table have diverged.
    pub fn evict_one_heap_page(&self, proc: &mut Process) -> Result<(), VmError> {
        let victim = proc
            .heap
            .select_victim()
            .unwrap_or_else(|| panic!("{}: eviction with no resident heap pages", proc.name));
        let slot = self.swap.allocate_slot()?;

        let frame = proc
            .page_table
            .translate(victim)
            .unwrap_or_else(|| panic!("resident heap page {victim} is not mapped"));
        let mut buf = vec![0u8; BLOCK_SIZE];
        AddressTranslator::current().read_frame(frame, 0, &mut buf);
        self.swap.write_page(slot, &buf);

        proc.page_table
            .unmap_range(victim, 1, Some(&mut self.frames.lock()));
        proc.heap.mark_swapped(victim, slot);
        log::debug!(
            "{}: evicted heap page {victim} to swap slot {}",
            proc.name,
            slot.index()
        );
        Ok(())
    }

    /// Brings a swapped heap page back into a fresh frame and releases its
    /// swap slot.
    fn retrieve_heap_page(
        &self,
        proc: &mut Process,
        page: VirtualAddress,
        slot: SwapSlot,
    ) -> Result<(), VmError> {
        self.ensure_heap_capacity(proc)?;

        let mut buf = vec![0u8; BLOCK_SIZE];
        self.swap.read_page(slot, &mut buf);

        {
            let mut frames = self.frames.lock();
            proc.page_table
                .allocate_range(&mut frames, page, page + arch::PAGE_SIZE, heap_flags())?;
        }
        proc.page_table.copy_out(page, &buf)?;
        proc.heap.mark_resident(page, self.clock.now());
        self.swap.release_slot(slot);
        log::debug!(
            "{}: retrieved heap page {page} from swap slot {}",
            proc.name,
            slot.index()
        );
        Ok(())
    }

    /// Maps a zeroed frame for a first-touch heap page and starts tracking
    /// it.
    fn map_new_heap_page(&self, proc: &mut Process, page: VirtualAddress) -> Result<(), VmError> {
        self.ensure_heap_capacity(proc)?;

        let mut frames = self.frames.lock();
        proc.page_table
            .allocate_range(&mut frames, page, page + arch::PAGE_SIZE, heap_flags())?;
        if let Err(error) = proc.heap.insert_resident(page, self.clock.now()) {
            proc.page_table.unmap_range(page, 1, Some(&mut frames));
            return Err(error);
        }
        Ok(())
    }

    /// Maps the parent's binary image into the child copy-on-write.
    ///
    /// Both processes end up in the same fork group with every shared frame
    /// recorded and mapped read-only on both sides. The child's heap starts
    /// empty: heap pages are private and materialize in the child on first
    /// touch.
    pub fn fork_address_space(
        &self,
        parent: &mut Process,
        child: &mut Process,
    ) -> Result<(), VmError> {
        let group = match parent.cow_group {
            Some(id) => id,
            None => {
                let id = self.cow.create_group()?;
                parent.cow_group = Some(id);
                id
            }
        };
        self.cow.join_group(Some(group));

        let shared = cow::share_address_space(
            &self.cow,
            Some(group),
            &mut parent.page_table,
            &mut child.page_table,
            parent.size,
        );
        if let Err(error) = shared {
            // Only the child leaves. The parent keeps its membership: pages
            // downgraded before the failure are registered with the group,
            // and sole-owner reclamation must still fire when the parent
            // writes to them.
            self.cow.leave_group(Some(group));
            return Err(error);
        }

        child.cow_group = Some(group);
        child.size = parent.size;
        child.heap_base = parent.heap_base;
        child.heap_extent = parent.heap_extent;
        arch::flush_address_cache();
        log::debug!(
            "{}: forked into {} (group of {})",
            parent.name,
            child.name,
            self.cow.process_count(group)
        );
        Ok(())
    }

    /// Resolves a write fault on a shared page by copying it.
    pub fn handle_cow_fault(
        &self,
        proc: &mut Process,
        fault_address: VirtualAddress,
    ) -> Result<(), VmError> {
        let result = cow::resolve_cow_fault(&self.cow, &self.frames, proc, fault_address);
        arch::flush_address_cache();
        result
    }

    /// Tears down a process's address space at exit: releases its swap
    /// slots, unmaps its binary and heap regions, and leaves its fork group.
    ///
    /// Shared frames are freed only when this process was their sole
    /// remaining owner.
    pub fn release_address_space(&self, proc: &mut Process) {
        for entry in proc.heap.entries() {
            if let Residency::Swapped { slot } = entry.residency {
                self.swap.release_slot(slot);
            }
        }
        proc.heap.clear();

        let binary_pages = proc.size / arch::PAGE_SIZE;
        for index in 0..binary_pages {
            self.release_mapped_page(proc, VirtualAddress::new(index * arch::PAGE_SIZE));
        }
        let heap_pages = (proc.heap_extent - proc.heap_base) / arch::PAGE_SIZE;
        for index in 0..heap_pages {
            self.release_mapped_page(proc, proc.heap_base + index * arch::PAGE_SIZE);
        }

        self.cow.leave_group(proc.cow_group);
        proc.cow_group = None;
        proc.size = 0;
        proc.heap_extent = proc.heap_base;
        arch::flush_address_cache();
        log::debug!("{}: released address space", proc.name);
    }

    /// Unmaps one page, freeing its frame unless another fork-group member
    /// still maps it.
    fn release_mapped_page(&self, proc: &mut Process, page: VirtualAddress) {
        let group = proc.cow_group;
        let Some(frame) = proc.page_table.unmap(page) else {
            return;
        };
        let free = if self.cow.is_shared(group, frame) {
            self.cow.release_frame_if_sole_owner(group, frame)
        } else {
            true
        };
        if free {
            self.frames.lock().free(frame);
        }
    }
}

/// Heap pages are always private, writable user data.
fn heap_flags() -> PageFlags {
    let mut flags = PageFlags::empty();
    flags.set_readable(true);
    flags.set_writable(true);
    flags.set_user(true);
    flags
}
