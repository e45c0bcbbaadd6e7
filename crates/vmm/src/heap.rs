//! Per-process heap-page tracking.
//!
//! Every demand-allocated heap page is tracked from first touch until the
//! process exits: either resident with the tick at which it was loaded, or
//! swapped out with the slot holding its contents. The load tick drives
//! eviction: when residency hits the cap, the page loaded longest ago goes
//! to swap first.

use crate::swap::SwapSlot;
use crate::VirtualAddress;

use alloc::vec::Vec;

/// Most heap pages a process may ever touch.
pub const MAX_HEAP_PAGES: usize = 100;

/// Most heap pages a process may keep resident at once.
pub const MAX_RESIDENT_HEAP: usize = 16;

/// Residency limits for one process's heap.
#[derive(Debug, Clone, Copy)]
pub struct HeapLimits {
    /// Cap on tracked pages, resident or swapped.
    pub max_tracked: usize,
    /// Cap on simultaneously resident pages.
    pub max_resident: usize,
}

impl Default for HeapLimits {
    fn default() -> Self {
        Self {
            max_tracked: MAX_HEAP_PAGES,
            max_resident: MAX_RESIDENT_HEAP,
        }
    }
}

/// Where a tracked heap page currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// In a physical frame, loaded at the given tick.
    Resident { loaded_at: u64 },
    /// Written out to the given swap slot.
    Swapped { slot: SwapSlot },
}

/// One tracked heap page.
#[derive(Debug, Clone, Copy)]
pub struct HeapPage {
    /// Page-aligned virtual address.
    pub page: VirtualAddress,
    pub residency: Residency,
}

/// Tracks every heap page a process has touched.
pub struct HeapTracker {
    pages: Vec<HeapPage>,
    limits: HeapLimits,
    /// Count of `Residency::Resident` entries, kept in step with `pages`.
    resident: usize,
}

impl HeapTracker {
    /// Creates an empty tracker with the given limits.
    pub fn new(limits: HeapLimits) -> Self {
        Self {
            pages: Vec::new(),
            limits,
            resident: 0,
        }
    }

    /// Looks up a tracked page by address.
    pub fn lookup(&self, page: VirtualAddress) -> Option<Residency> {
        self.pages
            .iter()
            .find(|entry| entry.page == page)
            .map(|entry| entry.residency)
    }

    /// Starts tracking a freshly loaded page.
    ///
    /// # Panics
    /// Panics if the page is already tracked; callers classify before
    /// inserting.
    pub fn insert_resident(&mut self, page: VirtualAddress, now: u64) -> Result<(), crate::VmError> {
        assert!(
            self.lookup(page).is_none(),
            "heap page {page} is already tracked"
        );
        if self.pages.len() >= self.limits.max_tracked {
            return Err(crate::VmError::HeapTrackerFull);
        }
        self.pages.push(HeapPage {
            page,
            residency: Residency::Resident { loaded_at: now },
        });
        self.resident += 1;
        Ok(())
    }

    /// Records that a resident page has been written to swap.
    ///
    /// # Panics
    /// Panics if the page is not tracked as resident.
    pub fn mark_swapped(&mut self, page: VirtualAddress, slot: SwapSlot) {
        let entry = self.entry_mut(page);
        assert!(
            matches!(entry.residency, Residency::Resident { .. }),
            "heap page {page} swapped out while not resident"
        );
        entry.residency = Residency::Swapped { slot };
        self.resident -= 1;
    }

    /// Records that a swapped page has been brought back in.
    ///
    /// # Panics
    /// Panics if the page is not tracked as swapped.
    pub fn mark_resident(&mut self, page: VirtualAddress, now: u64) {
        let entry = self.entry_mut(page);
        assert!(
            matches!(entry.residency, Residency::Swapped { .. }),
            "heap page {page} loaded while already resident"
        );
        entry.residency = Residency::Resident { loaded_at: now };
        self.resident += 1;
    }

    /// Returns the number of currently resident pages.
    pub fn resident_pages(&self) -> usize {
        self.resident
    }

    /// Returns true if loading one more page would exceed the residency cap.
    pub fn at_resident_cap(&self) -> bool {
        self.resident >= self.limits.max_resident
    }

    /// Picks the resident page loaded longest ago, or `None` if nothing is
    /// resident. Ties go to the page tracked earliest.
    pub fn select_victim(&self) -> Option<VirtualAddress> {
        let mut victim: Option<(VirtualAddress, u64)> = None;
        for entry in &self.pages {
            if let Residency::Resident { loaded_at } = entry.residency {
                match victim {
                    Some((_, oldest)) if loaded_at >= oldest => {}
                    _ => victim = Some((entry.page, loaded_at)),
                }
            }
        }
        victim.map(|(page, _)| page)
    }

    /// Returns every tracked page.
    pub fn entries(&self) -> &[HeapPage] {
        &self.pages
    }

    /// Drops all tracking state.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.resident = 0;
    }

    /// Returns the number of tracked pages, resident or swapped.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if no page is tracked.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn entry_mut(&mut self, page: VirtualAddress) -> &mut HeapPage {
        self.pages
            .iter_mut()
            .find(|entry| entry.page == page)
            .unwrap_or_else(|| panic!("heap page {page} is not tracked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;

    fn page(n: usize) -> VirtualAddress {
        VirtualAddress::new(n * arch::PAGE_SIZE)
    }

    fn limits(tracked: usize, resident: usize) -> HeapLimits {
        HeapLimits {
            max_tracked: tracked,
            max_resident: resident,
        }
    }

    #[test]
    fn victim_is_oldest_load() {
        let mut heap = HeapTracker::new(limits(8, 8));
        heap.insert_resident(page(1), 10).unwrap();
        heap.insert_resident(page(2), 5).unwrap();
        heap.insert_resident(page(3), 20).unwrap();
        assert_eq!(heap.select_victim(), Some(page(2)));
    }

    #[test]
    fn victim_ties_break_by_tracking_order() {
        let mut heap = HeapTracker::new(limits(8, 8));
        heap.insert_resident(page(4), 7).unwrap();
        heap.insert_resident(page(1), 7).unwrap();
        assert_eq!(heap.select_victim(), Some(page(4)));
    }

    #[test]
    fn swapped_pages_are_not_victims() {
        let mut heap = HeapTracker::new(limits(8, 8));
        heap.insert_resident(page(1), 1).unwrap();
        heap.insert_resident(page(2), 2).unwrap();
        heap.mark_swapped(page(1), dummy_slot());
        assert_eq!(heap.select_victim(), Some(page(2)));

        heap.mark_swapped(page(2), dummy_slot());
        assert_eq!(heap.select_victim(), None);
    }

    #[test]
    fn residency_counts_follow_transitions() {
        let mut heap = HeapTracker::new(limits(8, 2));
        heap.insert_resident(page(1), 1).unwrap();
        heap.insert_resident(page(2), 2).unwrap();
        assert_eq!(heap.resident_pages(), 2);
        assert!(heap.at_resident_cap());

        heap.mark_swapped(page(1), dummy_slot());
        assert_eq!(heap.resident_pages(), 1);
        assert!(!heap.at_resident_cap());
        assert_eq!(heap.len(), 2);

        heap.mark_resident(page(1), 3);
        assert_eq!(heap.resident_pages(), 2);
    }

    #[test]
    fn tracker_capacity_is_enforced() {
        let mut heap = HeapTracker::new(limits(2, 8));
        heap.insert_resident(page(1), 1).unwrap();
        heap.insert_resident(page(2), 2).unwrap();
        assert_eq!(
            heap.insert_resident(page(3), 3),
            Err(crate::VmError::HeapTrackerFull)
        );
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn double_insert_panics() {
        let mut heap = HeapTracker::new(limits(8, 8));
        heap.insert_resident(page(1), 1).unwrap();
        heap.insert_resident(page(1), 2).unwrap();
    }

    fn dummy_slot() -> SwapSlot {
        use crate::swap::{MemoryDisk, SwapStore};
        let store = SwapStore::new(MemoryDisk::new(1), 0, 1);
        store.allocate_slot().unwrap()
    }
}
