//! Swap arena for evicted heap pages.
//!
//! A fixed run of page-sized blocks on a block device, managed by a bitmap:
//! one flag per slot, allocated first-fit. The bitmap lock is never held
//! across device I/O: a slot is claimed under the lock, then written or read
//! without it, so one core's swap write does not stall another core's
//! allocation.

use crate::arch;
use crate::VmError;

use alloc::vec;
use alloc::vec::Vec;

/// Size of one swap block in bytes. Blocks hold exactly one page so that an
/// eviction is a single block write and a retrieval a single block read.
pub const BLOCK_SIZE: usize = arch::PAGE_SIZE;

/// A device that reads and writes fixed-size blocks.
///
/// Stands in for the buffer cache of the surrounding kernel; implementations
/// are expected to block until the transfer completes.
pub trait BlockDevice {
    /// Reads block `index` into `buf`.
    fn read_block(&self, index: usize, buf: &mut [u8]);

    /// Writes `data` to block `index`.
    fn write_block(&self, index: usize, data: &[u8]);
}

/// A slot in the swap arena holding one evicted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// Returns the slot index within the arena.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A fixed-capacity arena of swap slots on a block device.
///
/// Invariant: a slot is marked used exactly while one heap-tracker entry
/// references it.
pub struct SwapStore<D> {
    device: D,
    /// First device block of the arena.
    base_block: usize,
    used: spin::Mutex<Vec<bool>>,
}

impl<D: BlockDevice> SwapStore<D> {
    /// Creates a swap store of `slots` slots starting at `base_block` on
    /// `device`.
    pub fn new(device: D, base_block: usize, slots: usize) -> Self {
        Self {
            device,
            base_block,
            used: spin::Mutex::new(vec![false; slots]),
        }
    }

    /// Claims the first free slot.
    pub fn allocate_slot(&self) -> Result<SwapSlot, VmError> {
        let mut used = self.used.lock();
        match used.iter().position(|&in_use| !in_use) {
            Some(index) => {
                used[index] = true;
                Ok(SwapSlot(index))
            }
            None => Err(VmError::SwapFull),
        }
    }

    /// Returns a slot to the free pool.
    ///
    /// # Panics
    /// Panics if the slot is out of range or already free; both mean the
    /// tracker-to-slot accounting has been corrupted.
    pub fn release_slot(&self, slot: SwapSlot) {
        let mut used = self.used.lock();
        assert!(slot.0 < used.len(), "swap slot out of range");
        assert!(used[slot.0], "release of a free swap slot");
        used[slot.0] = false;
    }

    /// Writes one page of data into a claimed slot.
    ///
    /// # Panics
    /// Panics if `page` is not exactly one block, or the slot is not claimed.
    pub fn write_page(&self, slot: SwapSlot, page: &[u8]) {
        assert_eq!(page.len(), BLOCK_SIZE, "swap writes are whole pages");
        debug_assert!(self.used.lock()[slot.0], "write to an unclaimed swap slot");
        self.device.write_block(self.base_block + slot.0, page);
    }

    /// Reads one page of data from a claimed slot into `buf`.
    ///
    /// # Panics
    /// Panics if `buf` is not exactly one block, or the slot is not claimed.
    pub fn read_page(&self, slot: SwapSlot, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "swap reads are whole pages");
        debug_assert!(self.used.lock()[slot.0], "read from an unclaimed swap slot");
        self.device.read_block(self.base_block + slot.0, buf);
    }

    /// Returns the number of free slots.
    pub fn free_slots(&self) -> usize {
        self.used.lock().iter().filter(|&&in_use| !in_use).count()
    }

    /// Returns the total number of slots in the arena.
    pub fn capacity(&self) -> usize {
        self.used.lock().len()
    }
}

/// An in-memory block device for tests and emulation.
#[cfg(any(test, feature = "software-emulation"))]
pub struct MemoryDisk {
    blocks: spin::Mutex<Vec<Vec<u8>>>,
}

#[cfg(any(test, feature = "software-emulation"))]
impl MemoryDisk {
    /// Creates a disk of `blocks` zeroed blocks.
    pub fn new(blocks: usize) -> Self {
        Self {
            blocks: spin::Mutex::new(vec![vec![0u8; BLOCK_SIZE]; blocks]),
        }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl BlockDevice for MemoryDisk {
    fn read_block(&self, index: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.blocks.lock()[index]);
    }

    fn write_block(&self, index: usize, data: &[u8]) {
        self.blocks.lock()[index].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(slots: usize) -> SwapStore<MemoryDisk> {
        SwapStore::new(MemoryDisk::new(slots), 0, slots)
    }

    #[test]
    fn allocation_is_first_fit() {
        let swap = store(3);
        let a = swap.allocate_slot().unwrap();
        let b = swap.allocate_slot().unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);

        swap.release_slot(a);
        // The lowest free slot is handed out again before higher ones.
        assert_eq!(swap.allocate_slot().unwrap().index(), 0);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let swap = store(2);
        swap.allocate_slot().unwrap();
        swap.allocate_slot().unwrap();
        assert_eq!(swap.allocate_slot(), Err(VmError::SwapFull));
        assert_eq!(swap.free_slots(), 0);
    }

    #[test]
    fn pages_round_trip() {
        let swap = store(2);
        let slot = swap.allocate_slot().unwrap();

        let page: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i * 7) as u8).collect();
        swap.write_page(slot, &page);

        let mut readback = vec![0u8; BLOCK_SIZE];
        swap.read_page(slot, &mut readback);
        assert_eq!(readback, page);
    }

    #[test]
    #[should_panic(expected = "release of a free swap slot")]
    fn double_release_panics() {
        let swap = store(1);
        let slot = swap.allocate_slot().unwrap();
        swap.release_slot(slot);
        swap.release_slot(slot);
    }
}
