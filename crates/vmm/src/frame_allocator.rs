//! Physical frame allocation.
//!
//! A free-list allocator over a fixed physical region: frames freed by
//! unmapping are reused before the high-water mark advances. Every allocated
//! frame is handed out zeroed, so demand-allocated pages never leak stale
//! content between processes.

use crate::address::AddressTranslator;
use crate::arch;
use crate::{PhysicalAddress, VmError};

use alloc::vec::Vec;

/// Allocates single frames from a fixed physical region.
pub struct FrameAllocator {
    /// Next never-allocated frame.
    next: PhysicalAddress,
    /// End of the managed region (exclusive).
    end: PhysicalAddress,
    /// Frames returned by `free`, reused first.
    free_list: Vec<PhysicalAddress>,
    total: usize,
}

impl FrameAllocator {
    /// Creates an allocator managing `frames` frames starting at `base`.
    ///
    /// # Panics
    /// Panics if `base` is not page-aligned.
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        assert!(
            base.is_aligned(arch::PAGE_SIZE),
            "frame region must be page-aligned"
        );
        Self {
            next: base,
            end: base + frames * arch::PAGE_SIZE,
            free_list: Vec::new(),
            total: frames,
        }
    }

    /// Allocates one zeroed frame.
    pub fn allocate(&mut self) -> Result<PhysicalAddress, VmError> {
        let frame = match self.free_list.pop() {
            Some(frame) => frame,
            None if self.next < self.end => {
                let frame = self.next;
                self.next = self.next + arch::PAGE_SIZE;
                frame
            }
            None => return Err(VmError::OutOfFrames),
        };
        AddressTranslator::current().zero_page(frame);
        Ok(frame)
    }

    /// Returns a frame to the allocator.
    ///
    /// # Panics
    /// Panics if the frame is unaligned or outside the managed region.
    pub fn free(&mut self, frame: PhysicalAddress) {
        assert!(
            frame.is_aligned(arch::PAGE_SIZE),
            "freed frame must be page-aligned"
        );
        assert!(
            frame < self.next,
            "freed frame was never allocated from this region"
        );
        debug_assert!(
            !self.free_list.contains(&frame),
            "double free of frame {frame}"
        );
        self.free_list.push(frame);
    }

    /// Returns the number of frames currently available.
    pub fn free_frames(&self) -> usize {
        self.free_list.len() + (self.end - self.next) / arch::PAGE_SIZE
    }

    /// Returns the total number of frames managed.
    pub fn total_frames(&self) -> usize {
        self.total
    }
}
