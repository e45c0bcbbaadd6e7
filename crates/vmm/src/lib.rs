//! Process virtual-memory management: copy-on-write fork sharing, demand
//! loading of binary pages from ELF images, and a bounded-residency heap
//! pager backed by a fixed swap arena.
//!
//! The crate targets riscv64 kernels but builds and tests on any host: the
//! `software-emulation` feature swaps the Sv39 page-table layout for a
//! scale model with the same shape, walked by the same code.
#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

extern crate alloc;

mod address;
pub mod arch;
mod clock;
mod cow;
mod error;
mod fault;
mod frame_allocator;
mod heap;
mod image;
mod loader;
mod page_directory;
mod process;
mod swap;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use clock::Clock;
pub use cow::{CowRegistry, GroupId, MAX_COW_GROUPS, SHARED_FRAME_CAP};
pub use error::VmError;
pub use fault::{FaultKind, MemoryManager};
pub use frame_allocator::FrameAllocator;
pub use heap::{HeapLimits, HeapPage, HeapTracker, Residency, MAX_HEAP_PAGES, MAX_RESIDENT_HEAP};
pub use image::{ImageFile, ImageStore};
pub use page_directory::PageDirectory;
pub use process::Process;
pub use swap::{BlockDevice, SwapSlot, SwapStore, BLOCK_SIZE};

#[cfg(any(test, feature = "software-emulation"))]
pub use image::{MemoryImageFile, MemoryImageStore};
#[cfg(any(test, feature = "software-emulation"))]
pub use swap::MemoryDisk;
