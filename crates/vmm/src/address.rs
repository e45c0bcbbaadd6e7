//! Address types and the physical-memory translator.
//!
//! Physical and virtual addresses are separate newtypes so that a frame
//! address can never be handed to a page-table walk by accident. The
//! [`AddressTranslator`] converts between the two views of physical memory:
//! in a kernel it is a direct-map offset, under software emulation it is a
//! buffer standing in for RAM.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Generates the shared surface of the two address newtypes.
macro_rules! address_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address from a raw value.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks whether the address is aligned to `align`.
            ///
            /// # Panics
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Rounds the address down to a multiple of `align`.
            ///
            /// # Panics
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Rounds the address up to a multiple of `align`.
            ///
            /// # Panics
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

address_type!(
    PhysicalAddress,
    "The address of a location in physical memory.\n\n\
     A page-aligned physical address names a frame."
);

address_type!(
    VirtualAddress,
    "The address of a location in a virtual address space.\n\n\
     Only meaningful relative to a particular page table."
);

impl VirtualAddress {
    /// Returns the base address of the page containing this address.
    #[inline]
    pub const fn page_base(self) -> Self {
        self.align_down(arch::PAGE_SIZE)
    }
}

/// Converts between physical addresses and locations the kernel can touch.
///
/// Two modes exist:
/// - `Hardware`: physical memory is direct-mapped at a fixed virtual offset.
/// - `Emulated`: physical memory is a host buffer (tests and the
///   `software-emulation` feature).
pub enum AddressTranslator {
    /// Direct-map translation at a fixed offset.
    Hardware { direct_map_offset: usize },
    /// Translation into an emulated memory buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates an emulated translator backed by `size` bytes of fake RAM.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Installs the global translator. Must be called exactly once during
    /// initialization.
    ///
    /// # Panics
    /// Panics if a translator has already been installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if TRANSLATOR.get().is_some() {
                panic!("address translator already installed");
            }
            TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already installed");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns the installed translator.
    ///
    /// # Panics
    /// Panics if no translator has been installed yet.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current()
            .expect("address translator not installed; call AddressTranslator::set_current first")
    }

    /// Returns the installed translator, or `None` before initialization.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: the thread-local translator is written once and
                    // lives for the rest of the thread, so extending the
                    // borrow to 'static never observes a move or drop.
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Translates a physical address to a kernel-accessible virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a kernel virtual address back to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.offset_of(virt as *const u8),
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    /// Reserves a block of emulated physical memory (emulated mode only).
    ///
    /// Returns the physical address of the block, or `None` if the emulated
    /// RAM is exhausted.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        match self {
            Self::Hardware { .. } => panic!("cannot reserve memory through a hardware translator"),
            Self::Emulated(mem) => mem.allocate(size, align),
        }
    }

    /// Copies one whole page between two frames.
    pub fn copy_page(&self, dst: PhysicalAddress, src: PhysicalAddress) {
        debug_assert!(dst.is_aligned(arch::PAGE_SIZE));
        debug_assert!(src.is_aligned(arch::PAGE_SIZE));
        let src_ptr = self.phys_to_ptr::<u8>(src.as_usize());
        let dst_ptr = self.phys_to_ptr::<u8>(dst.as_usize());
        // SAFETY: both addresses name whole allocated frames, and distinct
        // frames never overlap.
        unsafe { core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, arch::PAGE_SIZE) };
    }

    /// Fills one whole frame with zeroes.
    pub fn zero_page(&self, frame: PhysicalAddress) {
        debug_assert!(frame.is_aligned(arch::PAGE_SIZE));
        let ptr = self.phys_to_ptr::<u8>(frame.as_usize());
        // SAFETY: the address names a whole allocated frame.
        unsafe { core::ptr::write_bytes(ptr, 0, arch::PAGE_SIZE) };
    }

    /// Writes `bytes` into a frame starting at `offset`.
    ///
    /// # Panics
    /// Panics if the write would run past the end of the frame.
    pub fn write_frame(&self, frame: PhysicalAddress, offset: usize, bytes: &[u8]) {
        debug_assert!(frame.is_aligned(arch::PAGE_SIZE));
        assert!(offset + bytes.len() <= arch::PAGE_SIZE, "write past end of frame");
        let ptr = self.phys_to_ptr::<u8>(frame.as_usize() + offset);
        // SAFETY: bounds were checked against the frame size above.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    }

    /// Reads bytes from a frame starting at `offset` into `buf`.
    ///
    /// # Panics
    /// Panics if the read would run past the end of the frame.
    pub fn read_frame(&self, frame: PhysicalAddress, offset: usize, buf: &mut [u8]) {
        debug_assert!(frame.is_aligned(arch::PAGE_SIZE));
        assert!(offset + buf.len() <= arch::PAGE_SIZE, "read past end of frame");
        let ptr = self.phys_to_ptr::<u8>(frame.as_usize() + offset);
        // SAFETY: bounds were checked against the frame size above.
        unsafe { core::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len()) };
    }
}

/// The global translator, installed once during initialization.
///
/// In test and software-emulation builds this is thread-local so every test
/// gets its own emulated memory.
#[cfg(not(any(test, feature = "software-emulation")))]
static TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let addr = VirtualAddress::new(arch::PAGE_SIZE + 3);
        assert!(!addr.is_aligned(arch::PAGE_SIZE));
        assert_eq!(addr.align_down(arch::PAGE_SIZE).as_usize(), arch::PAGE_SIZE);
        assert_eq!(addr.align_up(arch::PAGE_SIZE).as_usize(), 2 * arch::PAGE_SIZE);
        assert_eq!(addr.page_base(), addr.align_down(arch::PAGE_SIZE));
    }

    #[test]
    fn address_arithmetic() {
        let a = PhysicalAddress::new(0x100);
        assert_eq!((a + 0x20).as_usize(), 0x120);
        assert_eq!((a - 0x20).as_usize(), 0xE0);
        assert_eq!(a - PhysicalAddress::new(0x80), 0x80);
    }

    #[test]
    fn page_copy_and_zero_round_trip() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(16 * arch::PAGE_SIZE));
        }
        let translator = AddressTranslator::current();
        let a = PhysicalAddress::new(
            translator
                .allocate(arch::PAGE_SIZE, arch::PAGE_SIZE)
                .unwrap(),
        );
        let b = PhysicalAddress::new(
            translator
                .allocate(arch::PAGE_SIZE, arch::PAGE_SIZE)
                .unwrap(),
        );

        let pattern: alloc::vec::Vec<u8> = (0..arch::PAGE_SIZE).map(|i| i as u8).collect();
        translator.write_frame(a, 0, &pattern);
        translator.copy_page(b, a);

        let mut readback = alloc::vec![0u8; arch::PAGE_SIZE];
        translator.read_frame(b, 0, &mut readback);
        assert_eq!(readback, pattern);

        translator.zero_page(b);
        translator.read_frame(b, 0, &mut readback);
        assert!(readback.iter().all(|&b| b == 0));
    }
}
