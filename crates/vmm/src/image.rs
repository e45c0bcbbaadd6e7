//! Executable images and their on-disk format.
//!
//! Binary pages are demand-loaded straight from the process's executable, so
//! the fault path needs just enough ELF64 knowledge to find the loadable
//! segment covering a faulting address: the header's program-header table
//! geometry and the `PT_LOAD` entries themselves.

use crate::arch::PageFlags;
use crate::VirtualAddress;
use crate::VmError;

#[cfg(any(test, feature = "software-emulation"))]
use alloc::{collections::BTreeMap, string::String, vec::Vec};

/// Random-access reads from an executable image.
pub trait ImageFile {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    /// Reads past the end of the image return fewer bytes, down to zero.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;
}

/// Looks up executable images by name.
///
/// Stands in for the filesystem of the surrounding kernel.
pub trait ImageStore {
    type File: ImageFile;

    /// Opens the named image, or `None` if it does not exist.
    fn open(&self, name: &str) -> Option<Self::File>;
}

/// The parts of an ELF64 header the fault path needs: where the program
/// headers are.
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Size of an ELF64 file header in bytes.
    pub const SIZE: usize = 64;

    const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    /// Parses an ELF64 file header.
    ///
    /// # Panics
    /// Panics on a bad magic number. A process only exists because this image
    /// was loaded at exec time, so a non-ELF image here means the backing
    /// store has been corrupted.
    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        assert_eq!(
            bytes[..4],
            Self::MAGIC,
            "executable image is not an ELF binary"
        );
        Self {
            phoff: read_u64(bytes, 32),
            phentsize: read_u16(bytes, 54),
            phnum: read_u16(bytes, 56),
        }
    }
}

/// One ELF64 program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl ProgramHeader {
    /// Size of an ELF64 program header in bytes.
    pub const SIZE: usize = 56;

    /// Segment type of a loadable segment.
    pub const LOAD: u32 = 1;

    const FLAG_EXECUTABLE: u32 = 1;
    const FLAG_WRITABLE: u32 = 2;

    /// Parses an ELF64 program header.
    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            kind: read_u32(bytes, 0),
            flags: read_u32(bytes, 4),
            offset: read_u64(bytes, 8),
            vaddr: read_u64(bytes, 16),
            filesz: read_u64(bytes, 32),
            memsz: read_u64(bytes, 40),
        }
    }

    /// Returns true if `address` falls inside this segment's memory image.
    pub fn contains(&self, address: VirtualAddress) -> bool {
        let address = address.as_usize() as u64;
        address >= self.vaddr && address < self.vaddr + self.memsz
    }

    /// Checks the segment geometry an image is allowed to get wrong.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.memsz < self.filesz {
            return Err(VmError::BadSegment);
        }
        if self.vaddr.checked_add(self.memsz).is_none() {
            return Err(VmError::BadSegment);
        }
        if self.vaddr as usize % crate::arch::PAGE_SIZE != 0 {
            return Err(VmError::BadSegment);
        }
        Ok(())
    }

    /// Translates the segment's permission flags into page flags. Loaded
    /// pages are always user-readable.
    pub fn permissions(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_readable(true);
        flags.set_user(true);
        flags.set_writable(self.flags & Self::FLAG_WRITABLE != 0);
        flags.set_executable(self.flags & Self::FLAG_EXECUTABLE != 0);
        flags
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&bytes[offset..offset + 2]);
    u16::from_le_bytes(raw)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// An image store backed by host memory, for tests and emulation.
#[cfg(any(test, feature = "software-emulation"))]
pub struct MemoryImageStore {
    images: BTreeMap<String, Vec<u8>>,
}

#[cfg(any(test, feature = "software-emulation"))]
impl MemoryImageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            images: BTreeMap::new(),
        }
    }

    /// Adds an image under `name`, replacing any existing one.
    pub fn insert(&mut self, name: &str, image: Vec<u8>) {
        self.images.insert(String::from(name), image);
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Default for MemoryImageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl ImageStore for MemoryImageStore {
    type File = MemoryImageFile;

    fn open(&self, name: &str) -> Option<Self::File> {
        self.images.get(name).map(|bytes| MemoryImageFile {
            bytes: bytes.clone(),
        })
    }
}

/// An open image held in host memory.
#[cfg(any(test, feature = "software-emulation"))]
pub struct MemoryImageFile {
    bytes: Vec<u8>,
}

#[cfg(any(test, feature = "software-emulation"))]
impl ImageFile for MemoryImageFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return 0;
        }
        let available = &self.bytes[offset..];
        let count = buf.len().min(available.len());
        buf[..count].copy_from_slice(&available[..count]);
        count
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{build_elf, SegmentSpec};
    use super::*;
    use crate::arch;
    use alloc::vec;

    #[test]
    fn header_geometry_parses() {
        let image = build_elf(&[SegmentSpec {
            vaddr: 0,
            memsz: arch::PAGE_SIZE as u64,
            flags: 5,
            data: vec![1, 2, 3],
        }]);
        let mut raw = [0u8; ElfHeader::SIZE];
        raw.copy_from_slice(&image[..ElfHeader::SIZE]);
        let header = ElfHeader::parse(&raw);
        assert_eq!(header.phoff, ElfHeader::SIZE as u64);
        assert_eq!(header.phentsize as usize, ProgramHeader::SIZE);
        assert_eq!(header.phnum, 1);
    }

    #[test]
    fn program_headers_parse_and_locate() {
        let image = build_elf(&[SegmentSpec {
            vaddr: arch::PAGE_SIZE as u64,
            memsz: 2 * arch::PAGE_SIZE as u64,
            flags: 5,
            data: vec![0xAB; arch::PAGE_SIZE],
        }]);
        let mut raw = [0u8; ProgramHeader::SIZE];
        raw.copy_from_slice(&image[ElfHeader::SIZE..ElfHeader::SIZE + ProgramHeader::SIZE]);
        let ph = ProgramHeader::parse(&raw);

        assert_eq!(ph.kind, ProgramHeader::LOAD);
        assert_eq!(ph.filesz as usize, arch::PAGE_SIZE);
        assert!(ph.contains(VirtualAddress::new(arch::PAGE_SIZE)));
        assert!(ph.contains(VirtualAddress::new(3 * arch::PAGE_SIZE - 1)));
        assert!(!ph.contains(VirtualAddress::new(3 * arch::PAGE_SIZE)));
        ph.validate().unwrap();
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let unaligned = ProgramHeader {
            kind: ProgramHeader::LOAD,
            flags: 5,
            offset: 0,
            vaddr: 1,
            filesz: 0,
            memsz: arch::PAGE_SIZE as u64,
        };
        assert_eq!(unaligned.validate(), Err(VmError::BadSegment));

        let shrunken = ProgramHeader {
            vaddr: 0,
            filesz: 100,
            memsz: 50,
            ..unaligned
        };
        assert_eq!(shrunken.validate(), Err(VmError::BadSegment));

        let overflowing = ProgramHeader {
            vaddr: u64::MAX - arch::PAGE_SIZE as u64,
            filesz: 0,
            memsz: 2 * arch::PAGE_SIZE as u64,
            ..unaligned
        };
        assert_eq!(overflowing.validate(), Err(VmError::BadSegment));
    }

    #[test]
    fn permissions_map_to_page_flags() {
        let header = ProgramHeader {
            kind: ProgramHeader::LOAD,
            flags: 5, // read + execute
            offset: 0,
            vaddr: 0,
            filesz: 0,
            memsz: 0,
        };
        let flags = header.permissions();
        assert!(flags.is_readable());
        assert!(flags.is_user());
        assert!(flags.is_executable());
        assert!(!flags.is_writable());
    }

    #[test]
    #[should_panic(expected = "not an ELF binary")]
    fn bad_magic_panics() {
        let raw = [0u8; ElfHeader::SIZE];
        ElfHeader::parse(&raw);
    }

    #[test]
    fn reads_past_the_end_are_short() {
        let mut store = MemoryImageStore::new();
        store.insert("init", vec![1, 2, 3, 4]);
        let file = store.open("init").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(2, &mut buf), 2);
        assert_eq!(&buf[..2], &[3, 4]);
        assert_eq!(file.read_at(10, &mut buf), 0);
        assert!(store.open("missing").is_none());
    }
}
