//! Demand loading of binary pages from executable images.
//!
//! Pages below the heap are backed by the process's ELF image and loaded one
//! at a time, on first fault. Each load re-walks the program headers: the
//! image is the source of truth for which segment covers the page and with
//! which permissions.

use crate::arch;
use crate::frame_allocator::FrameAllocator;
use crate::image::{ElfHeader, ImageFile, ImageStore, ProgramHeader};
use crate::process::Process;
use crate::{VirtualAddress, VmError};

use alloc::vec;

/// Loads the binary page covering `page` into the process's address space.
///
/// Returns [`VmError::UnresolvedFault`] when no loadable segment covers the
/// page, and [`VmError::BadSegment`] when the covering segment's geometry is
/// malformed.
///
/// # Panics
/// Panics if the image's ELF header or program-header table cannot be read
/// in full. The image was already loaded once at exec time, so truncation
/// here means the backing store has been corrupted.
pub(crate) fn load_binary_page<I: ImageStore>(
    images: &I,
    frames: &mut FrameAllocator,
    proc: &mut Process,
    page: VirtualAddress,
) -> Result<(), VmError> {
    debug_assert!(page.is_aligned(arch::PAGE_SIZE));
    let image = images.open(&proc.name).ok_or(VmError::ImageNotFound)?;

    let mut raw_header = [0u8; ElfHeader::SIZE];
    let read = image.read_at(0, &mut raw_header);
    assert_eq!(read, ElfHeader::SIZE, "executable image lost its ELF header");
    let header = ElfHeader::parse(&raw_header);
    assert_eq!(
        header.phentsize as usize,
        ProgramHeader::SIZE,
        "executable image has a malformed program-header table"
    );

    for index in 0..header.phnum {
        let offset = header.phoff + u64::from(index) * ProgramHeader::SIZE as u64;
        let mut raw = [0u8; ProgramHeader::SIZE];
        let read = image.read_at(offset, &mut raw);
        assert_eq!(
            read,
            ProgramHeader::SIZE,
            "executable image has a truncated program-header table"
        );

        let segment = ProgramHeader::parse(&raw);
        if segment.kind != ProgramHeader::LOAD {
            continue;
        }
        segment.validate()?;
        if segment.contains(page) {
            return load_segment_page(&image, &segment, frames, proc, page);
        }
    }
    Err(VmError::UnresolvedFault)
}

/// Maps one fresh frame for `page` and fills it from the segment's file
/// data, leaving any remainder past `filesz` zeroed.
fn load_segment_page<F: ImageFile>(
    image: &F,
    segment: &ProgramHeader,
    frames: &mut FrameAllocator,
    proc: &mut Process,
    page: VirtualAddress,
) -> Result<(), VmError> {
    proc.page_table.allocate_range(
        frames,
        page,
        page + arch::PAGE_SIZE,
        segment.permissions(),
    )?;

    let segment_offset = (page.as_usize() as u64) - segment.vaddr;
    if segment_offset < segment.filesz {
        let count = core::cmp::min(arch::PAGE_SIZE as u64, segment.filesz - segment_offset) as usize;
        let mut buf = vec![0u8; count];
        let read = image.read_at(segment.offset + segment_offset, &mut buf);
        if read != count {
            proc.page_table.unmap_range(page, 1, Some(frames));
            return Err(VmError::BadImage);
        }
        proc.page_table.copy_out(page, &buf)?;
    }

    proc.size = proc.size.max(page.as_usize() + arch::PAGE_SIZE);
    log::debug!(
        "{}: loaded binary page {page} ({} file bytes)",
        proc.name,
        core::cmp::min(
            arch::PAGE_SIZE as u64,
            segment.filesz.saturating_sub(segment_offset)
        )
    );
    Ok(())
}
