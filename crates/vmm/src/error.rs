//! Error types for the virtual-memory manager.
//!
//! Failures split into two layers. Conditions only the faulting process can
//! be blamed for (resource exhaustion, addresses nothing backs, damaged image
//! segments) are surfaced as [`VmError`] so the caller can terminate just
//! that process. Violated kernel invariants, such as a page-table entry that
//! must exist or a malformed image header on a binary that already passed
//! `exec`, are panics: they indicate corrupted kernel state, not a
//! recoverable request.

/// Errors a fault or fork path can surface to its caller.
///
/// Every variant is scoped to the faulting process; none of them indicate a
/// kernel-wide failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No physical frame is available.
    OutOfFrames,
    /// Every slot in the swap arena is in use.
    SwapFull,
    /// The CoW group table has no free slot for a new group.
    GroupTableFull,
    /// A CoW group's shared-frame set is at capacity.
    SharedTableFull,
    /// The per-process heap tracker has no free entry.
    HeapTrackerFull,
    /// The faulting address is outside every image segment and the heap.
    UnresolvedFault,
    /// A fault permissions forbid resolving: a fault on a page that is
    /// already resident, or a write to a read-only page that is not shared.
    ProtectionFault,
    /// The process's image could not be opened.
    ImageNotFound,
    /// An image segment has impossible geometry: an unaligned base, an
    /// overflowing range, or more file content than memory.
    BadSegment,
    /// Segment content could not be read from the image.
    BadImage,
    /// A virtual address that had to be mapped was not.
    NotMapped,
}
