//! Copy-on-write fork sharing.
//!
//! Processes forked from a common ancestor form a group. The group records
//! every frame its members share and how many members remain; a shared frame
//! is freed only when the last writer to copy it away was also its sole
//! remaining owner. All groups live in one registry behind a single lock,
//! since fork and copy-fault both mutate group membership and the shared
//! frame sets together.

use crate::address::AddressTranslator;
use crate::arch;
use crate::frame_allocator::FrameAllocator;
use crate::page_directory::PageDirectory;
use crate::process::Process;
use crate::{PhysicalAddress, VirtualAddress, VmError};

use alloc::vec::Vec;

/// Most concurrently live fork groups.
pub const MAX_COW_GROUPS: usize = 64;

/// Most shared frames one group may record.
pub const SHARED_FRAME_CAP: usize = 100;

/// Identifies a fork group in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupId(usize);

struct CowGroup {
    shared_frames: Vec<PhysicalAddress>,
    process_count: usize,
}

/// Registry of all fork groups.
pub struct CowRegistry {
    groups: spin::Mutex<Vec<Option<CowGroup>>>,
}

impl CowRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let mut groups = Vec::new();
        groups.resize_with(MAX_COW_GROUPS, || None);
        Self {
            groups: spin::Mutex::new(groups),
        }
    }

    /// Creates a fresh group with one member, reusing the slot of any group
    /// whose members have all exited.
    pub fn create_group(&self) -> Result<GroupId, VmError> {
        let mut groups = self.groups.lock();
        match groups.iter().position(|slot| slot.is_none()) {
            Some(index) => {
                groups[index] = Some(CowGroup {
                    shared_frames: Vec::new(),
                    process_count: 1,
                });
                Ok(GroupId(index))
            }
            None => Err(VmError::GroupTableFull),
        }
    }

    /// Adds one member to a group. A process outside any group (`None`) has
    /// nothing to join.
    pub fn join_group(&self, group: Option<GroupId>) {
        if let Some(id) = group {
            let mut groups = self.groups.lock();
            live(&mut groups, id).process_count += 1;
        }
    }

    /// Removes one member from a group, recycling the slot when the last
    /// member leaves.
    ///
    /// # Panics
    /// Panics if the group has no members left to remove.
    pub fn leave_group(&self, group: Option<GroupId>) {
        let Some(id) = group else { return };
        let mut groups = self.groups.lock();
        let entry = live(&mut groups, id);
        assert!(entry.process_count > 0, "leave of an empty fork group");
        entry.process_count -= 1;
        if entry.process_count == 0 {
            groups[id.0] = None;
        }
    }

    /// Records a frame as shared by a group. Recording the same frame twice
    /// is a no-op; a process outside any group shares nothing.
    pub fn register_shared_frame(
        &self,
        group: Option<GroupId>,
        frame: PhysicalAddress,
    ) -> Result<(), VmError> {
        let Some(id) = group else { return Ok(()) };
        let mut groups = self.groups.lock();
        let entry = live(&mut groups, id);
        if entry.shared_frames.contains(&frame) {
            return Ok(());
        }
        if entry.shared_frames.len() >= SHARED_FRAME_CAP {
            return Err(VmError::SharedTableFull);
        }
        entry.shared_frames.push(frame);
        Ok(())
    }

    /// Returns true if the frame is recorded as shared by the group.
    pub fn is_shared(&self, group: Option<GroupId>, frame: PhysicalAddress) -> bool {
        let Some(id) = group else { return false };
        let mut groups = self.groups.lock();
        live(&mut groups, id).shared_frames.contains(&frame)
    }

    /// Drops the frame from the group's shared set and reports whether the
    /// caller was its sole remaining owner and should free it.
    ///
    /// With two or more members the frame stays recorded: the other members
    /// still map it.
    pub fn release_frame_if_sole_owner(
        &self,
        group: Option<GroupId>,
        frame: PhysicalAddress,
    ) -> bool {
        let Some(id) = group else { return false };
        let mut groups = self.groups.lock();
        let entry = live(&mut groups, id);
        if entry.process_count != 1 {
            return false;
        }
        match entry.shared_frames.iter().position(|&f| f == frame) {
            Some(index) => {
                entry.shared_frames.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns the member count of a group.
    pub fn process_count(&self, id: GroupId) -> usize {
        let mut groups = self.groups.lock();
        live(&mut groups, id).process_count
    }

    /// Returns the number of frames a group records as shared.
    pub fn shared_frames(&self, id: GroupId) -> usize {
        let mut groups = self.groups.lock();
        live(&mut groups, id).shared_frames.len()
    }
}

impl Default for CowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves a group id to its live entry.
///
/// Panics on a vacated slot: a process still carries an id only while it is
/// a member, so the group must exist.
fn live(groups: &mut [Option<CowGroup>], id: GroupId) -> &mut CowGroup {
    groups[id.0]
        .as_mut()
        .unwrap_or_else(|| panic!("fork group {} has been vacated", id.0))
}

/// Maps the parent's address space into the child read-only, downgrading the
/// parent's own mappings to match and recording every frame as shared.
///
/// A frame is registered before either table is touched, so a parent entry
/// is only ever downgraded once its frame is in the shared set. On failure
/// the child's partial mappings are torn down; parent pages processed before
/// the failure stay read-only and registered, and the caller keeps the
/// parent in the group so later write faults copy and reclaim them.
pub(crate) fn share_address_space(
    registry: &CowRegistry,
    group: Option<GroupId>,
    parent: &mut PageDirectory,
    child: &mut PageDirectory,
    size: usize,
) -> Result<(), VmError> {
    let mut va = 0;
    while va < size {
        let page = VirtualAddress::new(va);
        let Some(entry) = parent.walk(page) else {
            va += arch::PAGE_SIZE;
            continue;
        };
        if !entry.is_valid() {
            va += arch::PAGE_SIZE;
            continue;
        }

        let frame = entry
            .address()
            .unwrap_or_else(|| panic!("valid mapping at {page} has no frame"));
        let mut flags = entry.flags();
        flags.set_writable(false);

        let result = registry
            .register_shared_frame(group, frame)
            .and_then(|()| child.map(page, frame, flags));
        match result {
            Ok(()) => entry.set_flags(flags),
            Err(error) => {
                // The failing page may already be mapped; unmapping skips
                // holes, so include it either way.
                child.unmap_range(VirtualAddress::new(0), va / arch::PAGE_SIZE + 1, None);
                return Err(error);
            }
        }
        va += arch::PAGE_SIZE;
    }
    Ok(())
}

/// Gives the faulting process a private, writable copy of a shared page.
///
/// The frame must be recorded as shared by the process's group; a write
/// fault on read-only data that was never shared is a protection violation,
/// not a copy candidate. The old frame is freed only when this process was
/// the group's sole remaining owner of it.
pub(crate) fn resolve_cow_fault(
    registry: &CowRegistry,
    frames: &spin::Mutex<FrameAllocator>,
    proc: &mut Process,
    fault_address: VirtualAddress,
) -> Result<(), VmError> {
    let page = fault_address.page_base();
    let entry = proc
        .page_table
        .walk(page)
        .unwrap_or_else(|| panic!("copy fault at {page} with no mapping"));
    assert!(entry.is_valid(), "copy fault at {page} on an invalid entry");

    let old_frame = entry
        .address()
        .unwrap_or_else(|| panic!("valid mapping at {page} has no frame"));
    if !registry.is_shared(proc.cow_group, old_frame) {
        return Err(VmError::ProtectionFault);
    }
    let mut flags = entry.flags();
    flags.set_writable(true);

    let new_frame = frames.lock().allocate()?;
    AddressTranslator::current().copy_page(new_frame, old_frame);

    proc.page_table.unmap(page);
    proc.page_table.map(page, new_frame, flags)?;

    if registry.release_frame_if_sole_owner(proc.cow_group, old_frame) {
        frames.lock().free(old_frame);
    }
    log::debug!(
        "{}: copied shared page {page} from {old_frame} to {new_frame}",
        proc.name
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> PhysicalAddress {
        PhysicalAddress::new(n * arch::PAGE_SIZE)
    }

    #[test]
    fn groups_track_membership() {
        let registry = CowRegistry::new();
        let id = registry.create_group().unwrap();
        assert_eq!(registry.process_count(id), 1);

        registry.join_group(Some(id));
        registry.join_group(Some(id));
        assert_eq!(registry.process_count(id), 3);

        registry.leave_group(Some(id));
        assert_eq!(registry.process_count(id), 2);
    }

    #[test]
    fn vacated_slots_are_reused() {
        let registry = CowRegistry::new();
        let first = registry.create_group().unwrap();
        registry.leave_group(Some(first));
        let second = registry.create_group().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn group_table_exhaustion_is_an_error() {
        let registry = CowRegistry::new();
        for _ in 0..MAX_COW_GROUPS {
            registry.create_group().unwrap();
        }
        assert_eq!(registry.create_group(), Err(VmError::GroupTableFull));
    }

    #[test]
    fn shared_frames_deduplicate() {
        let registry = CowRegistry::new();
        let id = registry.create_group().unwrap();
        registry.register_shared_frame(Some(id), frame(1)).unwrap();
        registry.register_shared_frame(Some(id), frame(1)).unwrap();
        assert_eq!(registry.shared_frames(id), 1);
        assert!(registry.is_shared(Some(id), frame(1)));
        assert!(!registry.is_shared(Some(id), frame(2)));
    }

    #[test]
    fn shared_table_exhaustion_is_an_error() {
        let registry = CowRegistry::new();
        let id = registry.create_group().unwrap();
        for n in 0..SHARED_FRAME_CAP {
            registry.register_shared_frame(Some(id), frame(n)).unwrap();
        }
        assert_eq!(
            registry.register_shared_frame(Some(id), frame(SHARED_FRAME_CAP)),
            Err(VmError::SharedTableFull)
        );
    }

    #[test]
    fn ungrouped_processes_share_nothing() {
        let registry = CowRegistry::new();
        registry.register_shared_frame(None, frame(1)).unwrap();
        assert!(!registry.is_shared(None, frame(1)));
        assert!(!registry.release_frame_if_sole_owner(None, frame(1)));
        // Joining or leaving no group is a no-op.
        registry.join_group(None);
        registry.leave_group(None);
    }

    #[test]
    fn frames_are_released_only_by_the_sole_owner() {
        let registry = CowRegistry::new();
        let id = registry.create_group().unwrap();
        registry.join_group(Some(id));
        registry.register_shared_frame(Some(id), frame(1)).unwrap();

        // Two members: the frame stays shared.
        assert!(!registry.release_frame_if_sole_owner(Some(id), frame(1)));
        assert_eq!(registry.shared_frames(id), 1);

        registry.leave_group(Some(id));
        assert!(registry.release_frame_if_sole_owner(Some(id), frame(1)));
        assert_eq!(registry.shared_frames(id), 0);

        // Already released: nothing left to free.
        assert!(!registry.release_frame_if_sole_owner(Some(id), frame(1)));
    }

    #[test]
    #[should_panic(expected = "has been vacated")]
    fn vacated_group_access_panics() {
        let registry = CowRegistry::new();
        let id = registry.create_group().unwrap();
        registry.leave_group(Some(id));
        registry.process_count(id);
    }
}
