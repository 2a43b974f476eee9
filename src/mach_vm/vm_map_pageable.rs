//! VM Map Pageable - Wiring and Unwiring
//!
//! Based on Mach4 vm/vm_map.c (vm_map_pageable_common)
//!
//! Each entry carries two counts. `wired_count` counts kernel wirings plus
//! one for all user wirings together; `user_wired_count` counts the user
//! wirings. Pages are physically wired while `wired_count > 0`.
//!
//! Unwiring validates the whole range before changing anything. Wiring
//! runs in two passes: the first, under the write lock, prepares objects
//! and raises counts (rolling back on a hole or a protection mismatch);
//! the second faults the pages in with the lock downgraded to read, or
//! released entirely for the kernel map. Newly wired entries are held in
//! transition across the second pass.

use alloc::vec::Vec;

use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_fault::{vm_fault_unwire, vm_fault_wire};
use crate::mach_vm::vm_map::{
    vm_map_entry_end_transition, vm_map_entry_wait, EntryFlags, EntryLookup, EntryObject,
    MapWriteGuard, VmMap, VmProt,
};
use crate::mach_vm::vm_object::{vm_object_allocate, vm_object_shadow};

/// Wire (`access_type` non-empty) or unwire (`VmProt::NONE`) a range on
/// behalf of the kernel (vm_map_pageable)
pub fn vm_map_pageable(map: &VmMap, start: u64, end: u64, access_type: VmProt) -> KernResult<()> {
    vm_map_pageable_common(map, start, end, access_type, false)
}

/// Wire or unwire a range on behalf of a user (vm_map_pageable_user)
///
/// User wirings nest; only the first raises `wired_count` and only the
/// last lowers it.
pub fn vm_map_pageable_user(map: &VmMap, start: u64, end: u64, access_type: VmProt) -> KernResult<()> {
    vm_map_pageable_common(map, start, end, access_type, true)
}

fn vm_map_pageable_common(
    map: &VmMap,
    start: u64,
    end: u64,
    access_type: VmProt,
    user_wire: bool,
) -> KernResult<()> {
    let (start, end) = map.clamp(start, end);
    let guard = map.write();
    if access_type.is_empty() {
        unwire_range(map, guard, start, end, user_wire)
    } else {
        wire_range(map, guard, start, end, access_type, user_wire)
    }
}

// ============================================================================
// Unwiring
// ============================================================================

fn unwire_range<'a>(
    map: &'a VmMap,
    mut guard: MapWriteGuard<'a>,
    start: u64,
    end: u64,
    user_wire: bool,
) -> KernResult<()> {
    // Validate everything first; nothing may change on failure.
    let first = 'validate: loop {
        let first = match guard.lookup_entry(start) {
            EntryLookup::Contained(key) => key,
            EntryLookup::Preceding(_) => return Err(KernError::Failure),
        };
        let mut key = first;
        loop {
            let entry = guard.entry(key);
            if entry.in_transition() {
                guard.entry_mut(key).flags.insert(EntryFlags::NEEDS_WAKEUP);
                guard = vm_map_entry_wait(map, guard);
                continue 'validate;
            }
            let wired = if user_wire {
                entry.user_wired_count > 0
            } else {
                entry.wired_count > 0 && entry.kernel_wired_count() > 0
            };
            if !wired {
                return Err(KernError::Failure);
            }
            if entry.end >= end {
                break 'validate first;
            }
            let entry_end = entry.end;
            match guard.next_key(Some(key)) {
                Some(next) if guard.entry(next).start == entry_end => key = next,
                _ => return Err(KernError::Failure),
            }
        }
    };

    let mut cursor = Some(guard.clip_start(first, start));
    while let Some(key) = cursor {
        if guard.entry(key).start >= end {
            break;
        }
        guard.clip_end(key, end);
        let entry = guard.entry_mut(key);
        if user_wire {
            entry.user_wired_count -= 1;
            if entry.user_wired_count == 0 {
                entry.wired_count -= 1;
            }
        } else {
            entry.wired_count -= 1;
        }
        if entry.wired_count == 0 {
            vm_fault_unwire(map.pmap(), guard.entry(key));
        }
        cursor = guard.next_key(Some(key));
    }
    log::debug!("vm_map_pageable: map {} unwired [{:#x}, {:#x})", map.id.0, start, end);
    Ok(())
}

// ============================================================================
// Wiring
// ============================================================================

/// Undo the count raises of a failed first pass
fn unraise(guard: &mut MapWriteGuard<'_>, raised: &[(u64, bool)], user_wire: bool) {
    for &(key, raised_wired) in raised {
        let entry = guard.entry_mut(key);
        if user_wire {
            entry.user_wired_count -= 1;
        }
        if raised_wired {
            entry.wired_count -= 1;
        }
    }
}

fn wire_range<'a>(
    map: &'a VmMap,
    mut guard: MapWriteGuard<'a>,
    start: u64,
    end: u64,
    access_type: VmProt,
    user_wire: bool,
) -> KernResult<()> {
    let to_fault = 'restart: loop {
        let first = match guard.lookup_entry(start) {
            EntryLookup::Contained(key) => key,
            EntryLookup::Preceding(_) => return Err(KernError::Failure),
        };

        // Keys whose counts were raised, and whether it was a user raise
        // of wired_count, for rollback.
        let mut raised: Vec<(u64, bool)> = Vec::new();
        let mut to_fault: Vec<(u64, u64)> = Vec::new();
        let mut prepared = false;
        let mut failed = false;

        let mut key = guard.clip_start(first, start);
        loop {
            guard.clip_end(key, end);
            if guard.entry(key).in_transition() {
                unraise(&mut guard, &raised, user_wire);
                if prepared {
                    guard.touch();
                }
                guard.entry_mut(key).flags.insert(EntryFlags::NEEDS_WAKEUP);
                guard = vm_map_entry_wait(map, guard);
                continue 'restart;
            }
            let entry = guard.entry_mut(key);
            if entry.is_sub_map() || !entry.protection.contains(access_type) {
                failed = true;
                break;
            }

            if entry.wired_count == 0 {
                if entry.needs_copy() && entry.protection.contains(VmProt::WRITE) {
                    let (shadow, offset) =
                        vm_object_shadow(entry.object.object().cloned(), entry.offset, entry.size());
                    entry.object = EntryObject::Object(shadow);
                    entry.offset = offset;
                    entry.set_needs_copy(false);
                    prepared = true;
                } else if entry.object.is_none() {
                    entry.object = EntryObject::Object(vm_object_allocate(entry.size()));
                    entry.offset = 0;
                    prepared = true;
                }
            }

            let raised_wired = if user_wire {
                entry.user_wired_count += 1;
                entry.user_wired_count == 1
            } else {
                true
            };
            if raised_wired {
                entry.wired_count += 1;
                if entry.wired_count == 1 {
                    to_fault.push((entry.start, entry.end));
                }
            }
            raised.push((key, raised_wired));

            let entry_end = entry.end;
            if entry_end >= end {
                break;
            }
            match guard.next_key(Some(key)) {
                Some(next) if guard.entry(next).start == entry_end => key = next,
                _ => {
                    failed = true;
                    break;
                }
            }
        }

        if prepared {
            guard.touch();
        }

        if failed {
            unraise(&mut guard, &raised, user_wire);
            log::warn!(
                "vm_map_pageable: map {} wiring [{:#x}, {:#x}) rolled back",
                map.id.0,
                start,
                end
            );
            return Err(KernError::Failure);
        }
        break to_fault;
    };

    // Entries being faulted in stay in transition until the second pass
    // is done, so that delete and overwrite wait for them.
    for &(entry_start, _) in &to_fault {
        guard.entry_mut(entry_start).flags.insert(EntryFlags::IN_TRANSITION);
    }

    if map.is_kernel_map() {
        drop(guard);
        fault_ranges(map, &to_fault);
    } else {
        let read = guard.downgrade();
        fault_ranges(map, &to_fault);
        drop(read);
    }

    let mut guard = map.write();
    for &(range_start, range_end) in &to_fault {
        let mut cursor = guard.clip_to_start(range_start);
        while let Some(key) = cursor {
            if guard.entry(key).start >= range_end {
                break;
            }
            if guard.entry(key).in_transition() {
                vm_map_entry_end_transition(map, &mut guard, key);
            }
            cursor = guard.next_key(Some(key));
        }
    }
    drop(guard);
    log::debug!("vm_map_pageable: map {} wired [{:#x}, {:#x})", map.id.0, start, end);
    Ok(())
}

/// Fault in the newly wired ranges
///
/// Like `vm_fault_wire` in Mach, a page that cannot be brought in is
/// left unwired in the pmap; the entry keeps its count.
fn fault_ranges(map: &VmMap, ranges: &[(u64, u64)]) {
    for &(start, end) in ranges {
        if let Err(err) = vm_fault_wire(map, start, end) {
            log::warn!(
                "vm_map_pageable: map {} fault on [{:#x}, {:#x}) failed: {}",
                map.id.0,
                start,
                end,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::pmap::pmap_create;
    use crate::mach_vm::vm_map::{vm_map_create, vm_map_enter, VmInherit};
    use alloc::sync::Arc;

    fn map_with(range: &[(u64, u64)]) -> Arc<VmMap> {
        let map = vm_map_create(pmap_create(), 0, 0x100000, true);
        for &(start, size) in range {
            vm_map_enter(
                &map,
                start,
                size,
                0,
                false,
                Some(vm_object_allocate(size)),
                0,
                false,
                VmProt::DEFAULT,
                VmProt::ALL,
                VmInherit::Copy,
            )
            .unwrap();
        }
        map
    }

    #[test]
    fn test_wire_faults_pages_in() {
        let map = map_with(&[(0x1000, 0x2000)]);
        vm_map_pageable(&map, 0x1000, 0x3000, VmProt::READ).unwrap();
        assert_eq!(map.read().entry(0x1000).wired_count, 1);
        assert_eq!(map.pmap().wired_count(), 2);
        let pte = map.pmap().extract(0x2000).unwrap();
        assert_eq!(pte.page.wire_count(), 1);

        vm_map_pageable(&map, 0x1000, 0x3000, VmProt::NONE).unwrap();
        assert_eq!(map.read().entry(0x1000).wired_count, 0);
        assert_eq!(map.pmap().wired_count(), 0);
        assert_eq!(pte.page.wire_count(), 0);
    }

    #[test]
    fn test_unwire_never_wired_has_no_side_effects() {
        let map = map_with(&[(0x1000, 0x2000)]);
        let calls = map.pmap().call_count();
        let ts = map.timestamp();
        assert_eq!(
            vm_map_pageable(&map, 0x1800, 0x2000, VmProt::NONE),
            Err(KernError::Failure)
        );
        assert_eq!(map.pmap().call_count(), calls);
        assert_eq!(map.timestamp(), ts);
        assert_eq!(map.nentries(), 1);
    }

    #[test]
    fn test_wire_hole_rolls_back() {
        let map = map_with(&[(0x1000, 0x1000), (0x3000, 0x1000)]);
        assert_eq!(
            vm_map_pageable(&map, 0x1000, 0x4000, VmProt::READ),
            Err(KernError::Failure)
        );
        let state = map.read();
        assert!(state.entries().all(|e| e.wired_count == 0));
    }

    #[test]
    fn test_wire_unmapped_start_fails() {
        let map = map_with(&[(0x3000, 0x1000)]);
        assert_eq!(
            vm_map_pageable(&map, 0x1000, 0x4000, VmProt::READ),
            Err(KernError::Failure)
        );
    }

    #[test]
    fn test_user_wiring_nests() {
        let map = map_with(&[(0x1000, 0x1000)]);
        vm_map_pageable_user(&map, 0x1000, 0x2000, VmProt::READ).unwrap();
        vm_map_pageable_user(&map, 0x1000, 0x2000, VmProt::READ).unwrap();
        vm_map_pageable(&map, 0x1000, 0x2000, VmProt::READ).unwrap();
        {
            let state = map.read();
            let entry = state.entry(0x1000);
            assert_eq!(entry.wired_count, 2);
            assert_eq!(entry.user_wired_count, 2);
        }
        vm_map_pageable_user(&map, 0x1000, 0x2000, VmProt::NONE).unwrap();
        vm_map_pageable_user(&map, 0x1000, 0x2000, VmProt::NONE).unwrap();
        assert_eq!(
            vm_map_pageable_user(&map, 0x1000, 0x2000, VmProt::NONE),
            Err(KernError::Failure)
        );
        {
            let state = map.read();
            let entry = state.entry(0x1000);
            assert_eq!(entry.wired_count, 1);
            assert_eq!(entry.user_wired_count, 0);
        }
        vm_map_pageable(&map, 0x1000, 0x2000, VmProt::NONE).unwrap();
        assert_eq!(map.read().entry(0x1000).wired_count, 0);
    }

    #[test]
    fn test_kernel_unwire_cannot_take_user_count() {
        let map = map_with(&[(0x1000, 0x1000)]);
        vm_map_pageable_user(&map, 0x1000, 0x2000, VmProt::READ).unwrap();
        assert_eq!(
            vm_map_pageable(&map, 0x1000, 0x2000, VmProt::NONE),
            Err(KernError::Failure)
        );
    }

    #[test]
    fn test_wire_protection_mismatch() {
        let map = map_with(&[(0x1000, 0x1000)]);
        assert_eq!(
            vm_map_pageable(&map, 0x1000, 0x2000, VmProt::EXECUTE),
            Err(KernError::Failure)
        );
    }
}
