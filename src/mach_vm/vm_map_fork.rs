//! VM Map Fork - Address Space Duplication
//!
//! Based on Mach4 vm/vm_map.c (vm_map_fork)
//!
//! Builds a child map from a parent according to each entry's
//! inheritance:
//!
//! - `None`: the range is left out of the child
//! - `Share`: both maps reference one object; the parent's translations
//!   are copied into the child's pmap
//! - `Copy`: the child gets a copy-on-write snapshot, negotiated cheaply
//!   when the object allows it and copied through `vm_map_copyin`
//!   otherwise

use alloc::sync::Arc;

use crate::kern::counters;
use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::pmap::pmap_create;
use crate::mach_vm::vm_map::{
    vm_map_create, EntryFlags, EntryObject, MapWriteGuard, VmInherit, VmMap, VmMapEntry, VmProt,
};
use crate::mach_vm::vm_map_copy::{vm_map_copyin, CopyKind};
use crate::mach_vm::vm_object::{
    vm_object_allocate, vm_object_copy_temporary, vm_object_shadow, ObjectFlags,
};

/// Create the child of `old_map` (vm_map_fork)
pub fn vm_map_fork(old_map: &VmMap) -> KernResult<Arc<VmMap>> {
    let new_map = vm_map_create(
        pmap_create(),
        old_map.min_offset(),
        old_map.max_offset(),
        old_map.entries_pageable(),
    );

    let mut guard = old_map.write();
    let mut cursor = guard.next_key(None);
    while let Some(key) = cursor {
        let entry = guard.entry(key);
        // Nested maps cannot be copied; the child shares them.
        let inheritance = match entry.inheritance {
            VmInherit::Copy if entry.is_sub_map() => VmInherit::Share,
            other => other,
        };
        match inheritance {
            VmInherit::None => {
                cursor = guard.next_key(Some(key));
            }
            VmInherit::Share => {
                fork_share(old_map, &mut guard, key, &new_map);
                cursor = guard.next_key(Some(key));
            }
            VmInherit::Copy => {
                if fork_copy_quick(old_map, &mut guard, key, &new_map) {
                    cursor = guard.next_key(Some(key));
                } else {
                    let end = guard.entry(key).end;
                    guard = fork_copy_slow(old_map, guard, key, &new_map)?;
                    cursor = guard.clip_to_start(end);
                }
            }
        }
    }
    drop(guard);

    log::debug!(
        "vm_map_fork: map {} -> map {} ({} entries, size {:#x})",
        old_map.id.0,
        new_map.id.0,
        new_map.nentries(),
        new_map.size()
    );
    Ok(new_map)
}

/// Prepare a child copy of a parent entry
fn child_entry(entry: &VmMapEntry, new_map: &VmMap) -> VmMapEntry {
    let mut child = entry.duplicate();
    child.rezone(new_map.read().header().zone());
    child.wired_count = 0;
    child.user_wired_count = 0;
    child.projected_on = None;
    child.flags.remove(EntryFlags::IN_TRANSITION | EntryFlags::NEEDS_WAKEUP);
    child
}

// ============================================================================
// Share
// ============================================================================

fn fork_share(old_map: &VmMap, guard: &mut MapWriteGuard<'_>, key: u64, new_map: &VmMap) {
    let entry = guard.entry_mut(key);

    if let EntryObject::SubMap(_) = entry.object {
        let child = child_entry(entry, new_map);
        new_map.write().link(child);
        counters::C_VM_MAP_FORK_SHARE.inc();
        return;
    }

    // Give the entry an object of its own that both maps can later copy
    // on write independently.
    let mut changed = false;
    match entry.object.object().cloned() {
        None => {
            entry.object = EntryObject::Object(vm_object_allocate(entry.size()));
            entry.offset = 0;
            changed = true;
        }
        Some(object) => {
            let oversized = object.is_temporary()
                && object.is_shadowed()
                && object.size() > entry.size();
            if entry.needs_copy() || oversized {
                let (shadow, offset) = vm_object_shadow(Some(object), entry.offset, entry.size());
                entry.object = EntryObject::Object(shadow);
                entry.offset = offset;
                entry.set_needs_copy(false);
                if entry.protection.contains(VmProt::WRITE) {
                    old_map
                        .pmap()
                        .protect(entry.start, entry.end, entry.protection - VmProt::WRITE);
                }
                changed = true;
            }
        }
    }

    if let Some(object) = entry.object.object() {
        object.set_flags(ObjectFlags::USE_SHARED_COPY);
    }
    entry.set_shared(true);
    let (start, size) = (entry.start, entry.size());
    let child = child_entry(entry, new_map);
    if changed {
        guard.touch();
    }

    new_map.write().link(child);
    new_map.pmap().copy_from(old_map.pmap(), start, size, start);
    counters::C_VM_MAP_FORK_SHARE.inc();
}

// ============================================================================
// Copy
// ============================================================================

/// Symmetric copy-on-write of an unwired temporary entry; `false` when
/// the entry needs a real copy
fn fork_copy_quick(old_map: &VmMap, guard: &mut MapWriteGuard<'_>, key: u64, new_map: &VmMap) -> bool {
    let entry = guard.entry(key);
    if entry.wired_count != 0 || entry.is_sub_map() {
        return false;
    }
    let object = entry.object.object().cloned();
    let Some(needs) = vm_object_copy_temporary(object.as_ref()) else {
        return false;
    };

    let mut child = child_entry(entry, new_map);
    child.set_shared(false);
    child.set_needs_copy(entry.needs_copy() || needs.dst_needs_copy);

    if needs.src_needs_copy && !entry.needs_copy() {
        let prot = entry.protection - VmProt::WRITE - VmProt::NOTIFY;
        match (entry.is_shared(), &object) {
            (true, Some(object)) => object.pmap_protect(entry.offset, entry.offset + entry.size(), prot),
            _ => old_map.pmap().protect(entry.start, entry.end, prot),
        }
        guard.entry_mut(key).set_needs_copy(true);
        guard.touch();
    }

    new_map.write().link(child);
    counters::C_VM_MAP_FORK_COPY_QUICK.inc();
    true
}

/// Copy the entry's range through `vm_map_copyin` with the parent
/// unlocked, then re-take the parent lock
fn fork_copy_slow<'a>(
    old_map: &'a VmMap,
    guard: MapWriteGuard<'a>,
    key: u64,
    new_map: &VmMap,
) -> KernResult<MapWriteGuard<'a>> {
    let entry = guard.entry(key);
    let (start, size) = (entry.start, entry.size());
    drop(guard);

    let result = vm_map_copyin(old_map, start, size, false);
    let mut copy = match result {
        Ok(copy) => copy,
        Err(err) => {
            log::warn!(
                "vm_map_fork: map {} copy of [{:#x}, {:#x}) failed: {}",
                old_map.id.0,
                start,
                start + size,
                err
            );
            return Err(KernError::Failure);
        }
    };

    let CopyKind::EntryList(mut header) = copy.take_kind() else {
        return Err(KernError::Failure);
    };
    let mut child = new_map.write();
    let zone = child.header().zone();
    let mut entries = header.drain();
    for entry in &mut entries {
        entry.rezone(zone);
    }
    child.link_chain(entries);
    drop(child);
    counters::C_VM_MAP_FORK_COPY_SLOW.inc();

    Ok(old_map.write())
}
