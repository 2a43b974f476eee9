//! VM Map Lookup - Fault-Time Address Resolution
//!
//! Based on Mach4 vm/vm_map.c (vm_map_lookup, vm_map_verify)
//!
//! Resolves a faulting address to the object and offset that back it.
//! Copy-on-write shadows and zero-fill objects are created here on demand,
//! under an upgraded map lock. The lookup returns a [`MapVersion`]; the
//! fault handler drops every lock while it works on the page and checks
//! the version with [`vm_map_verify`] before entering a translation.

use alloc::sync::Arc;

use crate::kern::counters;
use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_map::{
    EntryLookup, EntryObject, MapReadGuard, MapUpgradableGuard, MapVersion, MapWriteGuard, VmMap,
    VmProt,
};
use crate::mach_vm::vm_object::{vm_object_allocate, vm_object_shadow, VmObject};

/// Outcome of a successful [`vm_map_lookup`]
#[derive(Debug)]
pub struct LookupResult {
    /// Nested map the address resolved in; `None` for the map passed in
    pub submap: Option<Arc<VmMap>>,
    /// Version of the map holding the entry
    pub version: MapVersion,
    pub object: Arc<VmObject>,
    pub offset: u64,
    /// Protection to enter the translation with
    pub prot: VmProt,
    /// The entry is wired; the fault must use `prot` as its access type
    pub wired: bool,
    /// The entry's object is shared with another map
    pub shared: bool,
}

impl LookupResult {
    /// The map whose version was recorded
    pub fn map<'a>(&'a self, top: &'a VmMap) -> &'a VmMap {
        self.submap.as_deref().unwrap_or(top)
    }
}

/// Try to take the write lock; `None` means the caller must start over
fn lock_upgrade(guard: MapUpgradableGuard<'_>) -> Option<MapWriteGuard<'_>> {
    match guard.try_upgrade() {
        Ok(write) => Some(write),
        Err(guard) => {
            drop(guard);
            counters::C_VM_MAP_LOOKUP_UPGRADE_RETRY.inc();
            log::warn!("vm_map_lookup: lock upgrade failed, retrying");
            None
        }
    }
}

/// Resolve `vaddr` for an access of `fault_type` (vm_map_lookup)
pub fn vm_map_lookup(map: &VmMap, vaddr: u64, fault_type: VmProt) -> KernResult<LookupResult> {
    let mut submap: Option<Arc<VmMap>> = None;
    let mut vaddr = vaddr;

    loop {
        let current: &VmMap = submap.as_deref().unwrap_or(map);
        let guard = current.upgradeable_read();
        let key = match guard.lookup_entry(vaddr) {
            EntryLookup::Contained(key) => key,
            EntryLookup::Preceding(_) => return Err(KernError::InvalidAddress),
        };
        let entry = guard.entry(key);
        log::trace!("vm_map_lookup: map {} {:#x} -> {}", current.id.0, vaddr, entry);

        if let EntryObject::SubMap(nested) = &entry.object {
            let nested = Arc::clone(nested);
            vaddr = entry.object_offset(vaddr);
            drop(guard);
            submap = Some(nested);
            continue;
        }

        let mut prot = entry.protection;
        if !prot.contains(fault_type) {
            return Err(if prot.contains(VmProt::NOTIFY) && fault_type.contains(VmProt::WRITE) {
                KernError::WriteProtectionFailure
            } else {
                KernError::ProtectionFailure
            });
        }

        let wired = entry.wired_count != 0;
        let fault_type = if wired { prot } else { fault_type };

        if entry.needs_copy() {
            if fault_type.contains(VmProt::WRITE) {
                let Some(mut write) = lock_upgrade(guard) else {
                    continue;
                };
                let entry = write.entry_mut(key);
                let (shadow, offset) =
                    vm_object_shadow(entry.object.object().cloned(), entry.offset, entry.size());
                entry.object = EntryObject::Object(shadow);
                entry.offset = offset;
                entry.set_needs_copy(false);
                write.touch();
                continue;
            }
            prot.remove(VmProt::WRITE);
        }

        let Some(object) = entry.object.object().cloned() else {
            let Some(mut write) = lock_upgrade(guard) else {
                continue;
            };
            let entry = write.entry_mut(key);
            entry.object = EntryObject::Object(vm_object_allocate(entry.size()));
            entry.offset = 0;
            write.touch();
            continue;
        };

        let offset = entry.object_offset(vaddr);
        let shared = entry.is_shared();
        let version = guard.version();
        drop(guard);
        return Ok(LookupResult {
            submap,
            version,
            object,
            offset,
            prot: prot - VmProt::NOTIFY,
            wired,
            shared,
        });
    }
}

/// Check that `map` has not changed since `version` was taken
/// (vm_map_verify); on success the map stays read-locked
pub fn vm_map_verify(map: &VmMap, version: MapVersion) -> Option<MapReadGuard<'_>> {
    let guard = map.read();
    if guard.version() == version {
        Some(guard)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::pmap::pmap_create;
    use crate::mach_vm::vm_map::{vm_map_create, vm_map_enter, vm_map_protect, vm_map_submap, VmInherit};

    fn map_with_entry(needs_copy: bool, object: Option<Arc<VmObject>>) -> Arc<VmMap> {
        let map = vm_map_create(pmap_create(), 0, 0x100000, true);
        vm_map_enter(
            &map,
            0x1000,
            0x2000,
            0,
            false,
            object,
            0,
            needs_copy,
            VmProt::DEFAULT,
            VmProt::ALL,
            VmInherit::Copy,
        )
        .unwrap();
        map
    }

    #[test]
    fn test_lookup_allocates_zero_fill_object() {
        let map = map_with_entry(false, None);
        let ts = map.timestamp();
        let result = vm_map_lookup(&map, 0x2000, VmProt::READ).unwrap();
        assert_eq!(result.offset, 0x1000);
        assert_eq!(result.prot, VmProt::DEFAULT);
        assert_eq!(map.timestamp(), ts + 1);
        assert!(vm_map_verify(&map, result.version).is_some());
    }

    #[test]
    fn test_read_fault_on_copy_strips_write() {
        let object = vm_object_allocate(0x2000);
        let map = map_with_entry(true, Some(Arc::clone(&object)));
        let result = vm_map_lookup(&map, 0x1000, VmProt::READ).unwrap();
        assert!(Arc::ptr_eq(&result.object, &object));
        assert_eq!(result.prot, VmProt::READ);
    }

    #[test]
    fn test_write_fault_on_copy_shadows() {
        let object = vm_object_allocate(0x2000);
        let map = map_with_entry(true, Some(Arc::clone(&object)));
        let result = vm_map_lookup(&map, 0x1000, VmProt::WRITE).unwrap();
        assert!(!Arc::ptr_eq(&result.object, &object));
        let (shadowed, _) = result.object.shadow().unwrap();
        assert!(Arc::ptr_eq(&shadowed, &object));
        assert!(!map.read().entry(0x1000).needs_copy());
    }

    #[test]
    fn test_protection_failures() {
        let map = map_with_entry(false, None);
        vm_map_protect(&map, 0x1000, 0x3000, VmProt::READ, false).unwrap();
        assert_eq!(
            vm_map_lookup(&map, 0x1000, VmProt::WRITE).unwrap_err(),
            KernError::ProtectionFailure
        );
        vm_map_protect(&map, 0x1000, 0x3000, VmProt::READ | VmProt::NOTIFY, false).unwrap();
        assert_eq!(
            vm_map_lookup(&map, 0x1000, VmProt::WRITE).unwrap_err(),
            KernError::WriteProtectionFailure
        );
        assert_eq!(
            vm_map_lookup(&map, 0x8000, VmProt::READ).unwrap_err(),
            KernError::InvalidAddress
        );
    }

    #[test]
    fn test_lookup_descends_submap() {
        let top = map_with_entry(false, None);
        let sub = vm_map_create(pmap_create(), 0, 0x100000, true);
        let object = vm_object_allocate(0x1000);
        vm_map_enter(
            &sub,
            0x1000,
            0x1000,
            0,
            false,
            Some(Arc::clone(&object)),
            0,
            false,
            VmProt::DEFAULT,
            VmProt::ALL,
            VmInherit::Copy,
        )
        .unwrap();
        let entry_offset = top.read().entry(0x1000).offset;
        assert_eq!(entry_offset, 0);
        vm_map_submap(&top, 0x1000, 0x3000, &sub).unwrap();
        let result = vm_map_lookup(&top, 0x2000, VmProt::READ).unwrap();
        assert!(Arc::ptr_eq(&result.object, &object));
        assert_eq!(result.map(&top).id, sub.id);
    }

    #[test]
    fn test_verify_detects_change() {
        let map = map_with_entry(false, Some(vm_object_allocate(0x2000)));
        let result = vm_map_lookup(&map, 0x1000, VmProt::READ).unwrap();
        crate::mach_vm::vm_map::vm_map_clip_start(&map, 0x2000);
        assert!(vm_map_verify(&map, result.version).is_none());
    }
}
