//! VM User Interface - Mach VM System Calls
//!
//! Based on Mach4 vm/vm_user.c
//!
//! The user-facing VM operations, as reached through Mach IPC. Each call
//! rounds its range to page boundaries, forwards to the map layer and
//! folds the outcome into a Mach return code.
//!
//! ## Key Operations
//!
//! - `vm_allocate`: Allocate zero-fill memory in a task's address space
//! - `vm_deallocate`: Release a range
//! - `vm_protect`: Change current or maximum protection
//! - `vm_inherit`: Set inheritance for fork
//! - `vm_read`: Snapshot memory into a copy object
//! - `vm_write`: Overwrite memory with a copy object
//! - `vm_copy`: Copy memory within a task
//! - `vm_region`: Query information about a memory region
//! - `vm_wire`: Wire or unwire memory on behalf of the user

use crate::kern::kern_return::{
    kern_return, KernReturn, KERN_INVALID_ADDRESS, KERN_INVALID_ARGUMENT, KERN_SUCCESS,
};
use crate::mach_vm::pmap::{MachineAttribute, MachineAttributeVal};
use crate::mach_vm::vm_map::{
    vm_map_enter, vm_map_inherit, vm_map_machine_attribute, vm_map_protect, vm_map_region,
    vm_map_remove, VmInherit, VmMap, VmProt, VmRegionInfo,
};
use crate::mach_vm::vm_map_copy::{vm_map_copy_overwrite, vm_map_copyin, VmMapCopy};
use crate::mach_vm::vm_map_pageable::vm_map_pageable_user;
use crate::mach_vm::vm_page::{page_end, trunc_page};

/// Page-rounded bounds of `[address, address + size)`
fn page_range(address: u64, size: u64) -> Option<(u64, u64)> {
    Some((trunc_page(address), page_end(address, size)?))
}

// ============================================================================
// Allocation
// ============================================================================

/// Allocate zero-fill memory
///
/// With `anywhere` the kernel picks the address and stores it in
/// `address`; otherwise `address` (truncated to a page) is used as is.
pub fn vm_allocate(map: &VmMap, address: &mut u64, size: u64, anywhere: bool) -> KernReturn {
    if size == 0 {
        *address = 0;
        return KERN_SUCCESS;
    }
    let start = if anywhere {
        trunc_page(map.min_offset())
    } else {
        trunc_page(*address)
    };
    let Some((_, size)) = page_range(0, size) else {
        return KERN_INVALID_ADDRESS;
    };
    let result = vm_map_enter(
        map,
        start,
        size,
        0,
        anywhere,
        None,
        0,
        false,
        VmProt::DEFAULT,
        VmProt::ALL,
        VmInherit::default(),
    );
    if let Ok(addr) = result {
        *address = addr;
    }
    kern_return(&result)
}

/// Release `[address, address + size)`
pub fn vm_deallocate(map: &VmMap, address: u64, size: u64) -> KernReturn {
    if size == 0 {
        return KERN_SUCCESS;
    }
    let Some((start, end)) = page_range(address, size) else {
        return KERN_INVALID_ADDRESS;
    };
    kern_return(&vm_map_remove(map, start, end))
}

// ============================================================================
// Attributes
// ============================================================================

/// Set the current protection, or the maximum with `set_maximum`
pub fn vm_protect(map: &VmMap, address: u64, size: u64, set_maximum: bool, new_protection: VmProt) -> KernReturn {
    let Some((start, end)) = page_range(address, size) else {
        return KERN_INVALID_ADDRESS;
    };
    kern_return(&vm_map_protect(map, start, end, new_protection, set_maximum))
}

/// Set the inheritance used by a later fork
pub fn vm_inherit(map: &VmMap, address: u64, size: u64, new_inheritance: VmInherit) -> KernReturn {
    let Some((start, end)) = page_range(address, size) else {
        return KERN_INVALID_ADDRESS;
    };
    kern_return(&vm_map_inherit(map, start, end, new_inheritance))
}

/// Describe the region containing or following `address`, which is
/// updated to the region's start
pub fn vm_region(map: &VmMap, address: &mut u64) -> Result<VmRegionInfo, KernReturn> {
    match vm_map_region(map, *address) {
        Ok(info) => {
            *address = info.start;
            Ok(info)
        }
        Err(err) => Err(err.code()),
    }
}

/// Wire (`access` non-empty) or unwire a range for the user
pub fn vm_wire(map: &VmMap, address: u64, size: u64, access: VmProt) -> KernReturn {
    if access.contains(VmProt::NOTIFY) {
        return KERN_INVALID_ARGUMENT;
    }
    let Some((start, end)) = page_range(address, size) else {
        return KERN_INVALID_ADDRESS;
    };
    kern_return(&vm_map_pageable_user(map, start, end, access))
}

/// Query or set a machine attribute; `value` is updated with the result
pub fn vm_machine_attribute(
    map: &VmMap,
    address: u64,
    size: u64,
    attribute: MachineAttribute,
    value: &mut MachineAttributeVal,
) -> KernReturn {
    let result = vm_map_machine_attribute(map, address, size, attribute, *value);
    if let Ok(out) = result {
        *value = out;
    }
    kern_return(&result)
}

// ============================================================================
// Data Transfer
// ============================================================================

/// Snapshot `[address, address + size)` into a copy object
pub fn vm_read(map: &VmMap, address: u64, size: u64) -> Result<VmMapCopy, KernReturn> {
    vm_map_copyin(map, address, size, false).map_err(|err| err.code())
}

/// Overwrite memory at `address` with `data`
pub fn vm_write(map: &VmMap, address: u64, data: VmMapCopy) -> KernReturn {
    kern_return(&vm_map_copy_overwrite(map, address, data, false))
}

/// Copy `size` bytes from `source_address` to `dest_address` in one map
pub fn vm_copy(map: &VmMap, source_address: u64, size: u64, dest_address: u64) -> KernReturn {
    let result = vm_map_copyin(map, source_address, size, false)
        .and_then(|copy| vm_map_copy_overwrite(map, dest_address, copy, false));
    kern_return(&result)
}
