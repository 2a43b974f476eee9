//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem.
//! Address maps and the collaborators they drive:
//! - vm_map: Address maps, entries, enter/delete/protect/inherit
//! - vm_map_lookup: Fault-time resolution and version checks
//! - vm_map_pageable: Wiring and unwiring
//! - vm_map_copy: Copy objects, copyin/copyout/overwrite
//! - vm_map_page_list: Page-list copies and continuations
//! - vm_map_fork: Address space duplication
//! - vm_fault: Page fault handling
//! - vm_object: Memory objects and shadow chains
//! - vm_page: Resident pages
//! - pmap: Physical map (translation bookkeeping)
//! - vm_user: Mach VM system calls

pub mod pmap;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_map_copy;
pub mod vm_map_fork;
pub mod vm_map_lookup;
pub mod vm_map_page_list;
pub mod vm_map_pageable;
pub mod vm_object;
pub mod vm_page;
pub mod vm_user;

pub use pmap::{pmap_create, pmap_find, Pmap, PmapId};
pub use vm_map::{
    kernel_map, vm_map_create, vm_map_enter, vm_map_protect, vm_map_remove, EntryFlags, VmInherit,
    VmMap, VmMapEntry, VmMapId, VmProt,
};
pub use vm_map_copy::{vm_map_copy_discard, vm_map_copyin, vm_map_copyout, VmMapCopy};
pub use vm_map_fork::vm_map_fork;
pub use vm_map_lookup::{vm_map_lookup, vm_map_verify};
pub use vm_map_pageable::{vm_map_pageable, vm_map_pageable_user};
pub use vm_object::{ObjectFlags, VmObject, VmObjectId};
pub use vm_page::{PageFlags, VmPage, PAGE_SIZE};

/// Initialize the Mach VM subsystem
pub fn init() {
    vm_map::vm_map_init();
}
