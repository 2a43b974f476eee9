//! Mach_R VM Map - Mach virtual memory address maps
//!
//! This crate implements the Mach address map: the ordered set of entries
//! describing a task's virtual address space, the copy-object machinery
//! used to move memory between maps, wiring, and copy-on-write fork.
//! Objects, pages, pmaps and the fault handler are kept in memory so that
//! every map operation can be exercised end to end.

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Map entry points mirror the Mach argument lists
#![allow(clippy::too_many_arguments)]

// Standard library replacement for no_std
extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod kern;
pub mod mach_vm;

pub use kern::kern_return::{KernError, KernResult, KernReturn};
pub use mach_vm::vm_map::{VmInherit, VmMap, VmProt};

/// Create the kernel map and the map zones
pub fn init() {
    mach_vm::init();
    log::info!("mach_vm_map: kernel map {}", mach_vm::vm_map::kernel_map().id.0);
}
