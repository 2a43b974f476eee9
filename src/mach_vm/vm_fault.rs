//! VM Fault - Page Fault Handling
//!
//! Based on Mach4 vm/vm_fault.h/c
//!
//! Resolves faults against the memory-backed object model:
//!
//! - **Zero-fill**: no page anywhere in the shadow chain, a fresh page is
//!   inserted in the first object
//! - **Copy-on-write**: a write finds the page in a backing object; the
//!   page is copied into the first object and the original's translations
//!   are flushed
//! - **Busy pages**: the fault waits for the owner and reports `Retry`
//!
//! The map is looked up, then unlocked while the page is resolved; the
//! translation is entered only if [`vm_map_verify`] confirms the map did
//! not change in between.

use alloc::sync::Arc;

use crate::kern::counters;
use crate::kern::kern_return::{KernError, KernResult};
use crate::kern::sched_prim::{clear_wait, thread_block};
use crate::mach_vm::pmap::{pmap_page_protect, Pmap};
use crate::mach_vm::vm_map::{VmMap, VmMapEntry, VmProt};
use crate::mach_vm::vm_map_lookup::{vm_map_lookup, vm_map_verify};
use crate::mach_vm::vm_object::VmObject;
use crate::mach_vm::vm_page::{trunc_page, vm_page_grab, PageFlags, PageRef, PAGE_SIZE};

// ============================================================================
// Fault Result
// ============================================================================

/// Outcome of resolving one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReturn {
    Success,
    /// State changed underneath; look the address up again
    Retry,
    MemoryShortage,
    FictitiousShortage,
    MemoryError,
    Interrupted,
}

impl From<FaultReturn> for KernError {
    fn from(ret: FaultReturn) -> Self {
        match ret {
            FaultReturn::MemoryShortage | FaultReturn::FictitiousShortage => KernError::ResourceShortage,
            FaultReturn::MemoryError => KernError::MemoryError,
            FaultReturn::Success | FaultReturn::Retry | FaultReturn::Interrupted => KernError::Failure,
        }
    }
}

/// A page resolved by [`vm_fault_page`], returned busy
#[derive(Debug)]
pub struct FaultPage {
    pub page: PageRef,
    /// Object holding the page
    pub object: Arc<VmObject>,
    pub offset: u64,
    /// The page belongs to the object the fault started from
    pub in_first_object: bool,
}

// ============================================================================
// Page Resolution
// ============================================================================

/// Find or create the page for `first_offset` in `first_object`
/// (vm_fault_page)
///
/// Walks the shadow chain. A write that finds the page in a backing object
/// pushes a private copy into the first object. The page is returned busy;
/// the caller releases it with `wakeup_done`.
pub fn vm_fault_page(
    first_object: &Arc<VmObject>,
    first_offset: u64,
    fault_type: VmProt,
) -> Result<FaultPage, FaultReturn> {
    let mut object = Arc::clone(first_object);
    let mut offset = first_offset;

    let page = loop {
        if let Some(page) = object.page_lookup(offset) {
            let ticket = page.assert_wait();
            if !page.try_busy() {
                thread_block(ticket);
                counters::C_VM_FAULT_RETRY.inc();
                return Err(FaultReturn::Retry);
            }
            clear_wait(ticket);
            if page.flags().contains(PageFlags::ERROR) {
                page.wakeup_done();
                return Err(FaultReturn::MemoryError);
            }
            break page;
        }
        match object.shadow() {
            Some((shadow, shadow_offset)) => {
                offset += shadow_offset;
                object = shadow;
            }
            None => {
                let page = vm_page_grab();
                page.set_flags(PageFlags::BUSY);
                if !first_object.page_insert(&page, first_offset) {
                    counters::C_VM_FAULT_RETRY.inc();
                    return Err(FaultReturn::Retry);
                }
                page.activate();
                counters::C_VM_FAULT_ZERO_FILL.inc();
                return Ok(FaultPage {
                    page,
                    object: Arc::clone(first_object),
                    offset: first_offset,
                    in_first_object: true,
                });
            }
        }
    };

    if Arc::ptr_eq(&object, first_object) {
        return Ok(FaultPage {
            page,
            object,
            offset,
            in_first_object: true,
        });
    }

    if fault_type.contains(VmProt::WRITE) {
        let copy = vm_page_grab();
        copy.set_flags(PageFlags::BUSY);
        copy.copy_from(&page);
        if !first_object.page_insert(&copy, first_offset) {
            page.wakeup_done();
            counters::C_VM_FAULT_RETRY.inc();
            return Err(FaultReturn::Retry);
        }
        pmap_page_protect(&page, VmProt::NONE);
        page.wakeup_done();
        copy.activate();
        counters::C_VM_FAULT_COW.inc();
        return Ok(FaultPage {
            page: copy,
            object: Arc::clone(first_object),
            offset: first_offset,
            in_first_object: true,
        });
    }

    Ok(FaultPage {
        page,
        object,
        offset,
        in_first_object: false,
    })
}

// ============================================================================
// Map Faults
// ============================================================================

/// Handle a fault at `vaddr` for an access of `fault_type` (vm_fault)
///
/// With `change_wiring` the page is also wired; used by the wiring path.
pub fn vm_fault(map: &VmMap, vaddr: u64, fault_type: VmProt, change_wiring: bool) -> KernResult<()> {
    counters::C_VM_FAULT.inc();
    let vaddr = trunc_page(vaddr);
    loop {
        let lookup = vm_map_lookup(map, vaddr, fault_type)?;
        let access = if lookup.wired { lookup.prot } else { fault_type };

        let result = match vm_fault_page(&lookup.object, lookup.offset, access) {
            Ok(result) => result,
            Err(FaultReturn::Retry) => continue,
            Err(err) => {
                log::warn!("vm_fault: map {} va {:#x}: {:?}", map.id.0, vaddr, err);
                return Err(err.into());
            }
        };

        let mut prot = lookup.prot;
        if !result.in_first_object {
            prot.remove(VmProt::WRITE);
        }

        let Some(_guard) = vm_map_verify(lookup.map(map), lookup.version) else {
            result.page.wakeup_done();
            counters::C_VM_FAULT_RETRY.inc();
            continue;
        };

        map.pmap().enter(vaddr, &result.page, prot, lookup.wired);
        if change_wiring {
            result.page.wire();
        } else {
            result.page.activate();
        }
        result.page.wakeup_done();
        log::trace!("vm_fault: map {} va {:#x} prot {:?}", map.id.0, vaddr, prot);
        return Ok(());
    }
}

/// Fault in and wire every page of `[start, end)` (vm_fault_wire)
pub fn vm_fault_wire(map: &VmMap, start: u64, end: u64) -> KernResult<()> {
    map.pmap().pageable(start, end, false);
    let mut va = start;
    while va < end {
        vm_fault(map, va, VmProt::NONE, true)?;
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Release the wirings of an entry's pages (vm_fault_unwire)
///
/// Pages are found through the entry's object chain so that wirings are
/// released even when the translations are already gone.
pub fn vm_fault_unwire(pmap: &Pmap, entry: &VmMapEntry) {
    let object = entry.object.object();
    let mut va = entry.start;
    while va < entry.end {
        if let Some(object) = object {
            if let Some((page, _, _)) = object.resolve_page(entry.object_offset(va)) {
                page.unwire();
            }
        }
        pmap.change_wiring(va, false);
        va += PAGE_SIZE;
    }
    pmap.pageable(entry.start, entry.end, true);
}

// ============================================================================
// Object-to-Object Copy
// ============================================================================

/// Copy `size` bytes of page data from one object into another
/// (vm_fault_copy)
///
/// Source pages missing from the whole chain read as zeros. Destination
/// pages are resolved for writing, so copy-on-write state in the
/// destination chain is honored.
pub fn vm_fault_copy(
    src_object: Option<&Arc<VmObject>>,
    src_offset: u64,
    dst_object: &Arc<VmObject>,
    dst_offset: u64,
    size: u64,
) -> KernResult<()> {
    let mut done = 0;
    while done < size {
        let dst = match vm_fault_page(dst_object, dst_offset + done, VmProt::WRITE) {
            Ok(dst) => dst,
            Err(FaultReturn::Retry) => continue,
            Err(err) => return Err(err.into()),
        };
        match src_object.and_then(|src| src.resolve_page(src_offset + done)) {
            Some((src_page, _, _)) => dst.page.copy_from(&src_page),
            None => dst.page.zero_fill(),
        }
        dst.page.wakeup_done();
        done += PAGE_SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::pmap::pmap_create;
    use crate::mach_vm::vm_map::{vm_map_create, vm_map_enter, VmInherit};
    use crate::mach_vm::vm_object::{vm_object_allocate, vm_object_shadow};

    #[test]
    fn test_zero_fill_in_first_object() {
        let object = vm_object_allocate(0x2000);
        let result = vm_fault_page(&object, 0x1000, VmProt::READ).unwrap();
        assert!(result.in_first_object);
        assert!(result.page.is_busy());
        result.page.wakeup_done();
        assert!(object.page_lookup(0x1000).is_some());
    }

    #[test]
    fn test_cow_push() {
        let base = vm_object_allocate(0x1000);
        let original = vm_page_grab();
        original.write(0, &[9]);
        base.page_insert(&original, 0);
        let (top, _) = vm_object_shadow(Some(Arc::clone(&base)), 0, 0x1000);

        let read = vm_fault_page(&top, 0, VmProt::READ).unwrap();
        assert!(!read.in_first_object);
        read.page.wakeup_done();

        let write = vm_fault_page(&top, 0, VmProt::WRITE).unwrap();
        assert!(write.in_first_object);
        assert!(!Arc::ptr_eq(&write.page, &original));
        let mut buf = [0u8; 1];
        write.page.read(0, &mut buf);
        assert_eq!(buf, [9]);
        write.page.wakeup_done();
    }

    #[test]
    fn test_busy_page_retries() {
        let object = vm_object_allocate(0x1000);
        let page = vm_page_grab();
        object.page_insert(&page, 0);
        assert!(page.try_busy());
        let other = Arc::clone(&page);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            other.wakeup_done();
        });
        assert_eq!(
            vm_fault_page(&object, 0, VmProt::READ).unwrap_err(),
            FaultReturn::Retry
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_vm_fault_enters_translation() {
        let map = vm_map_create(pmap_create(), 0, 0x100000, true);
        vm_map_enter(
            &map,
            0x4000,
            0x1000,
            0,
            false,
            None,
            0,
            false,
            VmProt::DEFAULT,
            VmProt::ALL,
            VmInherit::Copy,
        )
        .unwrap();
        vm_fault(&map, 0x4010, VmProt::WRITE, false).unwrap();
        let pte = map.pmap().extract(0x4000).unwrap();
        assert_eq!(pte.prot, VmProt::DEFAULT);
        assert!(!pte.wired);
        assert_eq!(
            vm_fault(&map, 0x9000, VmProt::READ, false),
            Err(KernError::InvalidAddress)
        );
    }

    #[test]
    fn test_fault_copy_zero_fills_missing_source() {
        let src = vm_object_allocate(0x2000);
        let page = vm_page_grab();
        page.write(0, &[1, 2]);
        src.page_insert(&page, 0);
        let dst = vm_object_allocate(0x2000);
        vm_fault_copy(Some(&src), 0, &dst, 0, 0x2000).unwrap();
        let mut buf = [0u8; 2];
        dst.page_lookup(0).unwrap().read(0, &mut buf);
        assert_eq!(buf, [1, 2]);
        dst.page_lookup(0x1000).unwrap().read(0, &mut buf);
        assert_eq!(buf, [0, 0]);
    }
}
