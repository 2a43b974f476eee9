//! Copyin/Copyout - Map-Relative Data Transfer
//!
//! Based on Mach4 kern/kern_subr.c and machine/copyio.c
//!
//! Copies bytes between a kernel buffer and an address range of a map.
//! The transfer goes page by page through the map's pmap; a page that is
//! not mapped with the needed access is faulted in first, exactly as a
//! user access would be. Copy-on-write therefore behaves the same for
//! these routines as for the task itself.

use core::ops::Range;

use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_fault::vm_fault;
use crate::mach_vm::vm_map::{VmMap, VmProt};
use crate::mach_vm::vm_page::{trunc_page, VmPage, PAGE_MASK, PAGE_SIZE};

/// Maximum size for a single copy operation
pub const COPYIO_MAX_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Page Walk
// ============================================================================

/// Visit each page of `[addr, addr + len)` mapped with `access`, faulting
/// pages in as needed
fn for_each_page<F>(map: &VmMap, addr: u64, len: usize, access: VmProt, mut visit: F) -> KernResult<()>
where
    F: FnMut(&VmPage, usize, Range<usize>),
{
    if len > COPYIO_MAX_SIZE {
        return Err(KernError::InvalidArgument);
    }
    addr.checked_add(len as u64).ok_or(KernError::InvalidAddress)?;

    let mut done = 0usize;
    while done < len {
        let va = addr + done as u64;
        let page_offset = (va & PAGE_MASK) as usize;
        let chunk = (len - done).min(PAGE_SIZE as usize - page_offset);
        let page = loop {
            match map.pmap().extract(trunc_page(va)) {
                Some(pte) if pte.prot.contains(access) => break pte.page,
                _ => vm_fault(map, va, access, false)?,
            }
        };
        visit(&*page, page_offset, done..done + chunk);
        done += chunk;
    }
    Ok(())
}

// ============================================================================
// Copyin - Map -> Kernel
// ============================================================================

/// Copy `buf.len()` bytes at `addr` in `map` into `buf`
pub fn copyin(map: &VmMap, addr: u64, buf: &mut [u8]) -> KernResult<()> {
    let len = buf.len();
    for_each_page(map, addr, len, VmProt::READ, |page, offset, range| {
        page.read(offset, &mut buf[range]);
    })
}

/// Fetch a 32-bit word
pub fn fuword32(map: &VmMap, addr: u64) -> KernResult<u32> {
    let mut bytes = [0u8; 4];
    copyin(map, addr, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Fetch a 64-bit word
pub fn fuword64(map: &VmMap, addr: u64) -> KernResult<u64> {
    let mut bytes = [0u8; 8];
    copyin(map, addr, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

// ============================================================================
// Copyout - Kernel -> Map
// ============================================================================

/// Copy `data` to `addr` in `map`
pub fn copyout(data: &[u8], map: &VmMap, addr: u64) -> KernResult<()> {
    for_each_page(map, addr, data.len(), VmProt::WRITE, |page, offset, range| {
        page.write(offset, &data[range]);
    })
}

/// Store a 32-bit word
pub fn suword32(map: &VmMap, addr: u64, value: u32) -> KernResult<()> {
    copyout(&value.to_le_bytes(), map, addr)
}

/// Store a 64-bit word
pub fn suword64(map: &VmMap, addr: u64, value: u64) -> KernResult<()> {
    copyout(&value.to_le_bytes(), map, addr)
}
