//! VM Map Page List - Page-List Copies and Continuations
//!
//! Based on Mach4 vm/vm_map.c (vm_map_copyin_page_list,
//! vm_map_copyout_page_list, vm_map_copy_page_discard)
//!
//! A page-list copy holds up to [`VM_MAP_COPY_PAGE_LIST_MAX`] resident
//! pages, each kept busy while the copy owns it. Longer ranges are
//! produced in batches: a batch that fills up carries a
//! [`PageListContinuation`] that yields the next batch on demand. Closing
//! or dropping a continuation aborts the rest of the transfer, deleting
//! the part of a destroyed source that was already handed out.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::kern::counters;
use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::pmap::pmap_page_protect;
use crate::mach_vm::vm_fault::{vm_fault_page, FaultReturn};
use crate::mach_vm::vm_map::{
    vm_map_delete, vm_map_entry_end_transition, vm_map_find_space, vm_map_remove, EntryFlags,
    EntryObject, VmInherit, VmMap, VmMapEntry, VmProt,
};
use crate::mach_vm::vm_map_copy::{CopyKind, VmMapCopy};
use crate::mach_vm::vm_map_lookup::{vm_map_lookup, vm_map_verify};
use crate::mach_vm::vm_object::{vm_object_allocate, VmObject};
use crate::mach_vm::vm_page::{
    page_end, round_page, trunc_page, vm_page_grab, PageFlags, PageRef, PAGE_SIZE,
};

/// Pages carried by one page-list copy
pub const VM_MAP_COPY_PAGE_LIST_MAX: usize = 64;

pub type PageVec = heapless::Vec<PageRef, VM_MAP_COPY_PAGE_LIST_MAX>;

// ============================================================================
// Page List
// ============================================================================

/// Busy pages owned by a copy, plus the producer of the next batch
#[derive(Debug, Default)]
pub struct PageList {
    pages: PageVec,
    cont: Option<PageListContinuation>,
}

impl PageList {
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[PageRef] {
        &self.pages
    }

    pub fn has_cont(&self) -> bool {
        self.cont.is_some()
    }

    pub(crate) fn take_pages(&mut self) -> PageVec {
        core::mem::take(&mut self.pages)
    }

    pub(crate) fn take_cont(&mut self) -> Option<PageListContinuation> {
        self.cont.take()
    }
}

impl Drop for PageList {
    fn drop(&mut self) {
        while let Some(page) = self.pages.pop() {
            if page.is_tabled() {
                page.activate();
            }
            page.wakeup_done();
        }
    }
}

// ============================================================================
// Continuation
// ============================================================================

#[derive(Debug)]
struct ContArgs {
    src_map: Arc<VmMap>,
    /// Next page to copy
    src_addr: u64,
    src_end: u64,
    /// Start of the source range still to be destroyed
    destroy_start: u64,
    src_destroy: bool,
    steal_pages: bool,
}

/// Producer of the remaining batches of a page-list copy
///
/// Each continuation yields one batch; the batch carries the next
/// continuation if more remains.
#[derive(Debug)]
pub struct PageListContinuation {
    args: Option<ContArgs>,
}

impl PageListContinuation {
    /// Unconsumed source range
    pub fn remaining(&self) -> Option<(u64, u64)> {
        self.args.as_ref().map(|a| (a.src_addr, a.src_end))
    }

    /// Copy in the next batch (vm_map_copyin_page_list_cont)
    pub fn next_batch(mut self) -> KernResult<VmMapCopy> {
        let Some(args) = self.args.take() else {
            return Err(KernError::InvalidArgument);
        };
        counters::C_VM_MAP_PAGE_LIST_CONT.inc();
        let result = copyin_page_batch(
            &args.src_map,
            args.src_addr,
            args.src_end,
            args.destroy_start,
            args.src_destroy,
            args.steal_pages,
        );
        if result.is_err() {
            abort(args);
        }
        result
    }

    /// Abandon the remaining batches
    pub fn close(mut self) {
        if let Some(args) = self.args.take() {
            abort(args);
        }
    }
}

impl Drop for PageListContinuation {
    fn drop(&mut self) {
        if let Some(args) = self.args.take() {
            abort(args);
        }
    }
}

fn abort(args: ContArgs) {
    let done = trunc_page(args.src_addr);
    if args.src_destroy && done > args.destroy_start {
        if let Err(err) = vm_map_remove(&args.src_map, args.destroy_start, done) {
            log::warn!("vm_map_copyin_page_list: abort cleanup failed: {}", err);
        }
    }
    log::debug!(
        "vm_map_copyin_page_list: map {} aborted at {:#x}",
        args.src_map.id.0,
        args.src_addr
    );
}

/// Run the continuation of a page-list copy, if it has one
/// (vm_map_copy_invoke_cont)
pub fn vm_map_copy_invoke_cont(copy: &mut VmMapCopy) -> KernResult<Option<VmMapCopy>> {
    let Some(cont) = copy.page_list_mut().and_then(PageList::take_cont) else {
        return Ok(None);
    };
    cont.next_batch().map(Some)
}

// ============================================================================
// Copyin
// ============================================================================

/// Copy `[src_addr, src_addr + len)` in as busy resident pages
/// (vm_map_copyin_page_list)
///
/// Pages are write-protected in place unless the source is destroyed and
/// privately owned. With `steal_pages` (and `src_destroy`) pages are
/// taken out of their objects where possible instead of being copied.
pub fn vm_map_copyin_page_list(
    src_map: &Arc<VmMap>,
    src_addr: u64,
    len: u64,
    src_destroy: bool,
    steal_pages: bool,
) -> KernResult<VmMapCopy> {
    if len == 0 {
        return Ok(VmMapCopy::new(CopyKind::PageList(PageList::default()), src_addr, 0));
    }
    if page_end(src_addr, len).is_none() {
        return Err(KernError::InvalidAddress);
    }
    copyin_page_batch(
        src_map,
        src_addr,
        src_addr + len,
        trunc_page(src_addr),
        src_destroy,
        steal_pages,
    )
}

/// Where a collected page came from
struct PageSource {
    object: Arc<VmObject>,
    offset: u64,
    /// Held by the mapping's own object and not shared with another map
    private: bool,
}

fn copyin_page_batch(
    src_map: &Arc<VmMap>,
    src_addr: u64,
    src_end: u64,
    destroy_start: u64,
    src_destroy: bool,
    steal_pages: bool,
) -> KernResult<VmMapCopy> {
    let end = round_page(src_end);
    let mut list = PageList::default();
    let mut sources = Vec::new();
    let mut addr = trunc_page(src_addr);

    while addr < end && !list.pages.is_full() {
        let (page, source) = page_list_resolve(src_map, addr)?;
        if !(src_destroy && source.private) {
            pmap_page_protect(&page, VmProt::READ);
        }
        if let Err(page) = list.pages.push(page) {
            page.wakeup_done();
            break;
        }
        sources.push(source);
        addr += PAGE_SIZE;
    }

    if src_destroy && steal_pages {
        steal_or_copy(&mut list, &sources);
    }

    if addr < end {
        list.cont = Some(PageListContinuation {
            args: Some(ContArgs {
                src_map: Arc::clone(src_map),
                src_addr: addr,
                src_end,
                destroy_start,
                src_destroy,
                steal_pages,
            }),
        });
    } else if src_destroy {
        vm_map_remove(src_map, destroy_start, end)?;
    }

    log::debug!(
        "vm_map_copyin_page_list: map {} {} pages from {:#x}{}",
        src_map.id.0,
        list.npages(),
        src_addr,
        if list.has_cont() { " (continued)" } else { "" }
    );
    Ok(VmMapCopy::new(CopyKind::PageList(list), src_addr, src_end - src_addr))
}

/// Fault in one source page and return it busy
fn page_list_resolve(src_map: &VmMap, addr: u64) -> KernResult<(PageRef, PageSource)> {
    loop {
        let lookup = vm_map_lookup(src_map, addr, VmProt::READ)?;
        let result = match vm_fault_page(&lookup.object, lookup.offset, VmProt::READ) {
            Ok(result) => result,
            Err(FaultReturn::Retry) => continue,
            Err(err) => return Err(err.into()),
        };
        if vm_map_verify(lookup.map(src_map), lookup.version).is_none() {
            result.page.wakeup_done();
            continue;
        }
        let source = PageSource {
            object: result.object,
            offset: result.offset,
            private: result.in_first_object && !lookup.shared,
        };
        return Ok((result.page, source));
    }
}

/// Take pages out of their objects, or replace them with private copies
fn steal_or_copy(list: &mut PageList, sources: &[PageSource]) {
    for (slot, source) in list.pages.iter_mut().zip(sources) {
        let object = &source.object;
        let stealable = source.private
            && object.is_temporary()
            && !object.is_shadowed()
            && !object.use_shared_copy()
            && !slot.is_precious();
        if stealable {
            object.page_remove(source.offset);
            pmap_page_protect(slot, VmProt::NONE);
            slot.unwire_all();
            counters::C_VM_MAP_PAGE_STEAL.inc();
        } else {
            let copy = vm_page_grab();
            copy.set_flags(PageFlags::BUSY);
            copy.copy_from(slot);
            let original = core::mem::replace(slot, copy);
            original.wakeup_done();
        }
    }
}

// ============================================================================
// Copyout
// ============================================================================

/// Map the pages of a page-list copy into new space in `dst_map`
/// (vm_map_copyout_page_list)
///
/// Continuations are driven until the whole range is placed. If one
/// fails, the partially filled range is deleted again.
pub(crate) fn vm_map_copyout_page_list(
    dst_map: &VmMap,
    mut list: PageList,
    offset: u64,
    size: u64,
) -> KernResult<u64> {
    if size == 0 {
        return Ok(0);
    }
    let start_off = trunc_page(offset);
    let Some(end_off) = page_end(offset, size) else {
        return Err(KernError::InvalidAddress);
    };
    let total = end_off - start_off;
    let must_wire = dst_map.wiring_required();

    let guard = dst_map.write();
    let (mut guard, found) = vm_map_find_space(dst_map, guard, dst_map.min_offset(), total, 0);
    let (start, prev) = found?;
    let end = start + total;

    // Extend a private anonymous predecessor rather than adding an entry.
    let extendable = prev.and_then(|key| {
        let entry = guard.entry(key);
        let object = entry.object.object()?;
        let compatible = entry.end == start
            && !entry.is_shared()
            && !entry.needs_copy()
            && !entry.in_transition()
            && object.is_temporary()
            && object.ref_count() == 1
            && object.shadow().is_none()
            && object.size() == entry.offset + entry.size()
            && entry.inheritance == VmInherit::default()
            && entry.protection == VmProt::DEFAULT
            && entry.max_protection == VmProt::ALL
            && entry.wired_count == u32::from(must_wire)
            && entry.user_wired_count == 0
            && entry.projected_on.is_none();
        compatible.then(|| (key, Arc::clone(object), entry.offset + entry.size()))
    });

    let (key, object, obj_offset) = match extendable {
        Some((key, object, obj_offset)) => {
            guard.extend_entry(key, end);
            (key, object, obj_offset)
        }
        None => {
            let object = vm_object_allocate(total);
            let mut entry = VmMapEntry::new(guard.header().zone(), start, end);
            entry.object = EntryObject::Object(Arc::clone(&object));
            entry.wired_count = u32::from(must_wire);
            guard.link(entry);
            (start, object, 0)
        }
    };
    guard.entry_mut(key).flags.insert(EntryFlags::IN_TRANSITION);
    guard.set_hint(key);
    drop(guard);

    let result = insert_pages(dst_map, &mut list, &object, start, obj_offset, must_wire);
    drop(list);

    let mut guard = dst_map.write();
    let mut cursor = guard.clip_to_start(key);
    while let Some(k) = cursor {
        if guard.entry(k).start >= end {
            break;
        }
        if guard.entry(k).in_transition() {
            vm_map_entry_end_transition(dst_map, &mut guard, k);
        }
        cursor = guard.next_key(Some(k));
    }

    if let Err(err) = result {
        guard = vm_map_delete(dst_map, guard, start, end);
        drop(guard);
        object.page_remove_range(obj_offset, obj_offset + total);
        log::warn!(
            "vm_map_copyout_page_list: map {} insertion at {:#x} failed: {}",
            dst_map.id.0,
            start,
            err
        );
        return Err(err);
    }
    drop(guard);
    log::debug!("vm_map_copyout_page_list: map {} at {:#x} size {:#x}", dst_map.id.0, start, total);
    Ok(start + (offset - start_off))
}

fn insert_pages(
    dst_map: &VmMap,
    list: &mut PageList,
    object: &Arc<VmObject>,
    start: u64,
    obj_offset: u64,
    must_wire: bool,
) -> KernResult<()> {
    let mut va = start;
    let mut offset = obj_offset;
    loop {
        let mut pages = list.take_pages().into_iter();
        while let Some(page) = pages.next() {
            let page = if page.is_tabled() {
                let copy = vm_page_grab();
                copy.set_flags(PageFlags::BUSY);
                copy.copy_from(&page);
                page.wakeup_done();
                copy
            } else {
                page
            };
            if !object.page_insert(&page, offset) {
                page.wakeup_done();
                // The rest are released when the list is dropped.
                list.pages.extend(pages);
                return Err(KernError::Failure);
            }
            dst_map.pmap().enter(va, &page, VmProt::DEFAULT, must_wire);
            if must_wire {
                page.wire();
            } else {
                page.activate();
            }
            page.wakeup_done();
            va += PAGE_SIZE;
            offset += PAGE_SIZE;
        }

        let Some(cont) = list.take_cont() else {
            return Ok(());
        };
        let mut next = cont.next_batch()?;
        match next.take_kind() {
            CopyKind::PageList(next_list) => *list = next_list,
            _ => return Err(KernError::InvalidArgument),
        }
    }
}
