//! VM Map Copy - Map-Independent Snapshots
//!
//! Based on Mach4 vm/vm_map.h/c (vm_map_copy_t and the copyin/copyout
//! family)
//!
//! A [`VmMapCopy`] carries a byte range out of one map and into another
//! without both maps being locked at once. It comes in three forms:
//!
//! - **Entry list**: an orphan header of entries whose objects hold the
//!   data, built by `vm_map_copyin`
//! - **Object**: one object range, built by `vm_map_copyin_object`
//! - **Page list**: busy resident pages, built by
//!   `vm_map_copyin_page_list` (see `vm_map_page_list`)
//!
//! Copies are consumed by `vm_map_copyout` or `vm_map_copy_overwrite`;
//! dropping one (`vm_map_copy_discard`) releases everything it holds.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::kern::counters;
use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_fault::{vm_fault_copy, vm_fault_unwire, vm_fault_wire};
use crate::mach_vm::vm_map::{
    vm_map_delete, vm_map_entry_wait, vm_map_find_space, vm_map_enter, vm_map_zones, EntryFlags,
    EntryLookup, EntryObject, EntryZone, MapHeader, MapWriteGuard, VmInherit, VmMap, VmMapEntry,
    VmProt,
};
use crate::mach_vm::vm_map_page_list::{vm_map_copyout_page_list, PageList};
use crate::mach_vm::vm_object::{
    vm_object_allocate, vm_object_copy_slowly, vm_object_copy_strategically,
    vm_object_copy_temporary, vm_object_shadow, VmObject,
};
use crate::mach_vm::vm_page::{page_aligned, page_end, round_page, trunc_page, PAGE_MASK};

// ============================================================================
// Copy Object
// ============================================================================

/// Representation of the copied data
#[derive(Debug)]
pub enum CopyKind {
    EntryList(MapHeader),
    Object(Option<Arc<VmObject>>),
    PageList(PageList),
}

/// A transferable snapshot of a byte range
///
/// `offset` and `size` describe the logical range, which may begin and
/// end inside a page.
#[derive(Debug)]
pub struct VmMapCopy {
    kind: CopyKind,
    pub offset: u64,
    pub size: u64,
}

impl VmMapCopy {
    pub(crate) fn new(kind: CopyKind, offset: u64, size: u64) -> Self {
        if let Err(err) = vm_map_zones().copy_zone.zalloc() {
            panic!("vm_map_copy: {}", err);
        }
        Self { kind, offset, size }
    }

    /// A copy holding nothing
    pub fn empty() -> Self {
        Self::new(CopyKind::Object(None), 0, 0)
    }

    pub fn kind(&self) -> &CopyKind {
        &self.kind
    }

    pub fn is_entry_list(&self) -> bool {
        matches!(self.kind, CopyKind::EntryList(_))
    }

    pub fn is_page_list(&self) -> bool {
        matches!(self.kind, CopyKind::PageList(_))
    }

    /// Entries of an entry-list copy
    pub fn header(&self) -> Option<&MapHeader> {
        match &self.kind {
            CopyKind::EntryList(header) => Some(header),
            _ => None,
        }
    }

    pub fn page_list(&self) -> Option<&PageList> {
        match &self.kind {
            CopyKind::PageList(list) => Some(list),
            _ => None,
        }
    }

    pub(crate) fn page_list_mut(&mut self) -> Option<&mut PageList> {
        match &mut self.kind {
            CopyKind::PageList(list) => Some(list),
            _ => None,
        }
    }

    /// Move the contents out, leaving an empty object copy behind
    pub(crate) fn take_kind(&mut self) -> CopyKind {
        core::mem::replace(&mut self.kind, CopyKind::Object(None))
    }
}

impl Drop for VmMapCopy {
    fn drop(&mut self) {
        vm_map_zones().copy_zone.zfree();
    }
}

impl fmt::Display for VmMapCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CopyKind::EntryList(header) => {
                writeln!(
                    f,
                    "copy entry list: offset={:#x} size={:#x} nentries={}",
                    self.offset,
                    self.size,
                    header.nentries()
                )?;
                for entry in header.iter() {
                    writeln!(f, "  {}", entry)?;
                }
                Ok(())
            }
            CopyKind::Object(object) => writeln!(
                f,
                "copy object: offset={:#x} size={:#x} object={:?}",
                self.offset,
                self.size,
                object.as_ref().map(|o| o.id.0)
            ),
            CopyKind::PageList(list) => writeln!(
                f,
                "copy page list: offset={:#x} size={:#x} npages={} cont={}",
                self.offset,
                self.size,
                list.npages(),
                list.has_cont()
            ),
        }
    }
}

/// Log a copy (vm_map_copy_print)
pub fn vm_map_copy_print(copy: &VmMapCopy) {
    log::info!("{}", copy);
}

/// Release a copy and everything it holds (vm_map_copy_discard)
///
/// A page-list continuation is aborted.
pub fn vm_map_copy_discard(copy: VmMapCopy) {
    drop(copy);
}

/// Move the contents of `copy` into a new copy, leaving `copy` empty
/// (vm_map_copy_copy)
pub fn vm_map_copy_copy(copy: &mut VmMapCopy) -> VmMapCopy {
    let kind = copy.take_kind();
    let new_copy = VmMapCopy::new(kind, copy.offset, copy.size);
    copy.offset = 0;
    copy.size = 0;
    new_copy
}

/// Wrap an object range in a copy (vm_map_copyin_object)
pub fn vm_map_copyin_object(object: Arc<VmObject>, offset: u64, size: u64) -> VmMapCopy {
    VmMapCopy::new(CopyKind::Object(Some(object)), offset, size)
}

// ============================================================================
// Copyin
// ============================================================================

/// Snapshot `[src_addr, src_addr + len)` of `src_map` as an entry list
/// (vm_map_copyin)
///
/// Each source entry is copied by the cheapest applicable strategy:
///
/// 1. moved outright when the source is destroyed and its object is
///    temporary
/// 2. shared copy-on-write when the object allows a temporary copy and
///    the entry is not wired
/// 3. copied page by page with the map unlocked, retried if the map
///    changed meanwhile
///
/// With `src_destroy` the source range is deleted once the copy is built.
pub fn vm_map_copyin(src_map: &VmMap, src_addr: u64, len: u64, src_destroy: bool) -> KernResult<VmMapCopy> {
    if len == 0 {
        return Ok(VmMapCopy::new(CopyKind::EntryList(MapHeader::new(true)), src_addr, 0));
    }
    let src_end = src_addr.checked_add(len).ok_or(KernError::InvalidAddress)?;
    let start = trunc_page(src_addr);
    let end = round_page(src_end);
    if end < start {
        return Err(KernError::InvalidAddress);
    }

    let mut header = MapHeader::new(true);
    let mut guard = src_map.write();
    let mut src_start = start;

    while src_start < end {
        let key = match guard.lookup_entry(src_start) {
            EntryLookup::Contained(key) => guard.clip_start(key, src_start),
            EntryLookup::Preceding(_) => return Err(KernError::InvalidAddress),
        };
        guard.clip_end(key, end);

        let entry = guard.entry(key);
        if entry.is_sub_map() {
            return Err(KernError::InvalidArgument);
        }
        let entry_end = entry.end;

        let mut new_entry = entry.duplicate();
        new_entry.rezone(EntryZone::Pageable);
        new_entry.wired_count = 0;
        new_entry.user_wired_count = 0;
        new_entry.projected_on = None;
        new_entry
            .flags
            .remove(EntryFlags::IN_TRANSITION | EntryFlags::NEEDS_WAKEUP | EntryFlags::IS_SHARED);

        let object = entry.object.object().cloned();
        let movable = object
            .as_ref()
            .map_or(true, |o| o.is_temporary() && !o.use_shared_copy());

        if src_destroy && movable {
            // Strategy 1: the entry's reference moves with the copy.
            counters::C_VM_MAP_COPYIN_MOVE.inc();
        } else if let Some(needs) = (entry.wired_count == 0)
            .then(|| vm_object_copy_temporary(object.as_ref()))
            .flatten()
        {
            // Strategy 2: both sides share the object copy-on-write.
            if needs.src_needs_copy && !entry.needs_copy() {
                let prot = entry.protection - VmProt::WRITE - VmProt::NOTIFY;
                match (entry.is_shared(), &object) {
                    (true, Some(object)) => {
                        object.pmap_protect(entry.offset, entry.offset + entry.size(), prot)
                    }
                    _ => src_map.pmap().protect(entry.start, entry.end, prot),
                }
                guard.entry_mut(key).set_needs_copy(true);
                guard.touch();
            }
            new_entry.set_needs_copy(needs.dst_needs_copy);
            counters::C_VM_MAP_COPYIN_QUICK.inc();
        } else {
            // Strategy 3: real copy with the map unlocked.
            let Some(object) = object else {
                return Err(KernError::Failure);
            };
            let wired = entry.wired_count != 0;
            let (offset, size) = (entry.offset, entry.size());
            let version = guard.version();
            drop(guard);

            let result = if wired {
                vm_object_copy_slowly(&object, offset, size).map(|o| (o, 0, false))
            } else {
                vm_object_copy_strategically(&object, offset, size)
            };

            guard = src_map.write();
            let (new_object, new_offset, needs_copy) = result?;
            if guard.version() != version {
                counters::C_VM_MAP_COPYIN_RETRY.inc();
                log::warn!(
                    "vm_map_copyin: map {} changed during copy at {:#x}, retrying",
                    src_map.id.0,
                    src_start
                );
                continue;
            }
            new_entry.object = EntryObject::Object(new_object);
            new_entry.offset = new_offset;
            new_entry.set_needs_copy(needs_copy);
            counters::C_VM_MAP_COPYIN_SLOW.inc();
        }

        header.link(new_entry);
        src_start = entry_end;
    }

    if src_destroy {
        guard = vm_map_delete(src_map, guard, start, end);
    }
    drop(guard);

    log::debug!(
        "vm_map_copyin: map {} [{:#x}, {:#x}) -> {} entries",
        src_map.id.0,
        src_addr,
        src_end,
        header.nentries()
    );
    Ok(VmMapCopy::new(CopyKind::EntryList(header), src_addr, len))
}

// ============================================================================
// Copyout
// ============================================================================

/// Insert `copy` into newly allocated space in `dst_map` (vm_map_copyout)
///
/// Returns the address corresponding to `copy.offset`. The copy is
/// consumed whether or not the insertion succeeds.
pub fn vm_map_copyout(dst_map: &VmMap, mut copy: VmMapCopy) -> KernResult<u64> {
    let (offset, size) = (copy.offset, copy.size);
    match copy.take_kind() {
        CopyKind::Object(object) => {
            if size == 0 {
                return Ok(0);
            }
            let obj_start = trunc_page(offset);
            let map_size = page_end(offset, size).ok_or(KernError::InvalidAddress)? - obj_start;
            let addr = vm_map_enter(
                dst_map,
                0,
                map_size,
                0,
                true,
                object,
                obj_start,
                false,
                VmProt::DEFAULT,
                VmProt::ALL,
                VmInherit::default(),
            )?;
            Ok(addr + (offset & PAGE_MASK))
        }
        CopyKind::PageList(list) => vm_map_copyout_page_list(dst_map, list, offset, size),
        CopyKind::EntryList(mut header) => {
            if header.is_empty() {
                return Ok(0);
            }
            let copy_start = trunc_page(offset);
            let total = page_end(offset, size).ok_or(KernError::InvalidAddress)? - copy_start;

            let guard = dst_map.write();
            let (mut guard, found) = vm_map_find_space(dst_map, guard, dst_map.min_offset(), total, 0);
            let (start, _) = found?;
            let adjustment = start.wrapping_sub(copy_start);
            let zone = guard.header().zone();
            let wire = dst_map.wiring_required();

            let mut entries = header.drain();
            let mut to_wire = Vec::new();
            for entry in &mut entries {
                entry.rezone(zone);
                entry.start = entry.start.wrapping_add(adjustment);
                entry.end = entry.end.wrapping_add(adjustment);
                entry.inheritance = VmInherit::default();
                entry.protection = VmProt::DEFAULT;
                entry.max_protection = VmProt::ALL;
                entry.projected_on = None;
                entry.user_wired_count = 0;
                entry.flags.remove(EntryFlags::IN_TRANSITION | EntryFlags::NEEDS_WAKEUP);
                if wire {
                    entry.wired_count = 1;
                    to_wire.push((entry.start, entry.end));
                } else {
                    entry.wired_count = 0;
                }
            }
            guard.link_chain(entries);
            guard.set_hint(start);
            drop(guard);

            for (wire_start, wire_end) in to_wire {
                if let Err(err) = vm_fault_wire(dst_map, wire_start, wire_end) {
                    log::warn!("vm_map_copyout: wiring [{:#x}, {:#x}) failed: {}", wire_start, wire_end, err);
                }
            }
            log::debug!("vm_map_copyout: map {} at {:#x} size {:#x}", dst_map.id.0, start, total);
            Ok(start + (offset - copy_start))
        }
    }
}

// ============================================================================
// Copy Overwrite
// ============================================================================

/// Turn an object copy into an equivalent one-entry list
fn object_to_entry_list(object: Option<Arc<VmObject>>, offset: u64, size: u64) -> MapHeader {
    let mut header = MapHeader::new(true);
    let start = trunc_page(offset);
    let mut entry = VmMapEntry::new(EntryZone::Pageable, start, round_page(offset + size));
    entry.object = EntryObject::from_object(object);
    entry.offset = start;
    header.link(entry);
    header
}

/// Validate the destination of an overwrite (first pass)
///
/// Returns the guard, possibly re-taken after waiting on an entry in
/// transition.
fn overwrite_check<'a>(
    dst_map: &'a VmMap,
    mut guard: MapWriteGuard<'a>,
    dst_addr: u64,
    dst_end: u64,
    interruptible: bool,
) -> (MapWriteGuard<'a>, KernResult<()>) {
    'start_pass_1: loop {
        let mut key = match guard.lookup_entry(dst_addr) {
            EntryLookup::Contained(key) => key,
            EntryLookup::Preceding(_) => return (guard, Err(KernError::InvalidAddress)),
        };
        loop {
            let entry = guard.entry(key);
            if entry.in_transition() {
                guard.entry_mut(key).flags.insert(EntryFlags::NEEDS_WAKEUP);
                guard = vm_map_entry_wait(dst_map, guard);
                continue 'start_pass_1;
            }
            if !entry.protection.contains(VmProt::WRITE) {
                return (guard, Err(KernError::ProtectionFailure));
            }
            if entry.is_sub_map() {
                return (guard, Err(KernError::InvalidArgument));
            }
            let permanent = entry.object.object().map_or(false, |o| !o.is_temporary());
            if permanent && interruptible {
                return (guard, Err(KernError::Failure));
            }
            if entry.end >= dst_end {
                return (guard, Ok(()));
            }
            let entry_end = entry.end;
            match guard.next_key(Some(key)) {
                Some(next) if guard.entry(next).start == entry_end => key = next,
                _ => return (guard, Err(KernError::InvalidAddress)),
            }
        }
    }
}

/// Write `copy` over the existing mappings at `dst_addr`
/// (vm_map_copy_overwrite)
///
/// Destination entries backed by private temporary memory (or pending
/// copy-on-write) simply take over the copy's objects; entries backed by
/// permanent or shared memory receive the data page by page so that their
/// objects are preserved. The copy is consumed. A failure after the first
/// entry has been overwritten leaves the earlier entries overwritten.
pub fn vm_map_copy_overwrite(dst_map: &VmMap, dst_addr: u64, mut copy: VmMapCopy, interruptible: bool) -> KernResult<()> {
    let (offset, size) = (copy.offset, copy.size);
    if page_end(offset, size).is_none() {
        return Err(KernError::InvalidAddress);
    }
    let mut header = match copy.take_kind() {
        CopyKind::EntryList(header) => header,
        CopyKind::Object(object) => object_to_entry_list(object, offset, size),
        CopyKind::PageList(_) => return Err(KernError::InvalidArgument),
    };
    if size == 0 {
        return Ok(());
    }
    if !page_aligned(offset) || !page_aligned(size) || !page_aligned(dst_addr) {
        return Err(KernError::InvalidArgument);
    }
    let dst_end = dst_addr.checked_add(size).ok_or(KernError::InvalidAddress)?;

    let guard = dst_map.write();
    let (mut guard, checked) = overwrite_check(dst_map, guard, dst_addr, dst_end, interruptible);
    checked?;

    let mut addr = dst_addr;
    while let Some(copy_key) = header.first_key() {
        let dst_key = match guard.lookup_entry(addr) {
            EntryLookup::Contained(key) => guard.clip_start(key, addr),
            EntryLookup::Preceding(_) => return Err(KernError::InvalidAddress),
        };
        if guard.entry(dst_key).in_transition() {
            guard.entry_mut(dst_key).flags.insert(EntryFlags::NEEDS_WAKEUP);
            guard = vm_map_entry_wait(dst_map, guard);
            continue;
        }
        if !guard.entry(dst_key).protection.contains(VmProt::WRITE) {
            return Err(KernError::ProtectionFailure);
        }

        let copy_size = header.entry(copy_key).size();
        let dst_size = guard.entry(dst_key).size();
        if copy_size < dst_size {
            guard.clip_end(dst_key, addr + copy_size);
        } else if copy_size > dst_size {
            header.clip_end(copy_key, header.entry(copy_key).start + dst_size);
        }
        let size = guard.entry(dst_key).size();
        assert_eq!(
            size,
            header.entry(copy_key).size(),
            "vm_map_copy_overwrite: clip mismatch at {:#x}",
            addr
        );

        let entry = guard.entry(dst_key);
        let temporary = entry.object.object().map_or(true, |o| o.is_temporary());
        let substitute = entry.wired_count == 0 && ((!entry.is_shared() && temporary) || entry.needs_copy());

        if substitute {
            let mut copy_entry = header.unlink(copy_key);
            if entry.is_shared() {
                if let Some(object) = entry.object.object() {
                    object.pmap_remove(entry.offset, entry.offset + size);
                }
            }
            dst_map.pmap().remove(entry.start, entry.end);
            let entry = guard.entry_mut(dst_key);
            entry.object = core::mem::take(&mut copy_entry.object);
            entry.offset = copy_entry.offset;
            entry.set_needs_copy(copy_entry.needs_copy());
            entry.set_shared(false);
            guard.touch();
            counters::C_VM_MAP_OVERWRITE_SUBSTITUTE.inc();
        } else {
            // Resolve a pending copy-on-write so the data lands in a
            // private object rather than the one shared with other maps.
            let entry = guard.entry_mut(dst_key);
            let rewire = entry.needs_copy() && entry.wired_count != 0;
            if entry.needs_copy() {
                if rewire {
                    vm_fault_unwire(dst_map.pmap(), entry);
                }
                let (shadow, shadow_offset) =
                    vm_object_shadow(entry.object.object().cloned(), entry.offset, size);
                entry.object = EntryObject::Object(shadow);
                entry.offset = shadow_offset;
                entry.set_needs_copy(false);
                guard.touch();
            }

            let existing = guard.entry(dst_key).object.object().cloned();
            let dst_object = match existing {
                Some(object) => object,
                None => {
                    let object = vm_object_allocate(size);
                    let entry = guard.entry_mut(dst_key);
                    entry.object = EntryObject::Object(Arc::clone(&object));
                    entry.offset = 0;
                    guard.touch();
                    object
                }
            };
            let dst_offset = guard.entry(dst_key).offset;
            let copy_entry = header.unlink(copy_key);
            drop(guard);

            let result = vm_fault_copy(
                copy_entry.object.object(),
                copy_entry.offset,
                &dst_object,
                dst_offset,
                size,
            );
            drop(copy_entry);
            guard = dst_map.write();
            if let Err(err) = result {
                log::warn!(
                    "vm_map_copy_overwrite: map {} page copy at {:#x} failed: {}",
                    dst_map.id.0,
                    addr,
                    err
                );
                return Err(err);
            }
            if rewire {
                drop(guard);
                if let Err(err) = vm_fault_wire(dst_map, addr, addr + size) {
                    log::warn!(
                        "vm_map_copy_overwrite: map {} rewiring at {:#x} failed: {}",
                        dst_map.id.0,
                        addr,
                        err
                    );
                }
                guard = dst_map.write();
            }
            counters::C_VM_MAP_OVERWRITE_PAGE_COPY.inc();
        }
        addr += size;
    }
    drop(guard);
    log::debug!(
        "vm_map_copy_overwrite: map {} [{:#x}, {:#x})",
        dst_map.id.0,
        dst_addr,
        dst_end
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::copyio::{copyin, copyout};
    use crate::mach_vm::pmap::pmap_create;
    use crate::mach_vm::vm_map::vm_map_create;
    use crate::mach_vm::vm_object::vm_object_allocate_permanent;
    use crate::mach_vm::vm_page::PAGE_SIZE;

    fn anon_map(start: u64, size: u64) -> Arc<VmMap> {
        let map = vm_map_create(pmap_create(), 0, 0x100000, true);
        vm_map_enter(
            &map,
            start,
            size,
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
        map
    }

    #[test]
    fn test_copyin_quick_marks_source_copy_on_write() {
        let src = anon_map(0x1000, 0x2000);
        copyout(b"hello", &src, 0x1000).unwrap();
        let copy = vm_map_copyin(&src, 0x1000, 0x2000, false).unwrap();
        assert!(copy.is_entry_list());
        assert_eq!(copy.header().unwrap().nentries(), 1);
        assert!(copy.header().unwrap().iter().all(VmMapEntry::needs_copy));
        assert!(src.read().entry(0x1000).needs_copy());
        let pte = src.pmap().extract(0x1000).unwrap();
        assert!(!pte.prot.contains(VmProt::WRITE));
    }

    #[test]
    fn test_copyout_wrapping_object_range() {
        let copy = vm_map_copyin_object(vm_object_allocate(0x2000), u64::MAX - 0xfff, 0x2000);
        let dst = vm_map_create(pmap_create(), 0, 0x100000, true);
        assert_eq!(vm_map_copyout(&dst, copy), Err(KernError::InvalidAddress));
        assert_eq!(dst.nentries(), 0);
    }

    #[test]
    fn test_copyin_gap_fails() {
        let src = anon_map(0x1000, 0x1000);
        assert_eq!(
            vm_map_copyin(&src, 0x1000, 0x2000, false).unwrap_err(),
            KernError::InvalidAddress
        );
    }

    #[test]
    fn test_copyin_destroy_moves_object() {
        let src = anon_map(0x1000, 0x1000);
        copyout(b"moved", &src, 0x1000).unwrap();
        let copy = vm_map_copyin(&src, 0x1000, 0x1000, true).unwrap();
        assert_eq!(src.nentries(), 0);
        let dst = vm_map_create(pmap_create(), 0, 0x100000, true);
        let addr = vm_map_copyout(&dst, copy).unwrap();
        let mut buf = [0u8; 5];
        copyin(&dst, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"moved");
    }

    #[test]
    fn test_copyin_permanent_copies_slowly() {
        let map = vm_map_create(pmap_create(), 0, 0x100000, true);
        let object = vm_object_allocate_permanent(0x1000);
        vm_map_enter(
            &map,
            0x2000,
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
        copyout(b"disk", &map, 0x2000).unwrap();
        let copy = vm_map_copyin(&map, 0x2000, 0x1000, false).unwrap();
        let header = copy.header().unwrap();
        let entry = header.iter().next().unwrap();
        assert_ne!(entry.object.object_id(), Some(object.id));
        assert!(!map.read().entry(0x2000).needs_copy());
    }

    #[test]
    fn test_copyout_unaligned_offset() {
        let src = anon_map(0x3000, 0x2000);
        copyout(b"abcdef", &src, 0x3ffd).unwrap();
        let copy = vm_map_copyin(&src, 0x3ffd, 6, false).unwrap();
        assert_eq!(copy.offset, 0x3ffd);
        assert_eq!(copy.size, 6);
        let dst = vm_map_create(pmap_create(), 0, 0x100000, true);
        let addr = vm_map_copyout(&dst, copy).unwrap();
        assert_eq!(addr & PAGE_MASK, 0xffd);
        let mut buf = [0u8; 6];
        copyin(&dst, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
        assert_eq!(dst.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_copyout_object() {
        let object = vm_object_allocate(0x2000);
        let copy = vm_map_copyin_object(object, 0, 0x2000);
        let dst = vm_map_create(pmap_create(), 0x10000, 0x100000, true);
        let addr = vm_map_copyout(&dst, copy).unwrap();
        assert_eq!(addr, 0x10000);
        assert_eq!(dst.size(), 0x2000);
    }

    #[test]
    fn test_copy_copy_empties_original() {
        let mut copy = vm_map_copyin_object(vm_object_allocate(0x1000), 0, 0x1000);
        let moved = vm_map_copy_copy(&mut copy);
        assert_eq!(moved.size, 0x1000);
        assert_eq!(copy.size, 0);
        assert!(matches!(copy.kind(), CopyKind::Object(None)));
        vm_map_copy_discard(copy);
        vm_map_copy_print(&moved);
    }

    #[test]
    fn test_overwrite_requires_alignment() {
        let dst = anon_map(0x1000, 0x1000);
        let copy = vm_map_copyin_object(vm_object_allocate(0x1000), 0, 0x1000);
        assert_eq!(
            vm_map_copy_overwrite(&dst, 0x1800, copy, false),
            Err(KernError::InvalidArgument)
        );
    }

    #[test]
    fn test_overwrite_substitutes_temporary() {
        let src = anon_map(0x1000, 0x1000);
        copyout(b"new", &src, 0x1000).unwrap();
        let dst = anon_map(0x8000, 0x3000);
        copyout(b"old", &dst, 0x9000).unwrap();
        let copy = vm_map_copyin(&src, 0x1000, 0x1000, false).unwrap();
        vm_map_copy_overwrite(&dst, 0x9000, copy, false).unwrap();
        assert_eq!(dst.nentries(), 3);
        let mut buf = [0u8; 3];
        copyin(&dst, 0x9000, &mut buf).unwrap();
        assert_eq!(&buf, b"new");
    }

    #[test]
    fn test_overwrite_preserves_permanent_object() {
        let dst = vm_map_create(pmap_create(), 0, 0x100000, true);
        let object = vm_object_allocate_permanent(0x1000);
        vm_map_enter(
            &dst,
            0x4000,
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
        let src = anon_map(0x1000, 0x1000);
        copyout(b"data", &src, 0x1000).unwrap();

        let copy = vm_map_copyin(&src, 0x1000, 0x1000, false).unwrap();
        assert_eq!(
            vm_map_copy_overwrite(&dst, 0x4000, copy, true),
            Err(KernError::Failure)
        );

        let copy = vm_map_copyin(&src, 0x1000, 0x1000, false).unwrap();
        vm_map_copy_overwrite(&dst, 0x4000, copy, false).unwrap();
        assert_eq!(dst.read().entry(0x4000).object.object_id(), Some(object.id));
        let mut buf = [0u8; 4];
        object.page_lookup(0).unwrap().read(0, &mut buf);
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn test_overwrite_read_only_destination() {
        let dst = anon_map(0x1000, 0x1000);
        crate::mach_vm::vm_map::vm_map_protect(&dst, 0x1000, 0x2000, VmProt::READ, false).unwrap();
        let copy = vm_map_copyin_object(vm_object_allocate(0x1000), 0, 0x1000);
        assert_eq!(
            vm_map_copy_overwrite(&dst, 0x1000, copy, false),
            Err(KernError::ProtectionFailure)
        );
    }
}
