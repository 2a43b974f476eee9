//! VM Object - Backing Store for Map Entries
//!
//! Based on Mach4 vm/vm_object.h/c
//!
//! An object is a sparse array of resident pages indexed by byte offset,
//! optionally shadowing another object: pages missing here are looked up
//! in the shadow at `offset + shadow_offset`. Copy-on-write is built from
//! shadows; a write fault on an entry that `needs_copy` interposes a new
//! shadow object and pushes modified pages into it.
//!
//! References are `Arc<VmObject>`. The Mach reference count is the strong
//! count, and the object is terminated (pages unmapped and freed) when the
//! last entry, copy or shadow pointing at it goes away.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::kern_return::KernResult;
use crate::kern::sched_prim::{clear_wait, thread_block};
use crate::mach_vm::pmap::pmap_page_protect;
use crate::mach_vm::vm_map::VmProt;
use crate::mach_vm::vm_page::{round_page, vm_page_grab, PageRef, PAGE_SIZE};

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

bitflags::bitflags! {
    /// VM Object flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u32 {
        /// Created by the kernel for anonymous memory
        const INTERNAL = 0x0001;
        /// Contents are discarded when the last reference goes away
        const TEMPORARY = 0x0002;
        /// Some other object may shadow this one
        const SHADOWED = 0x0004;
        /// Shared between maps; copies must not use symmetric copy-on-write
        const USE_SHARED_COPY = 0x0008;
        /// A pager has been associated with the object
        const PAGER_CREATED = 0x0010;
        /// Object may be cached after its last reference
        const CAN_PERSIST = 0x0020;
    }
}

/// Outcome of a successful temporary-copy negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyNeeds {
    /// The source mapping must become copy-on-write
    pub src_needs_copy: bool,
    /// The new mapping must be copy-on-write
    pub dst_needs_copy: bool,
}

#[derive(Debug)]
struct ObjectState {
    size: u64,
    pages: BTreeMap<u64, PageRef>,
    shadow: Option<Arc<VmObject>>,
    shadow_offset: u64,
    flags: ObjectFlags,
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// VM Object - represents a unit of backing store
#[derive(Debug)]
pub struct VmObject {
    /// Object ID
    pub id: VmObjectId,

    state: Mutex<ObjectState>,
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

fn object_create(size: u64, flags: ObjectFlags) -> Arc<VmObject> {
    Arc::new(VmObject {
        id: VmObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
        state: Mutex::new(ObjectState {
            size,
            pages: BTreeMap::new(),
            shadow: None,
            shadow_offset: 0,
            flags,
        }),
    })
}

/// Allocate an anonymous, temporary object
pub fn vm_object_allocate(size: u64) -> Arc<VmObject> {
    object_create(
        round_page(size),
        ObjectFlags::INTERNAL | ObjectFlags::TEMPORARY,
    )
}

/// Allocate a permanent object, standing in for pager-backed memory
pub fn vm_object_allocate_permanent(size: u64) -> Arc<VmObject> {
    object_create(
        round_page(size),
        ObjectFlags::PAGER_CREATED | ObjectFlags::CAN_PERSIST,
    )
}

impl VmObject {
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn flags(&self) -> ObjectFlags {
        self.state.lock().flags
    }

    pub fn set_flags(&self, flags: ObjectFlags) {
        self.state.lock().flags |= flags;
    }

    pub fn clear_flags(&self, flags: ObjectFlags) {
        self.state.lock().flags &= !flags;
    }

    pub fn is_temporary(&self) -> bool {
        self.flags().contains(ObjectFlags::TEMPORARY)
    }

    pub fn is_shadowed(&self) -> bool {
        self.flags().contains(ObjectFlags::SHADOWED)
    }

    pub fn use_shared_copy(&self) -> bool {
        self.flags().contains(ObjectFlags::USE_SHARED_COPY)
    }

    pub fn pager_created(&self) -> bool {
        self.flags().contains(ObjectFlags::PAGER_CREATED)
    }

    /// Mach reference count
    pub fn ref_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// The object this one shadows, with the offset into it
    pub fn shadow(&self) -> Option<(Arc<VmObject>, u64)> {
        let state = self.state.lock();
        state
            .shadow
            .as_ref()
            .map(|s| (Arc::clone(s), state.shadow_offset))
    }

    // ------------------------------------------------------------------------
    // Page table
    // ------------------------------------------------------------------------

    pub fn page_lookup(&self, offset: u64) -> Option<PageRef> {
        self.state.lock().pages.get(&offset).cloned()
    }

    /// Insert `page` at `offset`, replacing nothing; returns false if the
    /// slot is already occupied
    pub fn page_insert(&self, page: &PageRef, offset: u64) -> bool {
        let mut state = self.state.lock();
        if state.pages.contains_key(&offset) {
            return false;
        }
        page.set_owner(self.id, offset);
        state.pages.insert(offset, Arc::clone(page));
        if offset + PAGE_SIZE > state.size {
            state.size = offset + PAGE_SIZE;
        }
        true
    }

    pub fn page_remove(&self, offset: u64) -> Option<PageRef> {
        let page = self.state.lock().pages.remove(&offset);
        if let Some(page) = &page {
            page.clear_owner();
        }
        page
    }

    /// Free every resident page in `[start, end)` after unmapping it
    pub fn page_remove_range(&self, start: u64, end: u64) {
        let removed: Vec<PageRef> = {
            let mut state = self.state.lock();
            let keys: Vec<u64> = state.pages.range(start..end).map(|(o, _)| *o).collect();
            keys.into_iter()
                .filter_map(|o| state.pages.remove(&o))
                .collect()
        };
        for page in removed {
            pmap_page_protect(&page, VmProt::NONE);
            page.clear_owner();
        }
    }

    pub fn resident_pages(&self, start: u64, end: u64) -> Vec<(u64, PageRef)> {
        self.state
            .lock()
            .pages
            .range(start..end)
            .map(|(o, p)| (*o, Arc::clone(p)))
            .collect()
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Find the page backing `offset`, searching the shadow chain
    ///
    /// Returns the page together with the object that holds it and the
    /// offset within that object. Nothing is allocated.
    pub fn resolve_page(self: &Arc<Self>, offset: u64) -> Option<(PageRef, Arc<VmObject>, u64)> {
        let mut object = Arc::clone(self);
        let mut offset = offset;
        loop {
            let next = {
                let state = object.state.lock();
                if let Some(page) = state.pages.get(&offset) {
                    return Some((Arc::clone(page), Arc::clone(&object), offset));
                }
                state
                    .shadow
                    .as_ref()
                    .map(|s| (Arc::clone(s), offset + state.shadow_offset))
            };
            let (shadow, shadow_offset) = next?;
            object = shadow;
            offset = shadow_offset;
        }
    }

    /// Whether any page of `[offset, offset + size)` is resident anywhere
    /// in the chain
    fn chain_has_pages(self: &Arc<Self>, offset: u64, size: u64) -> bool {
        let mut object = Arc::clone(self);
        let mut offset = offset;
        loop {
            let next = {
                let state = object.state.lock();
                if state.pages.range(offset..offset + size).next().is_some() {
                    return true;
                }
                state
                    .shadow
                    .as_ref()
                    .map(|s| (Arc::clone(s), offset + state.shadow_offset))
            };
            match next {
                Some((shadow, shadow_offset)) => {
                    object = shadow;
                    offset = shadow_offset;
                }
                None => return false,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Hardware mappings of the object's pages
    // ------------------------------------------------------------------------

    /// Remove all pmap mappings of resident pages in `[start, end)`
    pub fn pmap_remove(&self, start: u64, end: u64) {
        for (_, page) in self.resident_pages(start, end) {
            pmap_page_protect(&page, VmProt::NONE);
        }
    }

    /// Reduce every pmap mapping of resident pages in `[start, end)`
    pub fn pmap_protect(&self, start: u64, end: u64, prot: VmProt) {
        for (_, page) in self.resident_pages(start, end) {
            pmap_page_protect(&page, prot);
        }
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let pages = core::mem::take(&mut self.state.get_mut().pages);
        for (_, page) in pages {
            pmap_page_protect(&page, VmProt::NONE);
            page.clear_owner();
        }
    }
}

// ============================================================================
// Shadowing and Copy Strategies
// ============================================================================

/// Interpose a new object in front of `source` (vm_object_shadow)
///
/// Returns the shadow object and the offset to use within it.
pub fn vm_object_shadow(source: Option<Arc<VmObject>>, offset: u64, length: u64) -> (Arc<VmObject>, u64) {
    let result = vm_object_allocate(length);
    if let Some(source) = source {
        source.set_flags(ObjectFlags::SHADOWED);
        let mut state = result.state.lock();
        state.shadow = Some(source);
        state.shadow_offset = offset;
    }
    log::trace!("vm_object_shadow: object {:?} length {:#x}", result.id, length);
    (result, 0)
}

/// Negotiate a cheap copy of a temporary object
///
/// On success both mappings keep pointing at the same object and the
/// caller marks them copy-on-write as reported. `None` means a real copy
/// is required.
pub fn vm_object_copy_temporary(object: Option<&Arc<VmObject>>) -> Option<CopyNeeds> {
    let Some(object) = object else {
        return Some(CopyNeeds {
            src_needs_copy: false,
            dst_needs_copy: false,
        });
    };
    let flags = object.flags();
    if flags.contains(ObjectFlags::TEMPORARY) && !flags.contains(ObjectFlags::USE_SHARED_COPY) {
        Some(CopyNeeds {
            src_needs_copy: true,
            dst_needs_copy: true,
        })
    } else {
        None
    }
}

/// Copy `[offset, offset + size)` of `src` page by page into a new object
///
/// Busy source pages are waited for, so the map the range came from must
/// not be locked by the caller.
pub fn vm_object_copy_slowly(src: &Arc<VmObject>, offset: u64, size: u64) -> KernResult<Arc<VmObject>> {
    let size = round_page(size);
    let new_object = vm_object_allocate(size);
    let mut off = 0;
    while off < size {
        if let Some((page, _, _)) = src.resolve_page(offset + off) {
            let ticket = page.assert_wait();
            if page.is_busy() {
                thread_block(ticket);
                continue;
            }
            clear_wait(ticket);
            let copy = vm_page_grab();
            copy.copy_from(&page);
            new_object.page_insert(&copy, off);
        }
        off += PAGE_SIZE;
    }
    Ok(new_object)
}

/// Copy a range using the cheapest correct method for the object
///
/// Returns the new object, the offset within it, and whether the new
/// mapping must be copy-on-write.
pub fn vm_object_copy_strategically(
    src: &Arc<VmObject>,
    offset: u64,
    size: u64,
) -> KernResult<(Arc<VmObject>, u64, bool)> {
    if !src.pager_created() && !src.chain_has_pages(offset, round_page(size)) {
        return Ok((vm_object_allocate(size), 0, false));
    }
    vm_object_copy_slowly(src, offset, size).map(|object| (object, 0, false))
}

/// Try to extend `prev` so that it also covers the next `next_size` bytes
/// (vm_object_coalesce)
pub fn vm_object_coalesce(
    prev: Option<&Arc<VmObject>>,
    prev_offset: u64,
    prev_size: u64,
    next_size: u64,
) -> bool {
    let Some(prev) = prev else {
        return true;
    };
    if Arc::strong_count(prev) > 1 {
        return false;
    }
    let newsize = prev_offset + prev_size;
    {
        let mut state = prev.state.lock();
        if state.flags.contains(ObjectFlags::PAGER_CREATED)
            || state.flags.contains(ObjectFlags::USE_SHARED_COPY)
            || state.shadow.is_some()
        {
            return false;
        }
        if newsize + next_size > state.size {
            state.size = newsize + next_size;
        }
    }
    prev.page_remove_range(newsize, newsize + next_size);
    true
}
