//! VM Page - Resident Page Management
//!
//! Based on Mach4 vm/vm_page.h and vm/vm_resident.c
//!
//! A page is a reference-counted frame holding `PAGE_SIZE` bytes. Its
//! state bits follow Mach: `BUSY` excludes concurrent faulting while a
//! thread owns the page (page-list copies keep pages busy until they are
//! inserted or discarded), `TABLED` marks membership in an object's page
//! table. Every pmap mapping of the page is recorded in its pv list so
//! that `pmap_page_protect` can find them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::sched_prim::{assert_wait, event_from_addr, thread_wakeup, WaitTicket};
use crate::mach_vm::pmap::PmapId;
use crate::mach_vm::vm_object::VmObjectId;

// ============================================================================
// Page Geometry
// ============================================================================

/// Page size in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Mask of the in-page offset bits
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Round an address down to its page boundary
#[inline]
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round an address up to the next page boundary
#[inline]
pub const fn round_page(addr: u64) -> u64 {
    addr.wrapping_add(PAGE_MASK) & !PAGE_MASK
}

/// Page-rounded end of `[addr, addr + size)`, or `None` if the range
/// wraps the address space
#[inline]
pub const fn page_end(addr: u64, size: u64) -> Option<u64> {
    match addr.checked_add(size) {
        Some(end) if end <= u64::MAX - PAGE_MASK => Some(round_page(end)),
        _ => None,
    }
}

#[inline]
pub const fn page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK == 0
}

// ============================================================================
// Page Flags
// ============================================================================

bitflags::bitflags! {
    /// Page state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Page is owned by a thread; others must wait
        const BUSY = 0x0001;
        /// Data has been requested but not supplied
        const ABSENT = 0x0002;
        /// Page has no real frame behind it
        const FICTITIOUS = 0x0004;
        /// Pager must be given the page back even when clean
        const PRECIOUS = 0x0008;
        /// Page is in an object's page table
        const TABLED = 0x0010;
        /// Page has been modified
        const DIRTY = 0x0020;
        /// Page is on the active queue
        const ACTIVE = 0x0040;
        /// Page is on the inactive queue
        const INACTIVE = 0x0080;
        /// Pager reported an error for this page
        const ERROR = 0x0100;
    }
}

// ============================================================================
// Page Structure
// ============================================================================

/// One recorded mapping of a page (pv entry)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvEntry {
    pub pmap: PmapId,
    pub va: u64,
}

/// Object and offset a tabled page belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOwner {
    pub object: VmObjectId,
    pub offset: u64,
}

/// A resident page
#[derive(Debug)]
pub struct VmPage {
    /// Fake physical address, unique per frame
    pub phys_addr: u64,

    flags: AtomicU32,

    /// Number of wirings; a wired page is never reclaimed
    wire_count: AtomicU32,

    owner: Mutex<Option<PageOwner>>,

    data: Mutex<Box<[u8]>>,

    /// Pmap mappings of this page
    mappings: Mutex<Vec<PvEntry>>,
}

/// Shared reference to a page
pub type PageRef = Arc<VmPage>;

static NEXT_PHYS: AtomicU64 = AtomicU64::new(0x10_0000);
static PAGES_GRABBED: AtomicU64 = AtomicU64::new(0);
static PAGES_FREED: AtomicU64 = AtomicU64::new(0);

/// Allocate a zero-filled page
pub fn vm_page_grab() -> PageRef {
    PAGES_GRABBED.fetch_add(1, Ordering::Relaxed);
    Arc::new(VmPage {
        phys_addr: NEXT_PHYS.fetch_add(PAGE_SIZE, Ordering::Relaxed),
        flags: AtomicU32::new(PageFlags::INACTIVE.bits()),
        wire_count: AtomicU32::new(0),
        owner: Mutex::new(None),
        data: Mutex::new(vec![0u8; PAGE_SIZE as usize].into_boxed_slice()),
        mappings: Mutex::new(Vec::new()),
    })
}

/// Pages allocated and released since boot
pub fn vm_page_stats() -> (u64, u64) {
    (
        PAGES_GRABBED.load(Ordering::Relaxed),
        PAGES_FREED.load(Ordering::Relaxed),
    )
}

impl VmPage {
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(PageFlags::BUSY)
    }

    pub fn is_absent(&self) -> bool {
        self.flags().contains(PageFlags::ABSENT)
    }

    pub fn is_tabled(&self) -> bool {
        self.flags().contains(PageFlags::TABLED)
    }

    pub fn is_precious(&self) -> bool {
        self.flags().contains(PageFlags::PRECIOUS)
    }

    /// Claim the page: returns false if it was already busy
    pub fn try_busy(&self) -> bool {
        let prev = self.flags.fetch_or(PageFlags::BUSY.bits(), Ordering::AcqRel);
        prev & PageFlags::BUSY.bits() == 0
    }

    /// Prepare to sleep until the page is no longer busy
    pub fn assert_wait(&self) -> WaitTicket {
        assert_wait(event_from_addr(self))
    }

    /// Release a busy page and wake anyone waiting for it (PAGE_WAKEUP_DONE)
    pub fn wakeup_done(&self) {
        self.clear_flags(PageFlags::BUSY);
        thread_wakeup(event_from_addr(self));
    }

    // ------------------------------------------------------------------------
    // Queues and wiring
    // ------------------------------------------------------------------------

    pub fn activate(&self) {
        self.clear_flags(PageFlags::INACTIVE);
        self.set_flags(PageFlags::ACTIVE);
    }

    pub fn deactivate(&self) {
        self.clear_flags(PageFlags::ACTIVE);
        self.set_flags(PageFlags::INACTIVE);
    }

    pub fn wire(&self) {
        if self.wire_count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.clear_flags(PageFlags::ACTIVE | PageFlags::INACTIVE);
        }
    }

    pub fn unwire(&self) {
        let prev = self
            .wire_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if prev == Ok(1) {
            self.activate();
        }
    }

    /// Drop every wiring at once (page is being stolen from its object)
    pub fn unwire_all(&self) {
        if self.wire_count.swap(0, Ordering::AcqRel) != 0 {
            self.activate();
        }
    }

    pub fn wire_count(&self) -> u32 {
        self.wire_count.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------------

    pub fn owner(&self) -> Option<PageOwner> {
        *self.owner.lock()
    }

    pub(crate) fn set_owner(&self, object: VmObjectId, offset: u64) {
        *self.owner.lock() = Some(PageOwner { object, offset });
        self.set_flags(PageFlags::TABLED);
    }

    pub(crate) fn clear_owner(&self) {
        *self.owner.lock() = None;
        self.clear_flags(PageFlags::TABLED);
    }

    // ------------------------------------------------------------------------
    // Contents
    // ------------------------------------------------------------------------

    /// Copy bytes out of the page starting at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy bytes into the page starting at `offset`
    pub fn write(&self, offset: usize, buf: &[u8]) {
        self.data.lock()[offset..offset + buf.len()].copy_from_slice(buf);
        self.set_flags(PageFlags::DIRTY);
    }

    /// Overwrite this page with the contents of `src` (vm_page_copy)
    pub fn copy_from(&self, src: &VmPage) {
        if core::ptr::eq(self, src) {
            return;
        }
        let src_data = src.data.lock();
        self.data.lock().copy_from_slice(&src_data);
        self.set_flags(PageFlags::DIRTY);
    }

    pub fn zero_fill(&self) {
        self.data.lock().fill(0);
    }

    // ------------------------------------------------------------------------
    // Pv list
    // ------------------------------------------------------------------------

    pub(crate) fn pv_add(&self, pmap: PmapId, va: u64) {
        let mut pv = self.mappings.lock();
        let entry = PvEntry { pmap, va };
        if !pv.contains(&entry) {
            pv.push(entry);
        }
    }

    pub(crate) fn pv_remove(&self, pmap: PmapId, va: u64) {
        self.mappings
            .lock()
            .retain(|e| !(e.pmap == pmap && e.va == va));
    }

    /// Current mappings of the page
    pub fn pv_snapshot(&self) -> Vec<PvEntry> {
        self.mappings.lock().clone()
    }
}

impl Drop for VmPage {
    fn drop(&mut self) {
        PAGES_FREED.fetch_add(1, Ordering::Relaxed);
    }
}
