//! Physical Map (pmap) - Address Translation Model
//!
//! Based on Mach4 vm/pmap.h
//!
//! Each VM map owns one pmap. The pmap is the "hardware" view: a table of
//! virtual page to (page, protection, wired) translations. It is allowed
//! to forget mappings at any time, but must never grant more access than
//! the map entry allows; the map layer relies on faults to repopulate it.
//!
//! Pmaps are registered by id so that `pmap_page_protect` can walk the pv
//! list of a page and reach every pmap mapping it.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::kern_return::{KernError, KernResult};
use crate::mach_vm::vm_map::VmProt;
use crate::mach_vm::vm_page::{trunc_page, PageRef, VmPage, PAGE_SIZE};

// ============================================================================
// Pmap Types
// ============================================================================

/// Pmap identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapId(pub u64);

/// One translation
#[derive(Debug, Clone)]
pub struct PmapEntry {
    pub page: PageRef,
    pub prot: VmProt,
    pub wired: bool,
}

/// Pmap statistics, including per-operation call counts
#[derive(Debug, Default)]
pub struct PmapStats {
    pub resident_count: AtomicU64,
    pub wired_count: AtomicU64,
    pub enter_calls: AtomicU64,
    pub remove_calls: AtomicU64,
    pub protect_calls: AtomicU64,
    pub copy_calls: AtomicU64,
    pub pageable_calls: AtomicU64,
}

/// Machine-specific attribute selectors (vm_machine_attribute)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineAttribute {
    Cache,
    Migrate,
    Replicate,
}

/// Values for [`MachineAttribute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineAttributeVal {
    Off,
    On,
    Get,
    CacheFlush,
}

// ============================================================================
// Pmap
// ============================================================================

#[derive(Debug)]
pub struct Pmap {
    pub id: PmapId,

    /// Virtual page address to translation
    mappings: Mutex<BTreeMap<u64, PmapEntry>>,

    /// Cache attribute state for the whole pmap
    cache_enabled: AtomicBool,

    pub stats: PmapStats,
}

static NEXT_PMAP_ID: AtomicU64 = AtomicU64::new(1);

static PMAP_REGISTRY: Mutex<BTreeMap<PmapId, Weak<Pmap>>> = Mutex::new(BTreeMap::new());

/// Create an empty translation context
pub fn pmap_create() -> Arc<Pmap> {
    let id = PmapId(NEXT_PMAP_ID.fetch_add(1, Ordering::Relaxed));
    let pmap = Arc::new(Pmap {
        id,
        mappings: Mutex::new(BTreeMap::new()),
        cache_enabled: AtomicBool::new(true),
        stats: PmapStats::default(),
    });
    PMAP_REGISTRY.lock().insert(id, Arc::downgrade(&pmap));
    pmap
}

pub fn pmap_find(id: PmapId) -> Option<Arc<Pmap>> {
    PMAP_REGISTRY.lock().get(&id).and_then(Weak::upgrade)
}

impl Pmap {
    /// Enter a translation, replacing any previous one at `va`
    pub fn enter(&self, va: u64, page: &PageRef, prot: VmProt, wired: bool) {
        let va = trunc_page(va);
        self.stats.enter_calls.fetch_add(1, Ordering::Relaxed);
        let old = self.mappings.lock().insert(
            va,
            PmapEntry {
                page: Arc::clone(page),
                prot,
                wired,
            },
        );
        match old {
            Some(old) => {
                if !Arc::ptr_eq(&old.page, page) {
                    old.page.pv_remove(self.id, va);
                }
                if old.wired {
                    self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
            None => {
                self.stats.resident_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        if wired {
            self.stats.wired_count.fetch_add(1, Ordering::Relaxed);
        }
        page.pv_add(self.id, va);
    }

    /// Remove all translations in `[start, end)`
    pub fn remove(&self, start: u64, end: u64) {
        self.stats.remove_calls.fetch_add(1, Ordering::Relaxed);
        let removed: Vec<(u64, PmapEntry)> = {
            let mut mappings = self.mappings.lock();
            let keys: Vec<u64> = mappings.range(start..end).map(|(va, _)| *va).collect();
            keys.into_iter()
                .filter_map(|va| mappings.remove(&va).map(|e| (va, e)))
                .collect()
        };
        self.forget(removed);
    }

    /// Reduce the protection of translations in `[start, end)` to `prot`
    ///
    /// Removing READ removes the translations altogether.
    pub fn protect(&self, start: u64, end: u64, prot: VmProt) {
        self.stats.protect_calls.fetch_add(1, Ordering::Relaxed);
        if !prot.contains(VmProt::READ) {
            let removed: Vec<(u64, PmapEntry)> = {
                let mut mappings = self.mappings.lock();
                let keys: Vec<u64> = mappings.range(start..end).map(|(va, _)| *va).collect();
                keys.into_iter()
                    .filter_map(|va| mappings.remove(&va).map(|e| (va, e)))
                    .collect()
            };
            self.forget(removed);
            return;
        }
        let mut mappings = self.mappings.lock();
        for (_, entry) in mappings.range_mut(start..end) {
            entry.prot &= prot;
        }
    }

    /// Duplicate `src` translations of `[src_addr, src_addr + len)` into
    /// this pmap at `dst_addr` (pmap_copy)
    pub fn copy_from(&self, src: &Pmap, dst_addr: u64, len: u64, src_addr: u64) {
        self.stats.copy_calls.fetch_add(1, Ordering::Relaxed);
        let entries: Vec<(u64, PmapEntry)> = src
            .mappings
            .lock()
            .range(src_addr..src_addr + len)
            .map(|(va, e)| (*va, e.clone()))
            .collect();
        for (va, entry) in entries {
            self.enter(dst_addr + (va - src_addr), &entry.page, entry.prot, false);
        }
    }

    /// Change the wired attribute of one translation
    pub fn change_wiring(&self, va: u64, wired: bool) {
        let mut mappings = self.mappings.lock();
        if let Some(entry) = mappings.get_mut(&trunc_page(va)) {
            if entry.wired != wired {
                entry.wired = wired;
                if wired {
                    self.stats.wired_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Pageability hint for a range; this pmap keeps no per-range state
    pub fn pageable(&self, _start: u64, _end: u64, _pageable: bool) {
        self.stats.pageable_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Translation at `va`, if any
    pub fn extract(&self, va: u64) -> Option<PmapEntry> {
        self.mappings.lock().get(&trunc_page(va)).cloned()
    }

    pub fn is_mapped(&self, va: u64) -> bool {
        self.mappings.lock().contains_key(&trunc_page(va))
    }

    /// Query or set a machine attribute over a range
    pub fn attribute(
        &self,
        _start: u64,
        _size: u64,
        attribute: MachineAttribute,
        value: MachineAttributeVal,
    ) -> KernResult<MachineAttributeVal> {
        match (attribute, value) {
            (MachineAttribute::Cache, MachineAttributeVal::Get) => {
                Ok(if self.cache_enabled.load(Ordering::Relaxed) {
                    MachineAttributeVal::On
                } else {
                    MachineAttributeVal::Off
                })
            }
            (MachineAttribute::Cache, MachineAttributeVal::On) => {
                self.cache_enabled.store(true, Ordering::Relaxed);
                Ok(value)
            }
            (MachineAttribute::Cache, MachineAttributeVal::Off) => {
                self.cache_enabled.store(false, Ordering::Relaxed);
                Ok(value)
            }
            (MachineAttribute::Cache, MachineAttributeVal::CacheFlush) => Ok(value),
            _ => Err(KernError::InvalidArgument),
        }
    }

    pub fn resident_count(&self) -> u64 {
        self.stats.resident_count.load(Ordering::Relaxed)
    }

    pub fn wired_count(&self) -> u64 {
        self.stats.wired_count.load(Ordering::Relaxed)
    }

    /// Total enter/remove/protect calls made on this pmap
    pub fn call_count(&self) -> u64 {
        self.stats.enter_calls.load(Ordering::Relaxed)
            + self.stats.remove_calls.load(Ordering::Relaxed)
            + self.stats.protect_calls.load(Ordering::Relaxed)
    }

    fn remove_one(&self, va: u64) {
        let removed = self.mappings.lock().remove(&va);
        if let Some(entry) = removed {
            self.forget(alloc::vec![(va, entry)]);
        }
    }

    fn reduce_one(&self, va: u64, prot: VmProt) {
        if let Some(entry) = self.mappings.lock().get_mut(&va) {
            entry.prot &= prot;
        }
    }

    fn forget(&self, removed: Vec<(u64, PmapEntry)>) {
        for (va, entry) in removed {
            entry.page.pv_remove(self.id, va);
            self.stats.resident_count.fetch_sub(1, Ordering::Relaxed);
            if entry.wired {
                self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for Pmap {
    fn drop(&mut self) {
        let mappings = core::mem::take(self.mappings.get_mut());
        for (va, entry) in mappings {
            entry.page.pv_remove(self.id, va);
        }
        PMAP_REGISTRY.lock().remove(&self.id);
    }
}

/// Lower the protection of every mapping of `page`, in all pmaps
///
/// `VmProt::NONE` removes the mappings.
pub fn pmap_page_protect(page: &VmPage, prot: VmProt) {
    for pv in page.pv_snapshot() {
        let Some(pmap) = pmap_find(pv.pmap) else {
            page.pv_remove(pv.pmap, pv.va);
            continue;
        };
        if prot.contains(VmProt::READ) {
            pmap.reduce_one(pv.va, prot);
        } else {
            pmap.remove_one(pv.va);
        }
    }
}

/// Number of pages spanned by `[start, end)`
pub fn page_count(start: u64, end: u64) -> u64 {
    (end - start) / PAGE_SIZE
}
