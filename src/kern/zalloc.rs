//! Zone Accounting for VM Map Structures
//!
//! Based on Mach4 kern/zalloc.c by Avadis Tevanian, Jr.
//!
//! Mach allocates maps, map entries and map copies from fixed-size zones.
//! Here the structures themselves live on the heap, and a zone tracks how
//! many elements of its kind are outstanding so that leaks and pool
//! mismatches (kernel entries versus pageable entries) stay observable.
//! The zones are created once by `vm_map_init` and never torn down.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::kern::kern_return::{KernError, KernResult};

// ============================================================================
// Zone Statistics
// ============================================================================

/// Zone statistics for debugging and monitoring
#[derive(Debug, Default)]
pub struct ZoneStats {
    /// Total allocations from this zone
    pub alloc_count: AtomicU64,
    /// Total deallocations to this zone
    pub free_count: AtomicU64,
    /// Current elements in use
    pub in_use: AtomicU32,
    /// Maximum elements ever in use
    pub max_in_use: AtomicU32,
    /// Failed allocation attempts
    pub failures: AtomicU32,
}

impl ZoneStats {
    fn record_alloc(&self) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        let in_use = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_use.fetch_max(in_use, Ordering::Relaxed);
    }

    fn record_free(&self) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Zone
// ============================================================================

/// A pool of fixed-size elements
#[derive(Debug)]
pub struct Zone {
    /// Zone name (for debugging)
    pub name: &'static str,

    /// Size of each element
    pub elem_size: usize,

    /// Element limit; `None` means the zone may grow without bound
    pub max_elements: Option<u32>,

    /// Zone statistics
    pub stats: ZoneStats,
}

impl Zone {
    pub const fn new(name: &'static str, elem_size: usize, max_elements: Option<u32>) -> Self {
        Self {
            name,
            elem_size,
            max_elements,
            stats: ZoneStats {
                alloc_count: AtomicU64::new(0),
                free_count: AtomicU64::new(0),
                in_use: AtomicU32::new(0),
                max_in_use: AtomicU32::new(0),
                failures: AtomicU32::new(0),
            },
        }
    }

    /// Take one element from the zone
    pub fn zalloc(&self) -> KernResult<()> {
        if let Some(max) = self.max_elements {
            if self.stats.in_use.load(Ordering::Relaxed) >= max {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("zone {} exhausted ({} elements)", self.name, max);
                return Err(KernError::ResourceShortage);
            }
        }
        self.stats.record_alloc();
        Ok(())
    }

    /// Return one element to the zone
    pub fn zfree(&self) {
        self.stats.record_free();
    }

    pub fn in_use(&self) -> u32 {
        self.stats.in_use.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated from the zone
    pub fn current_size(&self) -> u64 {
        self.in_use() as u64 * self.elem_size as u64
    }
}

/// Snapshot of a zone for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneInfo {
    pub name: &'static str,
    pub elem_size: usize,
    pub in_use: u32,
    pub max_in_use: u32,
    pub alloc_count: u64,
}

impl From<&Zone> for ZoneInfo {
    fn from(zone: &Zone) -> Self {
        Self {
            name: zone.name,
            elem_size: zone.elem_size,
            in_use: zone.in_use(),
            max_in_use: zone.stats.max_in_use.load(Ordering::Relaxed),
            alloc_count: zone.stats.alloc_count.load(Ordering::Relaxed),
        }
    }
}
