//! VM Map Event Counters
//!
//! Based on Mach4 kern/counters.h/c by CMU (1987-1991)
//!
//! Counters record which paths the map code takes (hint hits, coalesces,
//! the copyin strategy chosen, optimistic-concurrency retries). They are
//! diagnostic only; nothing in the map layer reads them back.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Mach counter type (atomically updated)
#[derive(Debug)]
pub struct MachCounter {
    value: AtomicU64,
    name: &'static str,
}

impl MachCounter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Lookup
// ============================================================================

pub static C_VM_MAP_LOOKUP_HINT_HIT: MachCounter = MachCounter::new("vm_map_lookup_hint_hit");
pub static C_VM_MAP_LOOKUP_HINT_MISS: MachCounter = MachCounter::new("vm_map_lookup_hint_miss");
pub static C_VM_MAP_LOOKUP_UPGRADE_RETRY: MachCounter =
    MachCounter::new("vm_map_lookup_upgrade_retry");
pub static C_VM_MAP_CLIP: MachCounter = MachCounter::new("vm_map_clip");

// ============================================================================
// Enter / Delete
// ============================================================================

pub static C_VM_MAP_ENTER_COALESCE: MachCounter = MachCounter::new("vm_map_enter_coalesce");
pub static C_VM_MAP_ENTER_NEW_ENTRY: MachCounter = MachCounter::new("vm_map_enter_new_entry");
pub static C_VM_MAP_SPACE_WAIT: MachCounter = MachCounter::new("vm_map_space_wait");
pub static C_VM_MAP_TRANSITION_WAIT: MachCounter = MachCounter::new("vm_map_transition_wait");
pub static C_VM_MAP_SIMPLIFY: MachCounter = MachCounter::new("vm_map_simplify");

// ============================================================================
// Copy Paths
// ============================================================================

pub static C_VM_MAP_COPYIN_MOVE: MachCounter = MachCounter::new("vm_map_copyin_move");
pub static C_VM_MAP_COPYIN_QUICK: MachCounter = MachCounter::new("vm_map_copyin_quick");
pub static C_VM_MAP_COPYIN_SLOW: MachCounter = MachCounter::new("vm_map_copyin_slow");
pub static C_VM_MAP_COPYIN_RETRY: MachCounter = MachCounter::new("vm_map_copyin_retry");
pub static C_VM_MAP_OVERWRITE_SUBSTITUTE: MachCounter =
    MachCounter::new("vm_map_overwrite_substitute");
pub static C_VM_MAP_OVERWRITE_PAGE_COPY: MachCounter =
    MachCounter::new("vm_map_overwrite_page_copy");
pub static C_VM_MAP_PAGE_LIST_CONT: MachCounter = MachCounter::new("vm_map_page_list_cont");
pub static C_VM_MAP_PAGE_STEAL: MachCounter = MachCounter::new("vm_map_page_steal");

// ============================================================================
// Fork / Fault
// ============================================================================

pub static C_VM_MAP_FORK_SHARE: MachCounter = MachCounter::new("vm_map_fork_share");
pub static C_VM_MAP_FORK_COPY_QUICK: MachCounter = MachCounter::new("vm_map_fork_copy_quick");
pub static C_VM_MAP_FORK_COPY_SLOW: MachCounter = MachCounter::new("vm_map_fork_copy_slow");
pub static C_VM_FAULT: MachCounter = MachCounter::new("vm_fault");
pub static C_VM_FAULT_RETRY: MachCounter = MachCounter::new("vm_fault_retry");
pub static C_VM_FAULT_COW: MachCounter = MachCounter::new("vm_fault_cow");
pub static C_VM_FAULT_ZERO_FILL: MachCounter = MachCounter::new("vm_fault_zero_fill");

static ALL_COUNTERS: [&MachCounter; 24] = [
    &C_VM_MAP_LOOKUP_HINT_HIT,
    &C_VM_MAP_LOOKUP_HINT_MISS,
    &C_VM_MAP_LOOKUP_UPGRADE_RETRY,
    &C_VM_MAP_CLIP,
    &C_VM_MAP_ENTER_COALESCE,
    &C_VM_MAP_ENTER_NEW_ENTRY,
    &C_VM_MAP_SPACE_WAIT,
    &C_VM_MAP_TRANSITION_WAIT,
    &C_VM_MAP_SIMPLIFY,
    &C_VM_MAP_COPYIN_MOVE,
    &C_VM_MAP_COPYIN_QUICK,
    &C_VM_MAP_COPYIN_SLOW,
    &C_VM_MAP_COPYIN_RETRY,
    &C_VM_MAP_OVERWRITE_SUBSTITUTE,
    &C_VM_MAP_OVERWRITE_PAGE_COPY,
    &C_VM_MAP_PAGE_LIST_CONT,
    &C_VM_MAP_PAGE_STEAL,
    &C_VM_MAP_FORK_SHARE,
    &C_VM_MAP_FORK_COPY_QUICK,
    &C_VM_MAP_FORK_COPY_SLOW,
    &C_VM_FAULT,
    &C_VM_FAULT_RETRY,
    &C_VM_FAULT_COW,
    &C_VM_FAULT_ZERO_FILL,
];

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub lookup_hint_hit: u64,
    pub lookup_hint_miss: u64,
    pub enter_coalesce: u64,
    pub copyin_move: u64,
    pub copyin_quick: u64,
    pub copyin_slow: u64,
    pub copyin_retry: u64,
    pub overwrite_substitute: u64,
    pub overwrite_page_copy: u64,
    pub page_list_cont: u64,
    pub fork_share: u64,
    pub fork_copy_quick: u64,
    pub fork_copy_slow: u64,
    pub faults: u64,
    pub cow_faults: u64,
}

pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        lookup_hint_hit: C_VM_MAP_LOOKUP_HINT_HIT.get(),
        lookup_hint_miss: C_VM_MAP_LOOKUP_HINT_MISS.get(),
        enter_coalesce: C_VM_MAP_ENTER_COALESCE.get(),
        copyin_move: C_VM_MAP_COPYIN_MOVE.get(),
        copyin_quick: C_VM_MAP_COPYIN_QUICK.get(),
        copyin_slow: C_VM_MAP_COPYIN_SLOW.get(),
        copyin_retry: C_VM_MAP_COPYIN_RETRY.get(),
        overwrite_substitute: C_VM_MAP_OVERWRITE_SUBSTITUTE.get(),
        overwrite_page_copy: C_VM_MAP_OVERWRITE_PAGE_COPY.get(),
        page_list_cont: C_VM_MAP_PAGE_LIST_CONT.get(),
        fork_share: C_VM_MAP_FORK_SHARE.get(),
        fork_copy_quick: C_VM_MAP_FORK_COPY_QUICK.get(),
        fork_copy_slow: C_VM_MAP_FORK_COPY_SLOW.get(),
        faults: C_VM_FAULT.get(),
        cow_faults: C_VM_FAULT_COW.get(),
    }
}

/// Log every counter at debug level
pub fn dump() {
    for counter in ALL_COUNTERS.iter() {
        log::debug!("{:>32}: {}", counter.name(), counter.get());
    }
}
