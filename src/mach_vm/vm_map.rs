//! VM Map - Address Space Management
//!
//! Based on Mach4 vm/vm_map.h/c
//!
//! A map is an ordered set of non-overlapping entries, each describing a
//! contiguous range `[start, end)` backed by an object (or by a nested
//! map), with protection, inheritance, wiring and copy-on-write state.
//! Entries are kept in a `BTreeMap` keyed by start address; a one-entry
//! hint and a `first_free` cursor accelerate lookups and allocation.
//!
//! All mutation happens under the map's reader-writer lock. Every
//! structural change (link, unlink, clip) advances the map timestamp by
//! one, and operations that change entry attributes the fault path relies
//! on advance it once more, so a saved [`MapVersion`] tells a thread that
//! dropped the lock whether what it looked up is still valid.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Bound;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Once, RwLock, RwLockReadGuard, RwLockUpgradableGuard, RwLockWriteGuard};

use crate::kern::counters;
use crate::kern::kern_return::{KernError, KernResult};
use crate::kern::sched_prim::{assert_wait, event_from_addr, thread_block, thread_wakeup, WaitEvent};
use crate::kern::zalloc::{Zone, ZoneInfo};
use crate::mach_vm::pmap::{pmap_create, MachineAttribute, MachineAttributeVal, Pmap};
use crate::mach_vm::vm_fault::vm_fault_unwire;
use crate::mach_vm::vm_map_pageable::vm_map_pageable;
use crate::mach_vm::vm_object::{vm_object_coalesce, VmObject, VmObjectId};
use crate::mach_vm::vm_page::{round_page, trunc_page, PAGE_MASK};

// ============================================================================
// VM Map Types
// ============================================================================

/// VM Map ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmMapId(pub u64);

bitflags::bitflags! {
    /// Memory protection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmProt: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        /// Writes are reported as `WriteProtectionFailure` instead of
        /// `ProtectionFailure`
        const NOTIFY = 0x10;
    }
}

impl VmProt {
    /// No access
    pub const NONE: Self = Self::empty();
    /// Read/write
    pub const DEFAULT: Self = Self::READ.union(Self::WRITE);
    /// Read/write/execute
    pub const ALL: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}

impl Default for VmProt {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Inheritance on fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum VmInherit {
    /// Child gets nothing at this range
    None = 2,
    /// Child shares the parent's memory
    Share = 0,
    /// Child gets a copy-on-write copy
    #[default]
    Copy = 1,
}

bitflags::bitflags! {
    /// Map entry state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u32 {
        /// Object is shared with another map
        const IS_SHARED = 0x0001;
        /// Copy-on-write is pending for this entry
        const NEEDS_COPY = 0x0002;
        /// Entry is being changed with the map unlocked
        const IN_TRANSITION = 0x0004;
        /// Someone is waiting for the transition to end
        const NEEDS_WAKEUP = 0x0008;
    }
}

/// Snapshot of the map timestamp used for optimistic concurrency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapVersion {
    pub main_timestamp: u64,
}

// ============================================================================
// Tunables
// ============================================================================

/// Upper bound on ranges that `vm_map_enter` prefaults
pub const VM_MAP_PMAP_ENTER_MAX: u64 = 128 * 1024;

/// Runtime policy knobs for the map layer
#[derive(Debug)]
pub struct VmMapTunables {
    /// Eagerly enter resident pages into the pmap on `vm_map_enter`
    pub pmap_enter_enable: AtomicBool,
    /// Only ranges smaller than this are prefaulted
    pub pmap_enter_max_size: AtomicU64,
}

static TUNABLES: VmMapTunables = VmMapTunables {
    pmap_enter_enable: AtomicBool::new(false),
    pmap_enter_max_size: AtomicU64::new(VM_MAP_PMAP_ENTER_MAX),
};

pub fn tunables() -> &'static VmMapTunables {
    &TUNABLES
}

/// Set the prefault policy
pub fn configure(pmap_enter_enable: bool, pmap_enter_max_size: u64) {
    TUNABLES
        .pmap_enter_enable
        .store(pmap_enter_enable, Ordering::Relaxed);
    TUNABLES
        .pmap_enter_max_size
        .store(pmap_enter_max_size, Ordering::Relaxed);
}

// ============================================================================
// Zones
// ============================================================================

/// Zones for map structures
#[derive(Debug)]
pub struct VmMapZones {
    pub map_zone: Zone,
    /// Entries of maps whose entries must not be paged (the kernel map)
    pub kentry_zone: Zone,
    pub entry_zone: Zone,
    pub copy_zone: Zone,
}

static VM_MAP_ZONES: Once<VmMapZones> = Once::new();

pub fn vm_map_zones() -> &'static VmMapZones {
    VM_MAP_ZONES.call_once(|| VmMapZones {
        map_zone: Zone::new("maps", core::mem::size_of::<VmMap>(), None),
        kentry_zone: Zone::new("kernel map entries", core::mem::size_of::<VmMapEntry>(), None),
        entry_zone: Zone::new("map entries", core::mem::size_of::<VmMapEntry>(), None),
        copy_zone: Zone::new("map copies", 64, None),
    })
}

/// Zone diagnostics
pub fn vm_map_zone_info() -> Vec<ZoneInfo> {
    let zones = vm_map_zones();
    alloc::vec![
        ZoneInfo::from(&zones.map_zone),
        ZoneInfo::from(&zones.kentry_zone),
        ZoneInfo::from(&zones.entry_zone),
        ZoneInfo::from(&zones.copy_zone),
    ]
}

/// Which pool an entry was allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryZone {
    Kernel,
    Pageable,
}

impl EntryZone {
    pub fn for_pageable(pageable: bool) -> Self {
        if pageable {
            EntryZone::Pageable
        } else {
            EntryZone::Kernel
        }
    }

    fn zone(self) -> &'static Zone {
        let zones = vm_map_zones();
        match self {
            EntryZone::Kernel => &zones.kentry_zone,
            EntryZone::Pageable => &zones.entry_zone,
        }
    }

    fn take(self) {
        if let Err(err) = self.zone().zalloc() {
            panic!("vm_map_entry_create: {}: {}", self.zone().name, err);
        }
    }
}

// ============================================================================
// VM Map Entry
// ============================================================================

/// What an entry maps
#[derive(Debug, Clone, Default)]
pub enum EntryObject {
    /// Nothing yet; zero-fill memory is created on first fault
    #[default]
    None,
    Object(Arc<VmObject>),
    SubMap(Arc<VmMap>),
}

impl EntryObject {
    pub fn object(&self) -> Option<&Arc<VmObject>> {
        match self {
            EntryObject::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn submap(&self) -> Option<&Arc<VmMap>> {
        match self {
            EntryObject::SubMap(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_sub_map(&self) -> bool {
        matches!(self, EntryObject::SubMap(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, EntryObject::None)
    }

    pub fn from_object(object: Option<Arc<VmObject>>) -> Self {
        object.map(EntryObject::Object).unwrap_or_default()
    }

    pub fn object_id(&self) -> Option<VmObjectId> {
        self.object().map(|o| o.id)
    }
}

/// VM Map Entry - one contiguous mapping
#[derive(Debug)]
pub struct VmMapEntry {
    pub start: u64,
    pub end: u64,

    /// Backing object or nested map; the entry owns one reference
    pub object: EntryObject,

    /// Offset into the object corresponding to `start`
    pub offset: u64,

    pub flags: EntryFlags,

    pub inheritance: VmInherit,
    pub protection: VmProt,
    pub max_protection: VmProt,

    /// Kernel and user wirings combined
    pub wired_count: u32,
    /// User wirings; each user wiring accounts for at most one kernel count
    pub user_wired_count: u32,

    /// Start of the kernel-side buffer entry this entry is projected on
    pub projected_on: Option<u64>,

    zone: EntryZone,
}

impl VmMapEntry {
    /// Create an entry with default attributes (vm_map_entry_create)
    pub fn new(zone: EntryZone, start: u64, end: u64) -> Self {
        zone.take();
        Self {
            start,
            end,
            object: EntryObject::None,
            offset: 0,
            flags: EntryFlags::empty(),
            inheritance: VmInherit::default(),
            protection: VmProt::DEFAULT,
            max_protection: VmProt::ALL,
            wired_count: 0,
            user_wired_count: 0,
            projected_on: None,
            zone,
        }
    }

    /// Duplicate every field, taking another reference on the object
    pub fn duplicate(&self) -> Self {
        self.zone.take();
        Self {
            start: self.start,
            end: self.end,
            object: self.object.clone(),
            offset: self.offset,
            flags: self.flags,
            inheritance: self.inheritance,
            protection: self.protection,
            max_protection: self.max_protection,
            wired_count: self.wired_count,
            user_wired_count: self.user_wired_count,
            projected_on: self.projected_on,
            zone: self.zone,
        }
    }

    /// Move the entry to another pool
    pub fn rezone(&mut self, zone: EntryZone) {
        if self.zone != zone {
            zone.take();
            self.zone.zone().zfree();
            self.zone = zone;
        }
    }

    pub fn zone(&self) -> EntryZone {
        self.zone
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(EntryFlags::IS_SHARED)
    }

    pub fn needs_copy(&self) -> bool {
        self.flags.contains(EntryFlags::NEEDS_COPY)
    }

    pub fn in_transition(&self) -> bool {
        self.flags.contains(EntryFlags::IN_TRANSITION)
    }

    pub fn is_sub_map(&self) -> bool {
        self.object.is_sub_map()
    }

    pub fn set_needs_copy(&mut self, value: bool) {
        self.flags.set(EntryFlags::NEEDS_COPY, value);
    }

    pub fn set_shared(&mut self, value: bool) {
        self.flags.set(EntryFlags::IS_SHARED, value);
    }

    /// Offset into the object for an address inside the entry
    pub fn object_offset(&self, addr: u64) -> u64 {
        self.offset + (addr - self.start)
    }

    /// Kernel wirings, excluding the one count held on behalf of users
    pub fn kernel_wired_count(&self) -> u32 {
        self.wired_count - u32::from(self.user_wired_count > 0)
    }
}

impl Drop for VmMapEntry {
    fn drop(&mut self) {
        self.zone.zone().zfree();
    }
}

impl fmt::Display for VmMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) prot={:?}/{:?} inh={:?} wired={}/{} {}{}",
            self.start,
            self.end,
            self.protection,
            self.max_protection,
            self.inheritance,
            self.wired_count,
            self.user_wired_count,
            if self.is_shared() { "shared " } else { "" },
            if self.needs_copy() { "copy " } else { "" },
        )?;
        match &self.object {
            EntryObject::None => write!(f, "object=null"),
            EntryObject::Object(object) => {
                write!(f, "object={} offset={:#x}", object.id.0, self.offset)
            }
            EntryObject::SubMap(map) => write!(f, "submap={} offset={:#x}", map.id.0, self.offset),
        }
    }
}

// ============================================================================
// Map Header
// ============================================================================

/// Result of an entry lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLookup {
    /// The entry starting at this key contains the address
    Contained(u64),
    /// No entry contains the address; the key is that of the preceding
    /// entry, `None` when the address precedes every entry
    Preceding(Option<u64>),
}

impl EntryLookup {
    pub fn found(&self) -> bool {
        matches!(self, EntryLookup::Contained(_))
    }

    /// Key of the entry returned by the lookup, if any
    pub fn key(&self) -> Option<u64> {
        match *self {
            EntryLookup::Contained(key) => Some(key),
            EntryLookup::Preceding(key) => key,
        }
    }
}

/// Ordered, non-overlapping set of entries
///
/// Owned by a map, or by an entry-list copy that is not attached to a map.
#[derive(Debug)]
pub struct MapHeader {
    entries: BTreeMap<u64, VmMapEntry>,
    pub entries_pageable: bool,
}

impl MapHeader {
    pub fn new(entries_pageable: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            entries_pageable,
        }
    }

    pub fn nentries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn zone(&self) -> EntryZone {
        EntryZone::for_pageable(self.entries_pageable)
    }

    pub fn get(&self, key: u64) -> Option<&VmMapEntry> {
        self.entries.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmMapEntry> {
        self.entries.values()
    }

    pub fn first_key(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub fn last_key(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    /// Key of the entry following `key`; `None` as input means the first
    pub fn next_key(&self, key: Option<u64>) -> Option<u64> {
        match key {
            Some(key) => self
                .entries
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .map(|(k, _)| *k),
            None => self.first_key(),
        }
    }

    pub fn prev_key(&self, key: u64) -> Option<u64> {
        self.entries.range(..key).next_back().map(|(k, _)| *k)
    }

    pub fn lookup(&self, addr: u64) -> EntryLookup {
        match self.entries.range(..=addr).next_back() {
            Some((&key, entry)) if entry.contains(addr) => EntryLookup::Contained(key),
            Some((&key, _)) => EntryLookup::Preceding(Some(key)),
            None => EntryLookup::Preceding(None),
        }
    }

    pub(crate) fn entry(&self, key: u64) -> &VmMapEntry {
        match self.entries.get(&key) {
            Some(entry) => entry,
            None => panic!("vm_map: no entry at {:#x}", key),
        }
    }

    pub(crate) fn entry_mut(&mut self, key: u64) -> &mut VmMapEntry {
        match self.entries.get_mut(&key) {
            Some(entry) => entry,
            None => panic!("vm_map: no entry at {:#x}", key),
        }
    }

    /// Insert an entry (vm_map_entry_link)
    pub(crate) fn link(&mut self, entry: VmMapEntry) {
        debug_assert!(entry.start < entry.end);
        debug_assert!(
            self.entries
                .range(..entry.end)
                .next_back()
                .map_or(true, |(_, prev)| prev.end <= entry.start),
            "vm_map_entry_link: overlap at {:#x}",
            entry.start
        );
        self.entries.insert(entry.start, entry);
    }

    /// Remove an entry (vm_map_entry_unlink)
    pub(crate) fn unlink(&mut self, key: u64) -> VmMapEntry {
        match self.entries.remove(&key) {
            Some(entry) => entry,
            None => panic!("vm_map_entry_unlink: no entry at {:#x}", key),
        }
    }

    /// Remove every entry in address order
    pub(crate) fn drain(&mut self) -> Vec<VmMapEntry> {
        core::mem::take(&mut self.entries).into_values().collect()
    }

    /// Split the entry at `key` so that an entry begins at `addr`
    ///
    /// Returns the key of the entry that now begins at `addr` (or the
    /// original key when `addr` is not strictly inside the entry) and
    /// whether a split happened.
    pub(crate) fn clip_start(&mut self, key: u64, addr: u64) -> (u64, bool) {
        let entry = self.entry(key);
        if addr <= entry.start || addr >= entry.end {
            return (key, false);
        }
        let mut back = self.unlink(key);
        let mut front = back.duplicate();
        front.end = addr;
        back.offset += addr - back.start;
        back.start = addr;
        self.entries.insert(front.start, front);
        self.entries.insert(back.start, back);
        counters::C_VM_MAP_CLIP.inc();
        (addr, true)
    }

    /// Split the entry at `key` so that it ends at `addr`
    pub(crate) fn clip_end(&mut self, key: u64, addr: u64) -> bool {
        let entry = self.entry_mut(key);
        if addr <= entry.start || addr >= entry.end {
            return false;
        }
        let mut back = entry.duplicate();
        entry.end = addr;
        back.offset += addr - back.start;
        back.start = addr;
        self.entries.insert(back.start, back);
        counters::C_VM_MAP_CLIP.inc();
        true
    }

    /// Check ordering and bounds; used by tests and debug assertions
    pub fn validate(&self, min: u64, max: u64) -> Result<(), &'static str> {
        let mut prev_end = min;
        for (key, entry) in &self.entries {
            if *key != entry.start {
                return Err("entry key does not match start");
            }
            if entry.start >= entry.end {
                return Err("empty or inverted entry");
            }
            if entry.start < prev_end {
                return Err("entries overlap or precede min_offset");
            }
            if entry.user_wired_count > entry.wired_count {
                return Err("user_wired_count exceeds wired_count");
            }
            prev_end = entry.end;
        }
        if prev_end > max {
            return Err("entry beyond max_offset");
        }
        Ok(())
    }
}

// ============================================================================
// Locked Map State
// ============================================================================

const NO_HINT: u64 = u64::MAX;

/// Everything protected by the map lock
#[derive(Debug)]
pub struct MapState {
    header: MapHeader,
    /// Sum of entry sizes
    size: u64,
    timestamp: u64,
    /// Entry after which the first gap begins; `None` when the gap is at
    /// `min_offset`
    first_free: Option<u64>,
    /// Key of the last entry found by a lookup
    hint: AtomicU64,
    min_offset: u64,
}

pub type MapReadGuard<'a> = RwLockReadGuard<'a, MapState>;
pub type MapWriteGuard<'a> = RwLockWriteGuard<'a, MapState>;
pub type MapUpgradableGuard<'a> = RwLockUpgradableGuard<'a, MapState>;

impl MapState {
    fn new(entries_pageable: bool, min_offset: u64) -> Self {
        Self {
            header: MapHeader::new(entries_pageable),
            size: 0,
            timestamp: 0,
            first_free: None,
            hint: AtomicU64::new(NO_HINT),
            min_offset,
        }
    }

    pub fn header(&self) -> &MapHeader {
        &self.header
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn nentries(&self) -> usize {
        self.header.nentries()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn version(&self) -> MapVersion {
        MapVersion {
            main_timestamp: self.timestamp,
        }
    }

    pub fn first_free(&self) -> Option<u64> {
        self.first_free
    }

    pub fn entries(&self) -> impl Iterator<Item = &VmMapEntry> {
        self.header.iter()
    }

    /// Find the entry containing `addr`, or the one preceding it
    /// (vm_map_lookup_entry)
    pub fn lookup_entry(&self, addr: u64) -> EntryLookup {
        let hint = self.hint.load(Ordering::Relaxed);
        if hint != NO_HINT {
            if let Some(entry) = self.header.get(hint) {
                if entry.contains(addr) {
                    counters::C_VM_MAP_LOOKUP_HINT_HIT.inc();
                    return EntryLookup::Contained(hint);
                }
            }
        }
        counters::C_VM_MAP_LOOKUP_HINT_MISS.inc();
        let result = self.header.lookup(addr);
        self.hint
            .store(result.key().unwrap_or(NO_HINT), Ordering::Relaxed);
        result
    }

    pub(crate) fn set_hint(&self, key: u64) {
        self.hint.store(key, Ordering::Relaxed);
    }

    pub(crate) fn entry(&self, key: u64) -> &VmMapEntry {
        self.header.entry(key)
    }

    pub(crate) fn entry_mut(&mut self, key: u64) -> &mut VmMapEntry {
        self.header.entry_mut(key)
    }

    pub(crate) fn next_key(&self, key: Option<u64>) -> Option<u64> {
        self.header.next_key(key)
    }

    /// First entry starting at or after the lookup position of `addr`,
    /// with the containing entry clipped to begin at `addr`
    pub(crate) fn clip_to_start(&mut self, addr: u64) -> Option<u64> {
        match self.lookup_entry(addr) {
            EntryLookup::Contained(key) => Some(self.clip_start(key, addr)),
            EntryLookup::Preceding(prev) => self.next_key(prev),
        }
    }

    /// Advance the version for a change that does not restructure the list
    pub(crate) fn touch(&mut self) {
        self.timestamp += 1;
    }

    pub(crate) fn link(&mut self, entry: VmMapEntry) {
        self.size += entry.size();
        self.header.link(entry);
        self.timestamp += 1;
        self.update_first_free(self.first_free);
    }

    /// Splice a run of entries in with one version change
    pub(crate) fn link_chain(&mut self, entries: Vec<VmMapEntry>) {
        if entries.is_empty() {
            return;
        }
        for entry in entries {
            self.size += entry.size();
            self.header.link(entry);
        }
        self.timestamp += 1;
        self.update_first_free(self.first_free);
    }

    pub(crate) fn unlink(&mut self, key: u64) -> VmMapEntry {
        let prev = self.header.prev_key(key);
        let entry = self.header.unlink(key);
        self.size -= entry.size();
        self.timestamp += 1;
        if self.hint.load(Ordering::Relaxed) == key {
            self.hint.store(prev.unwrap_or(NO_HINT), Ordering::Relaxed);
        }
        let candidate = match self.first_free {
            Some(ff) if ff >= key => prev,
            other => other,
        };
        self.update_first_free(candidate);
        entry
    }

    pub(crate) fn clip_start(&mut self, key: u64, addr: u64) -> u64 {
        let (key, split) = self.header.clip_start(key, addr);
        if split {
            self.timestamp += 1;
            self.update_first_free(self.first_free);
        }
        key
    }

    pub(crate) fn clip_end(&mut self, key: u64, addr: u64) {
        if self.header.clip_end(key, addr) {
            self.timestamp += 1;
            self.update_first_free(self.first_free);
        }
    }

    /// Grow an entry in place (coalescing or page-list extension)
    pub(crate) fn extend_entry(&mut self, key: u64, new_end: u64) {
        self.grow_entry(key, new_end);
        self.touch();
    }

    /// Move the end of an entry forward without a version bump; the caller
    /// accounts for the change
    fn grow_entry(&mut self, key: u64, new_end: u64) {
        let entry = self.header.entry_mut(key);
        debug_assert!(new_end > entry.end);
        self.size += new_end - entry.end;
        entry.end = new_end;
        self.update_first_free(self.first_free);
    }

    /// Walk forward from `candidate` while entries abut
    fn update_first_free(&mut self, candidate: Option<u64>) {
        let mut cur = match candidate {
            Some(key) if self.header.get(key).is_some() => Some(key),
            _ => None,
        };
        loop {
            let end = match cur {
                Some(key) => self.header.entry(key).end,
                None => self.min_offset,
            };
            match self.header.next_key(cur) {
                Some(next) if self.header.entry(next).start == end => cur = Some(next),
                _ => break,
            }
        }
        self.first_free = cur;
    }

    /// Check list invariants and the cached size
    pub fn validate(&self, min: u64, max: u64) -> Result<(), &'static str> {
        self.header.validate(min, max)?;
        let sum: u64 = self.header.iter().map(VmMapEntry::size).sum();
        if sum != self.size {
            return Err("cached size does not match entries");
        }
        Ok(())
    }
}

// ============================================================================
// VM Map
// ============================================================================

/// VM Map - an address space
pub struct VmMap {
    pub id: VmMapId,

    lock: RwLock<MapState>,

    /// Translation context, exclusively owned
    pmap: Arc<Pmap>,

    min_offset: u64,
    max_offset: u64,

    entries_pageable: bool,

    /// New ranges must be wired as soon as they are mapped
    wiring_required: AtomicBool,

    /// Allocation blocks instead of failing when the map is full
    wait_for_space: AtomicBool,

    is_kernel_map: bool,
}

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Create a map over `[min, max)` (vm_map_create)
pub fn vm_map_create(pmap: Arc<Pmap>, min: u64, max: u64, pageable: bool) -> Arc<VmMap> {
    create_map(pmap, min, max, pageable, false)
}

fn create_map(pmap: Arc<Pmap>, min: u64, max: u64, pageable: bool, kernel: bool) -> Arc<VmMap> {
    if let Err(err) = vm_map_zones().map_zone.zalloc() {
        panic!("vm_map_create: {}", err);
    }
    let map = Arc::new(VmMap {
        id: VmMapId(NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed)),
        lock: RwLock::new(MapState::new(pageable, min)),
        pmap,
        min_offset: min,
        max_offset: max,
        entries_pageable: pageable,
        wiring_required: AtomicBool::new(false),
        wait_for_space: AtomicBool::new(false),
        is_kernel_map: kernel,
    });
    log::debug!("vm_map_create: map {} [{:#x}, {:#x})", map.id.0, min, max);
    map
}

/// Take another reference on a map
pub fn vm_map_reference(map: &Arc<VmMap>) -> Arc<VmMap> {
    Arc::clone(map)
}

/// Release a reference; the last one destroys the map
pub fn vm_map_deallocate(map: Arc<VmMap>) {
    drop(map);
}

impl VmMap {
    pub fn pmap(&self) -> &Arc<Pmap> {
        &self.pmap
    }

    pub fn min_offset(&self) -> u64 {
        self.min_offset
    }

    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    pub fn entries_pageable(&self) -> bool {
        self.entries_pageable
    }

    pub fn is_kernel_map(&self) -> bool {
        self.is_kernel_map
    }

    pub fn wiring_required(&self) -> bool {
        self.wiring_required.load(Ordering::Acquire)
    }

    pub fn set_wiring_required(&self, value: bool) {
        self.wiring_required.store(value, Ordering::Release);
    }

    pub fn wait_for_space(&self) -> bool {
        self.wait_for_space.load(Ordering::Acquire)
    }

    pub fn set_wait_for_space(&self, value: bool) {
        self.wait_for_space.store(value, Ordering::Release);
    }

    /// Shared access to the entry list
    pub fn read(&self) -> MapReadGuard<'_> {
        self.lock.read()
    }

    pub(crate) fn write(&self) -> MapWriteGuard<'_> {
        self.lock.write()
    }

    pub(crate) fn upgradeable_read(&self) -> MapUpgradableGuard<'_> {
        self.lock.upgradeable_read()
    }

    pub fn size(&self) -> u64 {
        self.read().size()
    }

    pub fn nentries(&self) -> usize {
        self.read().nentries()
    }

    pub fn timestamp(&self) -> u64 {
        self.read().timestamp()
    }

    /// Event posted when space may have been freed
    pub(crate) fn space_event(&self) -> WaitEvent {
        event_from_addr(&self.wait_for_space)
    }

    /// Event posted when an entry leaves transition
    pub(crate) fn transition_event(&self) -> WaitEvent {
        event_from_addr(&self.lock)
    }

    /// Range-check and clamp `[start, end)` to the map bounds
    pub(crate) fn clamp(&self, start: u64, end: u64) -> (u64, u64) {
        let start = start.max(self.min_offset);
        let end = end.min(self.max_offset);
        (start, end.max(start))
    }

    /// Check list invariants under the read lock
    pub fn validate(&self) -> Result<(), &'static str> {
        self.read().validate(self.min_offset, self.max_offset)
    }
}

impl Drop for VmMap {
    fn drop(&mut self) {
        let state = self.lock.get_mut();
        let entries = state.header.drain();
        state.size = 0;
        for entry in entries {
            entry_destroy(&self.pmap, entry);
        }
        vm_map_zones().map_zone.zfree();
        log::debug!("vm_map_destroy: map {}", self.id.0);
    }
}

impl fmt::Debug for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMap")
            .field("id", &self.id)
            .field("min_offset", &self.min_offset)
            .field("max_offset", &self.max_offset)
            .field("pmap", &self.pmap.id)
            .finish()
    }
}

impl fmt::Display for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        writeln!(
            f,
            "map {}: [{:#x}, {:#x}) size={:#x} nentries={} timestamp={}",
            self.id.0,
            self.min_offset,
            self.max_offset,
            state.size(),
            state.nentries(),
            state.timestamp()
        )?;
        for entry in state.entries() {
            writeln!(f, "  {}", entry)?;
        }
        Ok(())
    }
}

/// Log the map contents (vm_map_print)
pub fn vm_map_print(map: &VmMap) {
    log::info!("{}", map);
}

// ============================================================================
// Kernel Map
// ============================================================================

/// Kernel address range
pub const VM_MIN_KERNEL_ADDRESS: u64 = 0xFFFF_8000_0000_0000;
pub const VM_MAX_KERNEL_ADDRESS: u64 = 0xFFFF_FFFF_FFFF_F000;

static KERNEL_MAP: Once<Arc<VmMap>> = Once::new();

/// Initialize the map subsystem: zones and the kernel map (vm_map_init)
pub fn vm_map_init() -> &'static Arc<VmMap> {
    vm_map_zones();
    KERNEL_MAP.call_once(|| {
        create_map(
            pmap_create(),
            VM_MIN_KERNEL_ADDRESS,
            VM_MAX_KERNEL_ADDRESS,
            false,
            true,
        )
    })
}

pub fn kernel_map() -> &'static Arc<VmMap> {
    vm_map_init()
}

// ============================================================================
// Lookup and Clip
// ============================================================================

/// Whether `addr` is mapped, and the entry found (copied out)
pub fn vm_map_lookup_entry(map: &VmMap, addr: u64) -> (bool, Option<(u64, u64)>) {
    let state = map.read();
    let result = state.lookup_entry(addr);
    let bounds = result.key().map(|k| {
        let entry = state.entry(k);
        (entry.start, entry.end)
    });
    (result.found(), bounds)
}

/// Make an entry boundary at `addr` if it falls inside an entry
pub fn vm_map_clip_start(map: &VmMap, addr: u64) {
    let mut state = map.write();
    if let EntryLookup::Contained(key) = state.lookup_entry(addr) {
        state.clip_start(key, addr);
    }
}

/// Make an entry boundary at `addr` if it falls inside an entry
pub fn vm_map_clip_end(map: &VmMap, addr: u64) {
    let mut state = map.write();
    if let EntryLookup::Contained(key) = state.lookup_entry(addr) {
        state.clip_end(key, addr);
    }
}

/// Sleep until an entry leaves transition; the caller has set
/// `NEEDS_WAKEUP` on it (vm_map_entry_wait)
pub(crate) fn vm_map_entry_wait<'a>(map: &'a VmMap, guard: MapWriteGuard<'a>) -> MapWriteGuard<'a> {
    counters::C_VM_MAP_TRANSITION_WAIT.inc();
    let ticket = assert_wait(map.transition_event());
    drop(guard);
    thread_block(ticket);
    map.write()
}

/// Clear transition state of the entry at `key`, waking waiters
pub(crate) fn vm_map_entry_end_transition(map: &VmMap, state: &mut MapState, key: u64) {
    let entry = state.entry_mut(key);
    let wake = entry.flags.contains(EntryFlags::NEEDS_WAKEUP);
    entry
        .flags
        .remove(EntryFlags::IN_TRANSITION | EntryFlags::NEEDS_WAKEUP);
    if wake {
        thread_wakeup(map.transition_event());
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Find a gap of `size` bytes aligned to `mask`, starting the scan at
/// `hint`; blocks while the map is full if it waits for space
///
/// Returns the start of the gap and the key of the entry preceding it.
pub(crate) fn vm_map_find_space<'a>(
    map: &'a VmMap,
    mut guard: MapWriteGuard<'a>,
    hint: u64,
    size: u64,
    mask: u64,
) -> (MapWriteGuard<'a>, KernResult<(u64, Option<u64>)>) {
    let mask = mask | PAGE_MASK;
    loop {
        let mut start = hint.max(map.min_offset);
        let mut prev = if start == map.min_offset {
            let ff = guard.first_free();
            if let Some(key) = ff {
                start = guard.entry(key).end;
            }
            ff
        } else {
            match guard.lookup_entry(start) {
                EntryLookup::Contained(key) => {
                    start = guard.entry(key).end;
                    Some(key)
                }
                EntryLookup::Preceding(prev) => prev,
            }
        };

        let found = loop {
            let Some(aligned) = start.checked_add(mask).map(|s| s & !mask) else {
                break None;
            };
            let end = match aligned.checked_add(size) {
                Some(end) if end <= map.max_offset => end,
                _ => break None,
            };
            match guard.next_key(prev) {
                Some(next) if guard.entry(next).start < end => {
                    start = guard.entry(next).end;
                    prev = Some(next);
                }
                _ => break Some(aligned),
            }
        };

        if let Some(start) = found {
            return (guard, Ok((start, prev)));
        }
        if map.wait_for_space() && size <= map.max_offset - map.min_offset {
            counters::C_VM_MAP_SPACE_WAIT.inc();
            let ticket = assert_wait(map.space_event());
            drop(guard);
            thread_block(ticket);
            guard = map.write();
            continue;
        }
        return (guard, Err(KernError::NoSpace));
    }
}

/// Map `object` at `offset` into `map` (vm_map_enter)
///
/// With `anywhere` the address is a search hint; otherwise the range
/// `[address, address + size)` must be free. Returns the chosen address.
#[allow(clippy::too_many_arguments)]
pub fn vm_map_enter(
    map: &VmMap,
    address: u64,
    size: u64,
    mask: u64,
    anywhere: bool,
    object: Option<Arc<VmObject>>,
    offset: u64,
    needs_copy: bool,
    cur_protection: VmProt,
    max_protection: VmProt,
    inheritance: VmInherit,
) -> KernResult<u64> {
    if size == 0 || size > u64::MAX - PAGE_MASK {
        return Err(KernError::InvalidArgument);
    }
    let size = round_page(size);
    let address = trunc_page(address);

    let mut guard = map.write();
    let (start, prev) = if anywhere {
        let (g, result) = vm_map_find_space(map, guard, address, size, mask);
        guard = g;
        result?
    } else {
        let end = address.checked_add(size).ok_or(KernError::InvalidAddress)?;
        if address < map.min_offset || end > map.max_offset {
            return Err(KernError::InvalidAddress);
        }
        match guard.lookup_entry(address) {
            EntryLookup::Contained(_) => return Err(KernError::InvalidAddress),
            EntryLookup::Preceding(prev) => {
                if let Some(next) = guard.next_key(prev) {
                    if guard.entry(next).start < end {
                        return Err(KernError::InvalidAddress);
                    }
                }
                (address, prev)
            }
        }
    };
    let end = start + size;

    // Extend the previous entry instead of creating a new one.
    if object.is_none() {
        if let Some(prev_key) = prev {
            let prev_entry = guard.entry(prev_key);
            let compatible = prev_entry.end == start
                && !prev_entry.is_shared()
                && !prev_entry.is_sub_map()
                && !prev_entry.in_transition()
                && prev_entry.needs_copy() == needs_copy
                && prev_entry.inheritance == inheritance
                && prev_entry.protection == cur_protection
                && prev_entry.max_protection == max_protection
                && prev_entry.wired_count == 0
                && prev_entry.projected_on.is_none()
                && vm_object_coalesce(
                    prev_entry.object.object(),
                    prev_entry.offset,
                    prev_entry.size(),
                    size,
                );
            if compatible {
                guard.extend_entry(prev_key, end);
                guard.set_hint(prev_key);
                counters::C_VM_MAP_ENTER_COALESCE.inc();
                log::debug!("vm_map_enter: map {} coalesced [{:#x}, {:#x})", map.id.0, start, end);
                drop(guard);
                if map.wiring_required() {
                    vm_map_pageable(map, start, end, cur_protection)?;
                }
                return Ok(start);
            }
        }
    }

    let mut entry = VmMapEntry::new(guard.header().zone(), start, end);
    entry.object = EntryObject::from_object(object.clone());
    entry.offset = offset;
    entry.set_needs_copy(needs_copy);
    entry.inheritance = inheritance;
    entry.protection = cur_protection;
    entry.max_protection = max_protection;
    guard.link(entry);
    guard.set_hint(start);
    counters::C_VM_MAP_ENTER_NEW_ENTRY.inc();
    log::debug!(
        "vm_map_enter: map {} [{:#x}, {:#x}) prot={:?}",
        map.id.0,
        start,
        end,
        cur_protection
    );

    if TUNABLES.pmap_enter_enable.load(Ordering::Relaxed)
        && !anywhere
        && !needs_copy
        && size < TUNABLES.pmap_enter_max_size.load(Ordering::Relaxed)
    {
        if let Some(object) = &object {
            vm_map_pmap_enter(map, start, end, object, offset, cur_protection);
        }
    }
    drop(guard);

    if map.wiring_required() {
        vm_map_pageable(map, start, end, cur_protection)?;
    }
    Ok(start)
}

/// Enter already-resident pages of `object` over a new range
fn vm_map_pmap_enter(map: &VmMap, start: u64, end: u64, object: &Arc<VmObject>, offset: u64, prot: VmProt) {
    for (page_offset, page) in object.resident_pages(offset, offset + (end - start)) {
        if page.is_busy() || page.is_absent() {
            continue;
        }
        map.pmap.enter(start + (page_offset - offset), &page, prot, false);
    }
}

// ============================================================================
// Deletion
// ============================================================================

/// Release everything an unlinked entry holds
pub(crate) fn entry_destroy(pmap: &Pmap, entry: VmMapEntry) {
    if entry.wired_count != 0 {
        vm_fault_unwire(pmap, &entry);
    }
    if entry.is_shared() {
        if let Some(object) = entry.object.object() {
            object.pmap_remove(entry.offset, entry.offset + entry.size());
        }
    }
    pmap.remove(entry.start, entry.end);
}

/// Delete the entry at `key` (vm_map_entry_delete)
pub(crate) fn vm_map_entry_delete(map: &VmMap, state: &mut MapState, key: u64) {
    let entry = state.unlink(key);
    entry_destroy(&map.pmap, entry);
}

/// Remove `[start, end)` from a write-locked map (vm_map_delete)
///
/// May sleep on entries in transition, hence the guard round trip.
pub(crate) fn vm_map_delete<'a>(
    map: &'a VmMap,
    mut guard: MapWriteGuard<'a>,
    start: u64,
    end: u64,
) -> MapWriteGuard<'a> {
    let mut addr = start;
    while addr < end {
        let Some(key) = guard.clip_to_start(addr) else {
            break;
        };
        let entry_start = guard.entry(key).start;
        if entry_start >= end {
            break;
        }
        guard.clip_end(key, end);
        if guard.entry(key).in_transition() {
            guard.entry_mut(key).flags.insert(EntryFlags::NEEDS_WAKEUP);
            guard = vm_map_entry_wait(map, guard);
            addr = entry_start;
            continue;
        }
        let entry_end = guard.entry(key).end;
        vm_map_entry_delete(map, &mut guard, key);
        addr = entry_end;
    }
    thread_wakeup(map.space_event());
    guard
}

/// Remove all mappings in `[start, end)` (vm_map_remove)
pub fn vm_map_remove(map: &VmMap, start: u64, end: u64) -> KernResult<()> {
    let (start, end) = map.clamp(start, end);
    let guard = map.write();
    let guard = vm_map_delete(map, guard, start, end);
    drop(guard);
    log::debug!("vm_map_remove: map {} [{:#x}, {:#x})", map.id.0, start, end);
    Ok(())
}

// ============================================================================
// Protection and Inheritance
// ============================================================================

/// Change protection over `[start, end)` (vm_map_protect)
///
/// Validation runs over the whole range before anything is changed. With
/// `set_max` the maximum protection becomes `new_prot` and the current
/// protection is intersected with it; otherwise the current protection
/// becomes exactly `new_prot`.
pub fn vm_map_protect(map: &VmMap, start: u64, end: u64, new_prot: VmProt, set_max: bool) -> KernResult<()> {
    let (start, end) = map.clamp(start, end);
    let mut guard = map.write();

    let first = match guard.lookup_entry(start) {
        EntryLookup::Contained(key) => Some(key),
        EntryLookup::Preceding(prev) => guard.next_key(prev),
    };

    let mut cursor = first;
    while let Some(key) = cursor {
        let entry = guard.entry(key);
        if entry.start >= end {
            break;
        }
        if entry.is_sub_map() {
            return Err(KernError::InvalidArgument);
        }
        if !(entry.max_protection | VmProt::NOTIFY).contains(new_prot) {
            return Err(KernError::ProtectionFailure);
        }
        cursor = guard.next_key(Some(key));
    }

    let mut changed = false;
    let mut cursor = match first {
        Some(key) => Some(guard.clip_start(key, start)),
        None => None,
    };
    while let Some(key) = cursor {
        if guard.entry(key).start >= end {
            break;
        }
        guard.clip_end(key, end);
        let entry = guard.entry_mut(key);
        let old_prot = entry.protection;
        if set_max {
            entry.max_protection = new_prot - VmProt::NOTIFY;
            entry.protection = new_prot & old_prot;
        } else {
            entry.protection = new_prot;
        }
        if entry.protection != old_prot {
            let mut hw_prot = entry.protection - VmProt::NOTIFY;
            if entry.needs_copy() {
                hw_prot.remove(VmProt::WRITE);
            }
            map.pmap.protect(entry.start, entry.end, hw_prot);
            changed = true;
        }
        cursor = guard.next_key(Some(key));
    }
    if changed {
        guard.touch();
    }
    Ok(())
}

/// Set the fork inheritance of `[start, end)` (vm_map_inherit)
pub fn vm_map_inherit(map: &VmMap, start: u64, end: u64, new_inheritance: VmInherit) -> KernResult<()> {
    let (start, end) = map.clamp(start, end);
    let mut guard = map.write();
    let mut cursor = guard.clip_to_start(start);
    while let Some(key) = cursor {
        if guard.entry(key).start >= end {
            break;
        }
        guard.clip_end(key, end);
        guard.entry_mut(key).inheritance = new_inheritance;
        cursor = guard.next_key(Some(key));
    }
    Ok(())
}

/// True when all of `[start, end)` is mapped with at least `protection`
pub fn vm_map_check_protection(map: &VmMap, start: u64, end: u64, protection: VmProt) -> bool {
    let state = map.read();
    let mut addr = start;
    let mut key = match state.lookup_entry(start) {
        EntryLookup::Contained(key) => key,
        EntryLookup::Preceding(_) => return false,
    };
    loop {
        let entry = state.entry(key);
        if entry.start > addr || !entry.protection.contains(protection) {
            return false;
        }
        if entry.end >= end {
            return true;
        }
        addr = entry.end;
        key = match state.next_key(Some(key)) {
            Some(next) => next,
            None => return false,
        };
    }
}

// ============================================================================
// Sub-maps, Regions and Simplification
// ============================================================================

/// Turn the range `[start, end)` into a window onto `submap`
/// (vm_map_submap)
///
/// The range must be exactly one entry with no backing object.
pub fn vm_map_submap(map: &VmMap, start: u64, end: u64, submap: &Arc<VmMap>) -> KernResult<()> {
    let (start, end) = map.clamp(start, end);
    let mut guard = map.write();
    let Some(key) = guard.clip_to_start(start) else {
        return Err(KernError::InvalidArgument);
    };
    guard.clip_end(key, end);
    let entry = guard.entry_mut(key);
    if entry.start != start || entry.end != end || !entry.object.is_none() {
        return Err(KernError::InvalidArgument);
    }
    entry.object = EntryObject::SubMap(Arc::clone(submap));
    guard.touch();
    Ok(())
}

/// Description of one region (vm_region)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRegionInfo {
    pub start: u64,
    pub size: u64,
    pub protection: VmProt,
    pub max_protection: VmProt,
    pub inheritance: VmInherit,
    pub shared: bool,
    pub object: Option<VmObjectId>,
    pub offset: u64,
}

/// Describe the first region at or after `address` (vm_map_region)
pub fn vm_map_region(map: &VmMap, address: u64) -> KernResult<VmRegionInfo> {
    let state = map.read();
    let key = match state.lookup_entry(address) {
        EntryLookup::Contained(key) => key,
        EntryLookup::Preceding(prev) => state.next_key(prev).ok_or(KernError::NoSpace)?,
    };
    let entry = state.entry(key);
    Ok(VmRegionInfo {
        start: entry.start,
        size: entry.size(),
        protection: entry.protection,
        max_protection: entry.max_protection,
        inheritance: entry.inheritance,
        shared: entry.is_shared(),
        object: entry.object.object_id(),
        offset: entry.offset,
    })
}

/// Merge the entry starting at `start` into its predecessor when they are
/// indistinguishable (vm_map_simplify)
pub fn vm_map_simplify(map: &VmMap, start: u64) -> bool {
    let mut guard = map.write();
    let key = match guard.lookup_entry(start) {
        EntryLookup::Contained(key) if key == start => key,
        _ => return false,
    };
    let Some(prev_key) = guard.header().prev_key(key) else {
        return false;
    };
    let this = guard.entry(key);
    let prev = guard.entry(prev_key);
    let same_object = match (&prev.object, &this.object) {
        (EntryObject::Object(a), EntryObject::Object(b)) => Arc::ptr_eq(a, b),
        _ => false,
    };
    let mergeable = same_object
        && prev.end == this.start
        && prev.offset + prev.size() == this.offset
        && prev.flags == this.flags
        && !prev.in_transition()
        && prev.inheritance == this.inheritance
        && prev.protection == this.protection
        && prev.max_protection == this.max_protection
        && prev.wired_count == this.wired_count
        && prev.user_wired_count == this.user_wired_count
        && prev.projected_on.is_none()
        && this.projected_on.is_none();
    if !mergeable {
        return false;
    }
    // One merge is one version step; the unlink accounts for it.
    let this = guard.unlink(key);
    guard.grow_entry(prev_key, this.end);
    guard.set_hint(prev_key);
    counters::C_VM_MAP_SIMPLIFY.inc();
    true
}

/// Query or set a machine attribute over a mapped range
/// (vm_map_machine_attribute)
pub fn vm_map_machine_attribute(
    map: &VmMap,
    address: u64,
    size: u64,
    attribute: MachineAttribute,
    value: MachineAttributeVal,
) -> KernResult<MachineAttributeVal> {
    let end = address.checked_add(size).ok_or(KernError::InvalidAddress)?;
    if address < map.min_offset || end > map.max_offset {
        return Err(KernError::InvalidAddress);
    }
    let _guard = map.read();
    map.pmap.attribute(address, size, attribute, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::vm_object::vm_object_allocate;
    use crate::mach_vm::vm_page::PAGE_SIZE;

    fn new_map(min: u64, max: u64) -> Arc<VmMap> {
        vm_map_create(pmap_create(), min, max, true)
    }

    fn enter_fixed(map: &VmMap, start: u64, size: u64) -> KernResult<u64> {
        vm_map_enter(
            map,
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
    }

    #[test]
    fn test_vm_prot() {
        assert!(VmProt::DEFAULT.contains(VmProt::READ | VmProt::WRITE));
        assert!(!VmProt::DEFAULT.contains(VmProt::EXECUTE));
        assert_eq!(VmProt::ALL.bits(), 7);
        assert!(VmProt::NONE.is_empty());
    }

    #[test]
    fn test_lookup_entry() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x2000, 0x2000).unwrap();
        let state = map.read();
        assert_eq!(state.lookup_entry(0x2000), EntryLookup::Contained(0x2000));
        assert_eq!(state.lookup_entry(0x3fff), EntryLookup::Contained(0x2000));
        assert_eq!(state.lookup_entry(0x4000), EntryLookup::Preceding(Some(0x2000)));
        assert_eq!(state.lookup_entry(0x1000), EntryLookup::Preceding(None));
    }

    #[test]
    fn test_clip_is_idempotent_at_boundaries() {
        let map = new_map(0, 0x100000);
        let object = vm_object_allocate(0x4000);
        vm_map_enter(
            &map,
            0x4000,
            0x4000,
            0,
            false,
            Some(object),
            0,
            false,
            VmProt::DEFAULT,
            VmProt::ALL,
            VmInherit::Copy,
        )
        .unwrap();
        let ts = map.timestamp();
        vm_map_clip_start(&map, 0x4000);
        vm_map_clip_end(&map, 0x7fff + 1);
        assert_eq!(map.nentries(), 1);
        assert_eq!(map.timestamp(), ts);

        vm_map_clip_start(&map, 0x5000);
        assert_eq!(map.nentries(), 2);
        assert_eq!(map.timestamp(), ts + 1);
        let state = map.read();
        let back = state.entry(0x5000);
        assert_eq!(back.offset, 0x1000);
        assert_eq!(back.end, 0x8000);
        assert_eq!(state.entry(0x4000).end, 0x5000);
        assert!(state.validate(0, 0x100000).is_ok());
    }

    #[test]
    fn test_enter_fixed_rejects_overlap() {
        let map = new_map(0x1000, 0x10000);
        enter_fixed(&map, 0x2000, 0x2000).unwrap();
        assert_eq!(enter_fixed(&map, 0x3000, 0x1000), Err(KernError::InvalidAddress));
        assert_eq!(enter_fixed(&map, 0x1000, 0x2000), Err(KernError::InvalidAddress));
        assert_eq!(enter_fixed(&map, 0xf000, 0x2000), Err(KernError::InvalidAddress));
        assert_eq!(enter_fixed(&map, 0x8000, 0), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_enter_abutting_coalesces() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x2000, 0x1000).unwrap();
        enter_fixed(&map, 0x3000, 0x1000).unwrap();
        assert_eq!(map.nentries(), 1);
        let state = map.read();
        assert_eq!(state.entry(0x2000).end, 0x4000);
        assert_eq!(state.size(), 0x2000);
    }

    #[test]
    fn test_enter_anywhere_uses_first_free() {
        let map = new_map(0x1000, 0x10000);
        let a = vm_map_enter(
            &map,
            0,
            PAGE_SIZE,
            0,
            true,
            Some(vm_object_allocate(PAGE_SIZE)),
            0,
            false,
            VmProt::DEFAULT,
            VmProt::ALL,
            VmInherit::Copy,
        )
        .unwrap();
        assert_eq!(a, 0x1000);
        let b = vm_map_enter(
            &map,
            0,
            0x3000,
            0x3fff,
            true,
            Some(vm_object_allocate(0x3000)),
            0,
            false,
            VmProt::DEFAULT,
            VmProt::ALL,
            VmInherit::Copy,
        )
        .unwrap();
        assert_eq!(b, 0x4000);
        assert_eq!(map.read().first_free(), Some(0x1000));
    }

    #[test]
    fn test_enter_anywhere_no_space() {
        let map = new_map(0, 0x4000);
        enter_fixed(&map, 0, 0x3000).unwrap();
        let result = vm_map_enter(
            &map,
            0,
            0x2000,
            0,
            true,
            Some(vm_object_allocate(0x2000)),
            0,
            false,
            VmProt::DEFAULT,
            VmProt::ALL,
            VmInherit::Copy,
        );
        assert_eq!(result, Err(KernError::NoSpace));
    }

    #[test]
    fn test_remove_middle() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x1000, 0x4000).unwrap();
        vm_map_remove(&map, 0x2000, 0x3000).unwrap();
        assert_eq!(map.nentries(), 2);
        assert_eq!(map.size(), 0x3000);
        assert!(!vm_map_lookup_entry(&map, 0x2000).0);
        assert_eq!(map.read().first_free(), Some(0x1000));
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_protect_validates_before_clipping() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x1000, 0x4000).unwrap();
        vm_map_protect(&map, 0x1000, 0x5000, VmProt::READ, true).unwrap();
        let ts = map.timestamp();
        assert_eq!(
            vm_map_protect(&map, 0x2000, 0x3000, VmProt::DEFAULT, false),
            Err(KernError::ProtectionFailure)
        );
        assert_eq!(map.nentries(), 1);
        assert_eq!(map.timestamp(), ts);
    }

    #[test]
    fn test_protect_set_max() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x1000, 0x1000).unwrap();
        vm_map_protect(&map, 0x1000, 0x2000, VmProt::READ | VmProt::EXECUTE, true).unwrap();
        let state = map.read();
        let entry = state.entry(0x1000);
        assert_eq!(entry.max_protection, VmProt::READ | VmProt::EXECUTE);
        assert_eq!(entry.protection, VmProt::READ);
    }

    #[test]
    fn test_inherit_clips() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x1000, 0x3000).unwrap();
        vm_map_inherit(&map, 0x2000, 0x3000, VmInherit::Share).unwrap();
        let state = map.read();
        assert_eq!(state.nentries(), 3);
        assert_eq!(state.entry(0x2000).inheritance, VmInherit::Share);
        assert_eq!(state.entry(0x1000).inheritance, VmInherit::Copy);
    }

    #[test]
    fn test_simplify_after_clip() {
        let map = new_map(0, 0x100000);
        let object = vm_object_allocate(0x2000);
        vm_map_enter(
            &map,
            0x1000,
            0x2000,
            0,
            false,
            Some(object),
            0,
            false,
            VmProt::DEFAULT,
            VmProt::ALL,
            VmInherit::Copy,
        )
        .unwrap();
        let ts = map.timestamp();
        vm_map_clip_start(&map, 0x2000);
        assert_eq!(map.nentries(), 2);
        assert_eq!(map.timestamp(), ts + 1);
        assert!(vm_map_simplify(&map, 0x2000));
        assert_eq!(map.nentries(), 1);
        assert_eq!(map.size(), 0x2000);
        assert_eq!(map.timestamp(), ts + 2);
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_region() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x8000, 0x1000).unwrap();
        let info = vm_map_region(&map, 0x1000).unwrap();
        assert_eq!(info.start, 0x8000);
        assert_eq!(info.size, 0x1000);
        assert_eq!(vm_map_region(&map, 0x9000), Err(KernError::NoSpace));
    }

    #[test]
    fn test_submap_requires_exact_empty_entry() {
        let map = new_map(0, 0x100000);
        let sub = new_map(0, 0x100000);
        enter_fixed(&map, 0x1000, 0x2000).unwrap();
        vm_map_submap(&map, 0x1000, 0x3000, &sub).unwrap();
        assert!(map.read().entry(0x1000).is_sub_map());
        assert_eq!(
            vm_map_protect(&map, 0x1000, 0x2000, VmProt::READ, false),
            Err(KernError::InvalidArgument)
        );
    }

    #[test]
    fn test_check_protection() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x1000, 0x1000).unwrap();
        enter_fixed(&map, 0x3000, 0x1000).unwrap();
        assert!(vm_map_check_protection(&map, 0x1000, 0x2000, VmProt::READ));
        assert!(!vm_map_check_protection(&map, 0x1000, 0x4000, VmProt::READ));
        assert!(!vm_map_check_protection(&map, 0x1000, 0x2000, VmProt::EXECUTE));
    }

    #[test]
    fn test_print() {
        let map = new_map(0, 0x100000);
        enter_fixed(&map, 0x1000, 0x1000).unwrap();
        let text = alloc::format!("{}", map);
        assert!(text.contains("nentries=1"));
        vm_map_print(&map);
    }
}
