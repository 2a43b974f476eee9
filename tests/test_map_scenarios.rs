//! Integration tests for end-to-end map scenarios
//!
//! These tests drive whole maps through the public entry points: entering
//! and protecting memory, forking with shared and copied inheritance, and
//! page-list copies larger than one batch.

use std::collections::HashSet;
use std::sync::Arc;

use mach_vm_map::kern::copyio::{copyin, copyout};
use mach_vm_map::kern::kern_return::KernError;
use mach_vm_map::mach_vm::pmap::pmap_create;
use mach_vm_map::mach_vm::vm_map::{
    vm_map_create, vm_map_enter, vm_map_inherit, vm_map_lookup_entry, vm_map_protect, VmInherit,
    VmMap, VmProt,
};
use mach_vm_map::mach_vm::vm_map_copy::vm_map_copy_discard;
use mach_vm_map::mach_vm::vm_map_fork::vm_map_fork;
use mach_vm_map::mach_vm::vm_map_page_list::{
    vm_map_copy_invoke_cont, vm_map_copyin_page_list, VM_MAP_COPY_PAGE_LIST_MAX,
};
use mach_vm_map::mach_vm::vm_object::vm_object_allocate;
use mach_vm_map::mach_vm::vm_page::{PageRef, PAGE_SIZE};

fn new_map() -> Arc<VmMap> {
    vm_map_create(pmap_create(), 0, 0x100000, true)
}

/// Scenario A: enter anywhere, then look the range up
fn scenario_a(map: &VmMap) -> u64 {
    let object = vm_object_allocate(0x1000);
    let addr = vm_map_enter(
        map,
        0,
        0x1000,
        0,
        true,
        Some(object),
        0,
        false,
        VmProt::READ | VmProt::WRITE,
        VmProt::ALL,
        VmInherit::Copy,
    )
    .expect("enter failed");
    assert_eq!(addr % PAGE_SIZE, 0);
    assert!(addr >= map.min_offset() && addr + 0x1000 <= map.max_offset());
    addr
}

fn read_byte(map: &VmMap, addr: u64) -> u8 {
    let mut byte = [0u8];
    copyin(map, addr, &mut byte).expect("copyin failed");
    byte[0]
}

#[test]
fn test_scenario_a_enter_and_lookup() {
    let map = new_map();
    let addr = scenario_a(&map);
    assert_eq!(vm_map_lookup_entry(&map, addr), (true, Some((addr, addr + 0x1000))));
    assert_eq!(vm_map_lookup_entry(&map, addr + 0xfff), (true, Some((addr, addr + 0x1000))));
    assert_eq!(map.nentries(), 1);
    assert_eq!(map.size(), 0x1000);
}

#[test]
fn test_scenario_b_protect_within_max() {
    let map = new_map();
    let addr = scenario_a(&map);
    vm_map_protect(&map, addr, addr + 0x1000, VmProt::READ, false).expect("protect to READ");
    vm_map_protect(&map, addr, addr + 0x1000, VmProt::WRITE, false).expect("protect to WRITE");

    let state = map.read();
    let entry = state.header().get(addr).expect("entry");
    assert_eq!(entry.protection, VmProt::WRITE);
    assert_eq!(entry.max_protection, VmProt::ALL);
    drop(state);

    vm_map_protect(&map, addr, addr + 0x1000, VmProt::READ, true).expect("lower max");
    assert_eq!(
        vm_map_protect(&map, addr, addr + 0x1000, VmProt::WRITE, false),
        Err(KernError::ProtectionFailure)
    );
}

#[test]
fn test_scenario_c_fork_share() {
    let m1 = new_map();
    let addr = scenario_a(&m1);
    copyout(&[1], &m1, addr + 0x10).unwrap();
    vm_map_inherit(&m1, addr, addr + 0x1000, VmInherit::Share).unwrap();

    let m2 = vm_map_fork(&m1).expect("fork failed");
    assert_eq!(vm_map_lookup_entry(&m2, addr), (true, Some((addr, addr + 0x1000))));
    assert!(m2.pmap().is_mapped(addr));

    copyout(&[42], &m1, addr + 0x10).unwrap();
    assert_eq!(read_byte(&m2, addr + 0x10), 42);
    copyout(&[43], &m2, addr + 0x20).unwrap();
    assert_eq!(read_byte(&m1, addr + 0x20), 43);
}

#[test]
fn test_scenario_d_fork_copy() {
    let m1 = new_map();
    let addr = scenario_a(&m1);
    copyout(&[7], &m1, addr + 0x10).unwrap();

    let m3 = vm_map_fork(&m1).expect("fork failed");
    copyout(&[99], &m1, addr + 0x10).unwrap();
    assert_eq!(read_byte(&m1, addr + 0x10), 99);
    assert_eq!(read_byte(&m3, addr + 0x10), 7);

    copyout(&[55], &m3, addr + 0x10).unwrap();
    assert_eq!(read_byte(&m1, addr + 0x10), 99);
    assert_eq!(read_byte(&m3, addr + 0x10), 55);
}

fn filled_map(npages: u64) -> Arc<VmMap> {
    let map = vm_map_create(pmap_create(), 0, 0x1000_0000, true);
    vm_map_enter(
        &map,
        0x100000,
        npages * PAGE_SIZE,
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
    for i in 0..npages {
        copyout(&[(i % 251) as u8], &map, 0x100000 + i * PAGE_SIZE).unwrap();
    }
    map
}

#[test]
fn test_scenario_e_page_list_continuations() {
    let npages = 2 * VM_MAP_COPY_PAGE_LIST_MAX as u64 + 10;
    let map = filled_map(npages);
    let mut copy = vm_map_copyin_page_list(&map, 0x100000, npages * PAGE_SIZE, false, false).unwrap();
    assert!(copy.page_list().unwrap().has_cont());

    let mut seen = HashSet::new();
    let mut held: Vec<PageRef> = Vec::new();
    loop {
        let list = copy.page_list().unwrap();
        assert!(list.npages() <= VM_MAP_COPY_PAGE_LIST_MAX);
        for page in list.pages() {
            assert!(page.is_busy());
            assert!(seen.insert(page.phys_addr), "page counted twice");
            held.push(Arc::clone(page));
        }
        match vm_map_copy_invoke_cont(&mut copy).unwrap() {
            Some(next) => {
                vm_map_copy_discard(copy);
                copy = next;
            }
            None => break,
        }
    }
    vm_map_copy_discard(copy);

    assert_eq!(held.len() as u64, npages);
    for (i, page) in held.iter().enumerate() {
        assert!(!page.is_busy(), "page left busy");
        let mut byte = [0u8];
        page.read(0, &mut byte);
        assert_eq!(byte[0], (i % 251) as u8);
    }
}

#[test]
fn test_scenario_e_abort_releases_pages() {
    let npages = VM_MAP_COPY_PAGE_LIST_MAX as u64 + 5;
    let map = filled_map(npages);
    let copy = vm_map_copyin_page_list(&map, 0x100000, npages * PAGE_SIZE, false, false).unwrap();
    let held: Vec<PageRef> = copy.page_list().unwrap().pages().to_vec();
    assert_eq!(held.len(), VM_MAP_COPY_PAGE_LIST_MAX);

    vm_map_copy_discard(copy);
    assert!(held.iter().all(|page| !page.is_busy()));
    assert_eq!(map.size(), npages * PAGE_SIZE);
    assert_eq!(read_byte(&map, 0x100000 + PAGE_SIZE), 1);
}

#[test]
fn test_scenario_e_destroying_transfer_empties_source() {
    let npages = VM_MAP_COPY_PAGE_LIST_MAX as u64 + 5;
    let src = filled_map(npages);
    let copy = vm_map_copyin_page_list(&src, 0x100000, npages * PAGE_SIZE, true, true).unwrap();
    let dst = vm_map_create(pmap_create(), 0, 0x1000_0000, true);
    let addr = mach_vm_map::mach_vm::vm_map_copy::vm_map_copyout(&dst, copy).unwrap();

    assert_eq!(src.nentries(), 0);
    assert_eq!(dst.size(), npages * PAGE_SIZE);
    for i in [0, VM_MAP_COPY_PAGE_LIST_MAX as u64, npages - 1] {
        assert_eq!(read_byte(&dst, addr + i * PAGE_SIZE), (i % 251) as u8);
    }
}
