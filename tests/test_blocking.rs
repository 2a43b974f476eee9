//! Integration tests for blocking map operations
//!
//! These tests use real threads to check that operations sleeping on a
//! map (waiting for address space, or for an entry in transition) are
//! woken by the operation that releases them, and that a copy made with
//! the map unlocked notices changes made meanwhile.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mach_vm_map::kern::copyio::{copyin, copyout};
use mach_vm_map::kern::counters;
use mach_vm_map::kern::sched_prim::{event_from_addr, has_waiters};
use mach_vm_map::mach_vm::pmap::pmap_create;
use mach_vm_map::mach_vm::vm_map::{
    kernel_map, vm_map_create, vm_map_enter, vm_map_lookup_entry, vm_map_remove, VmInherit,
    VmMap, VmProt, VM_MIN_KERNEL_ADDRESS,
};
use mach_vm_map::mach_vm::vm_map_copy::{vm_map_copyin, vm_map_copyout};
use mach_vm_map::mach_vm::vm_map_page_list::{vm_map_copyin_page_list, VM_MAP_COPY_PAGE_LIST_MAX};
use mach_vm_map::mach_vm::vm_map_pageable::vm_map_pageable;
use mach_vm_map::mach_vm::vm_object::{vm_object_allocate, vm_object_allocate_permanent};
use mach_vm_map::mach_vm::vm_page::{vm_page_grab, PAGE_SIZE};

fn enter_anon(map: &VmMap, start: u64, size: u64, anywhere: bool) -> u64 {
    vm_map_enter(
        map,
        start,
        size,
        0,
        anywhere,
        None,
        0,
        false,
        VmProt::DEFAULT,
        VmProt::ALL,
        VmInherit::Copy,
    )
    .expect("enter failed")
}

#[test]
fn test_enter_waits_for_space() {
    let map = vm_map_create(pmap_create(), 0x1000, 0x3000, true);
    map.set_wait_for_space(true);
    enter_anon(&map, 0x1000, 0x2000, false);

    let waiter = Arc::clone(&map);
    let handle = thread::spawn(move || enter_anon(&waiter, 0, PAGE_SIZE, true));

    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    vm_map_remove(&map, 0x1000, 0x2000).unwrap();
    let addr = handle.join().expect("waiter panicked");
    assert_eq!(addr, 0x1000);
    assert_eq!(map.size(), 0x2000);
}

#[test]
fn test_delete_waits_for_entry_in_transition() {
    let npages = VM_MAP_COPY_PAGE_LIST_MAX as u64 + 1;
    let src = vm_map_create(pmap_create(), 0, 0x1000_0000, true);
    enter_anon(&src, 0x100000, npages * PAGE_SIZE, false);
    for i in 0..npages {
        copyout(&[i as u8], &src, 0x100000 + i * PAGE_SIZE).unwrap();
    }

    // Hold the page the continuation will need.
    let last = src
        .pmap()
        .extract(0x100000 + (npages - 1) * PAGE_SIZE)
        .expect("last page resident")
        .page;
    assert!(last.try_busy());

    let copy = vm_map_copyin_page_list(&src, 0x100000, npages * PAGE_SIZE, false, false).unwrap();
    assert!(copy.page_list().unwrap().has_cont());

    let dst = vm_map_create(pmap_create(), 0, 0x1000_0000, true);
    let consumer_map = Arc::clone(&dst);
    let consumer = thread::spawn(move || vm_map_copyout(&consumer_map, copy));

    while dst.nentries() == 0 {
        thread::yield_now();
    }
    assert!(dst.read().entries().all(|e| e.in_transition()));

    let remover_map = Arc::clone(&dst);
    let remover = thread::spawn(move || vm_map_remove(&remover_map, 0, 0x1000_0000));

    thread::sleep(Duration::from_millis(50));
    assert!(!consumer.is_finished());
    assert!(!remover.is_finished());

    last.wakeup_done();
    let addr = consumer.join().expect("consumer panicked").expect("copyout failed");
    remover.join().expect("remover panicked").unwrap();

    assert_eq!(addr, 0);
    assert_eq!(dst.nentries(), 0);
    let mut byte = [0u8];
    copyin(&src, 0x100000 + (npages - 1) * PAGE_SIZE, &mut byte).unwrap();
    assert_eq!(byte[0], (npages - 1) as u8);
}

#[test]
fn test_remove_waits_for_kernel_wiring() {
    let map = kernel_map();
    let addr = VM_MIN_KERNEL_ADDRESS + 0x7000_0000;
    let object = vm_object_allocate(PAGE_SIZE);
    let page = vm_page_grab();
    assert!(object.page_insert(&page, 0));
    vm_map_enter(
        map,
        addr,
        PAGE_SIZE,
        0,
        false,
        Some(object),
        0,
        false,
        VmProt::DEFAULT,
        VmProt::ALL,
        VmInherit::Copy,
    )
    .expect("enter failed");

    // The second pass cannot finish while the page is busy.
    assert!(page.try_busy());
    let wirer = thread::spawn(move || vm_map_pageable(kernel_map(), addr, addr + PAGE_SIZE, VmProt::READ));
    while !has_waiters(event_from_addr(&*page)) {
        thread::yield_now();
    }
    assert!(map
        .read()
        .header()
        .get(addr)
        .is_some_and(|entry| entry.in_transition()));

    let remover = thread::spawn(move || vm_map_remove(kernel_map(), addr, addr + PAGE_SIZE));
    thread::sleep(Duration::from_millis(50));
    assert!(!remover.is_finished());
    assert!(vm_map_lookup_entry(map, addr).0);

    page.wakeup_done();
    wirer.join().expect("wirer panicked").unwrap();
    remover.join().expect("remover panicked").unwrap();
    assert!(!vm_map_lookup_entry(map, addr).0);
}

#[test]
fn test_copyin_retries_when_map_changes() {
    let map = vm_map_create(pmap_create(), 0, 0x1000_0000, true);
    vm_map_enter(
        &map,
        0x10000,
        PAGE_SIZE,
        0,
        false,
        Some(vm_object_allocate_permanent(PAGE_SIZE)),
        0,
        false,
        VmProt::DEFAULT,
        VmProt::ALL,
        VmInherit::Copy,
    )
    .expect("enter failed");
    copyout(b"device", &map, 0x10000).unwrap();
    let page = map.pmap().extract(0x10000).expect("page resident").page;
    let retries = counters::C_VM_MAP_COPYIN_RETRY.get();

    // Permanent memory is copied with the map unlocked; hold the page so
    // the map can change underneath.
    assert!(page.try_busy());
    let copier_map = Arc::clone(&map);
    let copier = thread::spawn(move || vm_map_copyin(&copier_map, 0x10000, PAGE_SIZE, false));
    while !has_waiters(event_from_addr(&*page)) {
        thread::yield_now();
    }
    let before = map.timestamp();
    enter_anon(&map, 0x40000, PAGE_SIZE, false);
    assert_eq!(map.timestamp(), before + 1);
    page.wakeup_done();

    let copy = copier.join().expect("copier panicked").expect("copyin failed");
    assert!(counters::C_VM_MAP_COPYIN_RETRY.get() > retries);

    let dst = vm_map_create(pmap_create(), 0, 0x1000_0000, true);
    let addr = vm_map_copyout(&dst, copy).unwrap();
    let mut buf = [0u8; 6];
    copyin(&dst, addr, &mut buf).unwrap();
    assert_eq!(&buf, b"device");
}
