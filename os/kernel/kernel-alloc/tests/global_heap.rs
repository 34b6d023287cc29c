mod common;

use common::{Machine, TestManager};
use kernel_alloc::GlobalHeap;
use std::alloc::{GlobalAlloc, Layout};

fn leaked_manager() -> &'static TestManager<'static> {
    let machine: &'static mut Machine = Box::leak(Box::new(Machine::new(1024, 0)));
    Box::leak(Box::new(machine.boot_full()))
}

#[test]
fn refuses_to_allocate_before_installation() {
    let heap = GlobalHeap::new();
    assert!(!heap.is_installed());
    let layout = Layout::from_size_align(64, 8).unwrap();
    assert!(unsafe { heap.alloc(layout) }.is_null());
}

#[test]
fn routes_allocations_to_kmalloc() {
    let mm = leaked_manager();
    let heap = GlobalHeap::new();
    assert!(heap.install(mm));
    assert!(!heap.install(leaked_manager()), "second install must be ignored");

    let layout = Layout::from_size_align(24, 8).unwrap();
    let p = unsafe { heap.alloc(layout) };
    assert!(!p.is_null());
    assert_eq!(mm.size_class_stats().next().unwrap().active_objects, 1);
    unsafe {
        p.write_bytes(0xEE, 24);
        heap.dealloc(p, layout);
    }
    assert_eq!(mm.size_class_stats().next().unwrap().active_objects, 0);
}

#[test]
fn alignment_is_honoured_by_rounding_up() {
    let mm = leaked_manager();
    let heap = GlobalHeap::new();
    heap.install(mm);

    let layout = Layout::from_size_align(16, 512).unwrap();
    let p = unsafe { heap.alloc(layout) };
    assert_eq!(p.addr() % 512, 0);
    unsafe { heap.dealloc(p, layout) };

    let page = Layout::from_size_align(4096, 4096).unwrap();
    let q = unsafe { heap.alloc(page) };
    assert_eq!(q.addr() % 4096, 0);
    unsafe { heap.dealloc(q, page) };

    let too_strict = Layout::from_size_align(64, 8192).unwrap();
    assert!(unsafe { heap.alloc(too_strict) }.is_null());
    mm.check_consistency();
}
