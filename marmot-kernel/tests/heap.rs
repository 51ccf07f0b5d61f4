//! The per-process virtual heap: first-fit allocation, coalescing, and
//! list traversal over demand-paged memory.

mod common;

use marmot_abi::{HEAP_BASE, PAGE_SIZE, store_page_addr};
use marmot_kernel::memory::HeapError;
use marmot_kernel::{Kernel, VmConfig};

fn child_with_heap(kernel: &mut Kernel, pages: usize) -> marmot_kernel::process::Pid {
    let pid = kernel.vcreate("child", 100, pages).unwrap();
    kernel.context_switch(pid).unwrap();
    pid
}

#[test]
fn vcreate_seeds_the_free_list_in_the_store() {
    let mut kernel = Kernel::new(VmConfig::default());
    let pid = kernel.vcreate("child", 100, 20).unwrap();

    // The initial node is written physically, because the child has never
    // run and cannot fault its own heap in yet.
    let store = kernel.processes().get(pid).unwrap().heap().unwrap().store;
    let base = store_page_addr(store.index(), 0);
    assert_eq!(kernel.machine().read_word(base), 0);
    assert_eq!(
        kernel.machine().read_word(base + 4),
        (20 * PAGE_SIZE) as u32
    );

    // No heap page is resident until someone touches one.
    assert_eq!(common::backing_frame_count(&kernel), 0);
}

#[test]
fn first_fit_reuses_and_appends_exactly() {
    let mut kernel = Kernel::new(VmConfig::default());
    child_with_heap(&mut kernel, 20);
    let heap_bytes = (20 * PAGE_SIZE) as u32;

    let a = kernel.vgetmem(200).unwrap();
    let b = kernel.vgetmem(120).unwrap();
    let c = kernel.vgetmem(96).unwrap();
    assert_eq!(a, HEAP_BASE);
    assert_eq!(b, HEAP_BASE + 200);
    assert_eq!(c, HEAP_BASE + 320);

    // Free A, then ask for something smaller: A's slot is reused and the
    // 40 spare bytes stay on the list.
    kernel.vfreemem(a, 200).unwrap();
    let d = kernel.vgetmem(160).unwrap();
    assert_eq!(d, a);

    // Free B: it coalesces with A's leftover into one 160-byte hole,
    // which is still too small for E, so E comes off the tail.
    kernel.vfreemem(b, 120).unwrap();
    let e = kernel.vgetmem(240).unwrap();
    assert_eq!(e, HEAP_BASE + 416);

    assert_eq!(
        kernel.heap_free_blocks().unwrap(),
        vec![
            (HEAP_BASE + 160, 160),
            (HEAP_BASE + 656, heap_bytes - 656),
        ]
    );
    common::check_invariants(&kernel);
}

#[test]
fn alloc_free_round_trip_restores_the_list() {
    let mut kernel = Kernel::new(VmConfig::default());
    child_with_heap(&mut kernel, 10);

    kernel.vgetmem(100).unwrap();
    let before = kernel.heap_free_blocks().unwrap();

    let addr = kernel.vgetmem(64).unwrap();
    kernel.vfreemem(addr, 64).unwrap();

    assert_eq!(kernel.heap_free_blocks().unwrap(), before);
    common::check_invariants(&kernel);
}

#[test]
fn traversal_faults_heap_pages_in() {
    let mut kernel = Kernel::new(VmConfig::default());
    child_with_heap(&mut kernel, 10);

    assert_eq!(common::backing_frame_count(&kernel), 0);
    kernel.vgetmem(64).unwrap();
    // The walk dereferenced the head node, pulling the first heap page in.
    assert!(common::backing_frame_count(&kernel) >= 1);
    common::check_invariants(&kernel);
}

#[test]
fn rejects_bad_sizes_and_addresses() {
    let mut kernel = Kernel::new(VmConfig::default());

    // The system process has no virtual heap.
    assert_eq!(kernel.vgetmem(64), Err(HeapError::NoHeap));

    child_with_heap(&mut kernel, 10);
    assert_eq!(kernel.vgetmem(0), Err(HeapError::InvalidSize));
    assert_eq!(kernel.vfreemem(HEAP_BASE, 0), Err(HeapError::InvalidSize));
    assert_eq!(kernel.vfreemem(0x1000, 8), Err(HeapError::InvalidAddress));

    // Larger than the whole heap.
    assert_eq!(
        kernel.vgetmem(10 * PAGE_SIZE as u32 + 8),
        Err(HeapError::NoMemory)
    );
}

#[test]
fn exhaustion_and_double_free_are_reported() {
    let mut kernel = Kernel::new(VmConfig::default());
    child_with_heap(&mut kernel, 10);
    let heap_bytes = (10 * PAGE_SIZE) as u32;

    let all = kernel.vgetmem(heap_bytes).unwrap();
    assert_eq!(all, HEAP_BASE);
    assert_eq!(kernel.vgetmem(8), Err(HeapError::NoMemory));

    kernel.vfreemem(all, heap_bytes).unwrap();
    // The range is free again; releasing any part of it is corruption.
    assert_eq!(
        kernel.vfreemem(all + 64, 32),
        Err(HeapError::Corrupted)
    );
    assert_eq!(
        kernel.heap_free_blocks().unwrap(),
        vec![(HEAP_BASE, heap_bytes)]
    );
    common::check_invariants(&kernel);
}

#[test]
fn heap_survives_eviction_of_its_own_pages() {
    // A pool small enough that the free-list pages themselves get evicted
    // and reloaded while the list is being walked.
    let mut kernel = Kernel::new(VmConfig { frames: 8 });
    child_with_heap(&mut kernel, 10);

    let one_page = PAGE_SIZE as u32;
    let x = kernel.vgetmem(one_page).unwrap();
    let y = kernel.vgetmem(one_page).unwrap();
    let z = kernel.vgetmem(one_page).unwrap();

    for (block, value) in [(x, 0x21u8), (y, 0x42), (z, 0x63)] {
        for offset in (0..one_page).step_by(1024) {
            kernel.store_u8(block + offset, value).unwrap();
        }
    }
    assert!(kernel.stats().evictions > 0);

    for (block, value) in [(x, 0x21u8), (y, 0x42), (z, 0x63)] {
        for offset in (0..one_page).step_by(1024) {
            assert_eq!(kernel.load_u8(block + offset).unwrap(), value);
        }
    }

    kernel.vfreemem(y, one_page).unwrap();
    assert_eq!(kernel.vgetmem(one_page).unwrap(), y);
    common::check_invariants(&kernel);
}
