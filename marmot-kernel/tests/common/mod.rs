//! Consistency checks shared by the integration tests.
//!
//! Run after the interesting operations of a test: every check here must
//! hold whenever a syscall has returned and no fault is in flight.

use marmot_abi::{ENTRIES_PER_TABLE, GLOBAL_TABLE_COUNT};
use marmot_kernel::Kernel;
use marmot_kernel::memory::{FrameId, FrameKind, StoreStatus};

/// Count present page-table entries, across every live process, whose
/// base is the given physical page.
fn count_mappings_of(kernel: &Kernel, target_page: u32) -> usize {
    let mut count = 0;
    for pid in kernel.processes().live_pids() {
        for i in GLOBAL_TABLE_COUNT..ENTRIES_PER_TABLE {
            let pde = kernel.directory_entry(pid, i).unwrap();
            if !pde.is_present() {
                continue;
            }
            for j in 0..ENTRIES_PER_TABLE {
                let pte = kernel.machine().read_entry(pde.base_page(), j);
                if pte.is_present() && pte.base_page() == target_page {
                    count += 1;
                }
            }
        }
    }
    count
}

fn present_entries_in(kernel: &Kernel, table_page: u32) -> usize {
    (0..ENTRIES_PER_TABLE)
        .filter(|j| kernel.machine().read_entry(table_page, *j).is_present())
        .count()
}

pub fn check_invariants(kernel: &Kernel) {
    let frames = kernel.frames();
    let globals = kernel.global_tables();

    // The FIFO holds exactly the used frames, each once.
    let fifo = frames.fifo();
    for (id, frame) in frames.iter() {
        let occurrences = fifo.iter().filter(|f| **f == id).count();
        assert_eq!(
            occurrences,
            usize::from(frame.is_used()),
            "frame {} FIFO membership",
            id.index()
        );
    }

    for (id, frame) in frames.iter() {
        match frame.kind() {
            Some(FrameKind::Backing { bsid, .. }) => {
                // Each used backing frame sits exactly once on its store's
                // resident list, and holds at least one reference covered
                // by at least as many live page-table entries.
                let resident = kernel.stores().get(bsid).frames_in_core();
                assert_eq!(
                    resident.iter().filter(|f| **f == id).count(),
                    1,
                    "frame {} residency on store {}",
                    id.index(),
                    bsid.index()
                );
                assert!(frame.refcnt() >= 1, "used frame {} unreferenced", id.index());
                assert!(
                    count_mappings_of(kernel, id.phys_page()) >= frame.refcnt() as usize,
                    "frame {} has more references than mappings",
                    id.index()
                );
            }
            Some(FrameKind::Table) if !globals.contains(&id) => {
                // A table's reference count is its number of present
                // entries.
                assert_eq!(
                    frame.refcnt() as usize,
                    present_entries_in(kernel, id.phys_page()),
                    "table frame {} refcnt",
                    id.index()
                );
            }
            _ => {}
        }
    }

    for (bsid, store) in kernel.stores().iter() {
        match store.status() {
            StoreStatus::Free => {
                assert!(store.maps().is_empty(), "free store {} has maps", bsid.index());
                assert!(
                    store.frames_in_core().is_empty(),
                    "free store {} has resident frames",
                    bsid.index()
                );
                assert_eq!(store.npages(), 0);
            }
            StoreStatus::Used => {
                // Resident-list entries must be backing frames of this
                // store.
                for id in store.frames_in_core() {
                    match frames.get(*id).kind() {
                        Some(FrameKind::Backing { bsid: b, .. }) => assert_eq!(b, bsid),
                        other => panic!(
                            "store {} resident list holds frame {} of kind {other:?}",
                            bsid.index(),
                            id.index()
                        ),
                    }
                }
                // No two mappings of one process may overlap.
                for (i, a) in store.maps().iter().enumerate() {
                    for b in &store.maps()[i + 1..] {
                        if a.pid == b.pid {
                            assert!(
                                !a.overlaps(b.vpno, b.npages),
                                "overlapping mappings on store {}",
                                bsid.index()
                            );
                        }
                    }
                }
            }
        }
    }

    // Every live directory starts with the four global tables.
    for pid in kernel.processes().live_pids() {
        for (i, table) in globals.iter().enumerate() {
            let pde = kernel.directory_entry(pid, i).unwrap();
            assert!(pde.is_present(), "process {} entry {i} absent", pid.index());
            assert_eq!(
                pde.base_page(),
                table.phys_page(),
                "process {} entry {i} is not global table {i}",
                pid.index()
            );
        }
    }
}

/// Used backing-store frames, handy for leak accounting.
#[allow(dead_code)]
pub fn backing_frame_count(kernel: &Kernel) -> usize {
    kernel
        .frames()
        .iter()
        .filter(|(_, f)| matches!(f.kind(), Some(FrameKind::Backing { .. })))
        .count()
}

#[allow(dead_code)]
pub fn frame_ids(ids: &[FrameId]) -> Vec<usize> {
    ids.iter().map(|id| id.index()).collect()
}
