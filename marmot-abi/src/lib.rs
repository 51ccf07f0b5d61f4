//! Shared constants for the marmot virtual memory subsystem.
//!
//! Everything here is part of the fixed machine contract: the physical
//! memory layout, the paging geometry, and the numeric codes returned by
//! the syscall surface. The kernel and any harness driving it must agree
//! on these values, so they live in their own dependency-free crate.

#![cfg_attr(not(test), no_std)]

/// Bytes per page.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// 32-bit entries per page directory or page table (one frame each).
pub const ENTRIES_PER_TABLE: usize = PAGE_SIZE / 4;

/// Number of global page tables identity-mapping physical memory.
///
/// Together they cover pages `0..GLOBAL_PAGES`, i.e. the whole 16 MiB of
/// physical memory, and occupy entries `0..4` of every page directory.
pub const GLOBAL_TABLE_COUNT: usize = 4;

/// Pages covered by the global identity mapping.
pub const GLOBAL_PAGES: usize = GLOBAL_TABLE_COUNT * ENTRIES_PER_TABLE;

/// Total simulated physical memory: 16 MiB, pages `0..PHYS_PAGES`.
pub const PHYS_PAGES: usize = GLOBAL_PAGES;

/// Total simulated physical memory in bytes.
pub const PHYS_MEMORY_SIZE: usize = PHYS_PAGES * PAGE_SIZE;

/// Physical page number of frame 0. Frame `i` occupies physical page
/// `FRAME_POOL_BASE_PAGE + i`.
pub const FRAME_POOL_BASE_PAGE: usize = 1024;

/// Capacity of the frame pool. A kernel may be configured with fewer
/// frames, never more.
pub const MAX_FRAMES: usize = 1024;

/// Number of backing stores.
pub const BS_COUNT: usize = 8;

/// Physical byte address of backing store 0.
pub const BS_BASE: u32 = 0x0080_0000;

/// Bytes reserved per backing store (1 MiB).
pub const BS_UNIT_SIZE: u32 = 0x0010_0000;

/// Largest page count a single backing store can serve.
pub const BS_MAX_PAGES: usize = (BS_UNIT_SIZE as usize) / PAGE_SIZE;

/// First virtual page available to user mappings. Everything below is the
/// global identity-mapped region.
pub const FIRST_USER_PAGE: u32 = 4096;

/// Lowest user virtual address; also where every private heap begins.
pub const HEAP_BASE: u32 = FIRST_USER_PAGE << PAGE_SHIFT;

/// Allocation granularity of the virtual heap free list, in bytes.
pub const HEAP_BLOCK_ALIGN: u32 = 8;

/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 64;

// Syscall status codes.

/// Call completed.
pub const OK: i32 = 0;

/// Call failed; the subsystem state is unchanged unless documented
/// otherwise (a fault-path failure kills the faulting process).
pub const SYSERR: i32 = -1;

// Replacement policy selectors for `srpolicy`/`grpolicy`.

/// Evict the least recently allocated backing-store frame.
pub const POLICY_FIFO: i32 = 3;

/// Evict the backing-store frame with the smallest age counter.
pub const POLICY_AGING: i32 = 4;

/// Virtual page number of an address.
pub const fn addr_to_vpno(addr: u32) -> u32 {
    addr >> PAGE_SHIFT
}

/// Base address of a virtual page.
pub const fn vpno_to_addr(vpno: u32) -> u32 {
    vpno << PAGE_SHIFT
}

/// Physical byte address of a page within a backing store.
pub const fn store_page_addr(bsid: usize, page: usize) -> u32 {
    BS_BASE + (bsid as u32) * BS_UNIT_SIZE + (page as u32 * PAGE_SIZE as u32)
}
