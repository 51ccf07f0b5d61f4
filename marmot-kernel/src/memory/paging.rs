//! Page directories and page tables.
//!
//! Entries are bit-exact 32-bit records: flags in the low 12 bits, the
//! 20-bit physical page number above them. Both levels share one entry
//! type; the dirty bit is only hardware-set on table entries and the 4 MiB
//! bit only applies to directory entries.
//!
//! The first four entries of every directory reference the same four
//! global tables, built once at boot, which identity-map all of physical
//! memory. They are never freed and the sweeps below never touch them.

use bitflags::bitflags;
use core::fmt;
use log::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use marmot_abi::{ENTRIES_PER_TABLE, GLOBAL_TABLE_COUNT, PAGE_SHIFT};

use crate::kernel::Kernel;
use crate::memory::frame::{FrameError, FrameId, FrameKind};
use crate::process::Pid;

bitflags! {
    /// Flag bits of a directory or table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        /// Table entries only; hardware-set on write.
        const DIRTY = 1 << 6;
        /// Directory entries only.
        const PAGE_SIZE_4MB = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

/// One 32-bit directory or table entry.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    pub const EMPTY: PageEntry = PageEntry(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn new(base_page: u32, flags: EntryFlags) -> Self {
        debug_assert!(base_page < (1 << 20), "base page out of range");
        Self((base_page << PAGE_SHIFT) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Physical page number this entry points at.
    pub fn base_page(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    pub fn insert(&mut self, flags: EntryFlags) {
        self.0 |= flags.bits();
    }

    pub fn remove(&mut self, flags: EntryFlags) {
        self.0 &= !flags.bits();
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("base_page", &self.base_page())
            .field("flags", &self.flags())
            .finish()
    }
}

impl Kernel {
    /// Build the four global tables that identity-map physical memory.
    /// Runs once at boot, before any process exists.
    pub(crate) fn init_global_tables(&mut self) -> Result<(), FrameError> {
        for t in 0..GLOBAL_TABLE_COUNT {
            let id = self.pt_alloc()?;
            let table = self.machine.table_mut(id.phys_page());
            for (j, entry) in table.iter_mut().enumerate() {
                *entry = PageEntry::new(
                    (t * ENTRIES_PER_TABLE + j) as u32,
                    EntryFlags::PRESENT | EntryFlags::WRITABLE,
                );
            }
            self.global_tables[t] = id;
        }
        Ok(())
    }

    /// Allocate and zero a page directory, then install the global tables
    /// in entries `0..4`.
    pub(crate) fn pd_alloc(&mut self) -> Result<FrameId, FrameError> {
        let id = self.frame_alloc(FrameKind::Directory)?;
        self.machine.zero_page(id.phys_page());
        for (i, table) in self.global_tables.into_iter().enumerate() {
            self.machine.write_entry(
                id.phys_page(),
                i,
                PageEntry::new(table.phys_page(), EntryFlags::PRESENT | EntryFlags::WRITABLE),
            );
        }
        Ok(id)
    }

    /// Allocate and zero a page table.
    pub(crate) fn pt_alloc(&mut self) -> Result<FrameId, FrameError> {
        let id = self.frame_alloc(FrameKind::Table)?;
        self.machine.zero_page(id.phys_page());
        Ok(id)
    }

    /// Release a page table, clearing any directory entry referencing it.
    pub(crate) fn pt_free(&mut self, table: FrameId) {
        self.frame_free(table);
    }

    /// Release a page directory and any page tables still hanging off it.
    ///
    /// Tables pointing at frames shared with other processes survive the
    /// cleanup sweep, so they are released wholesale here; the global
    /// region is left alone.
    pub(crate) fn pd_free(&mut self, directory: FrameId) {
        let directory_page = directory.phys_page();
        for i in GLOBAL_TABLE_COUNT..ENTRIES_PER_TABLE {
            let entry = self.machine.read_entry(directory_page, i);
            if !entry.is_present() {
                continue;
            }
            if let Some(table) = self.frames.frame_by_page(entry.base_page()) {
                self.pt_free(table);
            }
        }
        self.frame_free(directory);
    }

    /// Clear every page-table entry, in every live process, that points at
    /// the given physical page. Returns whether any cleared entry was
    /// dirty. Each cleared entry drops the owning table's reference count;
    /// a table that drains is reclaimed and its directory entry goes with
    /// it.
    pub(crate) fn invalidate_phys_page(&mut self, target_page: u32) -> bool {
        let mut dirty = false;
        for pid in self.procs.live_pids() {
            let Some(process) = self.procs.get(pid) else {
                continue;
            };
            let directory_page = process.page_dir().phys_page();
            for i in GLOBAL_TABLE_COUNT..ENTRIES_PER_TABLE {
                let pde = self.machine.read_entry(directory_page, i);
                if !pde.is_present() {
                    continue;
                }
                let table_page = pde.base_page();
                let mut cleared = 0;
                for j in 0..ENTRIES_PER_TABLE {
                    let pte = self.machine.read_entry(table_page, j);
                    if pte.is_present() && pte.base_page() == target_page {
                        if pte.flags().contains(EntryFlags::DIRTY) {
                            dirty = true;
                        }
                        self.machine.write_entry(table_page, j, PageEntry::EMPTY);
                        cleared += 1;
                    }
                }
                if cleared > 0 {
                    debug!(
                        "invalidated {cleared} mapping(s) of page {target_page:#x} \
                         in process {} table {table_page:#x}",
                        pid.index()
                    );
                    if let Some(table) = self.frames.frame_by_page(table_page) {
                        for _ in 0..cleared {
                            self.frame_dec_refcnt(table);
                        }
                    }
                }
            }
        }
        dirty
    }

    /// Clear directory entries referencing a reclaimed page table.
    pub(crate) fn clear_directory_refs(&mut self, table_page: u32) {
        for pid in self.procs.live_pids() {
            let Some(process) = self.procs.get(pid) else {
                continue;
            };
            let directory_page = process.page_dir().phys_page();
            for i in GLOBAL_TABLE_COUNT..ENTRIES_PER_TABLE {
                let pde = self.machine.read_entry(directory_page, i);
                if pde.is_present() && pde.base_page() == table_page {
                    self.machine.write_entry(directory_page, i, PageEntry::EMPTY);
                }
            }
        }
    }

    /// Read one directory entry of a live process.
    pub fn directory_entry(&self, pid: Pid, index: usize) -> Option<PageEntry> {
        let process = self.procs.get(pid)?;
        if index >= ENTRIES_PER_TABLE {
            return None;
        }
        Some(self.machine.read_entry(process.page_dir().phys_page(), index))
    }
}
