//! The page-fault handler.
//!
//! A fault means either the page or its page table is not present. The
//! handler resolves the faulting address to a backing-store page through
//! the mapping lists, finds or loads a frame for it, wires up the
//! two-level tables and reloads the directory base register. Everything
//! runs inside the kernel critical section; a fault cannot re-enter.

use log::{debug, warn};

use marmot_abi::{PAGE_SHIFT, addr_to_vpno};

use crate::kernel::Kernel;
use crate::machine::Access;
use crate::memory::frame::FrameKind;
use crate::memory::paging::{EntryFlags, PageEntry};
use crate::process::Pid;

/// A bound on handler retries. One pass is the norm; a retry only happens
/// when an eviction inside the handler reclaims the table or frame picked
/// up earlier in the same pass.
const FAULT_RETRY_LIMIT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No mapping covers the faulting address. Fatal to the process.
    NoMapping,
    /// Neither a free frame nor an evictable one. Fatal to the process.
    OutOfFrames,
}

impl Kernel {
    /// Service a page fault at `vaddr` for the current process.
    ///
    /// Any failure kills the faulting process; the tables, stores and
    /// frame pool stay consistent either way.
    pub(crate) fn page_fault(&mut self, vaddr: u32) -> Result<(), FaultError> {
        self.machine.set_fault_addr(vaddr);
        self.stats.faults += 1;

        if self.replacement_policy() == crate::memory::policy::PolicyKind::Aging {
            self.update_frame_ages();
        }

        let pid = self.procs.current();
        let vpno = addr_to_vpno(vaddr);
        debug!("page fault at {vaddr:#010x} (process {})", pid.index());

        let Some((bsid, map)) = self.stores.lookup_mapping(pid, vpno) else {
            warn!(
                "fault at {vaddr:#010x}: no mapping for process {}, killing it",
                pid.index()
            );
            self.kill_faulting_process(pid);
            return Err(FaultError::NoMapping);
        };
        let bspage = (vpno - map.vpno) as usize;

        let directory_index = (vaddr >> 22) as usize & 0x3ff;
        let table_index = (vaddr >> PAGE_SHIFT) as usize & 0x3ff;

        for _ in 0..FAULT_RETRY_LIMIT {
            let Some(process) = self.procs.get(pid) else {
                return Err(FaultError::NoMapping);
            };
            let directory_page = process.page_dir().phys_page();

            // Make sure a page table covers this slot.
            let pde = self.machine.read_entry(directory_page, directory_index);
            let table_page = if pde.is_present() {
                pde.base_page()
            } else {
                let table = match self.pt_alloc() {
                    Ok(id) => id,
                    Err(_) => {
                        self.kill_faulting_process(pid);
                        return Err(FaultError::OutOfFrames);
                    }
                };
                self.machine.write_entry(
                    directory_page,
                    directory_index,
                    PageEntry::new(
                        table.phys_page(),
                        EntryFlags::PRESENT | EntryFlags::WRITABLE,
                    ),
                );
                table.phys_page()
            };

            // Find the page in core, or load it. A page already resident
            // for another mapping is shared; one physical copy per store
            // page. The reference is taken at install time below, so a
            // pass abandoned by the revalidation leaves no stray count.
            let frame = match self.frames.find_bspage(bsid, bspage) {
                Some(id) => id,
                None => {
                    let id = match self.frame_alloc(FrameKind::Backing { bsid, bspage }) {
                        Ok(id) => id,
                        Err(_) => {
                            self.kill_faulting_process(pid);
                            return Err(FaultError::OutOfFrames);
                        }
                    };
                    self.stores.get_mut(bsid).frames_in_core.push(id);
                    self.machine.read_bs(id.phys_addr(), bsid.index(), bspage);
                    id
                }
            };

            // An eviction inside either allocation above can have drained
            // and reclaimed the table, or evicted the frame itself. Check
            // both before installing.
            let pde = self.machine.read_entry(directory_page, directory_index);
            if !pde.is_present() || pde.base_page() != table_page {
                continue;
            }
            if self.frames.find_bspage(bsid, bspage) != Some(frame) {
                continue;
            }

            self.machine.write_entry(
                table_page,
                table_index,
                PageEntry::new(
                    frame.phys_page(),
                    EntryFlags::PRESENT | EntryFlags::WRITABLE,
                ),
            );
            self.frames.get_mut(frame).refcnt += 1;
            if let Some(table) = self.frames.frame_by_page(table_page) {
                self.frames.get_mut(table).refcnt += 1;
            }

            // Table contents changed; the directory reload flushes every
            // non-global TLB entry.
            self.machine.load_pdbr(directory_page);
            return Ok(());
        }

        warn!(
            "fault at {vaddr:#010x}: allocation kept racing eviction, killing process {}",
            pid.index()
        );
        self.kill_faulting_process(pid);
        Err(FaultError::OutOfFrames)
    }

    fn kill_faulting_process(&mut self, pid: Pid) {
        if self.kill(pid).is_err() {
            warn!("process {} cannot be killed", pid.index());
        }
    }

    /// Translate a user address, servicing the fault if it misses.
    fn resolve(&mut self, vaddr: u32, access: Access) -> Result<u32, FaultError> {
        if let Some(paddr) = self.machine.translate(vaddr, access) {
            return Ok(paddr);
        }
        self.page_fault(vaddr)?;
        self.machine
            .translate(vaddr, access)
            .ok_or(FaultError::NoMapping)
    }

    // User-memory access. Each of these is a plain load or store that may
    // fault, exactly like a user-mode instruction; the heap free-list
    // walks run entirely on top of them.

    pub fn load_u8(&mut self, vaddr: u32) -> Result<u8, FaultError> {
        let paddr = self.resolve(vaddr, Access::Read)?;
        Ok(self.machine.read_byte(paddr))
    }

    pub fn store_u8(&mut self, vaddr: u32, value: u8) -> Result<(), FaultError> {
        let paddr = self.resolve(vaddr, Access::Write)?;
        self.machine.write_byte(paddr, value);
        Ok(())
    }

    pub fn load_u32(&mut self, vaddr: u32) -> Result<u32, FaultError> {
        let paddr = self.resolve(vaddr, Access::Read)?;
        Ok(self.machine.read_word(paddr))
    }

    pub fn store_u32(&mut self, vaddr: u32, value: u32) -> Result<(), FaultError> {
        let paddr = self.resolve(vaddr, Access::Write)?;
        self.machine.write_word(paddr, value);
        Ok(())
    }
}
