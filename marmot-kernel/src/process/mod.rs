//! Process bookkeeping.
//!
//! The scheduler proper lives outside this subsystem; what the paging
//! core needs from it is small: the current process id, each live
//! process's page directory, the private-heap descriptor, and hooks for
//! creation, context switch and death. Process 0 is the resident system
//! process, created at boot and never killed.

use alloc::string::String;
use alloc::vec::Vec;
use log::debug;

use marmot_abi::{BS_MAX_PAGES, FIRST_USER_PAGE, HEAP_BASE, MAX_PROCESSES, PAGE_SIZE, store_page_addr};

use crate::kernel::Kernel;
use crate::memory::backing_store::BsId;
use crate::memory::frame::{FrameError, FrameId};

/// Process identifier; an index into the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u16);

impl Pid {
    /// The resident system process.
    pub const SYSTEM: Pid = Pid(0);

    pub(crate) fn from_index(index: usize) -> Self {
        debug_assert!(index < MAX_PROCESSES);
        Self(index as u16)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The private virtual heap of a process created with `vcreate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHeap {
    /// The backing store dedicated to this heap.
    pub store: BsId,
    /// First virtual page of the heap region.
    pub vpno: u32,
    /// Heap size in pages.
    pub npages: usize,
    /// Head of the in-place free list; 0 when the heap is exhausted.
    pub(crate) free_head: u32,
}

impl VirtualHeap {
    pub fn free_head(&self) -> u32 {
        self.free_head
    }
}

/// One process-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub(crate) name: String,
    pub(crate) priority: i32,
    pub(crate) page_dir: FrameId,
    pub(crate) heap: Option<VirtualHeap>,
}

impl Process {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn page_dir(&self) -> FrameId {
        self.page_dir
    }

    pub fn heap(&self) -> Option<&VirtualHeap> {
        self.heap.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// Every process-table slot is taken.
    TableFull,
    /// No live process with this id.
    NotFound,
    /// Process 0 cannot be killed.
    Unkillable,
    /// Heap size outside `1..=256` pages.
    InvalidHeapSize,
    /// No free backing store for the heap.
    NoFreeStore,
    /// The frame pool could not supply a page directory or table.
    PoolExhausted,
}

impl From<FrameError> for ProcessError {
    fn from(_: FrameError) -> Self {
        ProcessError::PoolExhausted
    }
}

/// The process table. Slots are `None` until created and after death.
pub struct ProcessTable {
    slots: Vec<Option<Process>>,
    current: Pid,
}

impl ProcessTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..MAX_PROCESSES).map(|_| None).collect(),
            current: Pid::SYSTEM,
        }
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub(crate) fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots[pid.index()].as_ref()
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots[pid.index()].as_mut()
    }

    /// Live process ids in ascending order.
    pub fn live_pids(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| Pid::from_index(i))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn reserve(&self) -> Option<Pid> {
        self.slots
            .iter()
            .position(|slot| slot.is_none())
            .map(Pid::from_index)
    }

    fn install(&mut self, pid: Pid, process: Process) {
        debug_assert!(self.slots[pid.index()].is_none());
        self.slots[pid.index()] = Some(process);
    }

    fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.slots[pid.index()].take()
    }
}

impl Kernel {
    /// Create a process with its own page directory and no virtual heap.
    pub fn create(&mut self, name: &str, priority: i32) -> Result<Pid, ProcessError> {
        let pid = self.procs.reserve().ok_or(ProcessError::TableFull)?;
        let page_dir = self.pd_alloc()?;
        self.procs.install(
            pid,
            Process {
                name: String::from(name),
                priority,
                page_dir,
                heap: None,
            },
        );
        debug!("created process {} ({name})", pid.index());
        Ok(pid)
    }

    /// Create a process with a private demand-paged heap of `heap_pages`
    /// pages, backed by its own store and mapped at the first user page.
    pub fn vcreate(
        &mut self,
        name: &str,
        priority: i32,
        heap_pages: usize,
    ) -> Result<Pid, ProcessError> {
        if heap_pages == 0 || heap_pages > BS_MAX_PAGES {
            return Err(ProcessError::InvalidHeapSize);
        }
        let bsid = self
            .stores
            .get_free(heap_pages)
            .ok_or(ProcessError::NoFreeStore)?;
        let pid = self.create(name, priority)?;

        self.stores.alloc_heap(bsid, heap_pages);
        self.stores
            .add_mapping(bsid, pid, FIRST_USER_PAGE, heap_pages);

        // Seed the free list with one block spanning the whole heap. The
        // process has never run, so its heap pages cannot be touched
        // through virtual addresses yet; the node is written straight to
        // the physical start of the store and will page in on first use.
        let base = store_page_addr(bsid.index(), 0);
        self.machine.write_word(base, 0);
        self.machine
            .write_word(base + 4, (heap_pages * PAGE_SIZE) as u32);

        let process = self.procs.get_mut(pid).ok_or(ProcessError::NotFound)?;
        process.heap = Some(VirtualHeap {
            store: bsid,
            vpno: FIRST_USER_PAGE,
            npages: heap_pages,
            free_head: HEAP_BASE,
        });
        debug!(
            "created process {} ({name}) with a {heap_pages}-page heap on store {}",
            pid.index(),
            bsid.index()
        );
        Ok(pid)
    }

    /// Kill a process: release every mapping and store it holds, then its
    /// page tables and directory. Killing the current process switches to
    /// the system process.
    pub fn kill(&mut self, pid: Pid) -> Result<(), ProcessError> {
        if pid == Pid::SYSTEM {
            return Err(ProcessError::Unkillable);
        }
        let page_dir = self.procs.get(pid).ok_or(ProcessError::NotFound)?.page_dir;
        debug!("killing process {}", pid.index());

        // Stores first: the frame releases in here walk this process's
        // tables, so the entry must still be live.
        self.bs_clean_process(pid);
        self.pd_free(page_dir);
        self.procs.remove(pid);

        if self.procs.current() == pid {
            let system_dir = self
                .procs
                .get(Pid::SYSTEM)
                .map(|p| p.page_dir.phys_page())
                .unwrap_or_default();
            self.procs.set_current(Pid::SYSTEM);
            self.machine.load_pdbr(system_dir);
        }
        Ok(())
    }

    /// Make `pid` the current process and install its page directory.
    /// The directory load implicitly flushes non-global TLB entries.
    pub fn context_switch(&mut self, pid: Pid) -> Result<(), ProcessError> {
        let directory = self
            .procs
            .get(pid)
            .ok_or(ProcessError::NotFound)?
            .page_dir
            .phys_page();
        self.procs.set_current(pid);
        self.machine.load_pdbr(directory);
        Ok(())
    }

    pub fn current_pid(&self) -> Pid {
        self.procs.current()
    }
}
