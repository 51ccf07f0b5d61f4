//! The kernel state and boot sequence.

use log::info;

use marmot_abi::{GLOBAL_TABLE_COUNT, MAX_FRAMES};

use crate::machine::Machine;
use crate::memory::backing_store::BackingStoreTable;
use crate::memory::frame::{FrameId, FrameTable, PagingStats};
use crate::memory::policy::PolicyKind;
use crate::process::{Pid, ProcessTable};

/// Tunables fixed at boot.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Size of the physical frame pool. Production size is 1024; tests
    /// shrink it to force eviction.
    pub frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { frames: MAX_FRAMES }
    }
}

/// The whole paging subsystem: machine, frame pool, backing stores,
/// process table and the active replacement policy.
///
/// On a single CPU every entry point runs with interrupts disabled end to
/// end; here that discipline is the exclusive borrow (or the surrounding
/// [`crate::syscall::System`] lock), held for the whole call.
pub struct Kernel {
    pub(crate) machine: Machine,
    pub(crate) frames: FrameTable,
    pub(crate) stores: BackingStoreTable,
    pub(crate) procs: ProcessTable,
    pub(crate) policy: PolicyKind,
    pub(crate) global_tables: [FrameId; GLOBAL_TABLE_COUNT],
    pub(crate) stats: PagingStats,
}

impl Kernel {
    /// Boot the subsystem: build the global identity tables, create the
    /// system process and turn paging on.
    pub fn new(config: VmConfig) -> Self {
        assert!(
            config.frames > GLOBAL_TABLE_COUNT && config.frames <= MAX_FRAMES,
            "frame pool must fit the global tables and the physical pool region"
        );
        let mut kernel = Kernel {
            machine: Machine::new(),
            frames: FrameTable::new(config.frames),
            stores: BackingStoreTable::new(),
            procs: ProcessTable::new(),
            policy: PolicyKind::default(),
            global_tables: [FrameId::from_index(0); GLOBAL_TABLE_COUNT],
            stats: PagingStats::default(),
        };
        kernel
            .init_global_tables()
            .expect("no frames for the global tables");
        let system = kernel
            .create("system", 0)
            .expect("no frame for the system page directory");
        debug_assert_eq!(system, Pid::SYSTEM);
        kernel
            .context_switch(system)
            .expect("system process exists");
        kernel.machine.enable_paging();
        info!(
            "paging online: {} frames, policy {:?}",
            config.frames, kernel.policy
        );
        kernel
    }

    /// Install the replacement policy. Meant to be called once, before
    /// the first fault.
    pub fn set_replacement_policy(&mut self, policy: PolicyKind) {
        self.policy = policy;
    }

    pub fn replacement_policy(&self) -> PolicyKind {
        self.policy
    }

    // Read-only views for harnesses and tests.

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn stores(&self) -> &BackingStoreTable {
        &self.stores
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.procs
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn stats(&self) -> &PagingStats {
        &self.stats
    }

    /// The four boot-built identity tables shared by every directory.
    pub fn global_tables(&self) -> [FrameId; GLOBAL_TABLE_COUNT] {
        self.global_tables
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}
