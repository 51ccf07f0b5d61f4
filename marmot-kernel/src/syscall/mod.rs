//! The public syscall surface.
//!
//! [`System`] wraps the kernel in a spinlock and speaks the C-flavoured
//! calling convention: integer arguments, `OK`/`SYSERR` (or a value)
//! coming back. Each call takes the lock for its whole duration, which on
//! this single-CPU model is the interrupts-disabled critical section; the
//! guard restores it on every exit path. Typed errors stop here.

use log::debug;
use spinning_top::guard::SpinlockGuard;
use spinning_top::Spinlock;

use marmot_abi::{OK, SYSERR};

use crate::kernel::{Kernel, VmConfig};
use crate::memory::backing_store::BsId;
use crate::memory::policy::PolicyKind;

pub struct System {
    kernel: Spinlock<Kernel>,
}

impl System {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            kernel: Spinlock::new(Kernel::new(config)),
        }
    }

    /// Direct access to the kernel, for harnesses that need more than the
    /// syscall surface (process control, introspection).
    pub fn kernel(&self) -> SpinlockGuard<'_, Kernel> {
        self.kernel.lock()
    }

    /// Reserve backing store `bsid` with `npages` pages. Returns the size
    /// of the new or existing store, or `SYSERR`.
    pub fn get_bs(&self, bsid: u32, npages: u32) -> i32 {
        let Some(bsid) = BsId::new(bsid) else {
            return SYSERR;
        };
        match self.kernel.lock().get_bs(bsid, npages as usize) {
            Ok(size) => size as i32,
            Err(err) => {
                debug!("get_bs: {err:?}");
                SYSERR
            }
        }
    }

    /// Release backing store `bsid`; deferred while mappings remain.
    pub fn release_bs(&self, bsid: u32) -> i32 {
        let Some(bsid) = BsId::new(bsid) else {
            return SYSERR;
        };
        match self.kernel.lock().release_bs(bsid) {
            Ok(()) => OK,
            Err(err) => {
                debug!("release_bs: {err:?}");
                SYSERR
            }
        }
    }

    /// Map `npages` pages of store `bsid` at virtual page `vpno`.
    pub fn xmmap(&self, vpno: i32, bsid: u32, npages: i32) -> i32 {
        let (Some(bsid), Ok(vpno), Ok(npages)) =
            (BsId::new(bsid), u32::try_from(vpno), usize::try_from(npages))
        else {
            return SYSERR;
        };
        match self.kernel.lock().xmmap(vpno, bsid, npages) {
            Ok(()) => OK,
            Err(err) => {
                debug!("xmmap: {err:?}");
                SYSERR
            }
        }
    }

    /// Remove the mapping at virtual page `vpno`.
    pub fn xmunmap(&self, vpno: i32) -> i32 {
        let Ok(vpno) = u32::try_from(vpno) else {
            return SYSERR;
        };
        match self.kernel.lock().xmunmap(vpno) {
            Ok(()) => OK,
            Err(err) => {
                debug!("xmunmap: {err:?}");
                SYSERR
            }
        }
    }

    /// Create a process with a private virtual heap of `heap_pages`
    /// pages. Returns the new pid, or `SYSERR`.
    pub fn vcreate(&self, name: &str, priority: i32, heap_pages: i32) -> i32 {
        let Ok(heap_pages) = usize::try_from(heap_pages) else {
            return SYSERR;
        };
        match self.kernel.lock().vcreate(name, priority, heap_pages) {
            Ok(pid) => pid.index() as i32,
            Err(err) => {
                debug!("vcreate: {err:?}");
                SYSERR
            }
        }
    }

    /// Allocate `nbytes` from the current process's virtual heap.
    /// Returns the block address, or `SYSERR`.
    pub fn vgetmem(&self, nbytes: u32) -> i32 {
        match self.kernel.lock().vgetmem(nbytes) {
            Ok(addr) => addr as i32,
            Err(err) => {
                debug!("vgetmem: {err:?}");
                SYSERR
            }
        }
    }

    /// Return `nbytes` at `addr` to the current process's virtual heap.
    pub fn vfreemem(&self, addr: u32, nbytes: u32) -> i32 {
        match self.kernel.lock().vfreemem(addr, nbytes) {
            Ok(()) => OK,
            Err(err) => {
                debug!("vfreemem: {err:?}");
                SYSERR
            }
        }
    }

    /// Install the page replacement policy; call once at startup.
    pub fn srpolicy(&self, policy: i32) -> i32 {
        let Some(kind) = PolicyKind::from_raw(policy) else {
            return SYSERR;
        };
        self.kernel.lock().set_replacement_policy(kind);
        OK
    }

    /// The active page replacement policy.
    pub fn grpolicy(&self) -> i32 {
        self.kernel.lock().replacement_policy().as_raw()
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}
