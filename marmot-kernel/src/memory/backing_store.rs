//! Backing stores and their mapping lists.
//!
//! Eight fixed 1 MiB regions of physical memory act as the swap space.
//! Each store keeps the list of `(pid, virtual range)` bindings made
//! against it and the list of its pages currently resident in frames.
//! Resolving a fault is a reverse lookup: from `(pid, vpno)` through the
//! mapping lists to `(store, page offset)`.

use alloc::vec::Vec;
use core::array;
use log::debug;

use marmot_abi::{BS_COUNT, BS_MAX_PAGES, FIRST_USER_PAGE};

use crate::kernel::Kernel;
use crate::memory::frame::{FrameId, FrameKind};
use crate::process::Pid;

/// Identifier of one of the eight backing stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BsId(u8);

impl BsId {
    pub fn new(raw: u32) -> Option<Self> {
        if (raw as usize) < BS_COUNT {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A binding of a contiguous virtual page range of one process to a
/// store. Page `vpno + k` of the process is page `k` of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub pid: Pid,
    pub vpno: u32,
    pub npages: usize,
}

impl Mapping {
    pub fn contains(&self, vpno: u32) -> bool {
        vpno >= self.vpno && vpno < self.vpno + self.npages as u32
    }

    pub fn overlaps(&self, vpno: u32, npages: usize) -> bool {
        vpno < self.vpno + self.npages as u32 && self.vpno < vpno + npages as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Free,
    Used,
}

/// One backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingStore {
    pub(crate) status: StoreStatus,
    pub(crate) is_heap: bool,
    pub(crate) npages: usize,
    pub(crate) maps: Vec<Mapping>,
    pub(crate) frames_in_core: Vec<FrameId>,
    /// Set by a `release_bs` that found live mappings; the store is freed
    /// when the mapping list drains.
    pub(crate) release_pending: bool,
}

impl BackingStore {
    const FREE: BackingStore = BackingStore {
        status: StoreStatus::Free,
        is_heap: false,
        npages: 0,
        maps: Vec::new(),
        frames_in_core: Vec::new(),
        release_pending: false,
    };

    pub fn status(&self) -> StoreStatus {
        self.status
    }

    pub fn is_heap(&self) -> bool {
        self.is_heap
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn maps(&self) -> &[Mapping] {
        &self.maps
    }

    pub fn frames_in_core(&self) -> &[FrameId] {
        &self.frames_in_core
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsError {
    /// Page count outside `1..=256`.
    InvalidPageCount,
    /// Virtual page inside the global region.
    InvalidVirtualPage,
    /// Allocation of a store that is already in use.
    StoreInUse,
    /// Mapping against a store that has not been allocated.
    StoreNotAllocated,
    /// The store is a private heap and cannot be shared.
    HeapStore,
    /// Every store is in use.
    NoFreeStore,
    /// No mapping covers the given `(pid, vpno)`.
    NoMapping,
    /// The requested range overlaps an existing mapping of this process.
    MappingOverlap,
}

/// The table of all eight stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingStoreTable {
    stores: [BackingStore; BS_COUNT],
}

impl BackingStoreTable {
    pub(crate) fn new() -> Self {
        Self {
            stores: array::from_fn(|_| BackingStore::FREE),
        }
    }

    pub fn get(&self, bsid: BsId) -> &BackingStore {
        &self.stores[bsid.index()]
    }

    pub(crate) fn get_mut(&mut self, bsid: BsId) -> &mut BackingStore {
        &mut self.stores[bsid.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (BsId, &BackingStore)> {
        self.stores
            .iter()
            .enumerate()
            .map(|(i, s)| (BsId(i as u8), s))
    }

    /// Claim a specific store. Fails if it is already in use.
    pub(crate) fn alloc(&mut self, bsid: BsId, npages: usize) -> Result<(), BsError> {
        let store = self.get_mut(bsid);
        if store.status == StoreStatus::Used {
            return Err(BsError::StoreInUse);
        }
        *store = BackingStore {
            status: StoreStatus::Used,
            is_heap: false,
            npages,
            maps: Vec::new(),
            frames_in_core: Vec::new(),
            release_pending: false,
        };
        Ok(())
    }

    /// Claim a store for a private heap.
    pub(crate) fn alloc_heap(&mut self, bsid: BsId, npages: usize) {
        *self.get_mut(bsid) = BackingStore {
            status: StoreStatus::Used,
            is_heap: true,
            npages,
            maps: Vec::new(),
            frames_in_core: Vec::new(),
            release_pending: false,
        };
    }

    /// First free store, scanning in ascending id order. Capacity is
    /// uniform, so the page-count argument is validation rather than fit.
    pub(crate) fn get_free(&self, npages: usize) -> Option<BsId> {
        if npages == 0 || npages > BS_MAX_PAGES {
            return None;
        }
        self.iter()
            .find(|(_, s)| s.status == StoreStatus::Free)
            .map(|(id, _)| id)
    }

    pub(crate) fn add_mapping(&mut self, bsid: BsId, pid: Pid, vpno: u32, npages: usize) {
        debug!(
            "mapping store {} to process {} pages {vpno}..{}",
            bsid.index(),
            pid.index(),
            vpno + npages as u32
        );
        self.get_mut(bsid).maps.push(Mapping { pid, vpno, npages });
    }

    /// Resolve `(pid, vpno)` to the store and mapping covering it.
    pub(crate) fn lookup_mapping(&self, pid: Pid, vpno: u32) -> Option<(BsId, Mapping)> {
        for (bsid, store) in self.iter() {
            if store.status == StoreStatus::Free {
                continue;
            }
            for map in &store.maps {
                if map.pid == pid && map.contains(vpno) {
                    return Some((bsid, *map));
                }
            }
        }
        None
    }

    pub(crate) fn delete_mapping(&mut self, pid: Pid, vpno: u32) -> Result<(BsId, Mapping), BsError> {
        for (i, store) in self.stores.iter_mut().enumerate() {
            if store.status == StoreStatus::Free {
                continue;
            }
            if let Some(pos) = store
                .maps
                .iter()
                .position(|m| m.pid == pid && m.contains(vpno))
            {
                return Ok((BsId(i as u8), store.maps.remove(pos)));
            }
        }
        Err(BsError::NoMapping)
    }

    /// Does any existing mapping of this process overlap the range?
    /// Overlaps would make fault resolution ambiguous.
    pub(crate) fn overlaps_existing(&self, pid: Pid, vpno: u32, npages: usize) -> bool {
        self.iter().any(|(_, store)| {
            store
                .maps
                .iter()
                .any(|m| m.pid == pid && m.overlaps(vpno, npages))
        })
    }
}

impl Kernel {
    /// Reserve backing store `bsid` with room for `npages` pages. If the
    /// store already exists its current size is returned unchanged; a
    /// store serving as a private heap cannot be reserved.
    pub fn get_bs(&mut self, bsid: BsId, npages: usize) -> Result<usize, BsError> {
        if npages == 0 || npages > BS_MAX_PAGES {
            return Err(BsError::InvalidPageCount);
        }
        let store = self.stores.get(bsid);
        if store.status == StoreStatus::Used {
            if store.is_heap {
                return Err(BsError::HeapStore);
            }
            return Ok(store.npages);
        }
        self.stores.alloc(bsid, npages)?;
        debug!("reserved store {} ({npages} pages)", bsid.index());
        Ok(npages)
    }

    /// Release a store. With live mappings the release is deferred: the
    /// store is marked and freed when its mapping list drains.
    pub fn release_bs(&mut self, bsid: BsId) -> Result<(), BsError> {
        let store = self.stores.get(bsid);
        match store.status {
            StoreStatus::Free => Ok(()),
            StoreStatus::Used if store.maps.is_empty() => {
                self.free_store(bsid);
                Ok(())
            }
            StoreStatus::Used => {
                debug!(
                    "store {} still mapped, deferring release",
                    bsid.index()
                );
                self.stores.get_mut(bsid).release_pending = true;
                Ok(())
            }
        }
    }

    /// Bind `[vpno, vpno + npages)` of the current process to a store.
    /// No frames are touched; pages come in on demand.
    pub fn xmmap(&mut self, vpno: u32, bsid: BsId, npages: usize) -> Result<(), BsError> {
        if npages == 0 || npages > BS_MAX_PAGES {
            return Err(BsError::InvalidPageCount);
        }
        // The range must sit inside the 20-bit virtual page space, above
        // the global region.
        if vpno < FIRST_USER_PAGE || vpno as u64 + npages as u64 > 1 << 20 {
            return Err(BsError::InvalidVirtualPage);
        }
        let store = self.stores.get(bsid);
        if store.status == StoreStatus::Free {
            return Err(BsError::StoreNotAllocated);
        }
        if store.is_heap {
            return Err(BsError::HeapStore);
        }
        let pid = self.procs.current();
        if self.stores.overlaps_existing(pid, vpno, npages) {
            return Err(BsError::MappingOverlap);
        }
        self.stores.add_mapping(bsid, pid, vpno, npages);
        Ok(())
    }

    /// Remove the mapping of the current process covering `vpno`,
    /// dropping one reference from every resident frame in its range.
    pub fn xmunmap(&mut self, vpno: u32) -> Result<(), BsError> {
        if vpno < FIRST_USER_PAGE {
            return Err(BsError::InvalidVirtualPage);
        }
        let pid = self.procs.current();
        let (bsid, map) = self
            .stores
            .lookup_mapping(pid, vpno)
            .ok_or(BsError::NoMapping)?;
        self.release_mapping_frames(bsid, map.npages);
        self.stores.delete_mapping(pid, vpno)?;
        let store = self.stores.get(bsid);
        if store.maps.is_empty() && store.release_pending {
            self.free_store(bsid);
        }
        // Table contents changed; reloading the directory base drops every
        // non-global TLB entry.
        if let Some(process) = self.procs.get(pid) {
            let directory = process.page_dir().phys_page();
            self.machine.load_pdbr(directory);
        }
        Ok(())
    }

    /// Tear down everything a dying process holds: every mapping it owns
    /// is removed (dropping frame references on the way), and any store
    /// whose mapping list drains as a result is freed, private heaps
    /// included.
    pub(crate) fn bs_clean_process(&mut self, pid: Pid) {
        debug!("cleaning stores for process {}", pid.index());
        for index in 0..BS_COUNT {
            let bsid = BsId(index as u8);
            let mut removed_any = false;
            loop {
                let store = self.stores.get(bsid);
                if store.status == StoreStatus::Free {
                    break;
                }
                let Some(pos) = store.maps.iter().position(|m| m.pid == pid) else {
                    break;
                };
                let map = self.stores.get_mut(bsid).maps.remove(pos);
                removed_any = true;
                self.release_mapping_frames(bsid, map.npages);
            }
            if removed_any && self.stores.get(bsid).maps.is_empty() {
                self.free_store(bsid);
            }
        }
    }

    /// Drop one reference from every resident frame of the store whose
    /// page falls inside a mapping of `npages` pages. The range check is
    /// conservative: it covers the whole mapped prefix whether or not this
    /// particular mapping faulted the page in.
    pub(crate) fn release_mapping_frames(&mut self, bsid: BsId, npages: usize) {
        let resident = self.stores.get(bsid).frames_in_core.clone();
        for id in resident {
            if let Some(FrameKind::Backing { bsid: b, bspage }) = self.frames.get(id).kind() {
                if b == bsid && bspage < npages {
                    self.frame_dec_refcnt(id);
                }
            }
        }
    }

    /// Return a store to the free pool. All mappings must already be gone,
    /// which implies every resident frame has been released too.
    pub(crate) fn free_store(&mut self, bsid: BsId) {
        debug!("freeing store {}", bsid.index());
        let store = self.stores.get_mut(bsid);
        debug_assert!(store.maps.is_empty());
        debug_assert!(store.frames_in_core.is_empty());
        *store = BackingStore::FREE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_free_scans_in_ascending_order() {
        let mut table = BackingStoreTable::new();
        table.alloc(BsId(0), 10).unwrap();
        assert_eq!(table.get_free(10), Some(BsId(1)));
        assert_eq!(table.get_free(0), None);
        assert_eq!(table.get_free(257), None);
    }

    #[test]
    fn alloc_rejects_a_used_store() {
        let mut table = BackingStoreTable::new();
        table.alloc(BsId(3), 10).unwrap();
        assert_eq!(table.alloc(BsId(3), 5), Err(BsError::StoreInUse));
    }

    #[test]
    fn lookup_uses_strict_range_bounds() {
        let mut table = BackingStoreTable::new();
        let pid = Pid::from_index(1);
        table.alloc(BsId(0), 10).unwrap();
        table.add_mapping(BsId(0), pid, 5000, 10);

        assert!(table.lookup_mapping(pid, 4999).is_none());
        assert!(table.lookup_mapping(pid, 5000).is_some());
        assert!(table.lookup_mapping(pid, 5009).is_some());
        assert!(table.lookup_mapping(pid, 5010).is_none());
        assert!(table.lookup_mapping(Pid::from_index(2), 5005).is_none());
    }

    #[test]
    fn delete_removes_exactly_one_mapping() {
        let mut table = BackingStoreTable::new();
        let pid = Pid::from_index(1);
        table.alloc(BsId(0), 10).unwrap();
        table.add_mapping(BsId(0), pid, 5000, 10);
        table.add_mapping(BsId(0), Pid::from_index(2), 5000, 10);

        table.delete_mapping(pid, 5003).unwrap();
        assert_eq!(table.get(BsId(0)).maps().len(), 1);
        assert_eq!(table.delete_mapping(pid, 5003), Err(BsError::NoMapping));
    }

    #[test]
    fn overlap_detection_is_per_process() {
        let mut table = BackingStoreTable::new();
        let pid = Pid::from_index(1);
        table.alloc(BsId(0), 10).unwrap();
        table.add_mapping(BsId(0), pid, 5000, 10);

        assert!(table.overlaps_existing(pid, 5009, 1));
        assert!(!table.overlaps_existing(pid, 5010, 5));
        assert!(!table.overlaps_existing(Pid::from_index(2), 5000, 10));
    }
}
