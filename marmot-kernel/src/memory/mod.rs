//! Memory management: the frame pool, backing stores, two-level page
//! tables, the fault path, replacement policies and the per-process
//! virtual heap.

pub mod backing_store;
pub mod fault;
pub mod frame;
pub mod heap;
pub mod paging;
pub mod policy;

pub use backing_store::{BackingStore, BackingStoreTable, BsError, BsId, Mapping, StoreStatus};
pub use fault::FaultError;
pub use frame::{Frame, FrameError, FrameId, FrameKind, FrameTable, PagingStats};
pub use heap::HeapError;
pub use paging::{EntryFlags, PageEntry};
pub use policy::{Aging, EvictionPolicy, Fifo, PolicyKind};
