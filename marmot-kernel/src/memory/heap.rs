//! The per-process virtual heap.
//!
//! Free memory is tracked by a singly-linked list sorted by address,
//! whose nodes live inside the free blocks themselves: the first two
//! words of every free block are `(next, len)`. Only the head pointer
//! lives in the process entry. Every traversal step past the head
//! dereferences demand-paged addresses, so any step may fault a heap
//! page in; the accessors in `fault` make that transparent.

use alloc::vec::Vec;
use log::debug;

use marmot_abi::{HEAP_BASE, HEAP_BLOCK_ALIGN};

use crate::kernel::Kernel;
use crate::memory::fault::FaultError;
use crate::process::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// A zero-byte request or release.
    InvalidSize,
    /// The address is not a plausible heap block.
    InvalidAddress,
    /// The current process has no virtual heap.
    NoHeap,
    /// No free block large enough.
    NoMemory,
    /// The released range overlaps a free block; the list is left
    /// untouched.
    Corrupted,
    /// The faulting access underneath the list walk failed.
    Fault(FaultError),
}

impl From<FaultError> for HeapError {
    fn from(err: FaultError) -> Self {
        HeapError::Fault(err)
    }
}

/// Round a request up to the list granularity.
pub(crate) fn round_to_block(nbytes: u32) -> u32 {
    (nbytes + (HEAP_BLOCK_ALIGN - 1)) & !(HEAP_BLOCK_ALIGN - 1)
}

impl Kernel {
    /// Allocate `nbytes` from the current process's virtual heap,
    /// returning the lowest address of the block. First fit: an exact
    /// match is unlinked, a larger block is split with the tail staying
    /// on the list.
    pub fn vgetmem(&mut self, nbytes: u32) -> Result<u32, HeapError> {
        if nbytes == 0 {
            return Err(HeapError::InvalidSize);
        }
        let pid = self.procs.current();
        let head = self.heap_head(pid)?;
        let nbytes = round_to_block(nbytes);

        let mut prev: Option<u32> = None;
        let mut curr = head;
        while curr != 0 {
            let (next, len) = self.read_free_node(curr)?;
            if len == nbytes {
                self.relink(pid, prev, next)?;
                debug!("vgetmem({nbytes}) -> {curr:#010x} (exact)");
                return Ok(curr);
            }
            if len > nbytes {
                let leftover = curr + nbytes;
                self.write_free_node(leftover, next, len - nbytes)?;
                self.relink(pid, prev, leftover)?;
                debug!("vgetmem({nbytes}) -> {curr:#010x} (split, {} left)", len - nbytes);
                return Ok(curr);
            }
            prev = Some(curr);
            curr = next;
        }
        Err(HeapError::NoMemory)
    }

    /// Return `nbytes` at `addr` to the current process's free list,
    /// keeping it sorted and coalescing with both neighbours. A range
    /// overlapping either neighbour is reported as corruption and the
    /// list is left unchanged.
    pub fn vfreemem(&mut self, addr: u32, nbytes: u32) -> Result<(), HeapError> {
        if nbytes == 0 {
            return Err(HeapError::InvalidSize);
        }
        if addr < HEAP_BASE || addr % HEAP_BLOCK_ALIGN != 0 {
            return Err(HeapError::InvalidAddress);
        }
        let pid = self.procs.current();
        let head = self.heap_head(pid)?;
        let size = round_to_block(nbytes);
        let Some(end) = addr.checked_add(size) else {
            return Err(HeapError::InvalidAddress);
        };

        // Find the insertion point: the last free block below `addr`.
        let mut prev: Option<(u32, u32, u32)> = None; // (addr, next, len)
        let mut next = head;
        while next != 0 && next < addr {
            let (n, len) = self.read_free_node(next)?;
            prev = Some((next, n, len));
            next = n;
        }

        if let Some((paddr, _, plen)) = prev {
            if paddr + plen > addr {
                return Err(HeapError::Corrupted);
            }
        }
        if next != 0 && end > next {
            return Err(HeapError::Corrupted);
        }

        // Merge with the predecessor when contiguous, otherwise link a
        // fresh node.
        let (merged_addr, merged_len) = match prev {
            Some((paddr, _, plen)) if paddr + plen == addr => {
                self.store_u32(paddr + 4, plen + size)?;
                (paddr, plen + size)
            }
            _ => {
                self.write_free_node(addr, next, size)?;
                self.relink(pid, prev.map(|(p, _, _)| p), addr)?;
                (addr, size)
            }
        };

        // Merge forward when the grown block now touches its successor.
        if next != 0 && merged_addr + merged_len == next {
            let (nn, nlen) = self.read_free_node(next)?;
            self.write_free_node(merged_addr, nn, merged_len + nlen)?;
        }
        debug!("vfreemem({addr:#010x}, {size})");
        Ok(())
    }

    /// Snapshot the current process's free list as `(addr, len)` pairs.
    /// Walking the list faults pages in like any other traversal.
    pub fn heap_free_blocks(&mut self) -> Result<Vec<(u32, u32)>, HeapError> {
        let pid = self.procs.current();
        let mut blocks = Vec::new();
        let mut curr = self.heap_head(pid)?;
        while curr != 0 {
            let (next, len) = self.read_free_node(curr)?;
            blocks.push((curr, len));
            curr = next;
        }
        Ok(blocks)
    }

    fn heap_head(&self, pid: Pid) -> Result<u32, HeapError> {
        self.procs
            .get(pid)
            .and_then(|p| p.heap())
            .map(|h| h.free_head)
            .ok_or(HeapError::NoHeap)
    }

    /// Point the previous node (or the list head) at `target`.
    fn relink(&mut self, pid: Pid, prev: Option<u32>, target: u32) -> Result<(), HeapError> {
        match prev {
            Some(node) => self.store_u32(node, target)?,
            None => {
                let heap = self
                    .procs
                    .get_mut(pid)
                    .and_then(|p| p.heap.as_mut())
                    .ok_or(HeapError::NoHeap)?;
                heap.free_head = target;
            }
        }
        Ok(())
    }

    fn read_free_node(&mut self, addr: u32) -> Result<(u32, u32), HeapError> {
        // A node address that lost its alignment means the list itself
        // has been scribbled over.
        if addr % HEAP_BLOCK_ALIGN != 0 {
            return Err(HeapError::Corrupted);
        }
        let next = self.load_u32(addr)?;
        let len = self.load_u32(addr + 4)?;
        Ok((next, len))
    }

    fn write_free_node(&mut self, addr: u32, next: u32, len: u32) -> Result<(), HeapError> {
        self.store_u32(addr, next)?;
        self.store_u32(addr + 4, len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_up_to_eight_bytes() {
        assert_eq!(round_to_block(1), 8);
        assert_eq!(round_to_block(8), 8);
        assert_eq!(round_to_block(9), 16);
        assert_eq!(round_to_block(100), 104);
    }
}
