//! Page replacement policies.
//!
//! Both policies scan the allocation FIFO and only ever choose
//! backing-store frames; directories and tables are never victims. The
//! active policy is installed once at startup via `srpolicy` and consulted
//! by the frame allocator whenever the pool is full.

use marmot_abi::{POLICY_AGING, POLICY_FIFO};

use crate::memory::frame::{FrameId, FrameKind, FrameTable};

/// Chooses the frame to evict when the pool is full.
pub trait EvictionPolicy {
    /// The next victim, or `None` if no backing-store frame is resident.
    fn pick_victim(&self, frames: &FrameTable) -> Option<FrameId>;
}

/// Evict the least recently allocated backing-store frame.
pub struct Fifo;

impl EvictionPolicy for Fifo {
    fn pick_victim(&self, frames: &FrameTable) -> Option<FrameId> {
        frames
            .fifo()
            .iter()
            .copied()
            .find(|id| matches!(frames.get(*id).kind(), Some(FrameKind::Backing { .. })))
    }
}

/// Evict the backing-store frame with the smallest age counter.
///
/// Ages accumulate toward 255 for frames seen by recent sweeps and decay
/// toward zero otherwise, so the smallest age marks the oldest frame.
/// Ties go to the earlier FIFO position.
pub struct Aging;

impl EvictionPolicy for Aging {
    fn pick_victim(&self, frames: &FrameTable) -> Option<FrameId> {
        let mut best: Option<(FrameId, u8)> = None;
        for id in frames.fifo().iter().copied() {
            if !matches!(frames.get(id).kind(), Some(FrameKind::Backing { .. })) {
                continue;
            }
            let age = frames.get(id).age();
            match best {
                Some((_, oldest)) if age >= oldest => {}
                _ => best = Some((id, age)),
            }
        }
        best.map(|(id, _)| id)
    }
}

/// The installed policy, carrying the syscall selector values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    Fifo,
    Aging,
}

impl PolicyKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            POLICY_FIFO => Some(Self::Fifo),
            POLICY_AGING => Some(Self::Aging),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Fifo => POLICY_FIFO,
            Self::Aging => POLICY_AGING,
        }
    }

    pub(crate) fn strategy(self) -> &'static dyn EvictionPolicy {
        match self {
            Self::Fifo => &Fifo,
            Self::Aging => &Aging,
        }
    }
}
