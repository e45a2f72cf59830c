mod buddy;
mod free_list;

pub use buddy::{order_to_size, size_to_order, BuddyAllocator, BuddyStats};
pub use free_list::{FreeListAllocator, FreeListStats, Placement};

use std::fmt;
use thiserror::Error;

/// Symbolic address within the simulated address space. No real
/// memory backs it.
pub type Address = u64;

/// Identifier of a live allocation. Ids are handed out by the
/// engine, starting at 1, and never reused until the engine is
/// re-initialized.
pub type AllocationId = u64;

/// Outcomes an allocation engine can signal to its caller. None of
/// them is fatal: the engine state is left consistent after each.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Allocation failed: no free block can hold {size} bytes")]
    AllocationFailed { size: u64 },
    #[error("Invalid block id {0}")]
    InvalidId(AllocationId),
    #[error("Buddy allocator requires size to be a power of two (got {size})")]
    InvalidConfiguration { size: u64 },
}

/// A successful allocation: where it lives and how large the block
/// reserved for it really is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Id to pass back to `release`.
    pub id: AllocationId,
    /// First address of the block.
    pub address: Address,
    /// Size of the reserved block, which may be larger than the
    /// request for the buddy engine.
    pub size: u64,
}

/// Whether a range of the address space is available or held by an
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Used(AllocationId),
}

/// One line of an engine layout listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub start: Address,
    pub size: u64,
    pub state: BlockState,
}

impl LayoutEntry {
    /// Last address covered by the entry (inclusive). An empty entry
    /// reports its own start.
    pub fn end(&self) -> Address {
        self.start + self.size.saturating_sub(1)
    }

    pub fn is_free(&self) -> bool {
        self.state == BlockState::Free
    }
}

impl fmt::Display for LayoutEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x} - {:#x}] ", self.start, self.end())?;
        match self.state {
            BlockState::Free => write!(f, "FREE"),
            BlockState::Used(id) => write!(f, "USED (id={id})"),
        }
    }
}

/// Report produced by `Allocator::stats`, specific to the active
/// discipline.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStats {
    FreeList(FreeListStats),
    Buddy(BuddyStats),
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStats::FreeList(stats) => stats.fmt(f),
            EngineStats::Buddy(stats) => stats.fmt(f),
        }
    }
}

/// Allocation engine over a linear address space. Exactly one
/// discipline is active at a time; switching means building a new
/// engine, which discards every allocation and id of the old one.
///
/// The engine owns all of its state and is only reachable through
/// `&mut self`, so wrapping it in a single lock is enough to share
/// it between threads.
#[derive(Debug, Clone)]
pub enum Allocator {
    FreeList(FreeListAllocator),
    Buddy(BuddyAllocator),
}

impl Allocator {
    /// Free-list engine over `size` bytes. Any size is accepted.
    pub fn free_list(size: u64, placement: Placement) -> Self {
        let mut allocator = FreeListAllocator::new(size);
        allocator.set_placement(placement);
        Allocator::FreeList(allocator)
    }

    /// Buddy engine over `size` bytes, which must be a power of two.
    pub fn buddy(size: u64) -> Result<Self, AllocError> {
        BuddyAllocator::new(size).map(Allocator::Buddy)
    }

    /// Total number of bytes managed by the engine.
    pub fn total_size(&self) -> u64 {
        match self {
            Allocator::FreeList(allocator) => allocator.total_size(),
            Allocator::Buddy(allocator) => allocator.total_size(),
        }
    }

    /// Change the placement policy of a free-list engine. Returns
    /// `false` (and changes nothing) for the buddy engine, which has
    /// a single, fixed placement rule.
    pub fn set_placement(&mut self, placement: Placement) -> bool {
        match self {
            Allocator::FreeList(allocator) => {
                allocator.set_placement(placement);
                true
            }
            Allocator::Buddy(_) => false,
        }
    }

    pub fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        match self {
            Allocator::FreeList(allocator) => allocator.allocate(size),
            Allocator::Buddy(allocator) => allocator.allocate(size),
        }
    }

    /// Release the allocation `id`, returning the address its block
    /// started at.
    pub fn release(&mut self, id: AllocationId) -> Result<Address, AllocError> {
        match self {
            Allocator::FreeList(allocator) => allocator.release(id),
            Allocator::Buddy(allocator) => allocator.release(id),
        }
    }

    /// Layout listing: every block for the free-list engine, every
    /// free entry for the buddy engine.
    pub fn dump(&self) -> Vec<LayoutEntry> {
        match self {
            Allocator::FreeList(allocator) => allocator.dump(),
            Allocator::Buddy(allocator) => allocator.dump(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        match self {
            Allocator::FreeList(allocator) => EngineStats::FreeList(allocator.stats()),
            Allocator::Buddy(allocator) => EngineStats::Buddy(allocator.stats()),
        }
    }
}
