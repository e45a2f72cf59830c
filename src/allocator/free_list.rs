use super::{
    Address, AllocError, Allocation, AllocationId, BlockState, LayoutEntry,
};

use std::{cmp::Reverse, fmt};
use log::*;

/// How the free-list engine picks a free block for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// First free block large enough, in address order.
    #[default]
    FirstFit,
    /// Free block leaving the smallest remainder.
    BestFit,
    /// Largest free block.
    WorstFit,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Placement::FirstFit => "first_fit",
            Placement::BestFit => "best_fit",
            Placement::WorstFit => "worst_fit",
        })
    }
}

/// Contiguous range of the address space. The block is free when it
/// carries no allocation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    start: Address,
    size: u64,
    id: Option<AllocationId>,
}

impl Block {
    fn is_free(&self) -> bool {
        self.id.is_none()
    }

    fn end(&self) -> Address {
        self.start + self.size
    }
}

/// Free-list allocator. The blocks are kept in address order and
/// always partition `[0, total)`: each block starts where the
/// previous one ends, and no two neighbours are both free once an
/// operation returns.
#[derive(Debug, Clone)]
pub struct FreeListAllocator {
    /// Size of the managed address space.
    total: u64,
    /// Ordered partition of the address space.
    blocks: Vec<Block>,
    /// Id handed to the next successful allocation.
    next_id: AllocationId,
    /// Policy used to choose a free block.
    placement: Placement,
    /// Number of allocations that succeeded since the last `init`.
    successes: u64,
    /// Number of allocations that failed since the last `init`.
    failures: u64,
}

impl FreeListAllocator {
    pub fn new(size: u64) -> Self {
        let mut allocator = Self {
            total: 0,
            blocks: Vec::new(),
            next_id: 1,
            placement: Placement::default(),
            successes: 0,
            failures: 0,
        };
        allocator.init(size);
        allocator
    }

    /// Reset to a single free block spanning `size` bytes. The
    /// placement policy is kept.
    pub fn init(&mut self, size: u64) {
        self.total = size;
        self.blocks = vec![Block { start: 0, size, id: None }];
        self.next_id = 1;
        self.successes = 0;
        self.failures = 0;

        info!("Memory initialized: {} bytes", size);
    }

    pub fn set_placement(&mut self, placement: Placement) {
        self.placement = placement;
        debug!("Placement policy set to {}", placement);
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        // Look for a free block that can hold the request with the
        // current policy. If there is none, the request fails and
        // only the failure counter changes.
        let Some(index) = self.find_block(size) else {
            self.failures += 1;
            warn!("No free block can hold {} bytes ({})", size, self.placement);
            return Err(AllocError::AllocationFailed { size });
        };

        // Cut the block down to the requested size, the rest of it
        // becoming a new free block right after.
        self.split_block(index, size);

        let id = self.next_id;
        self.next_id += 1;
        self.successes += 1;

        let block = &mut self.blocks[index];
        block.id = Some(id);
        let allocation = Allocation {
            id,
            address: block.start,
            size: block.size,
        };

        debug!("Allocated block id={} at {:#x} ({} bytes)", id, allocation.address, size);
        self.check_partition();
        Ok(allocation)
    }

    pub fn release(&mut self, id: AllocationId) -> Result<Address, AllocError> {
        let Some(block) = self.blocks.iter_mut().find(|block| block.id == Some(id)) else {
            return Err(AllocError::InvalidId(id));
        };

        // Clearing the id frees the block; it is then merged with
        // whichever neighbours are free as well.
        block.id = None;
        let address = block.start;
        self.coalesce();

        debug!("Block {} at {:#x} freed and merged", id, address);
        self.check_partition();
        Ok(address)
    }

    pub fn dump(&self) -> Vec<LayoutEntry> {
        self.blocks
            .iter()
            .map(|block| LayoutEntry {
                start: block.start,
                size: block.size,
                state: match block.id {
                    Some(id) => BlockState::Used(id),
                    None => BlockState::Free,
                },
            })
            .collect()
    }

    pub fn stats(&self) -> FreeListStats {
        let (used, free) = self.blocks.iter().fold((0, 0), |(used, free), block| {
            if block.is_free() {
                (used, free + block.size)
            } else {
                (used + block.size, free)
            }
        });

        let free_blocks = self.blocks.iter().filter(|block| block.is_free());
        let largest_free = free_blocks.clone().map(|block| block.size).max().unwrap_or(0);

        FreeListStats {
            placement: self.placement,
            total: self.total,
            used,
            free,
            largest_free,
            free_blocks: free_blocks.count(),
            successes: self.successes,
            failures: self.failures,
        }
    }

    fn find_block(&self, size: u64) -> Option<usize> {
        let mut candidates = self.blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.is_free() && block.size >= size);

        // Ties always go to the block found first, which is the one
        // with the lowest address: `min_by_key` keeps the first
        // minimum, so the worst fit looks for the smallest reversed
        // size instead of using `max_by_key` (which keeps the last).
        let found = match self.placement {
            Placement::FirstFit => candidates.next(),
            Placement::BestFit => candidates.min_by_key(|(_, block)| block.size - size),
            Placement::WorstFit => candidates.min_by_key(|(_, block)| Reverse(block.size)),
        };

        found.map(|(index, _)| index)
    }

    fn split_block(&mut self, index: usize, size: u64) {
        let block = &mut self.blocks[index];
        if block.size == size {
            return;
        }

        // The block keeps its start and shrinks to the requested
        // size; the remaining space moves into a new free block
        // inserted just after it.
        let remainder = Block {
            start: block.start + size,
            size: block.size - size,
            id: None,
        };
        block.size = size;
        self.blocks.insert(index + 1, remainder);
    }

    fn coalesce(&mut self) {
        // Walk the whole list, absorbing each free block into its
        // free predecessor. The index only moves forward when the
        // current pair cannot be merged, so runs of several free
        // blocks collapse into one.
        let mut index = 0;
        while index + 1 < self.blocks.len() {
            if self.blocks[index].is_free() && self.blocks[index + 1].is_free() {
                let next = self.blocks.remove(index + 1);
                self.blocks[index].size += next.size;
            } else {
                index += 1;
            }
        }
    }

    fn check_partition(&self) {
        debug_assert_eq!(self.blocks.first().map(|block| block.start), Some(0));
        debug_assert_eq!(self.blocks.last().map(Block::end), Some(self.total));
        debug_assert!(self.blocks
            .windows(2)
            .all(|pair| pair[0].end() == pair[1].start));
        debug_assert!(self.blocks
            .windows(2)
            .all(|pair| !(pair[0].is_free() && pair[1].is_free())));
    }
}

/// Usage report of a free-list engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeListStats {
    pub placement: Placement,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Size of the largest free block.
    pub largest_free: u64,
    /// Number of free blocks.
    pub free_blocks: usize,
    pub successes: u64,
    pub failures: u64,
}

impl FreeListStats {
    /// Share of free memory outside the largest free block, in
    /// percent. 0 when nothing is free.
    pub fn external_fragmentation(&self) -> f64 {
        if self.free == 0 {
            0.0
        } else {
            (1.0 - self.largest_free as f64 / self.free as f64) * 100.0
        }
    }

    /// Share of the address space held by allocations, in percent.
    /// 0 for an empty address space.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        }
    }
}

impl fmt::Display for FreeListStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Placement: {}", self.placement)?;
        writeln!(f, "Total memory: {}", self.total)?;
        writeln!(f, "Used memory: {}", self.used)?;
        writeln!(f, "Free memory: {}", self.free)?;
        writeln!(f, "External fragmentation: {:.2}%", self.external_fragmentation())?;
        writeln!(f, "Memory utilization: {:.2}%", self.utilization())?;
        writeln!(f, "Allocation success: {}", self.successes)?;
        write!(f, "Allocation failure: {}", self.failures)
    }
}
