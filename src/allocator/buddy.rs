use super::{
    Address, AllocError, Allocation, AllocationId, BlockState, LayoutEntry,
};

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};
use log::*;

/// Set of free block addresses of a single order, kept sorted so the
/// lowest address is always taken first.
type FreeList = BTreeSet<Address>;

/// Live allocation of the buddy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BuddyBlock {
    /// Start of the block.
    addr: Address,
    /// The block spans `2^order` bytes.
    order: u32,
    /// Size originally requested, at most `2^order`.
    requested: u64,
}

/// Binary buddy allocator over a power-of-two address space.
///
/// Free blocks are tracked in one free list per order, from order 0
/// (single bytes) up to `max_order` (the whole space). Two blocks of
/// the same order that only differ by bit `order` of their address
/// are buddies; they are never both free at that order, since a
/// release merges them into their parent as soon as it happens.
#[derive(Debug, Clone)]
pub struct BuddyAllocator {
    /// Size of the managed address space, `2^max_order`.
    total: u64,
    /// Order of the root block.
    max_order: u32,
    /// Id handed to the next successful allocation.
    next_id: AllocationId,
    /// Bytes reserved but not requested, summed over the live
    /// allocations.
    internal_fragmentation: u64,
    /// Live allocations by id.
    allocated: BTreeMap<AllocationId, BuddyBlock>,
    /// Free lists, indexed by order.
    free_lists: Vec<FreeList>,
    successes: u64,
    failures: u64,
}

impl BuddyAllocator {
    pub fn new(size: u64) -> Result<Self, AllocError> {
        if !size.is_power_of_two() {
            warn!("Rejected buddy size {}: not a power of two", size);
            return Err(AllocError::InvalidConfiguration { size });
        }

        // The whole space starts as a single free block of the
        // highest order, at address 0.
        let max_order = size.ilog2();
        let mut free_lists = vec![FreeList::new(); max_order as usize + 1];
        free_lists[max_order as usize].insert(0);

        info!("Buddy memory initialized: {} bytes (max order {})", size, max_order);

        Ok(Self {
            total: size,
            max_order,
            next_id: 1,
            internal_fragmentation: 0,
            allocated: BTreeMap::new(),
            free_lists,
            successes: 0,
            failures: 0,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Running total of `2^order - requested` over the live
    /// allocations.
    pub fn internal_fragmentation(&self) -> u64 {
        self.internal_fragmentation
    }

    /// Free block addresses of the given order, lowest first.
    pub fn free_blocks(&self, order: u32) -> impl Iterator<Item = Address> + '_ {
        self.free_lists
            .get(order as usize)
            .into_iter()
            .flat_map(|list| list.iter().copied())
    }

    pub fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        let order = size_to_order(size);

        // Take the lowest free block of the smallest order that can
        // hold the request. Requests larger than the whole space
        // never find one.
        let max_order = self.max_order;
        let found = (order..=max_order).find_map(|current| {
            self.free_lists[current as usize]
                .pop_first()
                .map(|addr| (current, addr))
        });
        let Some((mut current, addr)) = found else {
            self.failures += 1;
            warn!("No free block of order {} or above for {} bytes", order, size);
            return Err(AllocError::AllocationFailed { size });
        };

        // Split the block down to the target order: each step keeps
        // the lower half and hands the upper half (its buddy) to
        // the free list one order below.
        while current > order {
            current -= 1;
            let buddy = addr + order_to_size(current);
            self.free_lists[current as usize].insert(buddy);
            debug!("Split: buddy {:#x} freed at order {}", buddy, current);
        }

        let block_size = order_to_size(order);
        self.internal_fragmentation += block_size - size;

        let id = self.next_id;
        self.next_id += 1;
        self.successes += 1;
        self.allocated.insert(id, BuddyBlock { addr, order, requested: size });

        debug!("Allocated block id={} at {:#x} size={}", id, addr, block_size);
        Ok(Allocation { id, address: addr, size: block_size })
    }

    pub fn release(&mut self, id: AllocationId) -> Result<Address, AllocError> {
        let block = self.allocated.remove(&id).ok_or(AllocError::InvalidId(id))?;
        self.internal_fragmentation -= order_to_size(block.order) - block.requested;

        // Merge the block with its buddy for as long as the buddy
        // is free at the same order, moving one order up each time.
        // The merged block starts at the lower of the two addresses.
        let mut addr = block.addr;
        let mut order = block.order;
        while order < self.max_order {
            let buddy = buddy_of(addr, order);
            if !self.free_lists[order as usize].remove(&buddy) {
                break;
            }

            debug!("Merged {:#x} with buddy {:#x} at order {}", addr, buddy, order);
            addr = addr.min(buddy);
            order += 1;
        }

        self.free_lists[order as usize].insert(addr);
        debug!("Block {} freed, {:#x} now free at order {}", id, addr, order);
        Ok(block.addr)
    }

    /// Every free block, by increasing order and then address.
    pub fn dump(&self) -> Vec<LayoutEntry> {
        self.free_lists
            .iter()
            .enumerate()
            .flat_map(|(order, list)| {
                list.iter().map(move |&start| LayoutEntry {
                    start,
                    size: order_to_size(order as u32),
                    state: BlockState::Free,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> BuddyStats {
        let allocated: u64 = self.allocated
            .values()
            .map(|block| order_to_size(block.order))
            .sum();

        let free: u64 = self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() as u64 * order_to_size(order as u32))
            .sum();

        BuddyStats {
            total: self.total,
            allocated,
            free,
            live_allocations: self.allocated.len(),
            internal_fragmentation: self.internal_fragmentation,
            successes: self.successes,
            failures: self.failures,
        }
    }
}

/// Smallest order whose block can hold `size` bytes. Sizes that no
/// 64-bit block can hold map to order 64, above any valid maximum.
pub fn size_to_order(size: u64) -> u32 {
    match size.checked_next_power_of_two() {
        Some(block_size) => block_size.trailing_zeros(),
        None => u64::BITS,
    }
}

pub fn order_to_size(order: u32) -> u64 {
    1 << order
}

fn buddy_of(addr: Address, order: u32) -> Address {
    addr ^ order_to_size(order)
}

/// Usage report of a buddy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyStats {
    pub total: u64,
    /// Bytes held by live allocations, rounded up to their blocks.
    pub allocated: u64,
    /// Bytes in the free lists.
    pub free: u64,
    pub live_allocations: usize,
    pub internal_fragmentation: u64,
    pub successes: u64,
    pub failures: u64,
}

impl fmt::Display for BuddyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total memory: {}", self.total)?;
        writeln!(f, "Allocated memory: {} ({} live blocks)", self.allocated, self.live_allocations)?;
        writeln!(f, "Free memory: {}", self.free)?;
        writeln!(f, "Buddy Internal Fragmentation: {} bytes", self.internal_fragmentation)?;
        writeln!(f, "Allocation success: {}", self.successes)?;
        write!(f, "Allocation failure: {}", self.failures)
    }
}
