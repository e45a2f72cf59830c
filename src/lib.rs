//! Memory allocation simulator: a free-list engine (first, best and
//! worst fit) and a binary buddy engine over a symbolic address
//! space, with a two-level cache and a FIFO page table fed by the
//! addresses they hand out.

pub mod allocator;
pub mod cache;
pub mod command;
pub mod simulator;
pub mod virtual_memory;
