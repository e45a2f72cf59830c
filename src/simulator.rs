use crate::{
    allocator::{AllocError, Allocator, Placement},
    cache::{Cache, CacheConfig, CacheGeometryError, CacheHierarchy, ReplacementPolicy},
    command::{Command, CommandError, EngineKind},
    virtual_memory::{PageTable, PageTableError},
};

use thiserror::Error;
use log::*;

/// L1: 8 sets, 2 ways of 32-byte lines, LRU.
pub const L1_SETS: usize = 8;
pub const L1_WAYS: usize = 2;
/// L2: 16 sets, 4 ways of 32-byte lines, FIFO.
pub const L2_SETS: usize = 16;
pub const L2_WAYS: usize = 4;
pub const LINE_SIZE: u64 = 32;

/// Page table: 256-byte pages over 4 KiB of physical memory, that
/// is 16 frames.
pub const PAGE_SIZE: u64 = 256;
pub const PHYSICAL_MEMORY: u64 = 4096;

#[derive(Error, Debug)]
pub enum SimulatorError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Cache(#[from] CacheGeometryError),
    #[error(transparent)]
    PageTable(#[from] PageTableError),
    #[error("Memory is not initialized, use: init memory <size> | init buddy <size>")]
    NotInitialized,
}

/// Geometry of the simulated machine around the allocation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    pub l1: CacheConfig,
    pub l2: CacheConfig,
    pub page_size: u64,
    pub physical_memory: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            l1: CacheConfig {
                name: "L1".to_string(),
                sets: L1_SETS,
                ways: L1_WAYS,
                line_size: LINE_SIZE,
                policy: ReplacementPolicy::Lru,
            },
            l2: CacheConfig {
                name: "L2".to_string(),
                sets: L2_SETS,
                ways: L2_WAYS,
                line_size: LINE_SIZE,
                policy: ReplacementPolicy::Fifo,
            },
            page_size: PAGE_SIZE,
            physical_memory: PHYSICAL_MEMORY,
        }
    }
}

/// What running a command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Text to show to the user.
    Report(String),
    /// The session is over.
    Exit,
}

/// A simulation session: the active allocation engine, if any, and
/// the caches and page table that consume its addresses.
#[derive(Debug, Clone)]
pub struct Simulator {
    engine: Option<Allocator>,
    /// Placement for free-list engines. It survives re-initialization
    /// and can be chosen before the first `init`.
    placement: Placement,
    caches: CacheHierarchy,
    page_table: PageTable,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Result<Self, SimulatorError> {
        let caches = CacheHierarchy::new(Cache::new(config.l1)?, Cache::new(config.l2)?);
        let page_table = PageTable::new(config.page_size, config.physical_memory)?;

        Ok(Self {
            engine: None,
            placement: Placement::default(),
            caches,
            page_table,
        })
    }

    /// Parse and run one command line.
    pub fn run_line(&mut self, line: &str) -> Result<Response, SimulatorError> {
        let command = line.parse::<Command>()?;
        self.execute(command)
    }

    pub fn execute(&mut self, command: Command) -> Result<Response, SimulatorError> {
        let report = match command {
            Command::Init { kind, size } => self.init(kind, size)?,
            Command::SetAllocator(placement) => self.set_allocator(placement),
            Command::Malloc(size) => {
                let is_free_list = matches!(self.engine, Some(Allocator::FreeList(_)));
                let allocation = self.engine_mut()?.allocate(size)?;

                // Only the free-list engine feeds the cache hierarchy,
                // and only on success.
                if is_free_list {
                    let outcome = self.caches.access(allocation.address);
                    debug!("Cache lookup of {:#x}: {}", allocation.address, outcome);
                    format!(
                        "Allocated block id={} at address={:#x} (cache: {})",
                        allocation.id, allocation.address, outcome,
                    )
                } else {
                    format!(
                        "Allocated block id={} at address={:#x} size={}",
                        allocation.id, allocation.address, allocation.size,
                    )
                }
            }
            Command::Free(id) => {
                self.engine_mut()?.release(id)?;
                format!("Block {} freed and merged", id)
            }
            Command::Dump => {
                let layout = self.engine_ref()?.dump();
                if layout.is_empty() {
                    "No free blocks".to_string()
                } else {
                    layout
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Command::Stats => self.engine_ref()?.stats().to_string(),
            Command::Cache => self.caches.to_string(),
            Command::Translate(addr) => {
                let physical = self.page_table.translate(addr);
                format!("Virtual {:#x} -> physical {:#x}", addr, physical)
            }
            Command::Vm => self.page_table.stats().to_string(),
            Command::Exit => return Ok(Response::Exit),
        };

        Ok(Response::Report(report))
    }

    fn init(&mut self, kind: EngineKind, size: u64) -> Result<String, SimulatorError> {
        // The new engine is fully built before it replaces the old
        // one, so a rejected configuration leaves the session as it
        // was.
        let (engine, label) = match kind {
            EngineKind::FreeList => (Allocator::free_list(size, self.placement), "Memory"),
            EngineKind::Buddy => (Allocator::buddy(size)?, "Buddy memory"),
        };
        let report = format!("{} initialized: {} bytes", label, engine.total_size());

        if self.engine.replace(engine).is_some() {
            info!("Re-initialized: previous allocations discarded");
        }
        self.caches.reset();
        self.page_table.reset();

        Ok(report)
    }

    fn set_allocator(&mut self, placement: Placement) -> String {
        match &mut self.engine {
            Some(engine @ Allocator::FreeList(_)) => {
                engine.set_placement(placement);
                self.placement = placement;
                format!("Allocator set to {}", placement)
            }
            Some(Allocator::Buddy(_)) => {
                warn!("Ignored placement {} in buddy mode", placement);
                "Allocator setting ignored in Buddy mode".to_string()
            }
            None => {
                self.placement = placement;
                format!("Allocator set to {}", placement)
            }
        }
    }

    fn engine_ref(&self) -> Result<&Allocator, SimulatorError> {
        self.engine.as_ref().ok_or(SimulatorError::NotInitialized)
    }

    fn engine_mut(&mut self) -> Result<&mut Allocator, SimulatorError> {
        self.engine.as_mut().ok_or(SimulatorError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator() -> Simulator {
        Simulator::new(SimulatorConfig::default()).unwrap()
    }

    fn report(simulator: &mut Simulator, line: &str) -> String {
        match simulator.run_line(line) {
            Ok(Response::Report(text)) => text,
            other => panic!("{line}: unexpected {other:?}"),
        }
    }

    #[test]
    fn engine_commands_need_an_init() {
        let mut simulator = simulator();
        for line in ["malloc 10", "free 1", "dump", "stats"] {
            assert!(matches!(
                simulator.run_line(line),
                Err(SimulatorError::NotInitialized),
            ));
        }
    }

    #[test]
    fn free_list_session() {
        let mut simulator = simulator();

        assert_eq!(report(&mut simulator, "init memory 1024"), "Memory initialized: 1024 bytes");
        assert_eq!(report(&mut simulator, "malloc 100"), "Allocated block id=1 at address=0x0 (cache: miss)");
        assert_eq!(report(&mut simulator, "malloc 200"), "Allocated block id=2 at address=0x64 (cache: miss)");
        assert_eq!(report(&mut simulator, "free 1"), "Block 1 freed and merged");
        assert_eq!(
            report(&mut simulator, "dump"),
            "[0x0 - 0x63] FREE\n[0x64 - 0x12b] USED (id=2)\n[0x12c - 0x3ff] FREE",
        );
        assert!(matches!(
            simulator.run_line("free 1"),
            Err(SimulatorError::Alloc(AllocError::InvalidId(1))),
        ));
    }

    #[test]
    fn buddy_session() {
        let mut simulator = simulator();

        assert_eq!(report(&mut simulator, "init buddy 1024"), "Buddy memory initialized: 1024 bytes");
        assert_eq!(report(&mut simulator, "malloc 100"), "Allocated block id=1 at address=0x0 size=128");
        assert_eq!(
            report(&mut simulator, "dump"),
            "[0x80 - 0xff] FREE\n[0x100 - 0x1ff] FREE\n[0x200 - 0x3ff] FREE",
        );
        assert!(report(&mut simulator, "stats").contains("Buddy Internal Fragmentation: 28 bytes"));
    }

    #[test]
    fn only_free_list_allocations_reach_the_caches() {
        let mut simulator = simulator();

        simulator.run_line("init buddy 1024").unwrap();
        simulator.run_line("malloc 64").unwrap();
        assert_eq!(simulator.caches.l1.stats().accesses, 0);

        simulator.run_line("init memory 1024").unwrap();
        simulator.run_line("malloc 64").unwrap();
        simulator.run_line("malloc 4096").unwrap_err();
        simulator.run_line("free 1").unwrap();

        let l1 = simulator.caches.l1.stats();
        let l2 = simulator.caches.l2.stats();
        assert_eq!((l1.accesses, l1.misses), (2, 1));
        assert_eq!((l2.accesses, l2.misses), (1, 1));
    }

    #[test]
    fn rejected_buddy_init_keeps_the_previous_engine() {
        let mut simulator = simulator();
        simulator.run_line("init memory 512").unwrap();
        simulator.run_line("malloc 10").unwrap();

        assert!(matches!(
            simulator.run_line("init buddy 1000"),
            Err(SimulatorError::Alloc(AllocError::InvalidConfiguration { size: 1000 })),
        ));
        assert!(matches!(simulator.engine.as_ref(), Some(Allocator::FreeList(_))));
        assert_eq!(simulator.caches.l1.stats().accesses, 2);
        assert_eq!(report(&mut simulator, "free 1"), "Block 1 freed and merged");
    }

    #[test]
    fn reinit_resets_caches_and_page_table() {
        let mut simulator = simulator();
        simulator.run_line("init memory 512").unwrap();
        simulator.run_line("malloc 10").unwrap();
        simulator.run_line("translate 0x300").unwrap();

        simulator.run_line("init buddy 512").unwrap();
        assert_eq!(simulator.caches.l1.stats().accesses, 0);
        assert_eq!(simulator.caches.l2.stats().accesses, 0);
        assert_eq!(simulator.page_table.stats().faults, 0);
    }

    #[test]
    fn placement_is_ignored_in_buddy_mode() {
        let mut simulator = simulator();
        simulator.run_line("init buddy 256").unwrap();

        assert_eq!(
            report(&mut simulator, "set allocator best_fit"),
            "Allocator setting ignored in Buddy mode",
        );
        assert_eq!(simulator.placement, Placement::FirstFit);
    }

    #[test]
    fn placement_survives_reinit() {
        let mut simulator = simulator();
        assert_eq!(report(&mut simulator, "set allocator worst_fit"), "Allocator set to worst_fit");
        simulator.run_line("init memory 256").unwrap();
        simulator.run_line("init memory 512").unwrap();

        let stats = report(&mut simulator, "stats");
        assert!(stats.starts_with("Placement: worst_fit\nTotal memory: 512\n"), "{stats}");
    }

    #[test]
    fn malloc_reports_where_the_cache_found_the_address() {
        let mut simulator = simulator();
        simulator.run_line("init memory 4096").unwrap();

        // 0x0 and 0x10 share a 32-byte line, 0x20 starts the next one.
        assert_eq!(report(&mut simulator, "malloc 16"), "Allocated block id=1 at address=0x0 (cache: miss)");
        assert_eq!(report(&mut simulator, "malloc 16"), "Allocated block id=2 at address=0x10 (cache: L1 hit)");
        assert_eq!(report(&mut simulator, "malloc 16"), "Allocated block id=3 at address=0x20 (cache: miss)");

        // Line 0x20 maps to L1 set 1; filling that set with lines 0x120
        // and 0x220 pushes it out of L1 while L2 (16 sets) keeps it.
        simulator.run_line("free 3").unwrap();
        simulator.run_line("malloc 224").unwrap(); // 0x20..0x100
        simulator.run_line("malloc 32").unwrap(); // 0x100
        simulator.run_line("malloc 32").unwrap(); // 0x120
        simulator.run_line("malloc 224").unwrap(); // 0x140..0x220
        simulator.run_line("malloc 32").unwrap(); // 0x220
        simulator.run_line("free 4").unwrap();
        assert_eq!(report(&mut simulator, "malloc 16"), "Allocated block id=9 at address=0x20 (cache: L2 hit)");
    }

    #[test]
    fn translate_and_vm_report() {
        let mut simulator = simulator();

        assert_eq!(report(&mut simulator, "translate 0x310"), "Virtual 0x310 -> physical 0x10");
        assert_eq!(report(&mut simulator, "translate 0x320"), "Virtual 0x320 -> physical 0x20");
        assert_eq!(
            report(&mut simulator, "vm"),
            "Resident pages: 1/16\nPage hits: 1\nPage faults: 1",
        );
    }

    #[test]
    fn exit_ends_the_session() {
        assert_eq!(simulator().run_line("exit").unwrap(), Response::Exit);
    }
}
