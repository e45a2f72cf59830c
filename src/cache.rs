use crate::allocator::Address;

use std::fmt;
use thiserror::Error;
use log::*;

/// Which line of a full set is evicted on a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// Least recently used: hits refresh the line's timestamp.
    Lru,
    /// First in, first out: only fills set the timestamp.
    Fifo,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cache {name} needs at least one set, one way and a non-empty line")]
pub struct CacheGeometryError {
    pub name: String,
}

/// Shape of a single cache level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub name: String,
    pub sets: usize,
    pub ways: usize,
    /// Line size in bytes.
    pub line_size: u64,
    pub policy: ReplacementPolicy,
}

#[derive(Debug, Clone, Copy, Default)]
struct CacheLine {
    valid: bool,
    tag: u64,
    /// Timestamp of the last fill (FIFO) or access (LRU).
    age: u64,
}

/// Set-associative cache simulator. It only tracks tags: no data is
/// ever stored.
#[derive(Debug, Clone)]
pub struct Cache {
    config: CacheConfig,
    sets: Vec<Vec<CacheLine>>,
    /// Logical clock, ticking once per access.
    timer: u64,
    accesses: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Result<Self, CacheGeometryError> {
        if config.sets == 0 || config.ways == 0 || config.line_size == 0 {
            return Err(CacheGeometryError { name: config.name });
        }

        let sets = vec![vec![CacheLine::default(); config.ways]; config.sets];
        Ok(Self {
            config,
            sets,
            timer: 0,
            accesses: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        })
    }

    /// Look up `addr`, filling its line on a miss. Returns `true` on
    /// a hit.
    pub fn access(&mut self, addr: Address) -> bool {
        self.accesses += 1;
        self.timer += 1;

        // The line number is split into a set index (low bits) and
        // a tag (the remaining high bits).
        let line_number = addr / self.config.line_size;
        let index = (line_number % self.config.sets as u64) as usize;
        let tag = line_number / self.config.sets as u64;
        let timer = self.timer;
        let set = &mut self.sets[index];

        if let Some(hit) = set.iter_mut().find(|line| line.valid && line.tag == tag) {
            if self.config.policy == ReplacementPolicy::Lru {
                hit.age = timer;
            }
            self.hits += 1;
            debug!("{} hit: {:#x} (set {})", self.config.name, addr, index);
            return true;
        }
        self.misses += 1;

        // Fill an invalid way if there is one, else evict the line
        // with the oldest timestamp (first one on ties).
        let slot = match set.iter().position(|line| !line.valid) {
            Some(slot) => slot,
            None => {
                self.evictions += 1;
                set.iter()
                    .enumerate()
                    .min_by_key(|(_, line)| line.age)
                    .map_or(0, |(slot, _)| slot)
            }
        };
        set[slot] = CacheLine { valid: true, tag, age: timer };

        debug!("{} miss: {:#x} (set {}, way {})", self.config.name, addr, index, slot);
        false
    }

    /// Invalidate every line and clear the counters.
    pub fn reset(&mut self) {
        self.sets
            .iter_mut()
            .flatten()
            .for_each(|line| *line = CacheLine::default());
        self.timer = 0;
        self.accesses = 0;
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.config.name.clone(),
            accesses: self.accesses,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub name: String,
    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hits over accesses, in percent. 0 before the first access.
    pub fn hit_rate(&self) -> f64 {
        if self.accesses == 0 {
            0.0
        } else {
            self.hits as f64 / self.accesses as f64 * 100.0
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache Stats ({})", self.name)?;
        writeln!(f, "Accesses : {}", self.accesses)?;
        writeln!(f, "Hits     : {}", self.hits)?;
        writeln!(f, "Misses   : {}", self.misses)?;
        writeln!(f, "Evictions: {}", self.evictions)?;
        write!(f, "Hit Rate : {:.2}%", self.hit_rate())
    }
}

/// Where an access through the hierarchy was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    L1Hit,
    L2Hit,
    Miss,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheOutcome::L1Hit => "L1 hit",
            CacheOutcome::L2Hit => "L2 hit",
            CacheOutcome::Miss => "miss",
        })
    }
}

/// Two cache levels in front of the simulated memory.
#[derive(Debug, Clone)]
pub struct CacheHierarchy {
    pub l1: Cache,
    pub l2: Cache,
}

impl CacheHierarchy {
    pub fn new(l1: Cache, l2: Cache) -> Self {
        Self { l1, l2 }
    }

    /// Look `addr` up in L1, then in L2 on a miss. After an L1 miss
    /// L1 is accessed once more to bring the line in, whatever L2
    /// answered; that second access is counted (as a hit, since the
    /// miss already filled the line).
    pub fn access(&mut self, addr: Address) -> CacheOutcome {
        if self.l1.access(addr) {
            return CacheOutcome::L1Hit;
        }

        let outcome = if self.l2.access(addr) {
            CacheOutcome::L2Hit
        } else {
            CacheOutcome::Miss
        };
        self.l1.access(addr);
        outcome
    }

    pub fn reset(&mut self) {
        self.l1.reset();
        self.l2.reset();
    }
}

impl fmt::Display for CacheHierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Cache Hierarchy ===")?;
        writeln!(f, "{}", self.l1.stats())?;
        writeln!(f)?;
        write!(f, "{}", self.l2.stats())
    }
}
