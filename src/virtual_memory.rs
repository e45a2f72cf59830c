use crate::allocator::Address;

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};
use thiserror::Error;
use log::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Page table needs a non-empty page and room for one frame (page {page_size}, memory {physical_size})")]
pub struct PageTableError {
    pub page_size: u64,
    pub physical_size: u64,
}

/// Single-level page table with FIFO replacement. Virtual pages are
/// mapped to physical frames on first touch; once every frame is in
/// use, the page mapped longest ago gives its frame up.
#[derive(Debug, Clone)]
pub struct PageTable {
    page_size: u64,
    frames: u64,
    /// Virtual page -> physical frame.
    mappings: HashMap<u64, u64>,
    /// Resident pages, oldest first.
    resident: VecDeque<u64>,
    hits: u64,
    faults: u64,
}

impl PageTable {
    pub fn new(page_size: u64, physical_size: u64) -> Result<Self, PageTableError> {
        let frames = physical_size.checked_div(page_size).unwrap_or(0);
        if frames == 0 {
            return Err(PageTableError { page_size, physical_size });
        }

        Ok(Self {
            page_size,
            frames,
            mappings: HashMap::new(),
            resident: VecDeque::new(),
            hits: 0,
            faults: 0,
        })
    }

    /// Physical address backing `addr`, mapping its page first if
    /// needed.
    pub fn translate(&mut self, addr: Address) -> Address {
        let page = addr / self.page_size;
        let offset = addr % self.page_size;

        if let Some(&frame) = self.mappings.get(&page) {
            self.hits += 1;
            return frame * self.page_size + offset;
        }
        self.faults += 1;

        // Frames are handed out in order until memory is full; from
        // then on the oldest resident page is evicted and its frame
        // reused.
        let evicted = if self.resident.len() as u64 >= self.frames {
            self.resident
                .pop_front()
                .and_then(|victim| self.mappings.remove(&victim).map(|frame| (victim, frame)))
        } else {
            None
        };
        let frame = match evicted {
            Some((victim, frame)) => {
                debug!("Page fault on page {}: evicted page {} from frame {}", page, victim, frame);
                frame
            }
            None => {
                debug!("Page fault on page {}: using free frame {}", page, self.mappings.len());
                self.mappings.len() as u64
            }
        };

        self.mappings.insert(page, frame);
        self.resident.push_back(page);
        frame * self.page_size + offset
    }

    pub fn reset(&mut self) {
        self.mappings.clear();
        self.resident.clear();
        self.hits = 0;
        self.faults = 0;
    }

    pub fn stats(&self) -> PageTableStats {
        PageTableStats {
            frames: self.frames,
            resident: self.resident.len(),
            hits: self.hits,
            faults: self.faults,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableStats {
    /// Physical frames available.
    pub frames: u64,
    /// Pages currently mapped.
    pub resident: usize,
    pub hits: u64,
    pub faults: u64,
}

impl fmt::Display for PageTableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Resident pages: {}/{}", self.resident, self.frames)?;
        writeln!(f, "Page hits: {}", self.hits)?;
        write!(f, "Page faults: {}", self.faults)
    }
}
