//! Hands out unique ports from a bounded half-open range.

use std::collections::BTreeSet;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free ports in range [{start}, {end}]")]
    Exhausted { start: u16, end: u16 },
}

/// Thread-safe allocator over `[start, end]`.
pub struct PortAllocator {
    start: u16,
    end: u16,
    taken: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            taken: Mutex::new(BTreeSet::new()),
        }
    }

    /// Return the lowest free port in the configured range.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut taken = self.taken.lock().expect("port allocator mutex poisoned");
        for port in self.start..=self.end {
            if !taken.contains(&port) {
                taken.insert(port);
                return Ok(port);
            }
        }
        Err(PortError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Release `port` back to the pool. A no-op if it was not allocated.
    pub fn release(&self, port: u16) {
        let mut taken = self.taken.lock().expect("port allocator mutex poisoned");
        taken.remove(&port);
    }
}
