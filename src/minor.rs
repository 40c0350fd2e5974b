//! Minor number namespace of one adapter.
//!
//! Up to 2048 queue nodes plus one generic control node. The control node
//! always gets [`MINOR_USER`]; queue nodes draw from `0..MINOR_USER`.

use crate::Error;

/// Size of the minor namespace: 2048 queues + 1 user BAR node.
pub const MINOR_MAX: u32 = 2048 + 1;
/// Minor reserved for the generic control node.
pub const MINOR_USER: u32 = 2048;

const WORDS: usize = ((MINOR_MAX as usize) + 63) / 64;

/// Bitmap arena of minors. Not synchronized; the adapter control block
/// keeps it under its lock.
#[derive(Debug, Clone)]
pub struct MinorAllocator {
    bits: [u64; WORDS],
    count: u32,
}

impl Default for MinorAllocator {
    fn default() -> MinorAllocator {
        MinorAllocator::new()
    }
}

impl MinorAllocator {
    pub fn new() -> MinorAllocator {
        MinorAllocator {
            bits: [0; WORDS],
            count: 0,
        }
    }

    /// Lowest free queue minor.
    pub fn allocate(&mut self) -> Result<u32, Error> {
        for (w, word) in self.bits.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let minor = (w * 64) as u32 + (!*word).trailing_zeros();
            if minor >= MINOR_USER {
                break;
            }
            self.set(minor);
            return Ok(minor);
        }
        Err(Error::ExhaustedIdentity)
    }

    /// Claims one specific minor, queue or control.
    pub fn reserve(&mut self, minor: u32) -> Result<u32, Error> {
        if minor >= MINOR_MAX {
            return Err(Error::InvalidArgument(format!(
                "minor {} outside 0..{}",
                minor, MINOR_MAX
            )));
        }
        if self.is_allocated(minor) {
            return Err(Error::MinorInUse(minor));
        }
        self.set(minor);
        Ok(minor)
    }

    /// Returns a minor to the free set. Releasing a free minor is a no-op.
    pub fn release(&mut self, minor: u32) {
        if minor >= MINOR_MAX || !self.is_allocated(minor) {
            return;
        }
        self.bits[minor as usize / 64] &= !(1 << (minor % 64));
        self.count -= 1;
    }

    pub fn is_allocated(&self, minor: u32) -> bool {
        minor < MINOR_MAX && self.bits[minor as usize / 64] & (1 << (minor % 64)) != 0
    }

    /// Number of minors currently handed out.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn free(&self) -> u32 {
        MINOR_MAX - self.count
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MINOR_MAX).filter(move |m| self.is_allocated(*m))
    }

    fn set(&mut self, minor: u32) {
        self.bits[minor as usize / 64] |= 1 << (minor % 64);
        self.count += 1;
    }
}
