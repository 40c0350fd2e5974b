use std::fmt;

/// One physically contiguous chunk of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    addr: u64,
    len: u32,
}

impl SgEntry {
    pub fn new(addr: u64, len: u32) -> SgEntry {
        SgEntry { addr, len }
    }

    /// Bus address of the chunk. Addresses are IOVAs identity-mapped to
    /// the process's virtual addresses.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Ordered chunk list describing one logically contiguous buffer. Chunk
/// order is buffer order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SgList {
    entries: Vec<SgEntry>,
    total: usize,
}

impl fmt::Debug for SgList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SgList ({} entries, {} bytes)", self.entries.len(), self.total)?;
        for (i, e) in self.entries.iter().enumerate() {
            writeln!(f, "  [{}] addr: {:#x?} len: {:#x?}", i, e.addr, e.len)?;
        }
        Ok(())
    }
}

impl SgList {
    pub(crate) fn with_capacity(n: usize) -> SgList {
        SgList {
            entries: Vec::with_capacity(n),
            total: 0,
        }
    }

    pub(crate) fn push(&mut self, addr: u64, len: u32) {
        debug_assert!(len > 0);
        self.entries.push(SgEntry::new(addr, len));
        self.total += len as usize;
    }

    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SgEntry> {
        self.entries.iter()
    }

    /// Sum of all chunk lengths.
    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a SgList {
    type Item = &'a SgEntry;
    type IntoIter = std::slice::Iter<'a, SgEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
