//! User buffer to scatter/gather translation.
//!
//! A buffer is either pinned in place (zero copy) or mirrored into
//! page-sized staging chunks. The [`Mapping`] remembers which, and dropping
//! it releases exactly what was acquired.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::{trace, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::sgl::SgList;
use crate::Error;

/// Host page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

/// Number of pages touched by `len` bytes starting at `addr`.
pub fn pages_spanned(addr: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let page = page_size();
    let first = addr / page;
    let last = (addr + len - 1) / page;
    last - first + 1
}

#[derive(Debug, Error)]
pub enum PinError {
    /// Pinning cannot be used at all; the mapper falls back to staging.
    #[error("pinning unavailable: {0}")]
    Unavailable(io::Error),
    #[error("pinning failed: {0}")]
    Failed(io::Error),
}

/// Source of page pins and staging memory.
pub trait PageProvider: Send + Sync {
    /// Pins the page starting at `page_addr`.
    fn pin(&self, page_addr: usize, page_len: usize) -> Result<(), PinError>;

    /// Undoes one successful [`pin`](PageProvider::pin).
    fn unpin(&self, page_addr: usize, page_len: usize);

    /// Allocates one page-aligned staging chunk.
    fn alloc_staging(&self, len: usize) -> io::Result<StagingPage> {
        StagingPage::alloc(len)
    }
}

/// Pins with `mlock(2)`. Pins are counted per page, since `munlock` is not.
#[derive(Debug, Default)]
pub struct HostPages {
    locked: Mutex<HashMap<usize, usize>>,
}

impl HostPages {
    pub fn new() -> HostPages {
        HostPages::default()
    }
}

impl PageProvider for HostPages {
    fn pin(&self, page_addr: usize, page_len: usize) -> Result<(), PinError> {
        let mut locked = self.locked.lock();
        if let Some(n) = locked.get_mut(&page_addr) {
            *n += 1;
            return Ok(());
        }
        let rc = unsafe { libc::mlock(page_addr as *const libc::c_void, page_len) };
        if rc != 0 {
            // EPERM, ENOMEM (RLIMIT_MEMLOCK) and EAGAIN all mean no pins
            // for this process right now.
            return Err(PinError::Unavailable(io::Error::last_os_error()));
        }
        locked.insert(page_addr, 1);
        Ok(())
    }

    fn unpin(&self, page_addr: usize, page_len: usize) {
        let mut locked = self.locked.lock();
        match locked.get_mut(&page_addr) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                locked.remove(&page_addr);
                unsafe {
                    libc::munlock(page_addr as *const libc::c_void, page_len);
                }
            }
            None => warn!("unpin of unpinned page {:#x}", page_addr),
        }
    }
}

/// Page-aligned heap chunk used when user pages are not pinned.
pub struct StagingPage {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The chunk is plain owned memory.
unsafe impl Send for StagingPage {}
unsafe impl Sync for StagingPage {}

impl fmt::Debug for StagingPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StagingPage({:?}, {:#x})", self.ptr, self.len)
    }
}

impl StagingPage {
    pub fn alloc(len: usize) -> io::Result<StagingPage> {
        let page = page_size();
        let size = ((len.max(1) + page - 1) / page) * page;
        let layout = Layout::from_size_align(size, page)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(StagingPage { ptr, len, layout })
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for StagingPage {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Debug, Default)]
struct MapStats {
    pinned: AtomicUsize,
    staged: AtomicUsize,
}

/// Pages pinned so far. Dropping unpins all of them.
struct Pinned {
    provider: Arc<dyn PageProvider>,
    stats: Arc<MapStats>,
    pages: Vec<usize>,
    page_len: usize,
}

impl Drop for Pinned {
    fn drop(&mut self) {
        for &page in &self.pages {
            self.provider.unpin(page, self.page_len);
        }
        self.stats.pinned.fetch_sub(self.pages.len(), Ordering::AcqRel);
    }
}

/// Staging chunks allocated so far. Dropping frees all of them.
struct Staged {
    stats: Arc<MapStats>,
    pages: Vec<StagingPage>,
}

impl Drop for Staged {
    fn drop(&mut self) {
        self.stats.staged.fetch_sub(self.pages.len(), Ordering::AcqRel);
    }
}

enum Backing {
    Pinned(Pinned),
    Staged(Staged),
}

/// A mapped buffer. Must outlive the transfer that uses its list.
pub struct Mapping {
    sgl: SgList,
    backing: Backing,
    pages_nr: usize,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("staged", &self.is_staged())
            .field("pages_nr", &self.pages_nr)
            .field("len", &self.sgl.total_len())
            .finish()
    }
}

impl Mapping {
    pub fn sgl(&self) -> &SgList {
        &self.sgl
    }

    /// Whether the allocate-and-copy path was taken.
    pub fn is_staged(&self) -> bool {
        matches!(self.backing, Backing::Staged(_))
    }

    pub fn pages_nr(&self) -> usize {
        self.pages_nr
    }

    pub fn len(&self) -> usize {
        self.sgl.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.sgl.is_empty()
    }

    /// Copies the first `n` transferred bytes from staging into `dst`.
    /// Pinned mappings already hold the data in place.
    pub fn copy_out(&self, dst: &mut [u8], n: usize) {
        let staged = match &self.backing {
            Backing::Staged(s) => s,
            Backing::Pinned(_) => return,
        };
        let mut n = n.min(dst.len());
        let mut off = 0;
        for page in &staged.pages {
            if n == 0 {
                break;
            }
            let chunk = n.min(page.len());
            dst[off..off + chunk].copy_from_slice(&page.as_slice()[..chunk]);
            off += chunk;
            n -= chunk;
        }
    }

    /// Releases everything the mapping holds.
    pub fn unmap(self) {}
}

/// Builds [`Mapping`]s and keeps count of what is still held.
#[derive(Clone)]
pub struct Mapper {
    provider: Arc<dyn PageProvider>,
    stats: Arc<MapStats>,
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mapper")?;
        writeln!(f, "  pinned: {}", self.pinned_pages())?;
        write!(f, "  staged: {}", self.staged_pages())
    }
}

impl Default for Mapper {
    fn default() -> Mapper {
        Mapper::new(Arc::new(HostPages::new()))
    }
}

impl Mapper {
    pub fn new(provider: Arc<dyn PageProvider>) -> Mapper {
        Mapper {
            provider,
            stats: Arc::new(MapStats::default()),
        }
    }

    /// Maps a buffer the device will read (host to card). Staged data is
    /// copied in before the list is built.
    pub fn map_write(&self, src: &[u8], copy: bool) -> Result<Mapping, Error> {
        self.map(src.as_ptr() as usize, src.len(), copy, Some(src))
    }

    /// Maps a buffer the device will fill (card to host). Staged data must
    /// be copied out with [`Mapping::copy_out`] after completion.
    pub fn map_read(&self, dst: &mut [u8], copy: bool) -> Result<Mapping, Error> {
        self.map(dst.as_mut_ptr() as usize, dst.len(), copy, None)
    }

    /// Maps with pinning only; no staging fallback.
    pub fn map_pinned(&self, addr: usize, len: usize) -> Result<Mapping, Error> {
        let pages_nr = pages_spanned(addr, len);
        self.pin(addr, len, pages_nr).map_err(|(page, e)| match e {
            PinError::Unavailable(e) | PinError::Failed(e) => Error::Mapping {
                page,
                pages: pages_nr,
                reason: e.to_string(),
            },
        })
    }

    fn map(
        &self,
        addr: usize,
        len: usize,
        copy: bool,
        src: Option<&[u8]>,
    ) -> Result<Mapping, Error> {
        if len == 0 {
            return Err(Error::InvalidArgument("zero length buffer".into()));
        }
        let pages_nr = pages_spanned(addr, len);

        if !copy {
            match self.pin(addr, len, pages_nr) {
                Ok(m) => return Ok(m),
                Err((page, PinError::Unavailable(e))) => {
                    warn!(
                        "pinning unavailable at page {}/{} ({}), staging {} bytes",
                        page, pages_nr, e, len
                    );
                }
                Err((page, PinError::Failed(e))) => {
                    return Err(Error::Mapping {
                        page,
                        pages: pages_nr,
                        reason: e.to_string(),
                    })
                }
            }
        }

        self.stage(len, src)
    }

    fn pin(&self, addr: usize, len: usize, pages_nr: usize) -> Result<Mapping, (usize, PinError)> {
        let page = page_size();
        let mut pinned = Pinned {
            provider: self.provider.clone(),
            stats: self.stats.clone(),
            pages: Vec::with_capacity(pages_nr),
            page_len: page,
        };
        let mut sgl = SgList::with_capacity(pages_nr);

        let end = addr + len;
        let mut cur = addr;
        for i in 0..pages_nr {
            let page_addr = cur & !(page - 1);
            // dropping `pinned` on error unpins pages 0..i
            self.provider.pin(page_addr, page).map_err(|e| (i, e))?;
            pinned.pages.push(page_addr);
            self.stats.pinned.fetch_add(1, Ordering::AcqRel);

            let chunk_end = (page_addr + page).min(end);
            sgl.push(cur as u64, (chunk_end - cur) as u32);
            cur = chunk_end;
        }
        debug_assert_eq!(sgl.total_len(), len);

        trace!("pinned {} pages for {:#x}+{:#x}", pages_nr, addr, len);
        Ok(Mapping {
            sgl,
            backing: Backing::Pinned(pinned),
            pages_nr,
        })
    }

    fn stage(&self, len: usize, src: Option<&[u8]>) -> Result<Mapping, Error> {
        let page = page_size();
        let pages_nr = (len + page - 1) / page;
        let mut staged = Staged {
            stats: self.stats.clone(),
            pages: Vec::with_capacity(pages_nr),
        };
        let mut sgl = SgList::with_capacity(pages_nr);

        let mut off = 0;
        for i in 0..pages_nr {
            let chunk = page.min(len - off);
            // dropping `staged` on error frees chunks 0..i
            let mut sp = self
                .provider
                .alloc_staging(chunk)
                .map_err(|e| Error::Mapping {
                    page: i,
                    pages: pages_nr,
                    reason: e.to_string(),
                })?;
            if let Some(src) = src {
                sp.as_mut_slice().copy_from_slice(&src[off..off + chunk]);
            }
            sgl.push(sp.addr() as u64, chunk as u32);
            staged.pages.push(sp);
            self.stats.staged.fetch_add(1, Ordering::AcqRel);
            off += chunk;
        }

        trace!("staged {} pages for {} bytes", pages_nr, len);
        Ok(Mapping {
            sgl,
            backing: Backing::Staged(staged),
            pages_nr,
        })
    }

    pub fn pinned_pages(&self) -> usize {
        self.stats.pinned.load(Ordering::Acquire)
    }

    pub fn staged_pages(&self) -> usize {
        self.stats.staged.load(Ordering::Acquire)
    }

    /// Pages pinned or staged by mappings that are still alive.
    pub fn outstanding_pages(&self) -> usize {
        self.pinned_pages() + self.staged_pages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts pins without touching the host's memory locks.
    #[derive(Default)]
    struct CountingPages {
        pins: AtomicUsize,
        fail_at: Option<usize>,
        unavailable: bool,
        seen: AtomicUsize,
    }

    impl PageProvider for CountingPages {
        fn pin(&self, _page_addr: usize, _page_len: usize) -> Result<(), PinError> {
            if self.unavailable {
                return Err(PinError::Unavailable(io::Error::from_raw_os_error(libc::EPERM)));
            }
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fail_at {
                return Err(PinError::Failed(io::Error::from_raw_os_error(libc::EFAULT)));
            }
            self.pins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unpin(&self, _page_addr: usize, _page_len: usize) {
            self.pins.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn spans() {
        let p = page_size();
        assert_eq!(pages_spanned(0, 0), 0);
        assert_eq!(pages_spanned(0, 1), 1);
        assert_eq!(pages_spanned(0, p), 1);
        assert_eq!(pages_spanned(p - 1, 2), 2);
        assert_eq!(pages_spanned(10, 2 * p), 3);
    }

    #[test]
    fn pinned_list_follows_buffer() {
        let provider = Arc::new(CountingPages::default());
        let mapper = Mapper::new(provider.clone());
        let len = 3 * page_size() + 123;
        let buf = vec![0u8; len + 77];
        let src = &buf[77..];

        let m = mapper.map_write(src, false).unwrap();
        assert!(!m.is_staged());
        assert_eq!(m.sgl().total_len(), len);
        assert_eq!(m.sgl().entries()[0].addr(), src.as_ptr() as u64);
        let mut next = src.as_ptr() as u64;
        for e in m.sgl() {
            assert_eq!(e.addr(), next);
            next += e.len() as u64;
        }
        assert_eq!(provider.pins.load(Ordering::SeqCst), m.pages_nr());
        assert_eq!(mapper.pinned_pages(), m.pages_nr());

        m.unmap();
        assert_eq!(provider.pins.load(Ordering::SeqCst), 0);
        assert_eq!(mapper.outstanding_pages(), 0);
    }

    #[test]
    fn failed_pin_unwinds_earlier_pages() {
        let provider = Arc::new(CountingPages {
            fail_at: Some(2),
            ..Default::default()
        });
        let mapper = Mapper::new(provider.clone());
        let buf = vec![0u8; 5 * page_size()];

        match mapper.map_write(&buf, false) {
            Err(Error::Mapping { page, .. }) => assert_eq!(page, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(provider.pins.load(Ordering::SeqCst), 0);
        assert_eq!(mapper.outstanding_pages(), 0);
    }

    #[test]
    fn unavailable_pinning_stages() {
        let provider = Arc::new(CountingPages {
            unavailable: true,
            ..Default::default()
        });
        let mapper = Mapper::new(provider);
        let data = (0..2 * page_size() + 9)
            .map(|_| fastrand::u8(..))
            .collect::<Vec<_>>();

        let m = mapper.map_write(&data, false).unwrap();
        assert!(m.is_staged());
        assert_eq!(mapper.staged_pages(), 3);
        let mut staged = Vec::new();
        for e in m.sgl() {
            let chunk =
                unsafe { slice::from_raw_parts(e.addr() as usize as *const u8, e.len() as usize) };
            staged.extend_from_slice(chunk);
        }
        assert_eq!(staged, data);
        drop(m);
        assert_eq!(mapper.outstanding_pages(), 0);
    }

    #[test]
    fn staged_read_copies_out() {
        let mapper = Mapper::new(Arc::new(CountingPages::default()));
        let mut dst = vec![0u8; page_size() + 10];
        let m = mapper.map_read(&mut dst, true).unwrap();
        assert!(m.is_staged());
        for (i, e) in m.sgl().iter().enumerate() {
            let chunk = unsafe {
                slice::from_raw_parts_mut(e.addr() as usize as *mut u8, e.len() as usize)
            };
            chunk.fill(i as u8 + 1);
        }
        let n = page_size() + 5;
        m.copy_out(&mut dst, n);
        assert!(dst[..page_size()].iter().all(|&b| b == 1));
        assert!(dst[page_size()..n].iter().all(|&b| b == 2));
        assert!(dst[n..].iter().all(|&b| b == 0));
    }

    #[test]
    fn repeated_map_unmap_leaves_nothing() {
        let mapper = Mapper::new(Arc::new(CountingPages::default()));
        let mut buf = vec![0u8; 4 * page_size()];
        for _ in 0..50 {
            let off = fastrand::usize(..page_size());
            let len = fastrand::usize(1..3 * page_size());
            let copy = fastrand::bool();
            let m = mapper.map_read(&mut buf[off..off + len], copy).unwrap();
            assert_eq!(m.len(), len);
        }
        assert_eq!(mapper.outstanding_pages(), 0);
    }

    #[test]
    fn zero_length_is_rejected() {
        let mapper = Mapper::new(Arc::new(CountingPages::default()));
        assert!(matches!(
            mapper.map_write(&[], false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn host_pages_refcounts() {
        let host = HostPages::new();
        let buf = vec![0u8; 2 * page_size()];
        let page = (buf.as_ptr() as usize + page_size() - 1) & !(page_size() - 1);
        match host.pin(page, page_size()) {
            Ok(()) => {
                host.pin(page, page_size()).unwrap();
                host.unpin(page, page_size());
                assert_eq!(host.locked.lock().get(&page), Some(&1));
                host.unpin(page, page_size());
                assert!(host.locked.lock().is_empty());
            }
            // no RLIMIT_MEMLOCK budget in this environment
            Err(PinError::Unavailable(_)) => {}
            Err(e) => panic!("unexpected {}", e),
        }
    }
}
