#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use qdma_cdev::{
    CdevCb, CdevConfig, DevNum, DevRegistry, DeviceClass, DeviceIdentity, Direction, Notifier,
    PageProvider, PinError, QueueEngine, QueueHandle, SgList, Status, Token, WaitStatus,
};

/// Device class that refuses registrations while `fail` is set.
#[derive(Debug, Default)]
pub struct FlakyClass {
    pub inner: DevRegistry,
    pub fail: AtomicBool,
    pub registered: AtomicUsize,
}

impl DeviceClass for FlakyClass {
    fn reserve_number_range(&self, name: &str, count: u32) -> io::Result<DevNum> {
        self.inner.reserve_number_range(name, count)
    }

    fn release_number_range(&self, base: DevNum, count: u32) {
        self.inner.release_number_range(base, count)
    }

    fn register_device(&self, identity: &DeviceIdentity) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        self.inner.register_device(identity)?;
        self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_device(&self, identity: &DeviceIdentity) {
        self.inner.unregister_device(identity);
        self.registered.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Pending {
    len: usize,
    notify: Option<Notifier>,
}

#[derive(Default)]
struct ManualState {
    next: u64,
    pending: HashMap<u64, Pending>,
    done: HashMap<u64, WaitStatus>,
    cancelled: Vec<u64>,
    accept: Option<usize>,
}

/// Engine whose requests only finish when the test says so.
#[derive(Default)]
pub struct ManualEngine {
    state: Mutex<ManualState>,
    changed: Condvar,
}

impl ManualEngine {
    /// Refuses every submit after `n` more have been accepted.
    pub fn accept_only(&self, n: usize) {
        self.state.lock().accept = Some(n);
    }

    pub fn pending(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.state.lock().pending.keys().map(|t| Token(*t)).collect();
        tokens.sort();
        tokens
    }

    pub fn cancelled(&self) -> Vec<Token> {
        self.state.lock().cancelled.iter().map(|t| Token(*t)).collect()
    }

    /// Finishes `token`; `bytes` of `None` reports the full length.
    pub fn finish(&self, token: Token, bytes: Option<usize>, status: Status) {
        let mut state = self.state.lock();
        let p = match state.pending.remove(&token.0) {
            Some(p) => p,
            None => return,
        };
        let bytes = bytes.unwrap_or(p.len);
        match p.notify {
            Some(notify) => notify.complete(bytes, status),
            None => {
                state.done.insert(token.0, WaitStatus::from((bytes, status)));
            }
        }
        self.changed.notify_all();
    }

    pub fn finish_all(&self, status: Status) {
        for token in self.pending() {
            self.finish(token, None, status);
        }
    }

    /// Waits until `n` requests are pending.
    pub fn wait_pending(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.pending.len() < n {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.pending.len() >= n;
            }
        }
        true
    }
}

impl QueueEngine for ManualEngine {
    fn submit(
        &self,
        _qhndl: QueueHandle,
        _dir: Direction,
        sgl: &SgList,
        notify: Option<Notifier>,
    ) -> Result<Token, i32> {
        let mut state = self.state.lock();
        match state.accept {
            Some(0) => return Err(libc::EBUSY),
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        state.next += 1;
        let token = state.next;
        state.pending.insert(
            token,
            Pending {
                len: sgl.total_len(),
                notify,
            },
        );
        self.changed.notify_all();
        Ok(Token(token))
    }

    fn wait(&self, token: Token, timeout: Option<Duration>) -> WaitStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(st) = state.done.remove(&token.0) {
                return st;
            }
            if !state.pending.contains_key(&token.0) {
                return WaitStatus::Failed(libc::ENOENT);
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        if let Some(st) = state.done.remove(&token.0) {
                            return st;
                        }
                        return WaitStatus::TimedOut;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
    }

    fn cancel(&self, token: Token) {
        self.state.lock().cancelled.push(token.0);
    }
}

/// Page provider whose pins fail from the `fail_at`-th pin on.
#[derive(Debug, Default)]
pub struct FailingPages {
    pub pins: AtomicUsize,
    pub held: AtomicUsize,
    pub fail_at: Option<usize>,
    pub unavailable: bool,
}

impl PageProvider for FailingPages {
    fn pin(&self, _page_addr: usize, _page_len: usize) -> Result<(), PinError> {
        if self.unavailable {
            return Err(PinError::Unavailable(io::Error::from_raw_os_error(libc::EPERM)));
        }
        let n = self.pins.fetch_add(1, Ordering::SeqCst);
        if self.fail_at.map_or(false, |k| n >= k) {
            return Err(PinError::Failed(io::Error::from_raw_os_error(libc::EFAULT)));
        }
        self.held.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unpin(&self, _page_addr: usize, _page_len: usize) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn adapter(
    name: &str,
    engine: Arc<dyn QueueEngine>,
    class: Arc<dyn DeviceClass>,
    config: CdevConfig,
    pages: Arc<dyn PageProvider>,
) -> CdevCb {
    let cb = CdevCb::with_pages(name, engine, class, config, pages).unwrap();
    cb.init_namespace().unwrap();
    cb
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| fastrand::u8(..)).collect()
}

/// Page-aligned heap buffer.
pub struct Aligned {
    buf: Vec<u8>,
    off: usize,
    len: usize,
}

impl Aligned {
    pub fn new(len: usize) -> Aligned {
        let page = qdma_cdev::page_size();
        let buf = vec![0u8; len + page];
        let off = (page - (buf.as_ptr() as usize % page)) % page;
        Aligned { buf, off, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.off..self.off + self.len]
    }
}
