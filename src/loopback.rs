//! In-memory queue engine: host-to-card transfers land in a per-queue FIFO
//! that card-to-host transfers on the same queue read back. Used to run the
//! node layer without a card.

use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::ops::Range;
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::engine::{Direction, Notifier, QueueEngine, QueueHandle, Status, Token, WaitStatus};
use crate::sgl::SgList;
use crate::user_cdev::BarIo;

/// Injected queue fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `submit` is refused with this code.
    Submit(i32),
    /// Requests are accepted and complete with this code.
    Complete(i32),
}

enum Progress {
    Queued,
    Done(usize, Status),
}

struct Request {
    qhndl: QueueHandle,
    dir: Direction,
    sgl: SgList,
    notify: Option<Notifier>,
    progress: Progress,
}

#[derive(Default)]
struct Queue {
    fifo: VecDeque<u8>,
    /// Card-to-host requests waiting for data.
    readers: VecDeque<u64>,
    fault: Option<Fault>,
}

#[derive(Default)]
struct State {
    next_token: u64,
    queues: HashMap<QueueHandle, Queue>,
    requests: HashMap<u64, Request>,
    paused: bool,
    held: VecDeque<u64>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

/// Software queue engine.
pub struct LoopbackEngine {
    tx: Sender<u64>,
    shared: Arc<Shared>,
}

impl fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        writeln!(f, "LoopbackEngine")?;
        writeln!(f, "  queues: {:?}", state.queues.len())?;
        writeln!(f, "  requests: {:?}", state.requests.len())?;
        write!(f, "  paused: {:?}", state.paused)
    }
}

impl LoopbackEngine {
    pub fn new() -> io::Result<LoopbackEngine> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::default());
        let worker = shared.clone();
        thread::Builder::new()
            .name("loopback".to_string())
            .spawn(move || run(rx, worker))?;
        Ok(LoopbackEngine { tx, shared })
    }

    /// Holds submitted requests without processing them until
    /// [`resume`](LoopbackEngine::resume).
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    pub fn resume(&self) {
        let held: Vec<u64> = {
            let mut state = self.shared.state.lock();
            state.paused = false;
            state.held.drain(..).collect()
        };
        for token in held {
            self.tx.send(token).ok();
        }
    }

    pub fn set_fault(&self, qhndl: QueueHandle, fault: Option<Fault>) {
        self.shared.state.lock().queues.entry(qhndl).or_default().fault = fault;
    }

    /// Bytes written to `qhndl` and not yet read back.
    pub fn queued_bytes(&self, qhndl: QueueHandle) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(&qhndl)
            .map_or(0, |q| q.fifo.len())
    }

    /// Requests submitted and not yet reaped.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().requests.len()
    }
}

impl QueueEngine for LoopbackEngine {
    fn submit(
        &self,
        qhndl: QueueHandle,
        dir: Direction,
        sgl: &SgList,
        notify: Option<Notifier>,
    ) -> Result<Token, i32> {
        let mut state = self.shared.state.lock();
        if let Some(Fault::Submit(code)) = state.queues.entry(qhndl).or_default().fault {
            return Err(code);
        }
        state.next_token += 1;
        let token = state.next_token;
        state.requests.insert(
            token,
            Request {
                qhndl,
                dir,
                sgl: sgl.clone(),
                notify,
                progress: Progress::Queued,
            },
        );
        drop(state);

        if self.tx.send(token).is_err() {
            let mut state = self.shared.state.lock();
            state.requests.remove(&token);
            return Err(libc::ENODEV);
        }
        trace!("loopback: {:?} {:?} {} bytes", token, dir, sgl.total_len());
        Ok(Token(token))
    }

    fn wait(&self, token: Token, timeout: Option<Duration>) -> WaitStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            match state.requests.get(&token.0) {
                None => {
                    warn!("loopback: wait on unknown {:?}", token);
                    return WaitStatus::Failed(libc::ENOENT);
                }
                Some(Request {
                    progress: Progress::Done(bytes, status),
                    ..
                }) => {
                    let st = WaitStatus::from((*bytes, *status));
                    state.requests.remove(&token.0);
                    return st;
                }
                Some(_) => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                        // one last look after the deadline
                        if let Some(Request {
                            progress: Progress::Done(..),
                            ..
                        }) = state.requests.get(&token.0)
                        {
                            continue;
                        }
                        return WaitStatus::TimedOut;
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
    }

    fn cancel(&self, token: Token) {
        let mut state = self.shared.state.lock();
        let queued = matches!(
            state.requests.get(&token.0),
            Some(Request {
                progress: Progress::Queued,
                ..
            })
        );
        if queued {
            debug!("loopback: aborting {:?}", token);
            finish(&mut state, token.0, 0, Status::Aborted);
            self.shared.changed.notify_all();
        }
    }
}

fn run(rx: Receiver<u64>, shared: Arc<Shared>) {
    while let Ok(token) = rx.recv() {
        let mut state = shared.state.lock();
        if state.paused {
            state.held.push_back(token);
            continue;
        }
        process(&mut state, token);
        shared.changed.notify_all();
    }
    trace!("loopback worker exits");
}

fn process(state: &mut State, token: u64) {
    let (qhndl, dir, fault) = match state.requests.get(&token) {
        Some(req) if matches!(req.progress, Progress::Queued) => {
            let fault = state.queues.get(&req.qhndl).and_then(|q| q.fault);
            (req.qhndl, req.dir, fault)
        }
        // cancelled before it got here
        _ => return,
    };
    if let Some(Fault::Complete(code)) = fault {
        finish(state, token, 0, Status::Failed(code));
        return;
    }

    match dir {
        Direction::H2c => {
            let bytes = match state.requests.get(&token) {
                Some(req) => gather(&req.sgl),
                None => return,
            };
            let n = bytes.len();
            let queue = state.queues.entry(qhndl).or_default();
            queue.fifo.extend(bytes);
            finish(state, token, n, Status::Ok);
            serve_readers(state, qhndl);
        }
        Direction::C2h => {
            state.queues.entry(qhndl).or_default().readers.push_back(token);
            serve_readers(state, qhndl);
        }
    }
}

/// Completes waiting readers of `qhndl` while data is queued. Reads are
/// short when less data than requested is available.
fn serve_readers(state: &mut State, qhndl: QueueHandle) {
    loop {
        let token = match state.queues.get_mut(&qhndl) {
            Some(q) if !q.fifo.is_empty() => match q.readers.pop_front() {
                Some(t) => t,
                None => return,
            },
            _ => return,
        };
        let n = match state.requests.get(&token) {
            Some(req) if matches!(req.progress, Progress::Queued) => {
                let queue = match state.queues.get_mut(&qhndl) {
                    Some(q) => q,
                    None => return,
                };
                scatter(&req.sgl, &mut queue.fifo)
            }
            _ => continue,
        };
        finish(state, token, n, Status::Ok);
    }
}

fn finish(state: &mut State, token: u64, bytes: usize, status: Status) {
    let notify = match state.requests.get_mut(&token) {
        Some(req) => {
            req.progress = Progress::Done(bytes, status);
            req.notify.take()
        }
        None => return,
    };
    if let Some(notify) = notify {
        // notified requests are never waited for
        state.requests.remove(&token);
        notify.complete(bytes, status);
    }
}

fn gather(sgl: &SgList) -> Vec<u8> {
    let mut out = Vec::with_capacity(sgl.total_len());
    for e in sgl {
        let len = e.len() as usize;
        let start = out.len();
        out.resize(start + len, 0);
        unsafe {
            ptr::copy_nonoverlapping(e.addr() as *const u8, out[start..].as_mut_ptr(), len);
        }
    }
    out
}

fn scatter(sgl: &SgList, fifo: &mut VecDeque<u8>) -> usize {
    let mut done = 0;
    for e in sgl {
        if fifo.is_empty() {
            break;
        }
        let len = (e.len() as usize).min(fifo.len());
        let chunk: Vec<u8> = fifo.drain(..len).collect();
        unsafe {
            ptr::copy_nonoverlapping(chunk.as_ptr(), e.addr() as *mut u8, len);
        }
        done += len;
    }
    done
}

/// BAR backed by host memory.
pub struct MemBar {
    mem: Mutex<Vec<u8>>,
}

impl fmt::Debug for MemBar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemBar ({:#x} bytes)", self.mem.lock().len())
    }
}

impl MemBar {
    pub fn new(size: usize) -> MemBar {
        MemBar {
            mem: Mutex::new(vec![0; size]),
        }
    }
}

/// Byte range of an access, `EFAULT` when it does not fit the address space.
fn bar_range(offset: u64, len: usize) -> io::Result<Range<usize>> {
    usize::try_from(offset)
        .ok()
        .and_then(|start| Some(start..start.checked_add(len)?))
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
}

impl BarIo for MemBar {
    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = bar_range(offset, buf.len())?;
        let mem = self.mem.lock();
        let src = mem
            .get(range)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let range = bar_range(offset, buf.len())?;
        let mut mem = self.mem.lock();
        let dst = mem
            .get_mut(range)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.mem.lock().len() as u64
    }
}
