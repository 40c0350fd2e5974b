//! Deferred completion worker.
//!
//! Engines report asynchronous completions as messages; this worker turns
//! them into copy-out, unmap and caller notification on its own thread. It
//! also drains requests whose synchronous caller gave up after a timeout,
//! holding their memory until the engine confirms they are finished.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::engine::{Completion, Notifier, QueueEngine, Token, WaitStatus};
use crate::Error;

pub(crate) type Finish = Box<dyn FnOnce(Completion) + Send>;

pub(crate) enum Event {
    Complete(Completion),
    Drain(Drain),
}

/// A timed-out request still owned by the engine.
pub(crate) struct Drain {
    pub token: Token,
    pub engine: Arc<dyn QueueEngine>,
    /// Memory the engine may still touch; dropped once drained.
    pub hold: Box<dyn Any + Send>,
}

#[derive(Default)]
struct State {
    inflight: HashMap<u64, Finish>,
    /// Requests not yet finished: tracked plus draining.
    busy: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    idle: Condvar,
}

impl Shared {
    fn done(&self) {
        let mut state = self.state.lock();
        state.busy -= 1;
        if state.busy == 0 {
            self.idle.notify_all();
        }
    }
}

pub(crate) struct Reaper {
    tx: Sender<Event>,
    shared: Arc<Shared>,
    next_tag: AtomicU64,
}

impl fmt::Debug for Reaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reaper (busy: {})", self.outstanding())
    }
}

impl Reaper {
    pub fn spawn(name: &str, poll: Duration) -> Result<Reaper, Error> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::default());
        let worker = shared.clone();
        thread::Builder::new()
            .name(format!("{}-reaper", name))
            .spawn(move || run(rx, worker, poll))
            .map_err(|e| Error::invalid_state(format!("cannot start reaper: {}", e)))?;
        Ok(Reaper {
            tx,
            shared,
            next_tag: AtomicU64::new(1),
        })
    }

    /// Registers `finish` to run on the worker when the returned notifier
    /// fires.
    pub fn track(&self, finish: Finish) -> Notifier {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.state.lock();
        state.inflight.insert(tag, finish);
        state.busy += 1;
        Notifier::new(tag, self.tx.clone())
    }

    /// Takes back a request the engine never accepted.
    pub fn untrack(&self, tag: u64) -> Option<Finish> {
        let mut state = self.shared.state.lock();
        let finish = state.inflight.remove(&tag)?;
        state.busy -= 1;
        if state.busy == 0 {
            self.shared.idle.notify_all();
        }
        Some(finish)
    }

    /// Keeps `drain.hold` alive until the engine finishes `drain.token`.
    pub fn drain(&self, drain: Drain) {
        self.shared.state.lock().busy += 1;
        if let Err(e) = self.tx.send(Event::Drain(drain)) {
            // worker is gone; drain inline
            if let Event::Drain(d) = e.into_inner() {
                d.engine.wait(d.token, None);
                drop(d.hold);
            }
            self.shared.done();
        }
    }

    /// Requests tracked or draining.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().busy
    }

    /// Waits until nothing is outstanding. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.busy > 0 {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return state.busy == 0;
            }
        }
        true
    }
}

fn run(rx: Receiver<Event>, shared: Arc<Shared>, poll: Duration) {
    let mut drains: Vec<Drain> = Vec::new();
    loop {
        let ev = if drains.is_empty() {
            match rx.recv() {
                Ok(ev) => Some(ev),
                Err(_) => break,
            }
        } else {
            match rx.recv_timeout(poll) {
                Ok(ev) => Some(ev),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        match ev {
            Some(Event::Complete(c)) => complete(&shared, c),
            Some(Event::Drain(d)) => {
                debug!("draining timed-out request {:?}", d.token);
                drains.push(d);
            }
            None => {}
        }

        let mut i = 0;
        while i < drains.len() {
            let d = &drains[i];
            match d.engine.wait(d.token, Some(Duration::from_secs(0))) {
                WaitStatus::TimedOut => i += 1,
                st => {
                    let d = drains.swap_remove(i);
                    debug!("request {:?} drained: {:?}", d.token, st);
                    drop(d);
                    shared.done();
                }
            }
        }
    }

    for d in drains {
        let st = d.engine.wait(d.token, None);
        debug!("request {:?} drained at shutdown: {:?}", d.token, st);
        drop(d);
        shared.done();
    }
    trace!("reaper exits");
}

fn complete(shared: &Shared, c: Completion) {
    let finish = shared.state.lock().inflight.remove(&c.tag);
    match finish {
        Some(finish) => {
            trace!("completion tag {} bytes {} {:?}", c.tag, c.bytes, c.status);
            let tag = c.tag;
            if panic::catch_unwind(AssertUnwindSafe(|| finish(c))).is_err() {
                error!("completion callback for tag {} panicked", tag);
            }
            shared.done();
        }
        None => warn!("completion for unknown tag {}", c.tag),
    }
}
