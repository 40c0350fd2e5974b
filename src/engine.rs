//! Interface to the queue engine that owns descriptor rings and
//! interrupts.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::sgl::SgList;

/// Opaque reference to a hardware queue inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle(pub u64);

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to card (write).
    H2c,
    /// Card to host (read).
    C2h,
}

/// Engine-side identifier of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

/// Outcome of a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Engine or hardware error code.
    Failed(i32),
    /// Aborted by [`QueueEngine::cancel`].
    Aborted,
}

/// Result of [`QueueEngine::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Done(usize),
    Failed(i32),
    Aborted,
    /// Deadline passed; the request is still outstanding.
    TimedOut,
}

impl From<(usize, Status)> for WaitStatus {
    fn from((bytes, status): (usize, Status)) -> WaitStatus {
        match status {
            Status::Ok => WaitStatus::Done(bytes),
            Status::Failed(code) => WaitStatus::Failed(code),
            Status::Aborted => WaitStatus::Aborted,
        }
    }
}

/// Completion message sent by the engine for a notified request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub tag: u64,
    pub bytes: usize,
    pub status: Status,
}

/// Completion path for an asynchronous request.
///
/// Calling [`complete`](Notifier::complete) only enqueues a message, so the
/// engine may call it from its interrupt or completion context.
pub struct Notifier {
    tag: u64,
    tx: Sender<crate::reaper::Event>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Notifier({})", self.tag)
    }
}

impl Notifier {
    pub(crate) fn new(tag: u64, tx: Sender<crate::reaper::Event>) -> Notifier {
        Notifier { tag, tx }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Reports the request as finished. Consumes the notifier: one
    /// completion per request.
    pub fn complete(self, bytes: usize, status: Status) {
        let c = Completion {
            tag: self.tag,
            bytes,
            status,
        };
        // The reaper outlives every notifier it handed out.
        self.tx.send(crate::reaper::Event::Complete(c)).ok();
    }
}

/// The descriptor-ring side of a queue.
///
/// The engine reads or writes the memory described by `sgl` until the
/// request completes or is aborted, so callers keep that memory alive until
/// then.
pub trait QueueEngine: Send + Sync {
    /// Queues a transfer. With a notifier the engine reports completion
    /// through it and [`wait`](QueueEngine::wait) is not used for the token.
    fn submit(
        &self,
        qhndl: QueueHandle,
        dir: Direction,
        sgl: &SgList,
        notify: Option<Notifier>,
    ) -> Result<Token, i32>;

    /// Blocks until the request finishes or `timeout` passes. `None` waits
    /// without a deadline.
    fn wait(&self, token: Token, timeout: Option<Duration>) -> WaitStatus;

    /// Asks the engine to abort the request. The request still completes
    /// (possibly as [`Status::Aborted`]) and must be waited for or notified.
    fn cancel(&self, token: Token);
}
