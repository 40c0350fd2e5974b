//! Request tracking: one I/O control block per blocking call or per
//! asynchronous element.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::barrier::dmb;
use crate::cdev::{Adapter, Cdev};
use crate::config::AioPolicy;
use crate::engine::{Completion, Direction, QueueHandle, Status, Token, WaitStatus};
use crate::mapper::Mapping;
use crate::reaper::Drain;
use crate::Error;

/// Caller buffer of a blocking transfer.
#[derive(Debug)]
pub enum IoBuf<'a> {
    /// Filled by the card.
    Read(&'a mut [u8]),
    /// Sent to the card.
    Write(&'a [u8]),
}

impl IoBuf<'_> {
    pub fn dir(&self) -> Direction {
        match self {
            IoBuf::Read(_) => Direction::C2h,
            IoBuf::Write(_) => Direction::H2c,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IoBuf::Read(b) => b.len(),
            IoBuf::Write(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one asynchronous element. Hands the buffer back.
#[derive(Debug)]
pub struct AioResult {
    pub buf: Vec<u8>,
    pub res: Result<usize, Error>,
}

pub type AioDone = Box<dyn FnOnce(AioResult) + Send>;

/// One element of a vectorized asynchronous transfer. For reads the
/// buffer length is the requested length.
pub struct AioRequest {
    buf: Vec<u8>,
    done: AioDone,
}

impl fmt::Debug for AioRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AioRequest ({} bytes)", self.buf.len())
    }
}

impl AioRequest {
    pub fn new<F>(buf: Vec<u8>, done: F) -> AioRequest
    where
        F: FnOnce(AioResult) + Send + 'static,
    {
        AioRequest {
            buf,
            done: Box::new(done),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn fail(self, e: Error) {
        (self.done)(AioResult {
            buf: self.buf,
            res: Err(e),
        })
    }
}

/// Decrements the node's in-flight count when dropped. Owned, so a drained
/// request keeps the node busy until the engine lets go of it.
struct Inflight(Arc<Cdev>);

impl Inflight {
    fn enter(node: &Arc<Cdev>) -> Inflight {
        node.inflight.fetch_add(1, Ordering::AcqRel);
        Inflight(node.clone())
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Blocking read or write. Returns the byte count the engine reports,
/// which may be short.
pub(crate) fn submit_sync(node: &Arc<Cdev>, buf: IoBuf<'_>) -> Result<usize, Error> {
    node.check_live()?;
    let dir = buf.dir();
    let qhndl = node.queue_handle(dir)?;
    if buf.is_empty() {
        return Ok(0);
    }

    let adapter = node.adapter();
    let copy = !node.no_memcpy();
    let inflight = Inflight::enter(node);

    let (mapping, dst) = match buf {
        IoBuf::Write(src) => (adapter.mapper.map_write(src, copy)?, None),
        IoBuf::Read(dst) => (adapter.mapper.map_read(dst, copy)?, Some(dst)),
    };
    if dir == Direction::H2c {
        dmb();
    }

    let engine = &adapter.engine;
    let token = engine
        .submit(qhndl, dir, mapping.sgl(), None)
        .map_err(|code| {
            error!("{}: submit {:?} failed ({})", node.name(), dir, code);
            Error::Engine { code }
        })?;
    trace!(
        "{}: {:?} {:?} {} bytes in {} chunks",
        node.name(),
        token,
        dir,
        mapping.len(),
        mapping.sgl().len()
    );

    match engine.wait(token, node.timeout()) {
        WaitStatus::Done(n) => {
            let n = n.min(mapping.len());
            if let Some(dst) = dst {
                mapping.copy_out(dst, n);
            }
            Ok(n)
        }
        WaitStatus::Failed(code) => {
            error!("{}: {:?} failed ({})", node.name(), token, code);
            Err(Error::Engine { code })
        }
        WaitStatus::Aborted => Err(Error::Cancelled),
        WaitStatus::TimedOut => {
            warn!(
                "{}: {:?} timed out after {} ms, cancelling",
                node.name(),
                token,
                node.timeout_ms()
            );
            engine.cancel(token);
            if mapping.is_staged() {
                // pages go first, then the node stops counting the request
                adapter.reaper.drain(Drain {
                    token,
                    engine: engine.clone(),
                    hold: Box::new((mapping, inflight)),
                });
            } else {
                // pinned pages belong to the caller's borrow
                let st = engine.wait(token, None);
                debug!("{}: {:?} drained: {:?}", node.name(), token, st);
                drop(mapping);
                drop(inflight);
            }
            Err(Error::Timeout(node.timeout_ms()))
        }
    }
}

/// Vectorized asynchronous transfer. Every element's callback fires exactly
/// once. Returns how many elements the engine accepted.
pub(crate) fn submit_async(
    node: &Arc<Cdev>,
    dir: Direction,
    reqs: Vec<AioRequest>,
) -> Result<usize, Error> {
    let qhndl = match node.check_live().and_then(|_| node.queue_handle(dir)) {
        Ok(q) => q,
        Err(e) => {
            for req in reqs {
                req.fail(e.clone());
            }
            return Err(e);
        }
    };

    let mut accepted = 0;
    let mut first_err = None;
    let mut reqs = reqs.into_iter();
    for req in reqs.by_ref() {
        match submit_one(node, qhndl, dir, req) {
            Ok(_) => accepted += 1,
            Err(e) => {
                first_err = Some(e);
                break;
            }
        }
    }
    for req in reqs {
        req.fail(Error::NotSubmitted);
    }

    match first_err {
        Some(e) if accepted == 0 => Err(e),
        _ => Ok(accepted),
    }
}

/// Submits one asynchronous element; on error its callback has already
/// run. `Ok(None)` means nothing reached the engine (empty buffer).
pub(crate) fn submit_one(
    node: &Arc<Cdev>,
    qhndl: QueueHandle,
    dir: Direction,
    req: AioRequest,
) -> Result<Option<Token>, Error> {
    let AioRequest { mut buf, done } = req;
    if buf.is_empty() {
        done(AioResult { buf, res: Ok(0) });
        return Ok(None);
    }

    let adapter = node.adapter();
    let mapping = match map_aio(node, adapter, dir, &mut buf) {
        Ok(m) => m,
        Err(e) => {
            done(AioResult {
                buf,
                res: Err(e.clone()),
            });
            return Err(e);
        }
    };
    if dir == Direction::H2c {
        dmb();
    }

    let sgl = mapping.sgl().clone();
    node.inflight.fetch_add(1, Ordering::AcqRel);
    let aiocb = AioCb {
        mapping,
        buf,
        done,
        node: node.clone(),
        dir,
    };
    let notifier = adapter.reaper.track(Box::new(move |c| aiocb.finish(c)));
    let tag = notifier.tag();

    match adapter.engine.submit(qhndl, dir, &sgl, Some(notifier)) {
        Ok(token) => {
            trace!("{}: aio {:?} tag {} {:?}", node.name(), token, tag, dir);
            Ok(Some(token))
        }
        Err(code) => {
            error!("{}: aio submit {:?} failed ({})", node.name(), dir, code);
            if let Some(finish) = adapter.reaper.untrack(tag) {
                finish(Completion {
                    tag,
                    bytes: 0,
                    status: Status::Failed(code),
                });
            }
            Err(Error::Engine { code })
        }
    }
}

fn map_aio(
    node: &Cdev,
    adapter: &Adapter,
    dir: Direction,
    buf: &mut Vec<u8>,
) -> Result<Mapping, Error> {
    match adapter.config.aio_policy {
        AioPolicy::FollowDevice => {
            let copy = !node.no_memcpy();
            match dir {
                Direction::H2c => adapter.mapper.map_write(buf, copy),
                Direction::C2h => adapter.mapper.map_read(buf, copy),
            }
        }
        AioPolicy::ZeroCopyOnly => adapter.mapper.map_pinned(buf.as_ptr() as usize, buf.len()),
    }
}

/// I/O control block of an asynchronous element. `mapping` is declared
/// before `buf` so the pins go before the pages they cover.
struct AioCb {
    mapping: Mapping,
    buf: Vec<u8>,
    done: AioDone,
    node: Arc<Cdev>,
    dir: Direction,
}

impl AioCb {
    fn finish(self, c: Completion) {
        let AioCb {
            mapping,
            mut buf,
            done,
            node,
            dir,
        } = self;
        let res = match c.status {
            Status::Ok => {
                let n = c.bytes.min(mapping.len());
                if dir == Direction::C2h {
                    mapping.copy_out(&mut buf, n);
                }
                Ok(n)
            }
            Status::Failed(code) => Err(Error::Engine { code }),
            Status::Aborted => Err(Error::Cancelled),
        };
        mapping.unmap();
        node.inflight.fetch_sub(1, Ordering::AcqRel);
        done(AioResult { buf, res });
    }
}
