use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_io::Timer;
use log::warn;
use parking_lot::Mutex;

use crate::cdev::{Cdev, CdevFile};
use crate::engine::Direction;
use crate::request::{self, AioRequest, AioResult};
use crate::Error;

#[derive(Default)]
struct Slot {
    inner: Mutex<(Option<AioResult>, Option<Waker>)>,
}

impl Slot {
    fn fill(&self, res: AioResult) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.0 = Some(res);
            inner.1.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct Done<'a>(&'a Slot);

impl Future for Done<'_> {
    type Output = AioResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<AioResult> {
        let mut inner = self.0.inner.lock();
        match inner.0.take() {
            Some(res) => Poll::Ready(res),
            None => {
                inner.1 = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Resolves to the result, or `None` once the timer fires first.
struct Deadline<'a> {
    done: Done<'a>,
    timer: Timer,
}

impl Future for Deadline<'_> {
    type Output = Option<AioResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AioResult>> {
        if let Poll::Ready(res) = Pin::new(&mut self.done).poll(cx) {
            return Poll::Ready(Some(res));
        }
        match Pin::new(&mut self.timer).poll(cx) {
            Poll::Ready(_) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl CdevFile {
    /// Reads into `buf` without blocking the executor. The buffer comes
    /// back with the result. With a deadline the transfer is cancelled when
    /// it passes; the future still resolves only after the engine let go of
    /// the buffer.
    pub async fn read_async(&self, buf: Vec<u8>, deadline: Option<Duration>) -> AioResult {
        transfer(self.node(), Direction::C2h, buf, deadline).await
    }

    pub async fn write_async(&self, buf: Vec<u8>, deadline: Option<Duration>) -> AioResult {
        transfer(self.node(), Direction::H2c, buf, deadline).await
    }
}

async fn transfer(
    node: &Arc<Cdev>,
    dir: Direction,
    buf: Vec<u8>,
    deadline: Option<Duration>,
) -> AioResult {
    let slot = Arc::new(Slot::default());
    let s = slot.clone();
    let req = AioRequest::new(buf, move |res| s.fill(res));

    let qhndl = match node.check_live().and_then(|_| node.queue_handle(dir)) {
        Ok(q) => q,
        Err(e) => {
            req.fail(e);
            return Done(&slot).await;
        }
    };

    // on error the callback already ran
    let token = match request::submit_one(node, qhndl, dir, req) {
        Ok(Some(token)) => token,
        _ => return Done(&slot).await,
    };

    let limit = match deadline {
        Some(limit) => limit,
        None => return Done(&slot).await,
    };
    let raced = Deadline {
        done: Done(&slot),
        timer: Timer::after(limit),
    };
    if let Some(res) = raced.await {
        return res;
    }

    warn!("{}: async {:?} passed its deadline, cancelling", node.name(), token);
    node.adapter().engine.cancel(token);
    let mut res = Done(&slot).await;
    if let Err(Error::Cancelled) = res.res {
        res.res = Err(Error::Timeout(limit.as_millis() as u64));
    }
    res
}
