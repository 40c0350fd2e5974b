//! Queue device nodes and the per-adapter control block that owns them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::config::{CdevConfig, QueueConf, QueueDir};
use crate::engine::{Direction, QueueEngine, QueueHandle};
use crate::error::diag;
use crate::host::{DevNum, DeviceClass, DeviceIdentity};
use crate::mapper::{HostPages, Mapper, PageProvider};
use crate::minor::{MinorAllocator, MINOR_MAX};
use crate::reaper::Reaper;
use crate::request::{self, AioRequest, IoBuf};
use crate::user_cdev::UserCdev;
use crate::Error;

/// Capability callbacks of a device node, bound once at creation.
///
/// The provided methods are the plain queue behaviour; implementors
/// override the hooks they need.
pub trait CdevOps: Send + Sync {
    fn open(&self, _cdev: &Cdev) -> Result<(), Error> {
        Ok(())
    }

    fn close(&self, _cdev: &Cdev) -> Result<(), Error> {
        Ok(())
    }

    fn ioctl(&self, _cdev: &Cdev, cmd: u32, _arg: u64) -> Result<i64, Error> {
        Err(Error::NotSupported(format!("ioctl {:#x}", cmd)))
    }

    /// Blocking read or write.
    fn rw(&self, cdev: &Arc<Cdev>, buf: IoBuf<'_>) -> Result<usize, Error> {
        request::submit_sync(cdev, buf)
    }

    /// Vectorized asynchronous read or write.
    fn aio_rw(
        &self,
        cdev: &Arc<Cdev>,
        dir: Direction,
        reqs: Vec<AioRequest>,
    ) -> Result<usize, Error> {
        request::submit_async(cdev, dir, reqs)
    }
}

/// Plain queue node callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueOps;

impl CdevOps for QueueOps {}

/// Node lifecycle. `Destroyed` is terminal for a node; a minor that holds
/// no node reads `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Registered,
    Open(usize),
    Destroyed,
}

/// Everything the nodes of one adapter share.
pub(crate) struct Adapter {
    pub name: String,
    pub config: CdevConfig,
    pub mapper: Mapper,
    pub reaper: Reaper,
    pub engine: Arc<dyn QueueEngine>,
    pub class: Arc<dyn DeviceClass>,
}

/// A queue device node.
pub struct Cdev {
    minor: u32,
    cdevno: DevNum,
    name: String,
    adapter: Arc<Adapter>,
    qconf: QueueConf,
    h2c_qhndl: Option<QueueHandle>,
    c2h_qhndl: Option<QueueHandle>,
    no_memcpy: bool,
    timeout_ms: u64,
    ops: Arc<dyn CdevOps>,
    destroyed: AtomicBool,
    /// Open handles, changed under the control-block lock.
    opens: AtomicUsize,
    pub(crate) inflight: AtomicUsize,
}

impl fmt::Debug for Cdev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cdev ({})", &self.name)?;
        writeln!(f, "  cdevno: {}", &self.cdevno)?;
        writeln!(f, "  h2c: {:?}", &self.h2c_qhndl)?;
        writeln!(f, "  c2h: {:?}", &self.c2h_qhndl)?;
        writeln!(f, "  no_memcpy: {:?}", &self.no_memcpy)?;
        write!(f, "  timeout_ms: {:?}", &self.timeout_ms)
    }
}

impl Cdev {
    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn cdevno(&self) -> DevNum {
        self.cdevno
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qconf(&self) -> &QueueConf {
        &self.qconf
    }

    /// Queue serving `dir`.
    pub fn queue_handle(&self, dir: Direction) -> Result<QueueHandle, Error> {
        let q = match dir {
            Direction::H2c => self.h2c_qhndl,
            Direction::C2h => self.c2h_qhndl,
        };
        q.ok_or_else(|| Error::NotSupported(format!("{} has no {:?} queue", self.name, dir)))
    }

    pub fn no_memcpy(&self) -> bool {
        self.no_memcpy
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Deadline of blocking transfers; `None` blocks until completion.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeout_ms))
        }
    }

    /// Requests referencing this node that have not finished.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> NodeState {
        if self.is_destroyed() {
            return NodeState::Destroyed;
        }
        match self.opens.load(Ordering::Acquire) {
            0 => NodeState::Registered,
            n => NodeState::Open(n),
        }
    }

    pub(crate) fn check_live(&self) -> Result<(), Error> {
        if self.is_destroyed() {
            return Err(Error::invalid_state(format!("{} destroyed", self.name)));
        }
        Ok(())
    }

    pub(crate) fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}


pub(crate) struct UserSlot {
    pub node: Arc<UserCdev>,
    pub open: usize,
}

pub(crate) struct CbState {
    pub base: Option<DevNum>,
    pub minors: MinorAllocator,
    nodes: BTreeMap<u32, Arc<Cdev>>,
    pub user: Option<UserSlot>,
}

pub(crate) struct Inner {
    pub adapter: Arc<Adapter>,
    /// Held only for minor and list updates, never across blocking work.
    pub state: Mutex<CbState>,
}

/// Per-adapter control block: minor namespace, device number range and
/// every node of one adapter.
#[derive(Clone)]
pub struct CdevCb {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for CdevCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        writeln!(f, "CdevCb ({})", &self.inner.adapter.name)?;
        writeln!(f, "  base: {:?}", &state.base)?;
        writeln!(f, "  minors: {}", state.minors.count())?;
        write!(f, "  {:?}", &self.inner.adapter.mapper)
    }
}

impl CdevCb {
    /// Control block for adapter `name`, pinning with `mlock(2)`.
    pub fn new(
        name: &str,
        engine: Arc<dyn QueueEngine>,
        class: Arc<dyn DeviceClass>,
        config: CdevConfig,
    ) -> Result<CdevCb, Error> {
        CdevCb::with_pages(name, engine, class, config, Arc::new(HostPages::new()))
    }

    pub fn with_pages(
        name: &str,
        engine: Arc<dyn QueueEngine>,
        class: Arc<dyn DeviceClass>,
        config: CdevConfig,
        pages: Arc<dyn PageProvider>,
    ) -> Result<CdevCb, Error> {
        let reaper = Reaper::spawn(name, config.drain_poll())?;
        let adapter = Adapter {
            name: name.to_string(),
            config,
            mapper: Mapper::new(pages),
            reaper,
            engine,
            class,
        };
        Ok(CdevCb {
            inner: Arc::new(Inner {
                adapter: Arc::new(adapter),
                state: Mutex::new(CbState {
                    base: None,
                    minors: MinorAllocator::new(),
                    nodes: BTreeMap::new(),
                    user: None,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.adapter.name
    }

    pub fn config(&self) -> &CdevConfig {
        &self.inner.adapter.config
    }

    pub fn mapper(&self) -> &Mapper {
        &self.inner.adapter.mapper
    }

    /// Reserves the device number range backing the whole minor space.
    /// Calling it again on an initialized block is a no-op.
    pub fn init_namespace(&self) -> Result<(), Error> {
        if self.inner.state.lock().base.is_some() {
            return Ok(());
        }
        let adapter = &self.inner.adapter;
        let base = adapter
            .class
            .reserve_number_range(&adapter.name, MINOR_MAX)
            .map_err(|e| {
                error!("{}: reserving {} minors failed: {}", adapter.name, MINOR_MAX, e);
                Error::Registration(e.to_string())
            })?;

        let mut state = self.inner.state.lock();
        if state.base.is_some() {
            drop(state);
            adapter.class.release_number_range(base, MINOR_MAX);
            return Ok(());
        }
        state.base = Some(base);
        debug!("{}: major {} reserved", adapter.name, base.major());
        Ok(())
    }

    /// Releases the device number range. Safe on a partially or never
    /// initialized block.
    pub fn cleanup_namespace(&self) {
        let (base, left) = {
            let mut state = self.inner.state.lock();
            (state.base.take(), state.nodes.len())
        };
        if left > 0 {
            warn!("{}: releasing namespace with {} nodes left", self.name(), left);
        }
        if let Some(base) = base {
            self.inner.adapter.class.release_number_range(base, MINOR_MAX);
            debug!("{}: major {} released", self.name(), base.major());
        }
    }

    /// Creates the node for one queue. `minor` picks a specific minor,
    /// `None` takes the lowest free one. On failure nothing stays
    /// allocated or registered, and `ebuf` receives a short reason.
    pub fn create(
        &self,
        qconf: &QueueConf,
        minor: Option<u32>,
        qhndl: QueueHandle,
        ebuf: Option<&mut String>,
    ) -> Result<Arc<Cdev>, Error> {
        self.create_with_ops(qconf, minor, qhndl, Arc::new(QueueOps), ebuf)
    }

    pub fn create_with_ops(
        &self,
        qconf: &QueueConf,
        minor: Option<u32>,
        qhndl: QueueHandle,
        ops: Arc<dyn CdevOps>,
        ebuf: Option<&mut String>,
    ) -> Result<Arc<Cdev>, Error> {
        let mut ebuf = ebuf;
        let adapter = &self.inner.adapter;

        let (base, minor) = {
            let mut state = self.inner.state.lock();
            let base = match state.base {
                Some(base) => base,
                None => {
                    diag(&mut ebuf, format_args!("{}: namespace not initialized", adapter.name));
                    return Err(Error::invalid_state("namespace not initialized"));
                }
            };
            let minor = match minor {
                Some(m) if m >= crate::minor::MINOR_USER => Err(Error::InvalidArgument(format!(
                    "minor {} is not a queue minor",
                    m
                ))),
                Some(m) => state.minors.reserve(m),
                None => state.minors.allocate(),
            };
            match minor {
                Ok(m) => (base, m),
                Err(e) => {
                    diag(&mut ebuf, format_args!("{}: {}", adapter.name, e));
                    return Err(e);
                }
            }
        };

        let (h2c_qhndl, c2h_qhndl) = match qconf.dir {
            QueueDir::H2c => (Some(qhndl), None),
            QueueDir::C2h => (None, Some(qhndl)),
            QueueDir::Bidi => (Some(qhndl), Some(qhndl)),
        };
        let node = Arc::new(Cdev {
            minor,
            cdevno: DevNum::new(base.major(), minor),
            name: qconf.node_name(&adapter.name),
            adapter: adapter.clone(),
            qconf: qconf.clone(),
            h2c_qhndl,
            c2h_qhndl,
            no_memcpy: qconf.no_memcpy.unwrap_or(adapter.config.no_memcpy),
            timeout_ms: qconf.timeout_ms.unwrap_or(adapter.config.timeout_ms),
            ops,
            destroyed: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
        });

        let identity = DeviceIdentity {
            devno: node.cdevno,
            name: node.name.clone(),
        };
        if let Err(e) = adapter.class.register_device(&identity) {
            error!("{}: registering {} failed: {}", adapter.name, identity.name, e);
            diag(
                &mut ebuf,
                format_args!("{}, create cdev {} failed: {}", adapter.name, identity.name, e),
            );
            self.inner.state.lock().minors.release(minor);
            return Err(Error::Registration(e.to_string()));
        }

        let mut state = self.inner.state.lock();
        if state.base != Some(base) {
            // namespace went away while registering
            state.minors.release(minor);
            drop(state);
            adapter.class.unregister_device(&identity);
            diag(&mut ebuf, format_args!("{}: namespace released", adapter.name));
            return Err(Error::invalid_state("namespace released during create"));
        }
        state.nodes.insert(minor, node.clone());
        drop(state);

        debug!("{}: created {} ({})", adapter.name, node.name, node.cdevno);
        Ok(node)
    }

    /// Unregisters and unlinks a node and frees its minor. Callers drain
    /// the node's I/O first; a second destroy fails with `InvalidState`.
    pub fn destroy(&self, node: &Cdev) -> Result<(), Error> {
        if node.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Error::invalid_state(format!("{} already destroyed", node.name)));
        }
        let inflight = node.inflight();
        if inflight > 0 {
            warn!("{}: destroying with {} requests in flight", node.name, inflight);
        }

        self.inner.adapter.class.unregister_device(&DeviceIdentity {
            devno: node.cdevno,
            name: node.name.clone(),
        });

        let mut state = self.inner.state.lock();
        let linked = match state.nodes.get(&node.minor) {
            Some(linked) => std::ptr::eq(Arc::as_ptr(linked), node),
            None => false,
        };
        if linked {
            state.nodes.remove(&node.minor);
            state.minors.release(node.minor);
        }
        drop(state);

        debug!("{}: destroyed {}", self.name(), node.name);
        Ok(())
    }

    /// Opens the queue node behind `minor`.
    pub fn open(&self, minor: u32) -> Result<CdevFile, Error> {
        let node = self
            .find(minor)
            .ok_or_else(|| Error::invalid_state(format!("no node at minor {}", minor)))?;
        node.check_live()?;
        node.ops.open(&node)?;

        let state = self.inner.state.lock();
        match state.nodes.get(&minor) {
            Some(linked) if Arc::ptr_eq(linked, &node) => {
                node.opens.fetch_add(1, Ordering::AcqRel);
            }
            _ => {
                drop(state);
                node.ops.close(&node).ok();
                return Err(Error::invalid_state(format!("{} went away", node.name)));
            }
        }
        drop(state);

        debug!("{}: opened", node.name);
        Ok(CdevFile {
            cb: self.inner.clone(),
            node,
            closed: false,
        })
    }

    pub fn find(&self, minor: u32) -> Option<Arc<Cdev>> {
        self.inner.state.lock().nodes.get(&minor).cloned()
    }

    pub fn node_state(&self, minor: u32) -> NodeState {
        match self.inner.state.lock().nodes.get(&minor) {
            Some(node) => node.state(),
            None => NodeState::Uninitialized,
        }
    }

    pub fn nodes(&self) -> Vec<Arc<Cdev>> {
        self.inner
            .state
            .lock()
            .nodes
            .values()
            .cloned()
            .collect()
    }

    /// Minors in use, control node included.
    pub fn minors(&self) -> Vec<u32> {
        self.inner.state.lock().minors.iter().collect()
    }

    pub fn minor_count(&self) -> u32 {
        self.inner.state.lock().minors.count()
    }

    /// Waits until no asynchronous or draining request is left.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.adapter.reaper.wait_idle(timeout)
    }

    /// Asynchronous and draining requests not yet finished.
    pub fn outstanding(&self) -> usize {
        self.inner.adapter.reaper.outstanding()
    }

    /// Tears down every node, then the number range.
    pub fn detach(&self) {
        for node in self.nodes() {
            self.destroy(&node).ok();
        }
        let user = self.inner.state.lock().user.as_ref().map(|u| u.node.clone());
        if let Some(user) = user {
            self.destroy_user(&user).ok();
        }
        self.cleanup_namespace();
    }
}

/// An open queue node. Closes on drop.
pub struct CdevFile {
    cb: Arc<Inner>,
    node: Arc<Cdev>,
    closed: bool,
}

impl fmt::Debug for CdevFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CdevFile ({})", self.node.name)
    }
}

impl CdevFile {
    pub fn node(&self) -> &Arc<Cdev> {
        &self.node
    }

    /// Reads up to `buf.len()` bytes from the card.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.node.ops.rw(&self.node, IoBuf::Read(buf))
    }

    /// Writes `buf` to the card.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.node.ops.rw(&self.node, IoBuf::Write(buf))
    }

    pub fn aio_read(&self, reqs: Vec<AioRequest>) -> Result<usize, Error> {
        self.node.ops.aio_rw(&self.node, Direction::C2h, reqs)
    }

    pub fn aio_write(&self, reqs: Vec<AioRequest>) -> Result<usize, Error> {
        self.node.ops.aio_rw(&self.node, Direction::H2c, reqs)
    }

    pub fn ioctl(&self, cmd: u32, arg: u64) -> Result<i64, Error> {
        self.node.check_live()?;
        self.node.ops.ioctl(&self.node, cmd, arg)
    }

    /// Closes explicitly, reporting the close hook's result.
    pub fn close(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let res = self.node.ops.close(&self.node);

        // every handle counted itself once in open
        let state = self.cb.state.lock();
        self.node.opens.fetch_sub(1, Ordering::AcqRel);
        drop(state);

        debug!("{}: closed", self.node.name);
        res
    }
}

impl Drop for CdevFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}: close failed: {}", self.node.name, e);
        }
    }
}
