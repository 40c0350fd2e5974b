//! Generic control node of an adapter: reserved minor, no queue, direct
//! access to the user BAR.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::cdev::{CdevCb, Inner, NodeState, UserSlot};
use crate::host::{DevNum, DeviceIdentity};
use crate::minor::MINOR_USER;
use crate::Error;

/// Register access to one PCIe BAR.
pub trait BarIo: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
    /// BAR length in bytes.
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Control-node ioctl hook.
pub trait UserOps: Send + Sync {
    fn ioctl(&self, _cdev: &UserCdev, cmd: u32, _arg: u64) -> Result<i64, Error> {
        Err(Error::NotSupported(format!("ioctl {:#x}", cmd)))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoUserOps;

impl UserOps for NoUserOps {}

/// The generic control node.
pub struct UserCdev {
    cdevno: DevNum,
    name: String,
    bar: u8,
    io: Arc<dyn BarIo>,
    ops: Arc<dyn UserOps>,
    /// Serializes BAR accesses from different opens.
    lock: Mutex<()>,
    destroyed: AtomicBool,
}

impl fmt::Debug for UserCdev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UserCdev ({})", &self.name)?;
        writeln!(f, "  cdevno: {}", &self.cdevno)?;
        write!(f, "  bar: {}", &self.bar)
    }
}

impl UserCdev {
    pub fn minor(&self) -> u32 {
        MINOR_USER
    }

    pub fn cdevno(&self) -> DevNum {
        self.cdevno
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bar(&self) -> u8 {
        self.bar
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn check_access(&self, offset: u64, len: usize) -> Result<(), Error> {
        if self.is_destroyed() {
            return Err(Error::invalid_state(format!("{} destroyed", self.name)));
        }
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.io.len() => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "{:#x}+{:#x} outside BAR {} ({:#x})",
                offset,
                len,
                self.bar,
                self.io.len()
            ))),
        }
    }
}

impl CdevCb {
    /// Creates the control node on the reserved minor.
    pub fn create_user(
        &self,
        bar: u8,
        io: Arc<dyn BarIo>,
        ops: Arc<dyn UserOps>,
        ebuf: Option<&mut String>,
    ) -> Result<Arc<UserCdev>, Error> {
        let mut ebuf = ebuf;
        let adapter = &self.inner.adapter;

        let base = {
            let mut state = self.inner.state.lock();
            let base = match state.base {
                Some(base) => base,
                None => {
                    crate::error::diag(
                        &mut ebuf,
                        format_args!("{}: namespace not initialized", adapter.name),
                    );
                    return Err(Error::invalid_state("namespace not initialized"));
                }
            };
            if let Err(e) = state.minors.reserve(MINOR_USER) {
                crate::error::diag(&mut ebuf, format_args!("{}: {}", adapter.name, e));
                return Err(e);
            }
            base
        };

        let node = Arc::new(UserCdev {
            cdevno: DevNum::new(base.major(), MINOR_USER),
            name: format!("{}-user", adapter.name),
            bar,
            io,
            ops,
            lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
        });
        let identity = DeviceIdentity {
            devno: node.cdevno,
            name: node.name.clone(),
        };
        if let Err(e) = adapter.class.register_device(&identity) {
            error!("{}: registering {} failed: {}", adapter.name, node.name, e);
            crate::error::diag(
                &mut ebuf,
                format_args!("{}, create user cdev failed: {}", adapter.name, e),
            );
            self.inner.state.lock().minors.release(MINOR_USER);
            return Err(Error::Registration(e.to_string()));
        }

        let mut state = self.inner.state.lock();
        if state.base != Some(base) {
            state.minors.release(MINOR_USER);
            drop(state);
            adapter.class.unregister_device(&identity);
            return Err(Error::invalid_state("namespace released during create"));
        }
        state.user = Some(UserSlot {
            node: node.clone(),
            open: 0,
        });
        drop(state);

        debug!("{}: created {} (bar {})", adapter.name, node.name, bar);
        Ok(node)
    }

    pub fn destroy_user(&self, node: &UserCdev) -> Result<(), Error> {
        if node.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Error::invalid_state(format!("{} already destroyed", node.name)));
        }
        self.inner.adapter.class.unregister_device(&DeviceIdentity {
            devno: node.cdevno,
            name: node.name.clone(),
        });

        let mut state = self.inner.state.lock();
        let linked = match &state.user {
            Some(slot) => std::ptr::eq(Arc::as_ptr(&slot.node), node),
            None => false,
        };
        if linked {
            state.user = None;
            state.minors.release(MINOR_USER);
        }
        drop(state);

        debug!("{}: destroyed {}", self.name(), node.name);
        Ok(())
    }

    pub fn open_user(&self) -> Result<UserFile, Error> {
        let mut state = self.inner.state.lock();
        let slot = state
            .user
            .as_mut()
            .ok_or_else(|| Error::invalid_state("no control node"))?;
        if slot.node.is_destroyed() {
            return Err(Error::invalid_state("control node destroyed"));
        }
        slot.open += 1;
        let node = slot.node.clone();
        drop(state);

        Ok(UserFile {
            cb: self.inner.clone(),
            node,
            closed: false,
        })
    }

    pub fn user_state(&self) -> NodeState {
        match &self.inner.state.lock().user {
            Some(slot) if slot.open > 0 => NodeState::Open(slot.open),
            Some(_) => NodeState::Registered,
            None => NodeState::Uninitialized,
        }
    }

    pub fn user(&self) -> Option<Arc<UserCdev>> {
        self.inner.state.lock().user.as_ref().map(|s| s.node.clone())
    }
}

/// An open control node. Closes on drop.
pub struct UserFile {
    cb: Arc<Inner>,
    node: Arc<UserCdev>,
    closed: bool,
}

impl fmt::Debug for UserFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserFile ({})", self.node.name)
    }
}

impl UserFile {
    pub fn node(&self) -> &Arc<UserCdev> {
        &self.node
    }

    /// Reads BAR registers starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        self.node.check_access(offset, buf.len())?;
        let _guard = self.node.lock.lock();
        self.node.io.read(offset, buf).map_err(|e| Error::Engine {
            code: e.raw_os_error().unwrap_or(libc::EIO),
        })?;
        Ok(buf.len())
    }

    /// Writes BAR registers starting at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, Error> {
        self.node.check_access(offset, buf.len())?;
        let _guard = self.node.lock.lock();
        self.node.io.write(offset, buf).map_err(|e| Error::Engine {
            code: e.raw_os_error().unwrap_or(libc::EIO),
        })?;
        Ok(buf.len())
    }

    pub fn ioctl(&self, cmd: u32, arg: u64) -> Result<i64, Error> {
        if self.node.is_destroyed() {
            return Err(Error::invalid_state(format!("{} destroyed", self.node.name)));
        }
        self.node.ops.ioctl(&self.node, cmd, arg)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.cb.state.lock();
        match state.user.as_mut() {
            Some(slot) if Arc::ptr_eq(&slot.node, &self.node) && slot.open > 0 => slot.open -= 1,
            _ => warn!("{}: closed after destroy", self.node.name),
        }
    }
}

impl Drop for UserFile {
    fn drop(&mut self) {
        self.release();
    }
}
