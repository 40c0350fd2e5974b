use std::io;
use std::num::ParseIntError;

use thiserror::Error;

/// Errors returned by device node creation and I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No free minor left in the adapter's namespace.
    #[error("no free minor number")]
    ExhaustedIdentity,
    /// The requested minor is already allocated.
    #[error("minor {0} already in use")]
    MinorInUse(u32),
    /// Pinning or staging failed at `page` of `pages`. Everything acquired
    /// before the failing page has been released.
    #[error("mapping failed at page {page} of {pages}: {reason}")]
    Mapping {
        page: usize,
        pages: usize,
        reason: String,
    },
    /// The device-class collaborator rejected the device.
    #[error("registration failed: {0}")]
    Registration(String),
    /// A blocking transfer ran past its deadline.
    #[error("timed out after {0} ms")]
    Timeout(u64),
    /// The queue engine reported a failed transfer.
    #[error("queue engine failure ({code})")]
    Engine { code: i32 },
    /// The engine aborted the transfer after a cancel.
    #[error("request cancelled")]
    Cancelled,
    /// Operation on a destroyed or not yet initialized object.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An earlier element of the same async vector was rejected.
    #[error("request not submitted")]
    NotSubmitted,
}

impl Error {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Error {
        Error::InvalidState(msg.into())
    }

    /// Negative errno, as a character device returns it.
    pub fn errno(&self) -> i32 {
        -match self {
            Error::ExhaustedIdentity => libc::ENOSPC,
            Error::MinorInUse(_) => libc::EBUSY,
            Error::Mapping { .. } => libc::ENOMEM,
            Error::Registration(_) => libc::ENODEV,
            Error::Timeout(_) => libc::ETIMEDOUT,
            Error::Engine { .. } => libc::EIO,
            Error::Cancelled => libc::ECANCELED,
            Error::InvalidState(_) => libc::ENODEV,
            Error::NotSupported(_) => libc::ENOTTY,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::NotSubmitted => libc::EAGAIN,
        }
    }

    /// Resource acquisition errors are unwound locally and leave nothing
    /// half built behind.
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            Error::ExhaustedIdentity
                | Error::MinorInUse(_)
                | Error::Mapping { .. }
                | Error::Registration(_)
        )
    }
}

/// Writes a short failure description into an optional diagnostic buffer.
pub(crate) fn diag(ebuf: &mut Option<&mut String>, msg: std::fmt::Arguments<'_>) {
    if let Some(buf) = ebuf.as_deref_mut() {
        buf.clear();
        std::fmt::Write::write_fmt(buf, msg).ok();
    }
}

/// Errors from loading a [`CdevConfig`](crate::CdevConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad integer: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("bad value for {attr}: {value}")]
    Value { attr: &'static str, value: String },
}
