//! Character-device layer of a QDMA queue driver: per-queue device nodes,
//! their minor namespace, and the read/write/aio paths that map user
//! buffers into scatter-gather lists and hand them to a queue engine.

mod error;
pub use error::{ConfigError, Error};

mod config;
pub use config::{AioPolicy, CdevConfig, QueueConf, QueueDir, QueueMode};

mod minor;
pub use minor::{MinorAllocator, MINOR_MAX, MINOR_USER};

mod sgl;
pub use sgl::{SgEntry, SgList};

mod mapper;
pub use mapper::{
    page_size, pages_spanned, HostPages, Mapper, Mapping, PageProvider, PinError, StagingPage,
};

mod engine;
pub use engine::{
    Completion, Direction, Notifier, QueueEngine, QueueHandle, Status, Token, WaitStatus,
};

mod host;
pub use host::{DevNum, DevRegistry, DeviceClass, DeviceIdentity};

mod reaper;

mod request;
pub use request::{AioDone, AioRequest, AioResult, IoBuf};

mod cdev;
pub use cdev::{Cdev, CdevCb, CdevFile, CdevOps, NodeState, QueueOps};

mod user_cdev;
pub use user_cdev::{BarIo, NoUserOps, UserCdev, UserFile, UserOps};

mod loopback;
pub use loopback::{Fault, LoopbackEngine, MemBar};

#[cfg(feature = "async")]
mod aio_async;

mod barrier;
pub use barrier::dmb;
