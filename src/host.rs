//! Host device-class facility that makes nodes visible to user space.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;

use parking_lot::Mutex;

const MINORBITS: u32 = 20;
const MINORMASK: u32 = (1 << MINORBITS) - 1;

/// Device number, major:minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevNum {
    major: u32,
    minor: u32,
}

impl DevNum {
    pub fn new(major: u32, minor: u32) -> DevNum {
        DevNum {
            major,
            minor: minor & MINORMASK,
        }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Kernel-internal `dev_t` encoding.
    pub fn raw(&self) -> u32 {
        (self.major << MINORBITS) | self.minor
    }
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// What gets registered for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub devno: DevNum,
    pub name: String,
}

/// Device-class collaborator.
pub trait DeviceClass: Send + Sync {
    /// Reserves `count` minors under a fresh major; returns minor 0.
    fn reserve_number_range(&self, name: &str, count: u32) -> io::Result<DevNum>;

    fn release_number_range(&self, base: DevNum, count: u32);

    /// Makes the device node visible.
    fn register_device(&self, identity: &DeviceIdentity) -> io::Result<()>;

    fn unregister_device(&self, identity: &DeviceIdentity);
}

#[derive(Debug, Default)]
struct RegistryState {
    majors: BTreeMap<u32, (String, u32)>,
    devices: BTreeMap<DevNum, String>,
}

/// In-process device class. Majors are handed out downwards from 511 like
/// dynamic character device majors.
#[derive(Debug, Default)]
pub struct DevRegistry {
    state: Mutex<RegistryState>,
}

const DYNAMIC_MAJOR_TOP: u32 = 511;
const DYNAMIC_MAJOR_BOTTOM: u32 = 234;

impl DevRegistry {
    pub fn new() -> DevRegistry {
        DevRegistry::default()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state.lock().devices.values().any(|n| n == name)
    }

    /// Registered device names, ordered by device number.
    pub fn devices(&self) -> Vec<String> {
        self.state.lock().devices.values().cloned().collect()
    }

    pub fn majors(&self) -> BTreeSet<u32> {
        self.state.lock().majors.keys().copied().collect()
    }
}

impl DeviceClass for DevRegistry {
    fn reserve_number_range(&self, name: &str, count: u32) -> io::Result<DevNum> {
        if count == 0 || count > MINORMASK {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut state = self.state.lock();
        let major = (DYNAMIC_MAJOR_BOTTOM..=DYNAMIC_MAJOR_TOP)
            .rev()
            .find(|m| !state.majors.contains_key(m))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBUSY))?;
        state.majors.insert(major, (name.to_string(), count));
        Ok(DevNum::new(major, 0))
    }

    fn release_number_range(&self, base: DevNum, count: u32) {
        let mut state = self.state.lock();
        if let Some((_, n)) = state.majors.get(&base.major()) {
            if *n == count {
                state.majors.remove(&base.major());
            }
        }
    }

    fn register_device(&self, identity: &DeviceIdentity) -> io::Result<()> {
        let mut state = self.state.lock();
        let major = identity.devno.major();
        match state.majors.get(&major) {
            Some((_, count)) if identity.devno.minor() < *count => {}
            _ => return Err(io::Error::from_raw_os_error(libc::ENXIO)),
        }
        if state.devices.contains_key(&identity.devno)
            || state.devices.values().any(|n| *n == identity.name)
        {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        state.devices.insert(identity.devno, identity.name.clone());
        Ok(())
    }

    fn unregister_device(&self, identity: &DeviceIdentity) {
        self.state.lock().devices.remove(&identity.devno);
    }
}
