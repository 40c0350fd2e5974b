use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Whether asynchronous requests may fall back to a staging copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioPolicy {
    /// Use the node's copy mode, exactly like synchronous I/O.
    FollowDevice,
    /// Always pin; fail instead of staging.
    ZeroCopyOnly,
}

/// Per-adapter settings for device nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdevConfig {
    /// Deadline for blocking transfers. Zero waits without a deadline.
    pub timeout_ms: u64,
    /// Attempt zero-copy pinning of user pages.
    pub no_memcpy: bool,
    pub aio_policy: AioPolicy,
    /// How often the reaper polls requests that are being drained.
    pub drain_poll_ms: u64,
}

impl Default for CdevConfig {
    fn default() -> CdevConfig {
        CdevConfig {
            timeout_ms: 10_000,
            no_memcpy: true,
            aio_policy: AioPolicy::FollowDevice,
            drain_poll_ms: 10,
        }
    }
}

impl CdevConfig {
    /// Loads settings from a directory holding one value per file, the way
    /// module parameters are exposed. Missing files keep their defaults.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<CdevConfig, ConfigError> {
        let dir = dir.as_ref();
        let mut config = CdevConfig::default();

        if let Some(v) = read_attr(dir, "timeout_ms")? {
            config.timeout_ms = parse_u64(&v)?;
        }
        if let Some(v) = read_attr(dir, "no_memcpy")? {
            config.no_memcpy = parse_u64(&v)? != 0;
        }
        if let Some(v) = read_attr(dir, "aio_policy")? {
            config.aio_policy = match v.as_str() {
                "follow" | "0" => AioPolicy::FollowDevice,
                "zerocopy" | "1" => AioPolicy::ZeroCopyOnly,
                _ => {
                    return Err(ConfigError::Value {
                        attr: "aio_policy",
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = read_attr(dir, "drain_poll_ms")? {
            let ms = parse_u64(&v)?;
            if ms == 0 {
                return Err(ConfigError::Value {
                    attr: "drain_poll_ms",
                    value: v,
                });
            }
            config.drain_poll_ms = ms;
        }

        Ok(config)
    }

    pub fn timeout_ms(mut self, ms: u64) -> CdevConfig {
        self.timeout_ms = ms;
        self
    }

    pub fn no_memcpy(mut self, no_memcpy: bool) -> CdevConfig {
        self.no_memcpy = no_memcpy;
        self
    }

    pub fn aio_policy(mut self, policy: AioPolicy) -> CdevConfig {
        self.aio_policy = policy;
        self
    }

    pub fn drain_poll_ms(mut self, ms: u64) -> CdevConfig {
        self.drain_poll_ms = ms.max(1);
        self
    }

    pub(crate) fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }
}

/// Queue transfer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Memory mapped.
    Mm,
    /// Streaming.
    St,
}

/// Which directions a queue handle serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDir {
    H2c,
    C2h,
    Bidi,
}

/// Configuration of one hardware queue, as handed to node creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConf {
    pub qidx: u32,
    pub mode: QueueMode,
    pub dir: QueueDir,
    /// Overrides [`CdevConfig::timeout_ms`].
    pub timeout_ms: Option<u64>,
    /// Overrides [`CdevConfig::no_memcpy`].
    pub no_memcpy: Option<bool>,
}

impl QueueConf {
    pub fn mm(qidx: u32) -> QueueConf {
        QueueConf {
            qidx,
            mode: QueueMode::Mm,
            dir: QueueDir::Bidi,
            timeout_ms: None,
            no_memcpy: None,
        }
    }

    pub fn st(qidx: u32, dir: QueueDir) -> QueueConf {
        QueueConf {
            qidx,
            mode: QueueMode::St,
            dir,
            timeout_ms: None,
            no_memcpy: None,
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> QueueConf {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_no_memcpy(mut self, no_memcpy: bool) -> QueueConf {
        self.no_memcpy = Some(no_memcpy);
        self
    }

    pub(crate) fn node_name(&self, adapter: &str) -> String {
        let mode = match self.mode {
            QueueMode::Mm => "MM",
            QueueMode::St => "ST",
        };
        match (self.mode, self.dir) {
            (QueueMode::St, QueueDir::C2h) => format!("{}-{}-{}-c2h", adapter, mode, self.qidx),
            (QueueMode::St, QueueDir::H2c) => format!("{}-{}-{}-h2c", adapter, mode, self.qidx),
            _ => format!("{}-{}-{}", adapter, mode, self.qidx),
        }
    }
}

fn read_attr(dir: &Path, name: &str) -> Result<Option<String>, ConfigError> {
    match fs::read_to_string(dir.join(name)) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_u64(v: &str) -> Result<u64, ConfigError> {
    let v = v.trim();
    if let Some(hex) = v.strip_prefix("0x") {
        Ok(u64::from_str_radix(hex, 16)?)
    } else {
        Ok(v.parse::<u64>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "qdma-cdev-{}-{}-{}",
            tag,
            std::process::id(),
            fastrand::u32(..)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_dir_keeps_defaults() {
        let dir = scratch_dir("empty");
        let config = CdevConfig::from_dir(&dir).unwrap();
        assert_eq!(config, CdevConfig::default());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn attributes_override_defaults() {
        let dir = scratch_dir("attrs");
        fs::write(dir.join("timeout_ms"), "0x64\n").unwrap();
        fs::write(dir.join("no_memcpy"), "0\n").unwrap();
        fs::write(dir.join("aio_policy"), "zerocopy\n").unwrap();
        fs::write(dir.join("drain_poll_ms"), "2").unwrap();

        let config = CdevConfig::from_dir(&dir).unwrap();
        assert_eq!(config.timeout_ms, 100);
        assert!(!config.no_memcpy);
        assert_eq!(config.aio_policy, AioPolicy::ZeroCopyOnly);
        assert_eq!(config.drain_poll_ms, 2);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn bad_values_are_rejected() {
        let dir = scratch_dir("bad");
        fs::write(dir.join("aio_policy"), "sometimes").unwrap();
        assert!(matches!(
            CdevConfig::from_dir(&dir),
            Err(ConfigError::Value { attr: "aio_policy", .. })
        ));
        fs::write(dir.join("aio_policy"), "follow").unwrap();
        fs::write(dir.join("timeout_ms"), "soon").unwrap();
        assert!(matches!(
            CdevConfig::from_dir(&dir),
            Err(ConfigError::ParseInt(_))
        ));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn node_names() {
        assert_eq!(QueueConf::mm(3).node_name("qdma01000"), "qdma01000-MM-3");
        assert_eq!(
            QueueConf::st(4, QueueDir::C2h).node_name("qdma01000"),
            "qdma01000-ST-4-c2h"
        );
        assert_eq!(
            QueueConf::st(4, QueueDir::Bidi).node_name("qdma01000"),
            "qdma01000-ST-4"
        );
    }
}
