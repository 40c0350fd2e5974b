use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use qdma_cdev::{
    Cdev, CdevCb, CdevConfig, CdevOps, DevRegistry, Error, HostPages, LoopbackEngine, MemBar,
    NodeState, NoUserOps, QueueConf, QueueDir, QueueHandle, MINOR_USER,
};

mod common;
use common::{adapter, Aligned, FlakyClass};

fn loopback_adapter(name: &str, class: Arc<FlakyClass>) -> CdevCb {
    adapter(
        name,
        Arc::new(LoopbackEngine::new().unwrap()),
        class,
        CdevConfig::default(),
        Arc::new(HostPages::new()),
    )
}

#[test]
fn create_write_destroy_on_minor_7() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma01000", class.clone());

    let node = cb
        .create(&QueueConf::mm(0), Some(7), QueueHandle(0), None)
        .unwrap();
    assert_eq!(node.minor(), 7);
    assert_eq!(node.name(), "qdma01000-MM-0");
    assert!(class.inner.is_registered("qdma01000-MM-0"));

    assert_eq!(node.state(), NodeState::Registered);
    let file = cb.open(7).unwrap();
    assert_eq!(cb.node_state(7), NodeState::Open(1));
    assert_eq!(node.state(), NodeState::Open(1));
    let mut buf = Aligned::new(4096);
    buf.as_mut_slice().copy_from_slice(&common::random_bytes(4096));
    assert_eq!(file.write(buf.as_slice()), Ok(4096));
    file.close().unwrap();
    assert_eq!(cb.node_state(7), NodeState::Registered);

    cb.destroy(&node).unwrap();
    assert_eq!(node.state(), NodeState::Destroyed);
    assert_eq!(cb.node_state(7), NodeState::Uninitialized);
    assert!(cb.minors().is_empty());
    assert_eq!(class.registered.load(Ordering::SeqCst), 0);
    assert!(class.inner.devices().is_empty());
    assert_eq!(cb.mapper().outstanding_pages(), 0);
}

#[test]
fn concurrent_creates_get_distinct_minors() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma02000", class);

    let handles: Vec<_> = (0..2u32)
        .map(|q| {
            let cb = cb.clone();
            thread::spawn(move || {
                cb.create(&QueueConf::mm(q), None, QueueHandle(q as u64), None)
                    .unwrap()
                    .minor()
            })
        })
        .collect();
    let minors: BTreeSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(minors.len(), 2);
    assert_eq!(cb.minors().into_iter().collect::<BTreeSet<_>>(), minors);
}

#[test]
fn many_concurrent_creates() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma03000", class);

    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let cb = cb.clone();
            thread::spawn(move || {
                let mut nodes = Vec::new();
                for i in 0..16 {
                    let q = t * 16 + i;
                    nodes.push(
                        cb.create(&QueueConf::mm(q), None, QueueHandle(q as u64), None)
                            .unwrap(),
                    );
                }
                for node in nodes.iter().step_by(2) {
                    cb.destroy(node).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let minors = cb.minors();
    assert_eq!(minors.len(), 64);
    assert!(minors.iter().all(|m| *m < MINOR_USER));
    assert_eq!(cb.nodes().len(), 64);
}

#[test]
fn failed_registration_leaks_nothing() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma04000", class.clone());

    class.fail.store(true, Ordering::SeqCst);
    let mut ebuf = String::new();
    let err = cb
        .create(&QueueConf::mm(1), Some(3), QueueHandle(1), Some(&mut ebuf))
        .unwrap_err();
    assert!(matches!(err, Error::Registration(_)));
    assert!(err.is_acquisition());
    assert!(ebuf.contains("qdma04000-MM-1"), "{}", ebuf);
    assert!(cb.minors().is_empty());
    assert!(cb.nodes().is_empty());
    assert_eq!(cb.node_state(3), NodeState::Uninitialized);

    class.fail.store(false, Ordering::SeqCst);
    let node = cb
        .create(&QueueConf::mm(1), Some(3), QueueHandle(1), None)
        .unwrap();
    assert_eq!(node.minor(), 3);
}

#[test]
fn minor_conflicts() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma05000", class);

    cb.create(&QueueConf::mm(0), Some(5), QueueHandle(0), None)
        .unwrap();
    assert_eq!(
        cb.create(&QueueConf::mm(1), Some(5), QueueHandle(1), None)
            .unwrap_err(),
        Error::MinorInUse(5)
    );
    assert!(matches!(
        cb.create(&QueueConf::mm(2), Some(MINOR_USER), QueueHandle(2), None),
        Err(Error::InvalidArgument(_))
    ));
    // the lowest free minor skips the fixed one
    let a = cb
        .create(&QueueConf::mm(3), None, QueueHandle(3), None)
        .unwrap();
    assert_eq!(a.minor(), 0);
    assert_eq!(cb.minor_count(), 2);
}

#[test]
fn destroy_is_once_only() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma06000", class);
    let node = cb
        .create(&QueueConf::st(0, QueueDir::H2c), None, QueueHandle(0), None)
        .unwrap();
    assert_eq!(node.name(), "qdma06000-ST-0-h2c");

    cb.destroy(&node).unwrap();
    assert!(matches!(cb.destroy(&node), Err(Error::InvalidState(_))));
    assert!(node.is_destroyed());
    assert!(matches!(node_io(&node), Err(Error::InvalidState(_))));
    assert!(cb.open(node.minor()).is_err());
}

#[test]
fn reused_minor_leaves_old_node_destroyed() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma0d000", class);
    assert_eq!(cb.node_state(42), NodeState::Uninitialized);

    let old = cb.create(&QueueConf::mm(0), Some(5), QueueHandle(0), None).unwrap();
    let file = cb.open(5).unwrap();
    cb.destroy(&old).unwrap();
    assert_eq!(old.state(), NodeState::Destroyed);
    assert_eq!(cb.node_state(5), NodeState::Uninitialized);

    let new = cb.create(&QueueConf::mm(0), Some(5), QueueHandle(0), None).unwrap();
    assert_eq!(cb.node_state(5), NodeState::Registered);
    assert_eq!(new.state(), NodeState::Registered);
    // closing the stale handle leaves both nodes where they are
    drop(file);
    assert_eq!(old.state(), NodeState::Destroyed);
    assert_eq!(new.state(), NodeState::Registered);
}

fn node_io(node: &Arc<Cdev>) -> Result<usize, Error> {
    qdma_cdev::QueueOps.rw(node, qdma_cdev::IoBuf::Write(&[0u8; 8]))
}

#[test]
fn create_needs_namespace() {
    let cb = CdevCb::new(
        "qdma07000",
        Arc::new(LoopbackEngine::new().unwrap()),
        Arc::new(DevRegistry::new()),
        CdevConfig::default(),
    )
    .unwrap();
    // cleanup on a never initialized block is harmless
    cb.cleanup_namespace();

    let mut ebuf = String::new();
    assert!(matches!(
        cb.create(&QueueConf::mm(0), None, QueueHandle(0), Some(&mut ebuf)),
        Err(Error::InvalidState(_))
    ));
    assert!(!ebuf.is_empty());

    cb.init_namespace().unwrap();
    cb.init_namespace().unwrap();
    cb.create(&QueueConf::mm(0), None, QueueHandle(0), None)
        .unwrap();
}

#[test]
fn detach_tears_everything_down() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma08000", class.clone());
    for q in 0..4 {
        cb.create(&QueueConf::mm(q), None, QueueHandle(q as u64), None)
            .unwrap();
    }
    cb.create_user(0, Arc::new(MemBar::new(0x1000)), Arc::new(NoUserOps), None)
        .unwrap();
    assert_eq!(cb.minor_count(), 5);
    assert_eq!(class.inner.majors().len(), 1);

    cb.detach();
    assert_eq!(cb.minor_count(), 0);
    assert!(cb.nodes().is_empty());
    assert!(cb.user().is_none());
    assert!(class.inner.devices().is_empty());
    assert!(class.inner.majors().is_empty());
}

#[test]
fn adapters_do_not_share_minors() {
    let class = Arc::new(FlakyClass::default());
    let a = loopback_adapter("qdma09000", class.clone());
    let b = loopback_adapter("qdma0a000", class.clone());

    let na = a.create(&QueueConf::mm(0), None, QueueHandle(0), None).unwrap();
    let nb = b.create(&QueueConf::mm(0), None, QueueHandle(0), None).unwrap();
    assert_eq!(na.minor(), nb.minor());
    assert_ne!(na.cdevno().major(), nb.cdevno().major());
    assert_eq!(class.inner.majors().len(), 2);
}

#[test]
fn open_counts() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma0b000", class);
    let node = cb.create(&QueueConf::mm(0), None, QueueHandle(0), None).unwrap();

    let f1 = cb.open(node.minor()).unwrap();
    let f2 = cb.open(node.minor()).unwrap();
    assert_eq!(cb.node_state(node.minor()), NodeState::Open(2));
    drop(f1);
    assert_eq!(cb.node_state(node.minor()), NodeState::Open(1));
    f2.close().unwrap();
    assert_eq!(cb.node_state(node.minor()), NodeState::Registered);
    // opening never touches the minor space
    assert_eq!(cb.minor_count(), 1);
}

struct Counter;

impl CdevOps for Counter {
    fn ioctl(&self, cdev: &Cdev, cmd: u32, arg: u64) -> Result<i64, Error> {
        match cmd {
            1 => Ok(cdev.minor() as i64 + arg as i64),
            _ => Err(Error::NotSupported(format!("ioctl {:#x}", cmd))),
        }
    }
}

#[test]
fn ioctl_goes_to_bound_ops() {
    let class = Arc::new(FlakyClass::default());
    let cb = loopback_adapter("qdma0c000", class);
    let node = cb
        .create_with_ops(&QueueConf::mm(0), Some(9), QueueHandle(0), Arc::new(Counter), None)
        .unwrap();
    let file = cb.open(node.minor()).unwrap();
    assert_eq!(file.ioctl(1, 10), Ok(19));
    assert!(matches!(file.ioctl(2, 0), Err(Error::NotSupported(_))));

    let plain = cb.create(&QueueConf::mm(1), None, QueueHandle(1), None).unwrap();
    let file = cb.open(plain.minor()).unwrap();
    assert_eq!(file.ioctl(1, 0).unwrap_err().errno(), -libc::ENOTTY);
}
