use anyhow::Result;
use std::sync::Arc;

use qdma_cdev::CdevCb;
use qdma_cdev::CdevConfig;
use qdma_cdev::DevRegistry;
use qdma_cdev::LoopbackEngine;
use qdma_cdev::QueueConf;
use qdma_cdev::QueueDir;
use qdma_cdev::QueueHandle;

fn main() -> Result<()> {
    let engine = Arc::new(LoopbackEngine::new()?);
    let class = Arc::new(DevRegistry::new());
    let cb = CdevCb::new("qdma01000", engine.clone(), class.clone(), CdevConfig::default())?;
    cb.init_namespace()?;

    let node = cb.create(&QueueConf::st(0, QueueDir::Bidi), None, QueueHandle(0), None)?;
    println!("{:?}", node);
    println!("devices: {:?}", class.devices());

    let file = cb.open(node.minor())?;

    // do not fill a whole page
    let items = 1000;
    let h2d: Vec<u32> = (0..items).map(|_| fastrand::u32(0..1024)).collect();
    let bytes: Vec<u8> = h2d.iter().flat_map(|v| v.to_ne_bytes()).collect();

    let n = file.write(&bytes)?;
    println!("wrote {} bytes", n);

    let mut back = vec![0u8; bytes.len()];
    let n = file.read(&mut back)?;
    println!("read {} bytes", n);

    for (i, chunk) in back.chunks_exact(4).enumerate() {
        let v = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        assert_eq!(v, h2d[i]);
    }

    file.close()?;
    cb.detach();
    println!("{:?}", cb);

    Ok(())
}
