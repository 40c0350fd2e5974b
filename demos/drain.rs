use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use qdma_cdev::CdevCb;
use qdma_cdev::CdevConfig;
use qdma_cdev::DevRegistry;
use qdma_cdev::Error;
use qdma_cdev::LoopbackEngine;
use qdma_cdev::QueueConf;
use qdma_cdev::QueueHandle;

fn main() -> Result<()> {
    let engine = Arc::new(LoopbackEngine::new()?);
    let config = CdevConfig::default().timeout_ms(100).no_memcpy(false);
    let cb = CdevCb::new("qdma01000", engine.clone(), Arc::new(DevRegistry::new()), config)?;
    cb.init_namespace()?;

    let node = cb.create(&QueueConf::mm(0), None, QueueHandle(0), None)?;
    let file = cb.open(node.minor())?;

    // hold the engine so the write cannot finish in time
    engine.pause();
    match file.write(&[0x55; 8192]) {
        Err(Error::Timeout(ms)) => println!("timed out after {} ms", ms),
        other => anyhow::bail!("expected a timeout, got {:?}", other),
    }
    println!("outstanding: {}", cb.outstanding());
    println!("{:?}", cb.mapper());

    engine.resume();
    if !cb.wait_idle(Duration::from_secs(1)) {
        anyhow::bail!("request did not drain");
    }
    println!("drained, outstanding: {}", cb.outstanding());
    println!("{:?}", cb.mapper());

    file.close()?;
    cb.destroy(&node)?;
    cb.cleanup_namespace();

    Ok(())
}
