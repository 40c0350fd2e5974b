use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use qdma_cdev::AioRequest;
use qdma_cdev::CdevCb;
use qdma_cdev::CdevConfig;
use qdma_cdev::DevRegistry;
use qdma_cdev::LoopbackEngine;
use qdma_cdev::QueueConf;
use qdma_cdev::QueueDir;
use qdma_cdev::QueueHandle;

fn main() -> Result<()> {
    let engine = Arc::new(LoopbackEngine::new()?);
    let cb = CdevCb::new(
        "qdma01000",
        engine,
        Arc::new(DevRegistry::new()),
        CdevConfig::default(),
    )?;
    cb.init_namespace()?;

    let node = cb.create(&QueueConf::st(1, QueueDir::Bidi), None, QueueHandle(1), None)?;
    let file = cb.open(node.minor())?;

    // vectorized submit, completions arrive on the reaper thread
    let (tx, rx) = crossbeam_channel::unbounded();
    let reqs: Vec<AioRequest> = (0..4)
        .map(|i| {
            let tx = tx.clone();
            let buf = vec![i as u8; 4096 * (i + 1)];
            AioRequest::new(buf, move |r| {
                tx.send((i, r.res)).ok();
            })
        })
        .collect();
    let accepted = file.aio_write(reqs)?;
    println!("{} writes accepted", accepted);
    for _ in 0..accepted {
        let (i, res) = rx.recv()?;
        println!("write {} done: {:?}", i, res);
    }

    async_io::block_on(async {
        let res = file.read_async(vec![0; 4096], None).await;
        println!("read: {:?}", res.res);
        assert!(res.buf.iter().all(|b| *b == 0));

        let res = file.write_async(vec![0xab; 512], Some(Duration::from_secs(1))).await;
        println!("write: {:?}", res.res);
        Result::<()>::Ok(())
    })?;

    cb.wait_idle(Duration::from_secs(1));
    file.close()?;
    cb.detach();

    Ok(())
}
