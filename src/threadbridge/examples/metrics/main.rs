#![allow(clippy::disallowed_macros)]
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use threadbridge::config::ReuseWorker;
use threadbridge::{
    CallMode, Instance, ReleaseMode, RuntimeBuilder, SharedMemory, ThreadsafeFunctionOptions,
};

fn main() -> Result<()> {
    // Install an in-process recorder so the snapshot can be printed below.
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;

    do_stuff()?;

    // Every runtime has been dropped, so the gauges are back at zero while
    // the counters show what was created.
    for (key, _unit, _description, value) in snapshotter.snapshot().into_vec() {
        let value = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => v.into_inner().to_string(),
            DebugValue::Histogram(v) => format!("{} samples", v.len()),
        };
        println!("{:?} {} = {}", key.kind(), key.key().name(), value);
    }
    Ok(())
}

fn do_stuff() -> Result<()> {
    let module = Arc::new(|memory: &SharedMemory| {
        Ok::<_, anyhow::Error>(Instance::new(memory.clone()).with_wasi_thread_start(
            |thread, _tid, arg| {
                thread.memory().fetch_add(arg as usize, 1);
                Ok(())
            },
        ))
    });

    for round in 0..3 {
        let runtime = RuntimeBuilder::new()
            .with_reuse_worker(ReuseWorker::Pool {
                size: 2,
                strict: false,
            })
            .build(module.clone(), SharedMemory::new_shared(256))?;
        let env = runtime.create_env();

        // more threads than the pool holds, so it grows
        for _ in 0..5 {
            runtime.spawner().spawn(1)?;
        }

        let delivered = Rc::new(Cell::new(0));
        let seen = delivered.clone();
        let tsfn = env.create_threadsafe_function(
            None,
            ThreadsafeFunctionOptions::default(),
            Some(Box::new(move |_, _, _| seen.set(seen.get() + 1))),
            None,
        )?;
        let producer = tsfn.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                let _ = producer.call(Box::new(()), CallMode::Blocking);
            }
        })
        .join()
        .map_err(|_| anyhow::anyhow!("producer panicked"))?;
        tsfn.release(ReleaseMode::Release)?;

        let work = env.create_async_work("metrics_example", || {}, |_, _| {})?;
        env.queue_async_work(work)?;

        runtime.run_until(
            || runtime.threads().running_count() == 0,
            Some(Duration::from_secs(10)),
        );
        runtime.run();
        env.delete_async_work(work)?;
        println!(
            "round {round}: {} callbacks, counter = {}",
            delivered.get(),
            runtime.memory().load(1)
        );
    }
    Ok(())
}
