#![allow(clippy::disallowed_macros)]
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use threadbridge::config::ReuseWorker;
use threadbridge::{
    CallMode, Instance, ReleaseMode, RuntimeBuilder, SharedMemory, ThreadsafeFunction,
    ThreadsafeFunctionOptions,
};

const THREADS: u32 = 4;
// Word offset of the per-thread result slots.
const RESULTS: usize = 16;

fn main() -> Result<()> {
    // Filled in once the main environment exists. Worker threads report
    // through it.
    let report: Arc<OnceLock<ThreadsafeFunction>> = Arc::default();

    let module = {
        let report = report.clone();
        Arc::new(move |memory: &SharedMemory| {
            let report = report.clone();
            Ok::<_, anyhow::Error>(Instance::new(memory.clone()).with_wasi_thread_start(
                move |thread, tid, arg| {
                    let from = arg as i64 * 1000;
                    let sum: i64 = (from..from + 1000).sum();
                    thread.memory().store(RESULTS + arg as usize, sum as i32);
                    if let Some(report) = report.get() {
                        let _ = report.call(Box::new((tid, arg, sum)), CallMode::Blocking);
                    }
                    Ok(())
                },
            ))
        })
    };

    let runtime = RuntimeBuilder::new()
        .with_reuse_worker(ReuseWorker::Pool {
            size: 2,
            strict: false,
        })
        .build(module, SharedMemory::new_shared(1024))?;
    let env = runtime.create_env();

    let tsfn = env.create_threadsafe_function(
        None,
        ThreadsafeFunctionOptions {
            max_queue_size: 4,
            resource_name: "report".to_string(),
            ..Default::default()
        },
        Some(Box::new(|env, _, data| {
            if env.is_none() {
                return;
            }
            if let Ok(item) = data.downcast::<(u32, u32, i64)>() {
                let (tid, arg, sum) = *item;
                println!("thread {tid} finished chunk {arg}: sum = {sum}");
            }
        })),
        Some(Box::new(|_, _| println!("report channel closed"))),
    )?;
    let _ = report.set(tsfn.clone());

    let thread = runtime.thread_context();
    for arg in 0..THREADS {
        let tid = thread.thread_spawn(arg);
        if tid < 0 {
            anyhow::bail!("spawning chunk {arg} failed with errno {}", -tid);
        }
        println!("spawned chunk {arg} as thread {tid}");
    }

    let done = runtime.run_until(
        || runtime.threads().running_count() == 0,
        Some(Duration::from_secs(10)),
    );
    println!("all threads finished: {done}");
    println!(
        "workers: {}",
        serde_json::to_string_pretty(&runtime.threads().threads())?
    );

    tsfn.release(ReleaseMode::Release)?;
    runtime.run();

    let total: i64 = (0..THREADS as usize)
        .map(|i| runtime.memory().load(RESULTS + i) as i64)
        .sum();
    println!("total = {total}");
    Ok(())
}
