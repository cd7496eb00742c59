#![allow(clippy::disallowed_macros)]
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use threadbridge::config::{AsyncWorkMode, WaitThreadStart};
use threadbridge::{GuestError, Instance, RuntimeBuilder, SharedMemory};
use tracing::{Level, span};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

// Arguments with this bit set make the thread trap.
const TRAP: u32 = 1 << 8;

fn main() -> Result<()> {
    let filter = env::args()
        .nth(1)
        .unwrap_or_else(|| "info,threadbridge=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().parse(filter)?)
        .with_span_events(FmtSpan::CLOSE)
        .with_thread_names(true)
        .init();

    run_example()
}

fn run_example() -> Result<()> {
    let module = Arc::new(|memory: &SharedMemory| {
        Ok::<_, anyhow::Error>(Instance::new(memory.clone()).with_wasi_thread_start(
            |thread, tid, arg| {
                tracing::info!(tid, arg, "thread running");
                if arg & TRAP != 0 {
                    return Err(GuestError::Trap("unreachable executed".to_string()));
                }
                thread.memory().store(arg as usize, tid as i32);
                Ok(())
            },
        ))
    });

    let runtime = RuntimeBuilder::new()
        .with_wait_thread_start(WaitThreadStart::Timeout(Duration::from_secs(5)))
        .with_async_work_mode(AsyncWorkMode::WorkerPool { size: 2 })
        .build(module, SharedMemory::new_shared(256))?;
    let env = runtime.create_env();

    let span = span!(Level::INFO, "spawn_round");
    let _entered = span.enter();

    for arg in 1..=3 {
        let tid = runtime.spawner().spawn(arg)?;
        tracing::info!(tid, arg, "spawned");
    }
    runtime.run_until(
        || runtime.threads().running_count() == 0,
        Some(Duration::from_secs(10)),
    );

    let work = env.create_async_work(
        "tracing_example",
        || std::thread::sleep(Duration::from_millis(10)),
        |_, status| tracing::info!(?status, "async work completed"),
    )?;
    env.queue_async_work(work)?;
    runtime.run();
    env.delete_async_work(work)?;

    // A trapping thread takes every other thread down with it.
    runtime.spawner().spawn(TRAP | 4)?;
    runtime.run();

    runtime.shutdown();
    Ok(())
}
