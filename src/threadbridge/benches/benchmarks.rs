use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{Bencher, Criterion, criterion_group, criterion_main};
use threadbridge::config::{AsyncWorkMode, ReuseWorker, RuntimeConfig};
use threadbridge::{
    CallMode, Context, Instance, ReleaseMode, RuntimeBuilder, SharedMemory,
    ThreadsafeFunctionOptions, WasmModule,
};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30));

fn thread_module() -> Arc<dyn WasmModule> {
    Arc::new(|memory: &SharedMemory| {
        Ok::<_, anyhow::Error>(Instance::new(memory.clone()).with_wasi_thread_start(
            |thread, _tid, arg| {
                thread.memory().fetch_add(arg as usize, 1);
                Ok(())
            },
        ))
    })
}

fn handle_scope_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_scopes");
    let ctx = Context::new(Arc::new(RuntimeConfig::default())).unwrap();
    let env = ctx.create_env();

    let bench_scope = |b: &mut Bencher<'_>, handles: usize| {
        b.iter(|| {
            let scope = env.open_handle_scope();
            for i in 0..handles {
                env.create_int32(i as i32);
            }
            env.close_handle_scope(scope).unwrap();
        });
    };

    group.bench_function("scope_10_handles", |b: &mut Bencher<'_>| {
        bench_scope(b, 10);
    });
    group.bench_function("scope_1000_handles", |b: &mut Bencher<'_>| {
        bench_scope(b, 1000);
    });
    group.bench_function("escape_one_of_100", |b: &mut Bencher<'_>| {
        b.iter(|| {
            let outer = env.open_handle_scope();
            let inner = env.open_escapable_handle_scope();
            let mut last = env.get_undefined();
            for i in 0..100 {
                last = env.create_int32(i);
            }
            env.escape_handle(inner, last).unwrap();
            env.close_handle_scope(inner).unwrap();
            env.close_handle_scope(outer).unwrap();
        });
    });

    group.finish();
}

fn threadsafe_function_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("threadsafe_functions");

    let bench_producers = |b: &mut Bencher<'_>, producers: usize, calls: usize| {
        b.iter_custom(|iterations| {
            let ctx = Context::new(Arc::new(RuntimeConfig::default())).unwrap();
            let env = ctx.create_env();
            let mut elapsed = Duration::ZERO;

            for _ in 0..iterations {
                let delivered = Rc::new(Cell::new(0usize));
                let seen = delivered.clone();
                let tsfn = env
                    .create_threadsafe_function(
                        None,
                        ThreadsafeFunctionOptions {
                            max_queue_size: 64,
                            ..Default::default()
                        },
                        Some(Box::new(move |env, _, _| {
                            if env.is_some() {
                                seen.set(seen.get() + 1);
                            }
                        })),
                        None,
                    )
                    .unwrap();

                let start = Instant::now();
                crossbeam::thread::scope(|s| {
                    for _ in 0..producers {
                        let tsfn = tsfn.clone();
                        tsfn.acquire().unwrap();
                        s.spawn(move |_| {
                            for _ in 0..calls {
                                tsfn.call(Box::new(()), CallMode::Blocking).unwrap();
                            }
                            tsfn.release(ReleaseMode::Release).unwrap();
                        });
                    }
                    ctx.run_until(|| delivered.get() == producers * calls, TIMEOUT);
                })
                .unwrap();
                elapsed += start.elapsed();

                tsfn.release(ReleaseMode::Release).unwrap();
                ctx.run_until_idle();
            }
            ctx.teardown();
            elapsed
        });
    };

    group.bench_function("1_producer_1000_calls", |b: &mut Bencher<'_>| {
        bench_producers(b, 1, 1000);
    });
    group.bench_function("4_producers_250_calls", |b: &mut Bencher<'_>| {
        bench_producers(b, 4, 250);
    });

    group.finish();
}

fn async_work_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_work");

    let bench_mode = |b: &mut Bencher<'_>, mode: AsyncWorkMode, items: usize| {
        let ctx = Context::new(Arc::new(RuntimeConfig {
            async_work_mode: mode,
            ..Default::default()
        }))
        .unwrap();
        let env = ctx.create_env();
        b.iter(|| {
            let completed = Rc::new(Cell::new(0usize));
            let works: Vec<_> = (0..items)
                .map(|_| {
                    let completed = completed.clone();
                    env.create_async_work(
                        "bench",
                        || {},
                        move |_, _| completed.set(completed.get() + 1),
                    )
                    .unwrap()
                })
                .collect();
            for work in &works {
                env.queue_async_work(*work).unwrap();
            }
            ctx.run_until(|| completed.get() == items, TIMEOUT);
            for work in works {
                env.delete_async_work(work).unwrap();
            }
        });
        ctx.teardown();
    };

    group.bench_function("pool_100_items", |b: &mut Bencher<'_>| {
        bench_mode(b, AsyncWorkMode::WorkerPool { size: 4 }, 100);
    });
    group.bench_function("cooperative_100_items", |b: &mut Bencher<'_>| {
        bench_mode(b, AsyncWorkMode::Cooperative { max_in_flight: 4 }, 100);
    });

    group.finish();
}

fn thread_spawn_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_spawn");
    group.sample_size(20);

    let bench_spawn = |b: &mut Bencher<'_>, reuse: ReuseWorker| {
        let runtime = RuntimeBuilder::new()
            .with_reuse_worker(reuse)
            .build(thread_module(), SharedMemory::new_shared(64))
            .unwrap();
        b.iter(|| {
            runtime.spawner().spawn(1).unwrap();
            runtime.run_until(|| runtime.threads().running_count() == 0, TIMEOUT);
        });
    };

    group.bench_function("spawn_fresh_worker", |b: &mut Bencher<'_>| {
        bench_spawn(b, ReuseWorker::Disabled);
    });
    group.bench_function("spawn_pooled_worker", |b: &mut Bencher<'_>| {
        bench_spawn(
            b,
            ReuseWorker::Pool {
                size: 1,
                strict: false,
            },
        );
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = handle_scope_benchmark, threadsafe_function_benchmark, async_work_benchmark, thread_spawn_benchmark
}
criterion_main!(benches);
