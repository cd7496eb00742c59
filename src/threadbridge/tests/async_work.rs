//! Tests for async work on the worker pool and the cooperative scheduler

#![allow(clippy::disallowed_macros)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use threadbridge::config::{AsyncWorkMode, RuntimeConfig};
use threadbridge::{AsyncWork, Context, Env, Status, WorkState};

fn setup(mode: AsyncWorkMode) -> (Context, Env) {
    let ctx = Context::new(Arc::new(RuntimeConfig {
        async_work_mode: mode,
        ..Default::default()
    }))
    .unwrap();
    let env = ctx.create_env();
    (ctx, env)
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

struct Tracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    gate: AtomicBool,
    executed: Vec<AtomicBool>,
}

impl Tracker {
    fn new(items: usize) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: AtomicBool::new(false),
            executed: (0..items).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    fn execute(&self, index: usize) {
        self.executed[index].store(true, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        while !self.gate.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

fn queue_items(
    env: &Env,
    tracker: &Arc<Tracker>,
    items: usize,
) -> (Vec<AsyncWork>, Rc<RefCell<Vec<Option<Status>>>>) {
    let statuses = Rc::new(RefCell::new(vec![None; items]));
    let works: Vec<AsyncWork> = (0..items)
        .map(|index| {
            let tracker = tracker.clone();
            let sink = statuses.clone();
            env.create_async_work(
                "tracked",
                move || tracker.execute(index),
                move |_, status| sink.borrow_mut()[index] = Some(status),
            )
            .unwrap()
        })
        .collect();
    for work in &works {
        env.queue_async_work(*work).unwrap();
    }
    (works, statuses)
}

#[test]
fn pool_bounds_concurrency_and_cancels_queued_items() {
    const ITEMS: usize = 10;
    let (ctx, env) = setup(AsyncWorkMode::WorkerPool { size: 4 });
    let tracker = Tracker::new(ITEMS);
    let (works, statuses) = queue_items(&env, &tracker, ITEMS);

    assert!(wait_for(|| tracker.current.load(Ordering::SeqCst) == 4));
    assert_eq!(env.async_work_state(works[7]).unwrap(), WorkState::Queued);
    env.cancel_async_work(works[7]).unwrap();
    assert_eq!(env.async_work_state(works[7]).unwrap(), WorkState::Cancelled);
    assert_eq!(env.async_work_state(works[0]).unwrap(), WorkState::Running);
    assert!(env.cancel_async_work(works[0]).is_err());

    tracker.gate.store(true, Ordering::SeqCst);
    assert!(ctx.run_until(
        || statuses.borrow().iter().all(Option::is_some),
        Some(Duration::from_secs(10)),
    ));

    assert_eq!(tracker.peak.load(Ordering::SeqCst), 4);
    assert!(!tracker.executed[7].load(Ordering::SeqCst));
    for (index, status) in statuses.borrow().iter().enumerate() {
        let expected = if index == 7 {
            Status::Cancelled
        } else {
            Status::Ok
        };
        assert_eq!(*status, Some(expected), "item {index}");
    }
    for work in works {
        env.delete_async_work(work).unwrap();
    }
    assert_eq!(ctx.loop_handle().active_refs(), 0);
}

#[test]
fn cooperative_mode_respects_max_in_flight() {
    const ITEMS: usize = 5;
    let (ctx, env) = setup(AsyncWorkMode::Cooperative { max_in_flight: 2 });
    let tracker = Tracker::new(ITEMS);
    tracker.gate.store(true, Ordering::SeqCst);
    let (works, statuses) = queue_items(&env, &tracker, ITEMS);
    env.cancel_async_work(works[4]).unwrap();
    ctx.run();
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    assert!(!tracker.executed[4].load(Ordering::SeqCst));
    assert_eq!(statuses.borrow()[4], Some(Status::Cancelled));
    assert!(statuses.borrow()[..4].iter().all(|s| *s == Some(Status::Ok)));
}

#[test]
fn teardown_with_outstanding_work_does_not_hang() {
    let (ctx, env) = setup(AsyncWorkMode::WorkerPool { size: 1 });
    let tracker = Tracker::new(2);
    let (_works, _statuses) = queue_items(&env, &tracker, 2);
    assert!(wait_for(|| tracker.current.load(Ordering::SeqCst) == 1));
    tracker.gate.store(true, Ordering::SeqCst);
    ctx.teardown();
    assert!(env.is_disposed());
}
