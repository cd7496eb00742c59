//! Tests for calling into an owner thread from other threads

#![allow(clippy::disallowed_macros)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use threadbridge::config::RuntimeConfig;
use threadbridge::tsfn::CallJs;
use threadbridge::{
    CallMode, Context, Error, ReleaseMode, ThreadsafeFunction, ThreadsafeFunctionOptions,
};
use threadbridge_common::layout::tsfn::DISPATCH_RUNNING;

const PRODUCERS: u32 = 4;
const CALLS: u32 = 250;

#[test]
fn producers_are_delivered_in_order_without_overlap() {
    let ctx = Context::new(Arc::new(RuntimeConfig {
        dispatch_batch_size: 16,
        ..Default::default()
    }))
    .unwrap();
    let env = ctx.create_env();

    let seen: Rc<RefCell<HashMap<u32, Vec<u32>>>> = Rc::default();
    let in_call = Rc::new(Cell::new(false));
    let overlaps = Rc::new(Cell::new(0));
    let outside_dispatch = Rc::new(Cell::new(0));
    let handle: Rc<RefCell<Option<ThreadsafeFunction>>> = Rc::default();

    let call_js: CallJs = {
        let (seen, in_call, overlaps, outside_dispatch, handle) = (
            seen.clone(),
            in_call.clone(),
            overlaps.clone(),
            outside_dispatch.clone(),
            handle.clone(),
        );
        Box::new(move |env, _func, data| {
            if env.is_none() {
                return;
            }
            if in_call.replace(true) {
                overlaps.set(overlaps.get() + 1);
            }
            if let Some(tsfn) = handle.borrow().as_ref()
                && tsfn.snapshot().dispatch_state & DISPATCH_RUNNING == 0
            {
                outside_dispatch.set(outside_dispatch.get() + 1);
            }
            if let Ok(item) = data.downcast::<(u32, u32)>() {
                let (producer, seq) = *item;
                seen.borrow_mut().entry(producer).or_default().push(seq);
            }
            in_call.set(false);
        })
    };

    let options = ThreadsafeFunctionOptions {
        max_queue_size: 8,
        initial_thread_count: 1,
        resource_name: "producers".to_string(),
        context: None,
    };
    let tsfn = env
        .create_threadsafe_function(None, options, Some(call_js), None)
        .unwrap();
    *handle.borrow_mut() = Some(tsfn.clone());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let tsfn = tsfn.clone();
            tsfn.acquire().unwrap();
            std::thread::spawn(move || {
                for seq in 0..CALLS {
                    tsfn.call(Box::new((producer, seq)), CallMode::Blocking)
                        .unwrap();
                }
                tsfn.release(ReleaseMode::Release).unwrap();
            })
        })
        .collect();

    let total = (PRODUCERS * CALLS) as usize;
    assert!(ctx.run_until(
        || seen.borrow().values().map(Vec::len).sum::<usize>() == total,
        Some(Duration::from_secs(20)),
    ));
    for producer in producers {
        producer.join().unwrap();
    }

    let expected: Vec<u32> = (0..CALLS).collect();
    for producer in 0..PRODUCERS {
        assert_eq!(seen.borrow()[&producer], expected, "producer {producer}");
    }
    assert_eq!(overlaps.get(), 0);
    assert_eq!(outside_dispatch.get(), 0);

    handle.borrow_mut().take();
    tsfn.release(ReleaseMode::Release).unwrap();
    ctx.run_until_idle();
    assert_eq!(env.threadsafe_function_count(), 0);
    assert!(matches!(
        tsfn.call(Box::new((0u32, 0u32)), CallMode::NonBlocking),
        Err(Error::Closing) | Err(Error::InvalidArg(_))
    ));
}

#[test]
fn loop_stays_alive_until_released() {
    let ctx = Context::new(Arc::new(RuntimeConfig::default())).unwrap();
    let env = ctx.create_env();
    let finalized = Rc::new(Cell::new(false));
    let delivered = Rc::new(Cell::new(0u32));
    let (f, d) = (finalized.clone(), delivered.clone());
    let tsfn = env
        .create_threadsafe_function(
            None,
            Default::default(),
            Some(Box::new(move |env, _, _| {
                if env.is_some() {
                    d.set(d.get() + 1);
                }
            })),
            Some(Box::new(move |_, _| f.set(true))),
        )
        .unwrap();

    let producer = tsfn.clone();
    drop(tsfn);
    let worker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        producer.call(Box::new(()), CallMode::Blocking).unwrap();
        producer.release(ReleaseMode::Release).unwrap();
    });
    ctx.run();
    worker.join().unwrap();
    assert_eq!(delivered.get(), 1);
    assert!(finalized.get());
}

#[test]
fn unref_lets_loop_exit() {
    let ctx = Context::new(Arc::new(RuntimeConfig::default())).unwrap();
    let env = ctx.create_env();
    let tsfn = env
        .create_threadsafe_function(None, Default::default(), Some(Box::new(|_, _, _| {})), None)
        .unwrap();
    tsfn.unref_loop();
    ctx.run();
    assert_eq!(env.threadsafe_function_count(), 1);
    tsfn.ref_loop();
    assert_eq!(ctx.loop_handle().active_refs(), 1);
    tsfn.release(ReleaseMode::Abort).unwrap();
    ctx.run();
    assert_eq!(env.threadsafe_function_count(), 0);
}

#[test]
fn abort_wakes_producer_blocked_on_full_queue() {
    let ctx = Context::new(Arc::new(RuntimeConfig::default())).unwrap();
    let env = ctx.create_env();
    let drained = Rc::new(Cell::new(0u32));
    let delivered = Rc::new(Cell::new(0u32));
    let (dr, de) = (drained.clone(), delivered.clone());
    let tsfn = env
        .create_threadsafe_function(
            None,
            ThreadsafeFunctionOptions {
                max_queue_size: 1,
                // this thread and the producer
                initial_thread_count: 2,
                ..Default::default()
            },
            Some(Box::new(move |env, _, _| match env {
                Some(_) => de.set(de.get() + 1),
                None => dr.set(dr.get() + 1),
            })),
            None,
        )
        .unwrap();
    tsfn.call(Box::new(0u32), CallMode::NonBlocking).unwrap();
    assert!(matches!(
        tsfn.call(Box::new(1u32), CallMode::NonBlocking),
        Err(Error::QueueFull)
    ));

    let producer = tsfn.clone();
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let worker = std::thread::spawn(move || {
        started_tx.send(()).unwrap();
        matches!(
            producer.call(Box::new(2u32), CallMode::Blocking),
            Err(Error::Closing)
        )
    });
    started_rx.recv().unwrap();
    // give the producer time to park on the full queue
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(tsfn.snapshot().queue_len, 1);

    tsfn.release(ReleaseMode::Abort).unwrap();
    assert!(worker.join().unwrap());
    assert_eq!(tsfn.snapshot().thread_count, 0);

    ctx.run_until_idle();
    assert_eq!(delivered.get(), 0);
    assert_eq!(drained.get(), 1);
    assert_eq!(env.threadsafe_function_count(), 0);
}
