use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::{AsyncWorkScheduler, Job, JobKey, deliver_completion};
use crate::context::Context;

#[derive(Default)]
struct CoopState {
    in_flight: usize,
    pending: VecDeque<Job>,
}

/// Runs `execute` from immediates on the owner thread.
///
/// At most `max_in_flight` items are handed to the loop at once; the rest
/// wait in FIFO order. An item counts as started once it has been handed out.
pub(crate) struct CooperativeScheduler {
    max_in_flight: usize,
    state: Rc<RefCell<CoopState>>,
}

impl CooperativeScheduler {
    pub(crate) fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            state: Rc::new(RefCell::new(CoopState::default())),
        }
    }
}

fn pump(ctx: &Context, state: &Rc<RefCell<CoopState>>, max_in_flight: usize) {
    loop {
        let job = {
            let mut st = state.borrow_mut();
            if st.in_flight >= max_in_flight {
                return;
            }
            let Some(job) = st.pending.pop_front() else {
                return;
            };
            if !job.start() {
                continue;
            }
            st.in_flight += 1;
            job
        };
        let state = state.clone();
        ctx.set_immediate(move |ctx| {
            let status = job.run();
            state.borrow_mut().in_flight -= 1;
            deliver_completion(ctx, job.key, status);
            pump(ctx, &state, max_in_flight);
        });
    }
}

impl AsyncWorkScheduler for CooperativeScheduler {
    fn queue(&self, ctx: &Context, job: Job) {
        self.state.borrow_mut().pending.push_back(job);
        pump(ctx, &self.state, self.max_in_flight);
    }

    fn cancel(&self, key: JobKey) -> bool {
        let mut st = self.state.borrow_mut();
        match st.pending.iter().position(|job| job.key == key) {
            Some(pos) => {
                st.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    fn shutdown(&self) {
        let dropped = std::mem::take(&mut self.state.borrow_mut().pending);
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Dropping queued cooperative work");
        }
    }

    fn name(&self) -> &'static str {
        "cooperative"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

    use super::*;
    use crate::async_work::WorkState;
    use crate::config::RuntimeConfig;

    fn job(ctx: &Context, work: u64, runs: &Arc<AtomicUsize>) -> Job {
        let runs = runs.clone();
        Job {
            key: JobKey { env: 1, work },
            execute: Arc::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            }),
            state: Arc::new(AtomicU8::new(WorkState::Queued as u8)),
            owner: ctx.loop_handle(),
        }
    }

    #[test]
    fn bounds_items_in_flight() {
        let ctx = Context::new(Arc::new(RuntimeConfig::default())).unwrap();
        let scheduler = CooperativeScheduler::new(2);
        let runs = Arc::new(AtomicUsize::new(0));
        for work in 0..5 {
            scheduler.queue(&ctx, job(&ctx, work, &runs));
        }
        assert_eq!(scheduler.state.borrow().in_flight, 2);
        assert_eq!(scheduler.state.borrow().pending.len(), 3);
        assert!(scheduler.cancel(JobKey { env: 1, work: 4 }));
        assert!(!scheduler.cancel(JobKey { env: 1, work: 0 }));
        ctx.run_until_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.state.borrow().in_flight, 0);
        assert_eq!(scheduler.name(), "cooperative");
    }
}
