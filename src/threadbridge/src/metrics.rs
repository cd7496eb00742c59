/*!
This module contains the definitions and implementations of the metrics emitted by the runtime
*/

use tracing::{Level, instrument};

use crate::async_work::WorkRecord;
use crate::env::EnvInner;
use crate::threads::WorkerEntry;
use crate::tsfn::TsfnShared;

// Gauges, live objects
static METRIC_ACTIVE_ENVS: &str = "active_envs";
static METRIC_ACTIVE_WORKERS: &str = "active_workers";
static METRIC_ACTIVE_TSFNS: &str = "active_threadsafe_functions";
static METRIC_ACTIVE_ASYNC_WORK: &str = "active_async_work";

// Counters, objects created during the lifetime of the process
static METRIC_TOTAL_ENVS: &str = "envs_total";
static METRIC_TOTAL_WORKERS: &str = "workers_total";
static METRIC_TOTAL_TSFNS: &str = "threadsafe_functions_total";
static METRIC_TOTAL_ASYNC_WORK: &str = "async_work_total";

// Counters, thread creation
pub(crate) static METRIC_THREADS_SPAWNED: &str = "threads_spawned_total";
pub(crate) static METRIC_THREAD_SPAWN_FAILURES: &str = "thread_spawn_failures_total";
pub(crate) static METRIC_REASON_LABEL: &str = "reason";

// Counters, async work completions by status
pub(crate) static METRIC_ASYNC_WORK_COMPLETED: &str = "async_work_completed_total";
pub(crate) static METRIC_STATUS_LABEL: &str = "status";

// Histograms, time spent in callbacks delivered by the loop
#[cfg(feature = "function_call_metrics")]
static METRIC_CALLBACK_DURATION: &str = "loop_callback_duration_micros";
#[cfg(feature = "function_call_metrics")]
static METRIC_CALLBACK_KIND: &str = "callback_kind";

pub(crate) trait MetricsTrait {
    const GAUGE: &'static str;
    const COUNTER: &'static str;
}

pub(crate) struct MetricsGuard<T: MetricsTrait>(std::marker::PhantomData<T>);

impl<T: MetricsTrait> MetricsGuard<T> {
    #[instrument(skip_all, level=Level::TRACE)]
    pub(crate) fn new() -> Self {
        metrics::gauge!(T::GAUGE).increment(1);
        metrics::counter!(T::COUNTER).increment(1);
        Self(std::marker::PhantomData)
    }
}

impl<T: MetricsTrait> Drop for MetricsGuard<T> {
    #[instrument(skip_all, level=Level::TRACE)]
    fn drop(&mut self) {
        metrics::gauge!(T::GAUGE).decrement(1);
    }
}

impl MetricsTrait for EnvInner {
    const GAUGE: &'static str = METRIC_ACTIVE_ENVS;
    const COUNTER: &'static str = METRIC_TOTAL_ENVS;
}

impl MetricsTrait for WorkerEntry {
    const GAUGE: &'static str = METRIC_ACTIVE_WORKERS;
    const COUNTER: &'static str = METRIC_TOTAL_WORKERS;
}

impl MetricsTrait for TsfnShared {
    const GAUGE: &'static str = METRIC_ACTIVE_TSFNS;
    const COUNTER: &'static str = METRIC_TOTAL_TSFNS;
}

impl MetricsTrait for WorkRecord {
    const GAUGE: &'static str = METRIC_ACTIVE_ASYNC_WORK;
    const COUNTER: &'static str = METRIC_TOTAL_ASYNC_WORK;
}

/// Times one callback delivered from the loop.
#[cfg(feature = "function_call_metrics")]
pub(crate) struct CallbackMetricGuard {
    kind: &'static str,
    start: std::time::Instant,
}

#[cfg(feature = "function_call_metrics")]
impl CallbackMetricGuard {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "function_call_metrics")]
impl Drop for CallbackMetricGuard {
    fn drop(&mut self) {
        metrics::histogram!(METRIC_CALLBACK_DURATION, METRIC_CALLBACK_KIND => self.kind)
            .record(self.start.elapsed().as_micros() as f64);
    }
}
