//! A synthetic keyed workload used to exercise a processor
//!
//! Each key receives a stream of tasks numbered in submission order. Tasks
//! record the highest index seen for their key, so a task that runs after a
//! later one of the same key is counted as out of order

use std::{
    fmt::{self, Display},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::types::{
    log_context::LogContext,
    task_key::TaskKey,
    tasks::{BoxedTask, FnTask, TaskError},
};
use config::WorkloadConfig;
use rand::{Rng, thread_rng};
use task_processor::Processor;
use tracing::{debug, warn};
use util::concurrency::interrupt;

/// The counters shared between the workload and its tasks
#[derive(Default)]
struct WorkloadState {
    /// Per key, one past the highest task index that has run
    high_water: Vec<AtomicUsize>,
    /// The number of tasks the processor accepted
    accepted: AtomicUsize,
    /// The number of tasks the processor rejected
    rejected: AtomicUsize,
    /// The number of tasks that ran to completion
    completed: AtomicUsize,
    /// The number of tasks that ran after a later task of the same key
    out_of_order: AtomicUsize,
}

/// A workload of keyed tasks
pub struct Workload {
    /// The shape of the workload
    config: WorkloadConfig,
    /// The counters updated by the workload's tasks
    state: Arc<WorkloadState>,
}

/// A summary of a finished workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkloadReport {
    /// The number of tasks the processor accepted
    pub accepted: usize,
    /// The number of tasks the processor rejected
    pub rejected: usize,
    /// The number of tasks that ran to completion
    pub completed: usize,
    /// The number of tasks that ran out of order
    pub out_of_order: usize,
}

impl Display for WorkloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workload finished: {} accepted, {} rejected, {} completed, {} out of order",
            self.accepted, self.rejected, self.completed, self.out_of_order
        )
    }
}

impl Workload {
    /// Constructor
    pub fn new(config: WorkloadConfig) -> Self {
        let high_water = (0..config.num_keys).map(|_| AtomicUsize::new(0)).collect();
        let state = Arc::new(WorkloadState { high_water, ..Default::default() });
        Self { config, state }
    }

    /// Submit every task of the workload, interleaving the keys
    pub fn submit(&self, processor: &dyn Processor) {
        for index in 0..self.config.tasks_per_key {
            for key in 0..self.config.num_keys {
                let task = self.build_task(key, index);
                if processor.execute(Some(TaskKey::from(key)), task) {
                    self.state.accepted.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!("task {index} of key {key} rejected");
                    self.state.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Summarize the workload
    pub fn report(&self) -> WorkloadReport {
        WorkloadReport {
            accepted: self.state.accepted.load(Ordering::Relaxed),
            rejected: self.state.rejected.load(Ordering::Relaxed),
            completed: self.state.completed.load(Ordering::Relaxed),
            out_of_order: self.state.out_of_order.load(Ordering::Relaxed),
        }
    }

    /// Build the `index`th task of a key
    fn build_task(&self, key: usize, index: usize) -> BoxedTask {
        let state = self.state.clone();
        let duration = jittered(self.config.task_duration);
        let task = FnTask::new(move || {
            let previous = state.high_water[key].fetch_max(index + 1, Ordering::AcqRel);
            if previous > index {
                warn!("task {index} ran after task {}", previous - 1);
                state.out_of_order.fetch_add(1, Ordering::Relaxed);
            }

            interrupt::sleep(duration).map_err(|_| TaskError::Interrupted)?;
            state.completed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .with_log_context(
            LogContext::new().with("key", key.to_string()).with("task", index.to_string()),
        );

        match self.config.task_timeout {
            Some(timeout) => task.with_timeout(timeout).boxed(),
            None => task.boxed(),
        }
    }
}

/// Pick a duration between half and all of the given one
fn jittered(duration: Duration) -> Duration {
    if duration.is_zero() {
        return duration;
    }

    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(thread_rng().gen_range(millis / 2..=millis))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use config::{ProcessorConfig, ProcessorKind, WorkloadConfig};
    use task_processor::new_processor;

    use super::{Workload, WorkloadReport, jittered};

    /// A small workload
    fn workload_config() -> WorkloadConfig {
        WorkloadConfig {
            num_keys: 4,
            tasks_per_key: 5,
            task_duration: Duration::from_millis(2),
            task_timeout: None,
        }
    }

    /// Tests that both processors run the workload in per-key order
    #[test]
    fn test_workload_in_order() {
        for kind in [ProcessorKind::RoundRobin, ProcessorKind::Striped] {
            let config =
                ProcessorConfig { kind, num_threads: 3, max_threads: 3, ..Default::default() };
            let processor = new_processor(&config).unwrap();

            let workload = Workload::new(workload_config());
            workload.submit(processor.as_ref());
            processor.stop_when_empty().unwrap();
            assert!(processor.await_termination(Duration::from_secs(10)));

            let expected =
                WorkloadReport { accepted: 20, rejected: 0, completed: 20, out_of_order: 0 };
            assert_eq!(workload.report(), expected);
        }
    }

    /// Tests that tasks submitted to a stopped processor are counted as
    /// rejected
    #[test]
    fn test_workload_rejected() {
        let processor = new_processor(&ProcessorConfig::default()).unwrap();
        processor.stop();

        let workload = Workload::new(workload_config());
        workload.submit(processor.as_ref());
        let report = workload.report();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.rejected, 20);
    }

    /// Tests the bounds of the jittered duration
    #[test]
    fn test_jitter() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(10));
            assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(10));
        }
    }
}
