//! Runs a single task with its logging context, timeout watchdog and failure
//! isolation applied

use std::{
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicUsize, Ordering},
};

use common::types::tasks::{BoxedTask, TaskError};
use processor_metrics::{
    gauge::Gauge, incr_completed_tasks, incr_failed_tasks, incr_timed_out_tasks,
    labels::NUM_EXECUTING_TASKS_METRIC,
};
use tracing::{error, warn};
use util::concurrency::{
    interrupt::{self, InterruptHandle},
    panic_message,
};

use crate::watchdog::TaskWatchdog;

/// How a task run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task returned successfully
    Completed,
    /// The task returned an error or panicked
    Failed,
    /// The task reported an interruption or left its thread interrupted
    ///
    /// The interrupt flag has been cleared by the runner
    Interrupted,
}

/// Executes tasks on behalf of a processor
pub struct TaskRunner {
    /// The name of the processor, used to tag logs and metrics
    processor: String,
    /// The number of tasks running at the moment
    executing: AtomicUsize,
    /// Mirrors `executing` to the metrics recorder
    executing_gauge: Gauge,
    /// Interrupts tasks that overrun their timeout
    watchdog: Option<TaskWatchdog>,
}

impl TaskRunner {
    /// Constructor
    pub fn new(processor: &str, watchdog: Option<TaskWatchdog>) -> Self {
        Self {
            processor: processor.to_string(),
            executing: AtomicUsize::new(0),
            executing_gauge: Gauge::for_processor(NUM_EXECUTING_TASKS_METRIC, processor),
            watchdog,
        }
    }

    /// The number of tasks running at the moment
    pub fn num_executing(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }

    /// Run a task on the calling thread
    ///
    /// Errors and panics are logged and counted, never propagated
    pub fn run_task(&self, task: BoxedTask) -> TaskOutcome {
        let _executing = ExecutingGuard::new(self);
        let _context =
            task.log_context().filter(|ctx| !ctx.is_empty()).cloned().map(|ctx| ctx.enter());
        let watch = match (task.timeout(), &self.watchdog) {
            (Some(timeout), Some(watchdog)) if !timeout.is_zero() => {
                Some(watchdog.watch(InterruptHandle::current(), timeout))
            },
            _ => None,
        };

        let res = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
        if watch.is_some_and(|guard| guard.fired()) {
            incr_timed_out_tasks(&self.processor);
        }

        let completed = matches!(res, Ok(Ok(())));
        let reported_interrupt = matches!(res, Ok(Err(TaskError::Interrupted)));
        match res {
            Ok(Ok(())) => incr_completed_tasks(&self.processor),
            Ok(Err(TaskError::Interrupted)) => {
                warn!("task in processor {} was interrupted", self.processor);
            },
            Ok(Err(e)) => {
                error!("task in processor {} failed: {e}", self.processor);
                incr_failed_tasks(&self.processor);
            },
            Err(panic) => {
                error!(
                    "task in processor {} panicked: {}",
                    self.processor,
                    panic_message(panic.as_ref())
                );
                incr_failed_tasks(&self.processor);
            },
        }

        // Consume the flag so the thread can tell the processor it was
        // interrupted without carrying the interrupt into the next task
        if interrupt::interrupted() || reported_interrupt {
            return TaskOutcome::Interrupted;
        }

        if completed { TaskOutcome::Completed } else { TaskOutcome::Failed }
    }
}

/// Tracks a task as executing for as long as it is alive
struct ExecutingGuard<'a> {
    /// The runner whose counters to update
    runner: &'a TaskRunner,
}

impl<'a> ExecutingGuard<'a> {
    /// Mark a task as executing
    fn new(runner: &'a TaskRunner) -> Self {
        runner.executing.fetch_add(1, Ordering::AcqRel);
        runner.executing_gauge.increment(1.);
        Self { runner }
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.runner.executing.fetch_sub(1, Ordering::AcqRel);
        self.runner.executing_gauge.decrement(1.);
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        thread::Builder,
        time::Duration,
    };

    use common::types::{
        log_context::LogContext,
        tasks::{FnTask, TaskError, task_fn},
    };
    use util::concurrency::{interrupt, timer::Timer};

    use super::{TaskOutcome, TaskRunner};
    use crate::watchdog::TaskWatchdog;

    /// Tests the outcome of successful, failing and panicking tasks
    #[test]
    fn test_outcomes() {
        let runner = TaskRunner::new("runner-test", None /* watchdog */);

        assert_eq!(runner.run_task(task_fn(|| {})), TaskOutcome::Completed);
        let failing = FnTask::new(|| Err(TaskError::failed("boom"))).boxed();
        assert_eq!(runner.run_task(failing), TaskOutcome::Failed);
        assert_eq!(runner.run_task(task_fn(|| panic!("bad task"))), TaskOutcome::Failed);
        let interrupted = FnTask::new(|| Err(TaskError::Interrupted)).boxed();
        assert_eq!(runner.run_task(interrupted), TaskOutcome::Interrupted);

        assert_eq!(runner.num_executing(), 0);
    }

    /// Tests that the task's logging context is active only while it runs
    #[test]
    fn test_log_context_applied() {
        let runner = TaskRunner::new("runner-test", None /* watchdog */);
        let seen = Arc::new(Mutex::new(None));

        let seen_clone = seen.clone();
        let task = FnTask::new(move || {
            *seen_clone.lock().unwrap() = LogContext::current().get("request").map(String::from);
            Ok(())
        })
        .with_log_context(LogContext::new().with("request", "17"))
        .boxed();

        runner.run_task(task);
        assert_eq!(seen.lock().unwrap().as_deref(), Some("17"));
        assert!(LogContext::current().is_empty());
    }

    /// Tests that the watchdog interrupts an overrunning task and the runner
    /// reports and clears the interrupt
    #[test]
    fn test_timeout_interrupts() {
        let watchdog = TaskWatchdog::new(Timer::new("runner-test").unwrap());
        let runner = Arc::new(TaskRunner::new("runner-test", Some(watchdog)));

        let (join, _handle) = interrupt::spawn(Builder::new(), move || {
            let task = FnTask::new(|| {
                interrupt::sleep(Duration::from_secs(30)).map_err(|_| TaskError::Interrupted)
            })
            .with_timeout(Duration::from_millis(20))
            .boxed();

            let outcome = runner.run_task(task);
            (outcome, interrupt::is_interrupted())
        })
        .unwrap();

        let (outcome, still_interrupted) = join.join().unwrap();
        assert_eq!(outcome, TaskOutcome::Interrupted);
        assert!(!still_interrupted);
    }

    /// Tests that a zero timeout disables the watchdog
    #[test]
    fn test_zero_timeout() {
        let watchdog = TaskWatchdog::new(Timer::new("runner-test").unwrap());
        let runner = TaskRunner::new("runner-test", Some(watchdog));
        let task = FnTask::new(|| {
            interrupt::sleep(Duration::from_millis(30)).map_err(|_| TaskError::Interrupted)
        })
        .with_timeout(Duration::ZERO)
        .boxed();

        assert_eq!(runner.run_task(task), TaskOutcome::Completed);
    }
}
