//! A processor whose threads serve the ring themselves
//!
//! Every thread of a fixed pool runs a selector: it takes a key off the ring,
//! acquires the key's next task and runs it, then goes back to the ring. A
//! selector whose task leaves it interrupted retires and is replaced after a
//! short delay so that a stuck or misbehaving task cannot permanently shrink
//! the pool.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::types::{task_key::TaskKey, tasks::BoxedTask};
use processor_metrics::{incr_accepted_tasks, incr_rejected_tasks, incr_replaced_selectors};
use tracing::{debug, info, warn};
use util::concurrency::{pool::WorkerPool, timer::Timer};

use crate::{
    error::ProcessorError,
    processor::{Processor, ProcessorServices},
    ring::Slot,
    runner::{TaskOutcome, TaskRunner},
    scheduler::TaskScheduler,
};

/// The delay before an interrupted selector is replaced
pub const DEFAULT_SELECTOR_RESTART_DELAY: Duration = Duration::from_millis(250);

/// A processor running one selector per thread of a fixed pool
pub struct RoundRobinProcessor {
    /// The state shared with the selectors
    inner: Arc<RoundRobinInner>,
}

impl RoundRobinProcessor {
    /// Create a processor with `num_threads` selectors
    pub fn new(name: &str, num_threads: usize) -> Result<Self, ProcessorError> {
        Self::with_options(
            name,
            num_threads,
            DEFAULT_SELECTOR_RESTART_DELAY,
            ProcessorServices::default(),
        )
    }

    /// Create a processor with a custom selector restart delay and services
    pub fn with_options(
        name: &str,
        num_threads: usize,
        selector_restart_delay: Duration,
        services: ProcessorServices,
    ) -> Result<Self, ProcessorError> {
        if num_threads == 0 {
            return Err(ProcessorError::InvalidConfig(
                "number of threads must be positive".to_string(),
            ));
        }

        let pool = WorkerPool::fixed(&format!("{name}-selector"), num_threads)?;
        let inner = Arc::new(RoundRobinInner {
            name: name.to_string(),
            num_threads,
            pool,
            scheduler: TaskScheduler::new(),
            runner: TaskRunner::new(name, services.watchdog),
            active_selectors: AtomicUsize::new(0),
            timer: services.timer,
            selector_restart_delay,
        });

        for _ in 0..num_threads {
            inner.start_selector_if_needed()?;
        }

        info!("started processor {name} with {num_threads} selectors");
        Ok(Self { inner })
    }

    /// The number of selectors running at the moment
    pub fn num_selectors(&self) -> usize {
        self.inner.active_selectors.load(Ordering::Acquire)
    }
}

impl Processor for RoundRobinProcessor {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn execute(&self, key: Option<TaskKey>, task: BoxedTask) -> bool {
        self.inner.execute(key, task)
    }

    fn stop(&self) {
        self.inner.scheduler.mark_stopped();
        self.inner.halt();
    }

    fn stop_when_empty(&self) -> Result<(), ProcessorError> {
        self.inner.scheduler.mark_stopped();
        self.inner.scheduler.await_drained()?;
        self.inner.halt();
        Ok(())
    }

    fn num_buffered_tasks(&self) -> usize {
        self.inner.scheduler.buffered_tasks()
    }

    fn num_executing_tasks(&self) -> usize {
        self.inner.runner.num_executing()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.pool.await_termination(timeout)
    }
}

impl Drop for RoundRobinProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------
// | Inner |
// ---------

/// The state shared between the processor handle and its selectors
struct RoundRobinInner {
    /// The name of the processor
    name: String,
    /// The number of selectors to keep running
    num_threads: usize,
    /// The fixed pool the selectors run on
    pool: WorkerPool,
    /// The registry, ring and lifecycle
    scheduler: TaskScheduler,
    /// Runs the acquired tasks
    runner: TaskRunner,
    /// The number of selectors started and not yet exited
    active_selectors: AtomicUsize,
    /// Schedules selector replacements
    timer: Option<Timer>,
    /// The delay before an interrupted selector is replaced
    selector_restart_delay: Duration,
}

impl RoundRobinInner {
    /// Queue a task
    fn execute(self: &Arc<Self>, key: Option<TaskKey>, task: BoxedTask) -> bool {
        if self.scheduler.is_stopped() {
            incr_rejected_tasks(&self.name);
            return false;
        }

        if let Err(e) = self.start_selector_if_needed() {
            warn!("processor {} could not start a selector: {e}", self.name);
        }

        let key = key.unwrap_or_else(TaskKey::current_thread);
        let accepted = self.scheduler.submit(key, task).accepted();
        if accepted {
            incr_accepted_tasks(&self.name);
        } else {
            incr_rejected_tasks(&self.name);
        }

        accepted
    }

    /// Start a selector if fewer than `num_threads` are running
    ///
    /// Returns whether a selector was started
    fn start_selector_if_needed(self: &Arc<Self>) -> Result<bool, ProcessorError> {
        let reserved =
            self.active_selectors.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.num_threads).then_some(n + 1)
            });
        if reserved.is_err() {
            return Ok(false);
        }

        let inner = self.clone();
        if let Err(e) = self.pool.execute(move || inner.run_selector()) {
            self.active_selectors.fetch_sub(1, Ordering::AcqRel);
            return Err(e.into());
        }

        Ok(true)
    }

    /// The selector loop
    fn run_selector(self: Arc<Self>) {
        debug!("selector started in processor {}", self.name);
        let replace = self.serve_ring();
        self.active_selectors.fetch_sub(1, Ordering::AcqRel);

        if replace {
            self.schedule_replacement();
        }
    }

    /// Serve the ring until poisoned or interrupted
    ///
    /// Returns whether the selector should be replaced
    fn serve_ring(&self) -> bool {
        loop {
            let key = match self.scheduler.ring().take() {
                Ok(Slot::Ready(key)) => key,
                Ok(Slot::Poison) => {
                    debug!("selector in processor {} poisoned, exiting", self.name);
                    return false;
                },
                Err(_) => {
                    debug!("selector in processor {} interrupted while idle, exiting", self.name);
                    return false;
                },
            };

            let Some(task) = self.scheduler.acquire_next(&key) else { continue };
            let outcome = self.runner.run_task(task);
            self.scheduler.complete(&key);
            if outcome == TaskOutcome::Interrupted {
                return !self.scheduler.is_stopped();
            }
        }
    }

    /// Start a new selector after the restart delay
    fn schedule_replacement(self: &Arc<Self>) {
        info!(
            "selector in processor {} was interrupted, replacing it in {:?}",
            self.name, self.selector_restart_delay
        );
        incr_replaced_selectors(&self.name);

        let Some(timer) = &self.timer else {
            self.restart_selector();
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        timer.schedule(self.selector_restart_delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.restart_selector();
            }
        });
    }

    /// Start a replacement selector unless the processor has stopped
    fn restart_selector(self: &Arc<Self>) {
        if self.scheduler.is_stopped() {
            return;
        }

        if let Err(e) = self.start_selector_if_needed() {
            warn!("processor {} could not replace a selector: {e}", self.name);
        }
    }

    /// Tear the processor down
    ///
    /// Idle selectors exit on the poison slots, busy ones are interrupted
    fn halt(&self) {
        if !self.scheduler.mark_halted() {
            return;
        }

        self.scheduler.poison(self.num_threads);
        self.pool.shutdown_now();
        info!(
            "stopped processor {} with {} tasks left unprocessed",
            self.name,
            self.scheduler.buffered_tasks()
        );
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashSet,
        sync::{
            Arc, Barrier, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use common::types::{
        log_context::LogContext,
        tasks::{FnTask, TaskError, task_fn},
    };
    use crossbeam::channel::unbounded;
    use rand::{Rng, thread_rng};
    use util::concurrency::interrupt;

    use super::RoundRobinProcessor;
    use crate::{
        Processor, TaskKey,
        test_helpers::{eventually, test_services},
    };

    /// The time to wait for expected events in tests
    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Build a processor with a short selector restart delay
    fn processor(num_threads: usize) -> RoundRobinProcessor {
        RoundRobinProcessor::with_options(
            "round-robin-test",
            num_threads,
            Duration::from_millis(20),
            test_services("round-robin-test"),
        )
        .unwrap()
    }

    /// Drain the processor and wait for its threads to exit
    fn drain(processor: &RoundRobinProcessor) {
        processor.stop_when_empty().unwrap();
        assert!(processor.await_termination(TEST_TIMEOUT));
    }

    /// Tests that a zero sized pool is refused
    #[test]
    fn test_zero_threads() {
        assert!(RoundRobinProcessor::new("zero", 0).is_err());
    }

    /// Tests that tasks under one key run in submission order, one at a time
    #[test]
    fn test_fifo_per_key() {
        let processor = processor(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let mut rng = thread_rng();
        for i in 0..50 {
            let (log, running, overlapped) = (log.clone(), running.clone(), overlapped.clone());
            let sleep = Duration::from_micros(rng.gen_range(0..500));
            let task = task_fn(move || {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(sleep);
                log.lock().unwrap().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
            });
            assert!(processor.execute(Some(TaskKey::from("key")), task));
        }

        drain(&processor);
        assert_eq!(*log.lock().unwrap(), (0..50).collect::<Vec<_>>());
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    /// Tests that a single thread alternates between keys one task per visit
    #[test]
    fn test_fairness_single_thread() {
        let processor = processor(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        // Hold the only selector so that every key is queued before serving
        let (release_send, release_recv) = unbounded::<()>();
        let (started_send, started_recv) = unbounded();
        processor.execute(
            Some(TaskKey::from("gate")),
            task_fn(move || {
                started_send.send(()).unwrap();
                let _ = release_recv.recv();
            }),
        );
        started_recv.recv_timeout(TEST_TIMEOUT).unwrap();

        for (key, count) in [("a", 3), ("b", 1), ("c", 2)] {
            for i in 1..=count {
                let log = log.clone();
                let label = format!("{key}{i}");
                processor.execute(Some(TaskKey::from(key)), task_fn(move || {
                    log.lock().unwrap().push(label);
                }));
            }
        }
        drop(release_send);

        drain(&processor);
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "c1", "a2", "c2", "a3"]);
    }

    /// Tests the ordered index scenario with two threads
    #[test]
    fn test_ordered_indices() {
        let processor = processor(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = TaskKey::ordered(7u32);

        for i in 0..5 {
            let log = log.clone();
            processor.execute(Some(key.clone()), task_fn(move || log.lock().unwrap().push(i)));
        }

        drain(&processor);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    /// Tests that 100 keys submitted from 100 threads all execute exactly once
    #[test]
    fn test_many_keys_many_threads() {
        let processor = Arc::new(processor(8));
        let executed = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(100));

        let submitters: Vec<_> = (0..100u64)
            .map(|i| {
                let (processor, executed, barrier) =
                    (processor.clone(), executed.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    processor.execute(Some(TaskKey::from(i)), task_fn(move || {
                        executed.lock().unwrap().push(i);
                    }))
                })
            })
            .collect();
        for submitter in submitters {
            assert!(submitter.join().unwrap());
        }

        drain(&processor);
        let mut executed = executed.lock().unwrap().clone();
        executed.sort_unstable();
        assert_eq!(executed, (0..100).collect::<Vec<_>>());
    }

    /// Tests that tasks submitted without a key from different threads run
    /// concurrently
    #[test]
    fn test_default_keys_concurrent() {
        let processor = Arc::new(processor(3));
        // Every task waits for the other two, which only succeeds if all three
        // run at once
        let rendezvous = Arc::new(Barrier::new(3));
        let (done_send, done_recv) = unbounded();

        let submitters: Vec<_> = (0..3)
            .map(|_| {
                let (processor, rendezvous, done_send) =
                    (processor.clone(), rendezvous.clone(), done_send.clone());
                thread::spawn(move || {
                    processor.execute(None, task_fn(move || {
                        rendezvous.wait();
                        done_send.send(thread::current().name().map(String::from)).unwrap();
                    }))
                })
            })
            .collect();
        for submitter in submitters {
            assert!(submitter.join().unwrap());
        }

        let threads: HashSet<_> =
            (0..3).map(|_| done_recv.recv_timeout(TEST_TIMEOUT).unwrap()).collect();
        assert_eq!(threads.len(), 3);
        drain(&processor);
    }

    /// Tests that no task is dispatched twice across concurrent selectors
    #[test]
    fn test_no_double_dispatch() {
        let processor = processor(4);
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..400).map(|_| AtomicUsize::new(0)).collect());

        for i in 0..400usize {
            let counts = counts.clone();
            let key = TaskKey::from(i % 10);
            processor.execute(Some(key), task_fn(move || {
                counts[i].fetch_add(1, Ordering::SeqCst);
            }));
        }

        drain(&processor);
        assert!(counts.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    }

    /// Tests that the processor is empty and rejects tasks after draining
    #[test]
    fn test_drained_then_rejects() {
        let processor = processor(2);
        for i in 0..20u64 {
            processor.execute(Some(TaskKey::from(i % 3)), task_fn(|| {
                thread::sleep(Duration::from_millis(1));
            }));
        }

        processor.stop_when_empty().unwrap();
        assert_eq!(processor.num_buffered_tasks(), 0);
        assert!(!processor.execute(Some(TaskKey::from(1u64)), task_fn(|| {})));
        assert!(processor.await_termination(TEST_TIMEOUT));
        assert_eq!(processor.num_executing_tasks(), 0);
    }

    /// Tests that tasks are rejected after a forced stop and stop is
    /// idempotent
    #[test]
    fn test_stop() {
        let processor = processor(2);
        processor.stop();
        processor.stop();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let accepted = processor.execute(None, task_fn(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!accepted);
        assert_eq!(processor.num_buffered_tasks(), 0);
        assert!(processor.await_termination(TEST_TIMEOUT));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    /// Tests that a failing or panicking task does not take its selector down
    #[test]
    fn test_failure_isolation() {
        let processor = processor(1);
        let (send, recv) = unbounded();

        processor.execute(None, FnTask::new(|| Err(TaskError::failed("boom"))).boxed());
        processor.execute(None, task_fn(|| panic!("task panic")));
        processor.execute(None, task_fn(move || send.send(()).unwrap()));

        recv.recv_timeout(TEST_TIMEOUT).unwrap();
        assert_eq!(processor.num_selectors(), 1);
        drain(&processor);
    }

    /// Tests that a selector whose task times out is replaced
    #[test]
    fn test_timed_out_selector_replaced() {
        let processor = processor(1);
        let (send, recv) = unbounded();

        let timed_out_send = send.clone();
        let task = FnTask::new(move || {
            let res = interrupt::sleep(Duration::from_secs(30));
            timed_out_send.send("timed out").unwrap();
            res.map_err(|_| TaskError::Interrupted)
        })
        .with_timeout(Duration::from_millis(20))
        .boxed();
        processor.execute(Some(TaskKey::from("slow")), task);
        assert_eq!(recv.recv_timeout(TEST_TIMEOUT).unwrap(), "timed out");

        // The replacement is started by the timer, not by a new submission
        thread::sleep(Duration::from_millis(200));
        assert_eq!(processor.num_selectors(), 1);
        processor.execute(Some(TaskKey::from("fast")), task_fn(move || send.send("ran").unwrap()));
        assert_eq!(recv.recv_timeout(TEST_TIMEOUT).unwrap(), "ran");
        drain(&processor);
    }

    /// Tests that the submitter's logging context follows the task
    #[test]
    fn test_log_context_propagated() {
        let processor = processor(2);
        let (send, recv) = unbounded();

        let task = {
            let _guard = LogContext::new().with("tenant", "acme").enter();
            FnTask::new(move || {
                send.send(LogContext::current().get("tenant").map(String::from)).unwrap();
                Ok(())
            })
            .with_current_log_context()
            .boxed()
        };
        processor.execute(None, task);

        assert_eq!(recv.recv_timeout(TEST_TIMEOUT).unwrap().as_deref(), Some("acme"));
        drain(&processor);
    }

    /// Tests that the executing count reflects running tasks
    #[test]
    fn test_executing_count() {
        let processor = processor(2);
        let (release_send, release_recv) = unbounded::<()>();

        for key in ["a", "b"] {
            let release_recv = release_recv.clone();
            processor.execute(Some(TaskKey::from(key)), task_fn(move || {
                let _ = release_recv.recv();
            }));
        }

        assert!(eventually(TEST_TIMEOUT, || processor.num_executing_tasks() == 2));
        drop(release_send);
        drain(&processor);
        assert_eq!(processor.num_executing_tasks(), 0);
    }
}
