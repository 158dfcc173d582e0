//! A processor that dispatches into an elastic pool
//!
//! A single queue consumer thread serves the ring and hands each acquired task
//! to an elastic pool, which grows to its maximum size before queueing. The
//! consumer is started lazily when a key gains work and retires when the ring
//! stays empty. The number of pending tasks (accepted but not yet started)
//! may be capped.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{Builder, JoinHandle},
    time::Duration,
};

use common::types::{task_key::TaskKey, tasks::BoxedTask};
use processor_metrics::{incr_accepted_tasks, incr_rejected_tasks};
use tracing::{debug, error, info, warn};
use util::concurrency::{
    interrupt::{self, InterruptHandle},
    lock,
    pool::{DEFAULT_KEEP_ALIVE, WorkerPool},
};

use crate::{
    error::ProcessorError,
    processor::{Processor, ProcessorServices},
    ring::Slot,
    runner::TaskRunner,
    scheduler::{Admission, TaskScheduler},
};

/// The default time the queue consumer waits for work before retiring
pub const DEFAULT_CONSUMER_WAIT: Duration = Duration::from_secs(60);

/// The sizing of a striped processor
#[derive(Clone, Debug)]
pub struct StripedOptions {
    /// The number of pool threads kept alive while idle
    pub core_threads: usize,
    /// The maximum number of pool threads
    pub max_threads: usize,
    /// The maximum number of pending tasks, `None` for no limit
    pub max_tasks: Option<usize>,
    /// How long a pool thread above the core count may idle
    pub keep_alive: Duration,
    /// How long the queue consumer waits for work before retiring
    pub consumer_wait: Duration,
}

impl StripedOptions {
    /// Options with the given pool sizes and defaults otherwise
    pub fn new(core_threads: usize, max_threads: usize) -> Self {
        Self {
            core_threads,
            max_threads,
            max_tasks: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            consumer_wait: DEFAULT_CONSUMER_WAIT,
        }
    }

    /// Validate the sizes
    fn validate(&self) -> Result<(), ProcessorError> {
        if self.core_threads == 0 {
            return Err(ProcessorError::InvalidConfig(
                "number of core threads must be positive".to_string(),
            ));
        }
        if self.max_threads < self.core_threads {
            return Err(ProcessorError::InvalidConfig(format!(
                "max threads ({}) must not be less than core threads ({})",
                self.max_threads, self.core_threads
            )));
        }

        Ok(())
    }
}

/// A processor with one queue consumer and an elastic pool
pub struct StripedProcessor {
    /// The state shared with the consumer and the pool
    inner: Arc<StripedInner>,
}

impl StripedProcessor {
    /// Create a processor with the given pool sizes and pending task cap
    ///
    /// A cap of `None` or zero disables it
    pub fn new(
        name: &str,
        core_threads: usize,
        max_threads: usize,
        max_tasks: Option<usize>,
    ) -> Result<Self, ProcessorError> {
        let options =
            StripedOptions { max_tasks, ..StripedOptions::new(core_threads, max_threads) };
        Self::with_options(name, options, ProcessorServices::default())
    }

    /// Create a processor from options and services
    pub fn with_options(
        name: &str,
        options: StripedOptions,
        services: ProcessorServices,
    ) -> Result<Self, ProcessorError> {
        options.validate()?;
        let pool = WorkerPool::elastic(
            &format!("{name}-worker"),
            options.core_threads,
            options.max_threads,
            options.keep_alive,
        )?;

        let inner = StripedInner {
            name: name.to_string(),
            pool,
            scheduler: TaskScheduler::new(),
            runner: Arc::new(TaskRunner::new(name, services.watchdog)),
            pending: Arc::new(AtomicUsize::new(0)),
            max_tasks: options.max_tasks.filter(|max| *max > 0),
            consumer_wait: options.consumer_wait,
            consumer: Mutex::new(None),
        };

        info!(
            "started processor {name} with {}-{} threads",
            options.core_threads, options.max_threads
        );
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Whether the queue consumer thread is running
    pub fn consumer_running(&self) -> bool {
        lock(&self.inner.consumer).is_some()
    }
}

impl Processor for StripedProcessor {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn execute(&self, key: Option<TaskKey>, task: BoxedTask) -> bool {
        self.inner.execute(key, task)
    }

    fn stop(&self) {
        self.inner.halt();
    }

    fn stop_when_empty(&self) -> Result<(), ProcessorError> {
        let inner = &self.inner;
        inner.scheduler.mark_stopped();
        // Keys leave the registry only once their last task has finished on
        // the pool
        inner.scheduler.await_drained()?;
        inner.halt();
        Ok(())
    }

    fn num_buffered_tasks(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    fn num_executing_tasks(&self) -> usize {
        self.inner.runner.num_executing()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.pool.await_termination(timeout)
    }
}

impl Drop for StripedProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------
// | Inner |
// ---------

/// The running queue consumer thread
struct ConsumerHandle {
    /// Joins the thread
    join: JoinHandle<()>,
    /// Interrupts the thread
    interrupt: InterruptHandle,
}

/// What the consumer does next
enum ConsumerStep {
    /// Dispatch the acquired task of a key
    Task(TaskKey, BoxedTask),
    /// Wait for more work
    Idle,
    /// Exit
    Stop,
}

/// The state shared between the processor handle, the consumer and the pool
struct StripedInner {
    /// The name of the processor
    name: String,
    /// The elastic pool tasks run on
    pool: WorkerPool,
    /// The registry, ring and lifecycle
    scheduler: TaskScheduler,
    /// Runs the dispatched tasks
    runner: Arc<TaskRunner>,
    /// The number of accepted tasks that have not started
    pending: Arc<AtomicUsize>,
    /// The cap on `pending`
    max_tasks: Option<usize>,
    /// How long the consumer waits for work before retiring
    consumer_wait: Duration,
    /// The consumer thread, `None` while it is not running
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl StripedInner {
    /// Queue a task
    fn execute(self: &Arc<Self>, key: Option<TaskKey>, task: BoxedTask) -> bool {
        if self.scheduler.is_stopped() {
            incr_rejected_tasks(&self.name);
            return false;
        }

        if !self.reserve_pending() {
            debug!("processor {} is at its pending task limit, rejecting task", self.name);
            incr_rejected_tasks(&self.name);
            return false;
        }

        let key = key.unwrap_or_else(TaskKey::current_thread);
        let admission = self.scheduler.submit(key, task);
        if !admission.accepted() {
            release_pending(&self.pending, 1);
            incr_rejected_tasks(&self.name);
            return false;
        }

        if admission == Admission::NewKey {
            self.ensure_consumer();
        }

        incr_accepted_tasks(&self.name);
        true
    }

    /// Count a new pending task, returns `false` if the cap is reached
    fn reserve_pending(&self) -> bool {
        match self.max_tasks {
            None => {
                self.pending.fetch_add(1, Ordering::AcqRel);
                true
            },
            Some(max) => self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
                .is_ok(),
        }
    }

    /// Start the queue consumer unless it is running
    fn ensure_consumer(self: &Arc<Self>) {
        let mut consumer = lock(&self.consumer);
        if consumer.is_some() || self.scheduler.is_halted() {
            return;
        }

        let inner = self.clone();
        let builder = Builder::new().name(format!("{}-queue-consumer", self.name));
        match interrupt::spawn(builder, move || inner.run_consumer()) {
            Ok((join, interrupt)) => *consumer = Some(ConsumerHandle { join, interrupt }),
            Err(e) => error!("processor {} could not start its queue consumer: {e}", self.name),
        }
    }

    /// The consumer loop
    fn run_consumer(self: Arc<Self>) {
        debug!("queue consumer of processor {} started", self.name);
        loop {
            match self.await_processor_task() {
                ConsumerStep::Task(key, task) => self.dispatch(key, task),
                ConsumerStep::Idle => {},
                ConsumerStep::Stop => break,
            }
        }
        debug!("queue consumer of processor {} exited", self.name);
    }

    /// Wait for the next task to dispatch
    fn await_processor_task(&self) -> ConsumerStep {
        match self.scheduler.ring().poll(self.consumer_wait) {
            Err(_) | Ok(Some(Slot::Poison)) => return ConsumerStep::Stop,
            Ok(Some(Slot::Ready(key))) => {
                if let Some(task) = self.scheduler.acquire_next(&key) {
                    return ConsumerStep::Task(key, task);
                }
            },
            Ok(None) => {},
        }

        // Retire while holding the consumer lock; a submission or completion
        // that pushes a key after the emptiness check finds no consumer and
        // starts one
        let mut consumer = lock(&self.consumer);
        if self.scheduler.ring().is_empty() {
            consumer.take();
            return ConsumerStep::Stop;
        }

        ConsumerStep::Idle
    }

    /// Hand a task to the pool
    ///
    /// The key rejoins the ring only once the task has finished, so tasks of
    /// one key never run concurrently
    fn dispatch(self: &Arc<Self>, key: TaskKey, task: BoxedTask) {
        let inner = self.clone();
        let pending = PendingTask::new(self.pending.clone());
        let res = self.pool.execute(move || {
            drop(pending);
            inner.runner.run_task(task);
            inner.complete(&key);
        });

        if let Err(e) = res {
            warn!("processor {} dropped a task: {e}", self.name);
        }
    }

    /// Finish the in-flight task of a key, restarting the consumer if the key
    /// has more work
    fn complete(self: &Arc<Self>, key: &TaskKey) {
        if self.scheduler.complete(key) {
            self.ensure_consumer();
        }
    }

    /// Tear the processor down
    ///
    /// The consumer is poisoned, interrupted and joined; pool threads running
    /// tasks are interrupted and queued tasks are discarded
    fn halt(&self) {
        self.scheduler.mark_stopped();
        if !self.scheduler.mark_halted() {
            return;
        }

        self.scheduler.poison(1);
        let consumer = lock(&self.consumer).take();
        if let Some(consumer) = consumer {
            consumer.interrupt.interrupt();
            if consumer.join.join().is_err() {
                error!("queue consumer of processor {} panicked", self.name);
            }
        }

        // Discarded jobs release their pending count as they are dropped
        let discarded = self.pool.shutdown_now();
        info!("stopped processor {}, discarded {discarded} dispatched tasks", self.name);
    }
}

/// A dispatched task that has not started yet
///
/// Releases its pending count when dropped, whether the task starts or its
/// job is discarded by the pool
struct PendingTask {
    /// The pending counter of the processor
    pending: Arc<AtomicUsize>,
}

impl PendingTask {
    /// Track a dispatched task
    fn new(pending: Arc<AtomicUsize>) -> Self {
        Self { pending }
    }
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        release_pending(&self.pending, 1);
    }
}

/// Decrement the pending counter without wrapping below zero
fn release_pending(pending: &AtomicUsize, n: usize) {
    let _ =
        pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(n)));
}
