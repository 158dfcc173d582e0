//! A worker pool that grows from a core to a maximum number of threads
//!
//! A submitted job prefers a fresh thread over waiting in the queue until the
//! pool reaches its maximum size; only then are jobs queued. Threads above the
//! core count retire after sitting idle for the keep-alive duration. A fixed
//! pool is one whose core and maximum sizes are equal.

use std::{
    collections::HashMap,
    panic,
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::Builder,
    time::{Duration, Instant},
};

use crossbeam::{
    channel::{Receiver, Sender, unbounded},
    select,
};
use thiserror::Error;
use tracing::{debug, error};

use crate::err_str;

use super::{
    Job,
    interrupt::{self, InterruptHandle},
    lock, panic_message,
};

/// The default time a thread above the core count may idle before retiring
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// The error type emitted by the worker pool
#[derive(Clone, Debug, Error)]
pub enum PoolError {
    /// The pool was configured with invalid sizes
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    /// The pool has been shut down and accepts no more jobs
    #[error("pool {0} is shut down")]
    ShutDown(String),
    /// A worker thread could not be spawned
    #[error("error spawning pool thread: {0}")]
    Spawn(String),
}

/// A pool of worker threads
///
/// Dropping the pool shuts it down immediately
pub struct WorkerPool {
    /// The state shared with the worker threads
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with a fixed number of threads, all started eagerly
    pub fn fixed(name: &str, num_threads: usize) -> Result<Self, PoolError> {
        let pool = Self::new(name, num_threads, num_threads, DEFAULT_KEEP_ALIVE)?;
        pool.prestart_core_threads()?;
        Ok(pool)
    }

    /// Create a pool that grows from `core_threads` up to `max_threads`
    ///
    /// Threads are started lazily as jobs arrive
    pub fn elastic(
        name: &str,
        core_threads: usize,
        max_threads: usize,
        keep_alive: Duration,
    ) -> Result<Self, PoolError> {
        Self::new(name, core_threads, max_threads, keep_alive)
    }

    /// Validate the sizes and build the pool without starting threads
    fn new(
        name: &str,
        core_threads: usize,
        max_threads: usize,
        keep_alive: Duration,
    ) -> Result<Self, PoolError> {
        if core_threads == 0 {
            return Err(PoolError::InvalidConfig("core threads must be positive".to_string()));
        }
        if max_threads < core_threads {
            return Err(PoolError::InvalidConfig(format!(
                "max threads ({max_threads}) must not be less than core threads ({core_threads})"
            )));
        }

        let (job_queue, job_receiver) = unbounded();
        let (shutdown_signal, shutdown_receiver) = unbounded();
        let inner = PoolInner {
            name: name.to_string(),
            core_threads,
            max_threads,
            keep_alive,
            job_queue,
            job_receiver,
            shutdown: AtomicBool::new(false),
            shutdown_signal: Mutex::new(Some(shutdown_signal)),
            shutdown_receiver,
            state: Mutex::new(PoolState::default()),
            terminated: Condvar::new(),
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Start threads until the pool has its core number of threads
    pub fn prestart_core_threads(&self) -> Result<(), PoolError> {
        let mut state = lock(&self.inner.state);
        while state.live < self.inner.core_threads {
            self.inner.spawn_worker(&mut state, None /* first_job */)?;
        }

        Ok(())
    }

    /// Submit a job for execution
    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(Box::new(job))
    }

    /// Stop the pool immediately
    ///
    /// Queued jobs are discarded and every worker thread is interrupted;
    /// jobs already running finish on their own terms. Returns the number of
    /// jobs discarded from the queue. A worker may also drop a job it took off
    /// the queue as the shutdown raced it, so a job that owns resources should
    /// release them when dropped rather than rely on this count
    pub fn shutdown_now(&self) -> usize {
        self.inner.shutdown_now()
    }

    /// Block until every worker thread has exited or the timeout elapses
    ///
    /// Returns whether the pool terminated
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        while state.live > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            state = self
                .inner
                .terminated
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| PoisonError::into_inner(e).0);
        }

        true
    }

    // -----------
    // | Getters |
    // -----------

    /// The name of the pool
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the pool has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// The number of live worker threads
    pub fn live_threads(&self) -> usize {
        lock(&self.inner.state).live
    }

    /// The number of jobs waiting for a thread
    pub fn queued_jobs(&self) -> usize {
        self.inner.job_receiver.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.inner.is_shutdown() {
            self.inner.shutdown_now();
        }
    }
}

// --------------
// | Pool Inner |
// --------------

/// The bookkeeping of the pool's threads
#[derive(Default)]
struct PoolState {
    /// The number of live worker threads
    live: usize,
    /// The number of threads waiting for a job
    idle: usize,
    /// The id to assign the next worker thread
    next_id: usize,
    /// Interrupt handles of the live worker threads, by id
    workers: HashMap<usize, InterruptHandle>,
}

/// The outcome of waiting for a job
enum Poll {
    /// A job was received
    Job(Job),
    /// The pool is shutting down
    Shutdown,
    /// No job arrived within the keep-alive
    Idle,
}

/// The state shared between the pool handle and its workers
struct PoolInner {
    /// The name of the pool, used to name threads
    name: String,
    /// The number of threads kept alive while idle
    core_threads: usize,
    /// The maximum number of threads
    max_threads: usize,
    /// How long a thread above the core count may idle
    keep_alive: Duration,
    /// The queue of jobs waiting for a thread
    job_queue: Sender<Job>,
    /// The receiving end of the job queue, shared by all workers
    job_receiver: Receiver<Job>,
    /// Whether the pool has been shut down
    shutdown: AtomicBool,
    /// Dropped on shutdown to wake idle workers
    shutdown_signal: Mutex<Option<Sender<()>>>,
    /// Disconnects when the pool shuts down
    shutdown_receiver: Receiver<()>,
    /// The thread bookkeeping
    state: Mutex<PoolState>,
    /// Signalled when the last worker exits
    terminated: Condvar,
}

impl PoolInner {
    /// Whether the pool has been shut down
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Hand a job to a new thread or queue it
    fn execute(self: &Arc<Self>, job: Job) -> Result<(), PoolError> {
        if self.is_shutdown() {
            return Err(PoolError::ShutDown(self.name.clone()));
        }

        let mut state = lock(&self.state);
        let grow = state.live < self.core_threads
            || (state.idle == 0 && state.live < self.max_threads);
        if grow {
            return self.spawn_worker(&mut state, Some(job));
        }
        drop(state);

        self.job_queue.send(job).map_err(|_| PoolError::ShutDown(self.name.clone()))?;

        // A shutdown racing the send must not leave the job stranded in the
        // queue
        if self.is_shutdown() {
            self.job_receiver.try_iter().for_each(drop);
            return Err(PoolError::ShutDown(self.name.clone()));
        }

        Ok(())
    }

    /// Spawn a worker thread, optionally with a first job to run
    fn spawn_worker(
        self: &Arc<Self>,
        state: &mut PoolState,
        first_job: Option<Job>,
    ) -> Result<(), PoolError> {
        let id = state.next_id;
        state.next_id += 1;

        let inner = self.clone();
        let builder = Builder::new().name(format!("{}-{id}", self.name));
        let (_join, handle) = interrupt::spawn(builder, move || inner.worker_loop(id, first_job))
            .map_err(err_str!(PoolError::Spawn))?;

        state.live += 1;
        state.workers.insert(id, handle);
        Ok(())
    }

    /// The main loop of a worker thread
    fn worker_loop(self: Arc<Self>, id: usize, first_job: Option<Job>) {
        let mut next = first_job;
        loop {
            let job = match next.take() {
                Some(job) => job,
                None => match self.next_job(id) {
                    Some(job) => job,
                    // The worker was already deregistered
                    None => return,
                },
            };

            if self.is_shutdown() {
                debug!("pool {} shut down, dropping a job without running it", self.name);
                drop(job);
                break;
            }

            if let Err(panic) = panic::catch_unwind(panic::AssertUnwindSafe(job)) {
                error!("job panicked in pool {}: {}", self.name, panic_message(panic.as_ref()));
            }

            // Interrupts aimed at a finished job do not carry over to the next
            interrupt::interrupted();
        }

        self.deregister(&mut lock(&self.state), id);
    }

    /// Wait for the next job
    ///
    /// Returns `None` if the worker should exit, in which case it has been
    /// deregistered
    fn next_job(&self, id: usize) -> Option<Job> {
        loop {
            if self.is_shutdown() {
                self.deregister(&mut lock(&self.state), id);
                return None;
            }

            lock(&self.state).idle += 1;
            let poll = select! {
                recv(self.job_receiver) -> job => job.map(Poll::Job).unwrap_or(Poll::Shutdown),
                recv(self.shutdown_receiver) -> _ => Poll::Shutdown,
                default(self.keep_alive) => Poll::Idle,
            };

            let mut state = lock(&self.state);
            state.idle -= 1;
            match poll {
                Poll::Job(job) => return Some(job),
                Poll::Shutdown => {
                    self.deregister(&mut state, id);
                    return None;
                },
                Poll::Idle if state.live > self.core_threads => {
                    debug!("retiring idle thread {id} of pool {}", self.name);
                    self.deregister(&mut state, id);
                    return None;
                },
                Poll::Idle => {},
            }
        }
    }

    /// Remove a worker from the bookkeeping
    fn deregister(&self, state: &mut PoolState, id: usize) {
        state.live -= 1;
        state.workers.remove(&id);
        if state.live == 0 {
            self.terminated.notify_all();
        }
    }

    /// Stop the pool, discarding queued jobs and interrupting workers
    fn shutdown_now(&self) -> usize {
        self.shutdown.store(true, Ordering::Release);
        lock(&self.shutdown_signal).take();

        let discarded = self.job_receiver.try_iter().count();
        for worker in lock(&self.state).workers.values() {
            worker.interrupt();
        }

        debug!("pool {} shut down, discarded {discarded} queued jobs", self.name);
        discarded
    }
}
