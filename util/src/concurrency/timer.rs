//! A timer thread that runs jobs after a delay
//!
//! Jobs run on the timer thread itself and must be short; a job that needs to
//! do real work should hand it off to a pool.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    io, panic,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::Builder,
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use lazy_static::lazy_static;
use tracing::{debug, error};

use super::{Job, panic_message};

lazy_static! {
    /// The timer shared by components that are not given one explicitly
    static ref GLOBAL_TIMER: Option<Timer> = match Timer::new("global") {
        Ok(timer) => Some(timer),
        Err(e) => {
            error!("error spawning global timer thread: {e}");
            None
        },
    };
}

/// A message to the timer thread
enum TimerCommand {
    /// Run a job at the given deadline
    Schedule {
        /// The id of the scheduled job
        id: u64,
        /// The instant at which to run the job
        deadline: Instant,
        /// The job
        job: Job,
    },
    /// Drop a scheduled job without running it
    Cancel(u64),
}

/// A handle on a timer thread
///
/// Clones share the same thread; the thread exits once every clone and every
/// outstanding [`TimerHandle`] has been dropped
#[derive(Clone)]
pub struct Timer {
    /// The name of the timer, used for the thread name
    name: Arc<str>,
    /// The queue to the timer thread
    commands: Sender<TimerCommand>,
    /// The id to assign to the next scheduled job
    next_id: Arc<AtomicU64>,
}

impl Timer {
    /// Spawn a new timer thread
    pub fn new(name: &str) -> io::Result<Self> {
        let (commands, receiver) = unbounded();
        Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || TimerLoop::default().run(&receiver))?;

        Ok(Self { name: Arc::from(name), commands, next_id: Arc::new(AtomicU64::new(0)) })
    }

    /// The process wide timer, if its thread could be spawned
    pub fn global() -> Option<Timer> {
        GLOBAL_TIMER.clone()
    }

    /// The name of the timer
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `job` on the timer thread once `delay` has elapsed
    ///
    /// Returns a handle that may cancel the job before it runs. Dropping the
    /// handle does not cancel the job
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        if self.commands.send(TimerCommand::Schedule { id, deadline, job: Box::new(job) }).is_err()
        {
            error!("timer {} has exited, dropping scheduled job", self.name);
        }

        TimerHandle { id, commands: self.commands.clone() }
    }
}

/// A handle on a scheduled job
#[derive(Debug)]
pub struct TimerHandle {
    /// The id of the job
    id: u64,
    /// The queue to the timer thread
    commands: Sender<TimerCommand>,
}

impl TimerHandle {
    /// Cancel the job if it has not run yet
    pub fn cancel(self) {
        // The timer thread outlives every sender, so the send cannot fail
        let _ = self.commands.send(TimerCommand::Cancel(self.id));
    }
}

// --------------
// | Timer Loop |
// --------------

/// The state owned by the timer thread
#[derive(Default)]
struct TimerLoop {
    /// Deadlines of scheduled jobs, earliest first
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    /// The jobs that have not run or been cancelled
    jobs: HashMap<u64, Job>,
}

impl TimerLoop {
    /// Process commands and fire due jobs until every sender is dropped
    fn run(mut self, commands: &Receiver<TimerCommand>) {
        loop {
            let next = match self.deadlines.peek() {
                Some(Reverse((deadline, _))) => commands.recv_deadline(*deadline),
                None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match next {
                Ok(TimerCommand::Schedule { id, deadline, job }) => {
                    self.deadlines.push(Reverse((deadline, id)));
                    self.jobs.insert(id, job);
                },
                Ok(TimerCommand::Cancel(id)) => {
                    self.jobs.remove(&id);
                },
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("timer queue closed, exiting");
                    return;
                },
            }

            self.fire_due();
        }
    }

    /// Run every job whose deadline has passed
    fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }

            self.deadlines.pop();
            // Cancelled jobs leave their deadline behind
            if let Some(job) = self.jobs.remove(&id) {
                if let Err(panic) = panic::catch_unwind(panic::AssertUnwindSafe(job)) {
                    error!("timer job panicked: {}", panic_message(panic.as_ref()));
                }
            }
        }
    }
}
