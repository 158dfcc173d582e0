//! The scheduling core shared by both processors
//!
//! The scheduler owns the registry of task managers, the ring of keys with
//! ready work and the processor's lifecycle flags. The processors only differ
//! in how they pull keys off the ring and where they run the acquired tasks.
//!
//! A key is in the ring iff its manager is registered, non-empty and has no
//! task in flight, and it is never in the ring twice. A key whose task is
//! running stays registered and off the ring until the task completes, so
//! tasks of one key never overlap. Every ring push happens while holding the
//! registry lock so that the decision to deregister or re-enqueue a manager is
//! atomic with respect to submissions.

use std::{
    collections::HashMap,
    sync::{
        Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use common::types::{task_key::TaskKey, tasks::BoxedTask};
use util::concurrency::{
    interrupt::{self, Interrupted},
    lock,
};

use crate::{
    ring::{Ring, Slot},
    task_manager::{DefaultTaskManager, ManagerFactory, TaskManager},
};

/// The interval at which a thread waiting for the registry to drain checks its
/// interrupt flag and the halt flag
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The outcome of submitting a task to the scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The scheduler is stopped, the task was dropped
    Rejected,
    /// The task was queued behind other tasks of its key
    Queued,
    /// The task was the first of its key, a new slot was pushed onto the ring
    NewKey,
}

impl Admission {
    /// Whether the task was accepted
    pub fn accepted(self) -> bool {
        self != Admission::Rejected
    }
}

/// A registered task manager
struct Registration {
    /// The queued tasks of the key
    manager: Box<dyn TaskManager>,
    /// Whether a task of the key has been acquired and not yet completed
    in_flight: bool,
}

/// The registry, ring and lifecycle of a processor
pub struct TaskScheduler {
    /// The live managers by key
    registry: Mutex<HashMap<TaskKey, Registration>>,
    /// Signalled when the registry becomes empty
    drained: Condvar,
    /// The keys with ready work
    ring: Ring,
    /// Builds managers for new keys
    manager_factory: ManagerFactory,
    /// Set once the processor stops accepting tasks
    stopped: AtomicBool,
    /// Set once the processor has been torn down
    halted: AtomicBool,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    /// Create a scheduler with FIFO task managers
    pub fn new() -> Self {
        Self::with_manager_factory(Box::new(DefaultTaskManager::boxed))
    }

    /// Create a scheduler that builds its task managers with the given
    /// factory
    pub fn with_manager_factory(manager_factory: ManagerFactory) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            ring: Ring::new(),
            manager_factory,
            stopped: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }

    // --------------
    // | Submission |
    // --------------

    /// Queue a task under its key
    ///
    /// The stop flag is checked under the registry lock, so a submission that
    /// races a stop either lands before the drain wait observes the registry
    /// or is rejected
    pub fn submit(&self, key: TaskKey, task: BoxedTask) -> Admission {
        let mut registry = lock(&self.registry);
        if self.is_stopped() {
            return Admission::Rejected;
        }

        // A registered key is either in the ring already or in flight, in
        // which case completing its task re-enqueues it
        if let Some(registration) = registry.get_mut(&key) {
            registration.manager.add(task);
            return Admission::Queued;
        }

        let mut manager = (self.manager_factory)(key.clone());
        manager.add(task);
        registry.insert(key.clone(), Registration { manager, in_flight: false });
        self.ring.push_back(Slot::Ready(key));

        Admission::NewKey
    }

    /// Take the next task of the key popped off the ring
    ///
    /// The key stays registered and off the ring until [`Self::complete`] is
    /// called for it. Returns `None` if the key has no live manager or a task
    /// of the key is already in flight
    pub fn acquire_next(&self, key: &TaskKey) -> Option<BoxedTask> {
        let mut registry = lock(&self.registry);
        let registration = registry.get_mut(key)?;
        if registration.in_flight {
            return None;
        }

        match registration.manager.remove() {
            Some(task) => {
                registration.in_flight = true;
                Some(task)
            },
            None => {
                self.deregister(&mut registry, key);
                None
            },
        }
    }

    /// Mark the in-flight task of a key as finished
    ///
    /// A manager left empty is deregistered, otherwise its key goes back to
    /// the tail of the ring so that other keys are served first. Returns
    /// whether the key was pushed onto the ring
    pub fn complete(&self, key: &TaskKey) -> bool {
        let mut registry = lock(&self.registry);
        let Some(registration) = registry.get_mut(key) else { return false };
        registration.in_flight = false;

        if registration.manager.is_empty() {
            self.deregister(&mut registry, key);
            return false;
        }

        self.ring.push_back(Slot::Ready(key.clone()));
        true
    }

    /// Remove a manager from the registry, waking drain waiters if it was the
    /// last
    fn deregister(&self, registry: &mut HashMap<TaskKey, Registration>, key: &TaskKey) {
        let executer_key = match registry.get(key) {
            Some(registration) => registration.manager.executer_key().clone(),
            None => return,
        };

        registry.remove(&executer_key);
        if registry.is_empty() {
            self.drained.notify_all();
        }
    }

    // -------------
    // | Lifecycle |
    // -------------

    /// Stop accepting tasks, returns whether this call flipped the flag
    pub fn mark_stopped(&self) -> bool {
        // Take the registry lock so that no submission is between its stop
        // check and its insert when the flag flips
        let _registry = lock(&self.registry);
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    /// Whether the scheduler has stopped accepting tasks
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Mark the processor as torn down, returns whether this call flipped the
    /// flag
    pub fn mark_halted(&self) -> bool {
        let first = !self.halted.swap(true, Ordering::AcqRel);
        // Wake drain waiters so they observe the halt
        let _registry = lock(&self.registry);
        self.drained.notify_all();
        first
    }

    /// Whether the processor has been torn down
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Block until every manager has drained and its last task completed, or
    /// the processor is halted
    ///
    /// Returns `Err` if the calling thread is interrupted while waiting
    pub fn await_drained(&self) -> Result<(), Interrupted> {
        let mut registry = lock(&self.registry);
        while !registry.is_empty() && !self.is_halted() {
            if interrupt::interrupted() {
                return Err(Interrupted);
            }

            registry = self
                .drained
                .wait_timeout(registry, DRAIN_POLL_INTERVAL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| PoisonError::into_inner(e).0);
        }

        Ok(())
    }

    /// Push `n` poison slots at the head of the ring
    pub fn poison(&self, n: usize) {
        self.ring.poison(n);
    }

    // -----------
    // | Getters |
    // -----------

    /// The ring of ready keys
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// The number of tasks queued across all managers
    pub fn buffered_tasks(&self) -> usize {
        lock(&self.registry).values().map(|registration| registration.manager.len()).sum()
    }

    /// The number of keys with queued or in-flight tasks
    pub fn num_keys(&self) -> usize {
        lock(&self.registry).len()
    }
}
