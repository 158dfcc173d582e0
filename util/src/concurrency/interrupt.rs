//! Cooperative thread interruption
//!
//! Every thread owns an interrupt flag. Interrupting a thread sets its flag
//! and unparks it; blocking helpers in this module observe the flag and
//! return early. Nothing is forcibly stopped, code running on an interrupted
//! thread decides when to check the flag.

use std::{
    cell::RefCell,
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, Builder, JoinHandle, Thread, ThreadId},
    time::{Duration, Instant},
};

use thiserror::Error;

thread_local! {
    /// The interrupt flag of the current thread
    static INTERRUPT_FLAG: RefCell<Arc<AtomicBool>> =
        RefCell::new(Arc::new(AtomicBool::new(false)));
}

/// The error returned by blocking helpers when the thread is interrupted
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("thread interrupted")]
pub struct Interrupted;

/// A handle that interrupts one thread
#[derive(Clone)]
pub struct InterruptHandle {
    /// The interrupt flag of the thread
    flag: Arc<AtomicBool>,
    /// The thread, unparked on interrupt
    thread: Thread,
}

impl InterruptHandle {
    /// A handle on the calling thread
    pub fn current() -> Self {
        Self { flag: current_flag(), thread: thread::current() }
    }

    /// Set the thread's interrupt flag and wake it if parked
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
        self.thread.unpark();
    }

    /// Whether the thread's interrupt flag is set
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The id of the thread
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    /// The name of the thread, if it has one
    pub fn thread_name(&self) -> Option<&str> {
        self.thread.name()
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("thread", &self.thread.name().unwrap_or("<unnamed>"))
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// The interrupt flag of the calling thread
fn current_flag() -> Arc<AtomicBool> {
    INTERRUPT_FLAG.with(|flag| flag.borrow().clone())
}

/// Whether the calling thread has been interrupted, leaving the flag as is
pub fn is_interrupted() -> bool {
    current_flag().load(Ordering::Acquire)
}

/// Whether the calling thread has been interrupted, clearing the flag
pub fn interrupted() -> bool {
    current_flag().swap(false, Ordering::AcqRel)
}

/// Spawn a thread and return an interrupt handle on it alongside its join
/// handle
///
/// The handle is usable immediately, before the new thread starts running
pub fn spawn<F, T>(builder: Builder, f: F) -> io::Result<(JoinHandle<T>, InterruptHandle)>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let flag = Arc::new(AtomicBool::new(false));
    let thread_flag = flag.clone();
    let join = builder.spawn(move || {
        INTERRUPT_FLAG.with(|f| *f.borrow_mut() = thread_flag);
        f()
    })?;

    let handle = InterruptHandle { flag, thread: join.thread().clone() };
    Ok((join, handle))
}

/// Sleep for the given duration, returning early if the thread is
/// interrupted
///
/// An interrupt observed here is consumed, the flag is cleared
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    let deadline = Instant::now() + duration;
    loop {
        if interrupted() {
            return Err(Interrupted);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::park_timeout(deadline - now);
    }
}
