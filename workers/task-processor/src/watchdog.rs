//! Interrupts threads whose task overruns its timeout
//!
//! The watchdog does not stop anything by force: it sets the interrupt flag
//! of the executing thread and unparks it. Tasks cooperate by checking
//! `util::concurrency::interrupt`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::warn;
use util::concurrency::{
    interrupt::InterruptHandle,
    timer::{Timer, TimerHandle},
};

/// Watches running tasks for timeouts
#[derive(Clone)]
pub struct TaskWatchdog {
    /// The timer on which expiries fire
    timer: Timer,
}

impl TaskWatchdog {
    /// Create a watchdog firing on the given timer
    pub fn new(timer: Timer) -> Self {
        Self { timer }
    }

    /// A watchdog on the process wide timer
    pub fn global() -> Option<Self> {
        Timer::global().map(Self::new)
    }

    /// Interrupt `target` once `timeout` elapses, unless the returned guard is
    /// dropped first
    pub fn watch(&self, target: InterruptHandle, timeout: Duration) -> WatchGuard {
        let fired = Arc::new(AtomicBool::new(false));
        let expired = fired.clone();
        let handle = self.timer.schedule(timeout, move || {
            warn!(
                "task on thread {} exceeded its timeout of {timeout:?}, interrupting",
                target.thread_name().unwrap_or("<unnamed>")
            );
            expired.store(true, Ordering::Release);
            target.interrupt();
        });

        WatchGuard { handle: Some(handle), fired }
    }
}

/// Stops watching a task when dropped
#[must_use = "the task stops being watched when the guard is dropped"]
pub struct WatchGuard {
    /// The scheduled expiry
    handle: Option<TimerHandle>,
    /// Whether the expiry fired
    fired: Arc<AtomicBool>,
}

impl WatchGuard {
    /// Whether the watchdog interrupted the task
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        thread::{self, Builder},
        time::Duration,
    };

    use util::concurrency::{
        interrupt::{self, InterruptHandle},
        timer::Timer,
    };

    use super::TaskWatchdog;

    /// Tests that an overrunning thread is interrupted
    #[test]
    fn test_interrupts_on_expiry() {
        let watchdog = TaskWatchdog::new(Timer::new("watchdog-test").unwrap());
        let (join, handle) = interrupt::spawn(Builder::new(), move || {
            let guard = watchdog.watch(InterruptHandle::current(), Duration::from_millis(20));
            let res = interrupt::sleep(Duration::from_secs(30));
            (res.is_err(), guard.fired())
        })
        .unwrap();

        let (interrupted, fired) = join.join().unwrap();
        assert!(interrupted);
        assert!(fired);
        assert!(!handle.is_interrupted());
    }

    /// Tests that dropping the guard before expiry leaves the thread alone
    #[test]
    fn test_guard_cancels() {
        let watchdog = TaskWatchdog::new(Timer::new("watchdog-test").unwrap());
        let guard = watchdog.watch(InterruptHandle::current(), Duration::from_millis(30));
        drop(guard);

        thread::sleep(Duration::from_millis(60));
        assert!(!interrupt::interrupted());
    }
}
