//! Helpers shared by the processor tests

use std::{
    thread,
    time::{Duration, Instant},
};

use util::concurrency::timer::Timer;

use crate::{processor::ProcessorServices, watchdog::TaskWatchdog};

/// Services backed by a timer dedicated to one test
pub fn test_services(name: &str) -> ProcessorServices {
    let timer = Timer::new(name).unwrap();
    ProcessorServices { watchdog: Some(TaskWatchdog::new(timer.clone())), timer: Some(timer) }
}

/// Poll a condition until it holds or the timeout elapses
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }

    condition()
}
