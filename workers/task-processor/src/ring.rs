//! The ring of keys with work ready to run
//!
//! The ring is a blocking double-ended queue. Keys are appended at the tail
//! when they gain work or are revisited, poison slots are pushed at the head
//! so that shutdown overtakes queued work.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use common::types::task_key::TaskKey;
use util::concurrency::{
    interrupt::{self, Interrupted},
    lock,
};

/// The interval at which a blocked taker checks its interrupt flag
///
/// An interrupt unparks the thread but does not wake a condvar wait
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An entry in the ring
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    /// A key whose manager has at least one task
    Ready(TaskKey),
    /// Tells the taking thread to exit
    Poison,
}

/// A blocking double-ended queue of slots
#[derive(Default)]
pub struct Ring {
    /// The queued slots
    slots: Mutex<VecDeque<Slot>>,
    /// Signalled when a slot is pushed
    available: Condvar,
}

impl Ring {
    /// Constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a slot at the tail
    pub fn push_back(&self, slot: Slot) {
        lock(&self.slots).push_back(slot);
        self.available.notify_one();
    }

    /// Insert `n` poison slots at the head
    pub fn poison(&self, n: usize) {
        let mut slots = lock(&self.slots);
        for _ in 0..n {
            slots.push_front(Slot::Poison);
        }
        drop(slots);

        self.available.notify_all();
    }

    /// Take the slot at the head, blocking until one is available
    ///
    /// Returns `Err` if the calling thread is interrupted while waiting, the
    /// interrupt is consumed
    pub fn take(&self) -> Result<Slot, Interrupted> {
        loop {
            if let Some(slot) = self.pop_front(None /* deadline */)? {
                return Ok(slot);
            }
        }
    }

    /// Take the slot at the head, waiting at most `timeout` for one
    ///
    /// Returns `Ok(None)` if the timeout elapsed and `Err` if the calling
    /// thread was interrupted
    pub fn poll(&self, timeout: Duration) -> Result<Option<Slot>, Interrupted> {
        self.pop_front(Some(Instant::now() + timeout))
    }

    /// The number of queued slots
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }

    /// Pop the head slot, waiting until the deadline if one is given
    fn pop_front(&self, deadline: Option<Instant>) -> Result<Option<Slot>, Interrupted> {
        let mut slots = lock(&self.slots);
        loop {
            if interrupt::interrupted() {
                return Err(Interrupted);
            }
            if let Some(slot) = slots.pop_front() {
                return Ok(Some(slot));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(INTERRUPT_POLL_INTERVAL)
                },
                None => INTERRUPT_POLL_INTERVAL,
            };

            slots = self
                .available
                .wait_timeout(slots, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| PoisonError::into_inner(e).0);
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::Arc,
        thread::{self, Builder},
        time::{Duration, Instant},
    };

    use common::types::task_key::TaskKey;
    use util::concurrency::interrupt;

    use super::{Ring, Slot};

    /// Tests that poison overtakes queued keys and keys keep their order
    #[test]
    fn test_poison_at_head() {
        let ring = Ring::new();
        ring.push_back(Slot::Ready(TaskKey::from("a")));
        ring.push_back(Slot::Ready(TaskKey::from("b")));
        ring.poison(2);

        assert_eq!(ring.len(), 4);
        assert_eq!(ring.take().unwrap(), Slot::Poison);
        assert_eq!(ring.take().unwrap(), Slot::Poison);
        assert_eq!(ring.take().unwrap(), Slot::Ready(TaskKey::from("a")));
        assert_eq!(ring.take().unwrap(), Slot::Ready(TaskKey::from("b")));
        assert!(ring.is_empty());
    }

    /// Tests that a poll on an empty ring times out
    #[test]
    fn test_poll_timeout() {
        let ring = Ring::new();
        let start = Instant::now();
        assert_eq!(ring.poll(Duration::from_millis(30)), Ok(None));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    /// Tests that a blocked taker wakes on push and on interrupt
    #[test]
    fn test_take_wakes() {
        let ring = Arc::new(Ring::new());

        let taker_ring = ring.clone();
        let taker = thread::spawn(move || taker_ring.take());
        thread::sleep(Duration::from_millis(20));
        ring.push_back(Slot::Ready(TaskKey::from(1u64)));
        assert_eq!(taker.join().unwrap(), Ok(Slot::Ready(TaskKey::from(1u64))));

        let taker_ring = ring.clone();
        let (join, handle) = interrupt::spawn(Builder::new(), move || taker_ring.take()).unwrap();
        thread::sleep(Duration::from_millis(20));
        handle.interrupt();
        assert!(join.join().unwrap().is_err());
    }
}
