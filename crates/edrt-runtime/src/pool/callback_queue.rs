//! Completion callbacks waiting for the main thread
//!
//! Workers push, only the main thread pops. The queue is a lock-free
//! `SegQueue`, so a worker publishing a completion never waits on the main
//! loop.

use std::panic::{self, AssertUnwindSafe};

use crossbeam_queue::SegQueue;
use edrt_core::kwarn;

/// A completion callback bound to the result it will receive
pub(crate) type Completion = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct CallbackQueue {
    queue: SegQueue<Completion>,
}

impl CallbackQueue {
    pub(crate) fn new() -> Self {
        Self { queue: SegQueue::new() }
    }

    pub(crate) fn push(&self, completion: Completion) {
        self.queue.push(completion);
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Run the callbacks queued at the time of the call, oldest first.
    ///
    /// Completions pushed while draining wait for the next call, so one
    /// drain cannot be starved by a busy pool.
    pub(crate) fn drain(&self) -> usize {
        let snapshot = self.queue.len();
        let mut ran = 0;
        while ran < snapshot {
            let Some(completion) = self.queue.pop() else { break };
            if panic::catch_unwind(AssertUnwindSafe(completion)).is_err() {
                kwarn!("pool: completion callback panicked");
            }
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_drain_is_fifo() {
        let q = CallbackQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let seen = Arc::clone(&seen);
            q.push(Box::new(move || seen.lock().unwrap().push(i)));
        }
        assert_eq!(q.drain(), 4);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_push_during_drain_waits_for_next_drain() {
        let q = Arc::new(CallbackQueue::new());
        let inner = Arc::clone(&q);
        q.push(Box::new(move || inner.push(Box::new(|| {}))));
        assert_eq!(q.drain(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain(), 1);
    }

    #[test]
    fn test_panicking_callback_is_counted() {
        let q = CallbackQueue::new();
        q.push(Box::new(|| panic!("bad completion")));
        q.push(Box::new(|| {}));
        assert_eq!(q.drain(), 2);
    }
}
