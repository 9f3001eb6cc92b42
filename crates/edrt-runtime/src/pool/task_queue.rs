//! Bounded task queue shared by the pool's workers
//!
//! One mutex guards the queue together with the pause and busy counters, so
//! a worker can never pop a task between a pause request and the quiescence
//! check that follows it.
//!
//! Condvars:
//! - `available`: workers wait for a task
//! - `resumed`: workers wait out a pause
//! - `space`: blocking producers wait for a free slot
//! - `quiescent`: a pausing thread waits for `busy == 0`

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use edrt_core::{RtError, RtResult};

use crate::config::Backpressure;
use crate::pool::callback_queue::Completion;

/// A queued unit of work; returns its bound completion, if any
pub(crate) struct WorkerTask {
    pub(crate) run: Box<dyn FnOnce() -> Option<Completion> + Send + 'static>,
}

struct QueueState {
    tasks: VecDeque<WorkerTask>,
    shutdown: bool,
    pause_depth: usize,
    busy: usize,
}

pub(crate) struct TaskQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Condvar,
    resumed: Condvar,
    space: Condvar,
    quiescent: Condvar,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity),
                shutdown: false,
                pause_depth: 0,
                busy: 0,
            }),
            available: Condvar::new(),
            resumed: Condvar::new(),
            space: Condvar::new(),
            quiescent: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a task, applying `policy` when all slots are taken.
    ///
    /// A blocking producer gives up with `QueueFull` while the pool is
    /// paused, since no slot can free until the pause ends.
    pub(crate) fn push(&self, task: WorkerTask, policy: Backpressure) -> RtResult<()> {
        let mut st = self.lock();
        loop {
            if st.shutdown {
                return Err(RtError::Stopped);
            }
            if st.tasks.len() < self.capacity {
                st.tasks.push_back(task);
                drop(st);
                self.available.notify_one();
                return Ok(());
            }
            match policy {
                Backpressure::Reject => return Err(RtError::QueueFull),
                Backpressure::Block if st.pause_depth > 0 => return Err(RtError::QueueFull),
                Backpressure::Block => {
                    st = self.space.wait(st).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Block until a task may run. `None` means the pool is shutting down.
    ///
    /// A returned task counts as busy until `finish` is called.
    pub(crate) fn pop(&self) -> Option<WorkerTask> {
        let mut st = self.lock();
        loop {
            if st.shutdown {
                return None;
            }
            if st.pause_depth > 0 {
                st = self.resumed.wait(st).unwrap_or_else(|e| e.into_inner());
                continue;
            }
            if let Some(task) = st.tasks.pop_front() {
                st.busy += 1;
                drop(st);
                self.space.notify_one();
                return Some(task);
            }
            st = self.available.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Mark the caller's task as done
    pub(crate) fn finish(&self) {
        let mut st = self.lock();
        st.busy -= 1;
        if st.busy == 0 {
            drop(st);
            self.quiescent.notify_all();
        }
    }

    /// Raise the pause depth. With `wait`, return only once no task is
    /// running.
    pub(crate) fn pause(&self, wait: bool) -> usize {
        let mut st = self.lock();
        st.pause_depth += 1;
        let depth = st.pause_depth;
        if wait {
            while st.busy > 0 && !st.shutdown {
                st = self.quiescent.wait(st).unwrap_or_else(|e| e.into_inner());
            }
        }
        depth
    }

    /// Lower the pause depth; workers resume when it reaches zero.
    ///
    /// Returns `None` if the pool was not paused.
    pub(crate) fn resume(&self) -> Option<usize> {
        let mut st = self.lock();
        if st.pause_depth == 0 {
            return None;
        }
        st.pause_depth -= 1;
        let depth = st.pause_depth;
        drop(st);
        if depth == 0 {
            self.resumed.notify_all();
            self.available.notify_all();
            self.space.notify_all();
        }
        Some(depth)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.lock().pause_depth > 0
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub(crate) fn busy(&self) -> usize {
        self.lock().busy
    }

    /// Stop handing out tasks and wake every waiter.
    ///
    /// Returns the tasks that never started; the caller drops them.
    pub(crate) fn close(&self) -> Vec<WorkerTask> {
        let mut st = self.lock();
        st.shutdown = true;
        let unstarted: Vec<_> = st.tasks.drain(..).collect();
        drop(st);
        self.available.notify_all();
        self.resumed.notify_all();
        self.space.notify_all();
        self.quiescent.notify_all();
        unstarted
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().shutdown
    }
}
