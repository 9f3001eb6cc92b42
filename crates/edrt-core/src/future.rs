//! One-shot future/promise pair
//!
//! A [`Future`] holds the not-yet-available result of a task running on
//! another thread. Exactly one [`Promise`] fulfils it, exactly once.
//!
//! Consumption is encoded in the types: [`Future::get`] takes `self`, so a
//! result can be observed at most once, and [`Future::try_get`] hands the
//! future back when the result is not ready yet.
//!
//! ```ignore
//! let fut = edrt_core::submit(|| expensive_index(&path))?;
//! // ... keep the UI responsive ...
//! let index = fut.get()?;
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::error::{RtError, RtResult};

enum State<T> {
    Pending,
    Ready(RtResult<T>),
}

struct Slot<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, result: RtResult<T>) {
        let mut state = self.lock();
        if matches!(*state, State::Pending) {
            *state = State::Ready(result);
            drop(state);
            self.ready.notify_all();
        }
    }
}

/// Write side of a one-shot result.
///
/// Dropping a promise without fulfilling it completes the future with
/// `TaskPanicked` (if unwinding) or `Stopped`, so readers never hang.
pub struct Promise<T> {
    slot: Arc<Slot<T>>,
    fulfilled: bool,
}

impl<T> Promise<T> {
    /// Store the result and wake all waiters
    pub fn set(mut self, value: T) {
        self.fulfilled = true;
        self.slot.complete(Ok(value));
    }

    /// Complete with an error instead of a value
    pub fn fail(mut self, err: RtError) {
        self.fulfilled = true;
        self.slot.complete(Err(err));
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.fulfilled {
            let err = if thread::panicking() {
                RtError::TaskPanicked
            } else {
                RtError::Stopped
            };
            self.slot.complete(Err(err));
        }
    }
}

/// Read side of a one-shot result
pub struct Future<T> {
    slot: Arc<Slot<T>>,
    thread: Option<JoinHandle<()>>,
}

/// Create an unfulfilled promise/future pair
pub fn pair<T>() -> (Promise<T>, Future<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(State::Pending),
        ready: Condvar::new(),
    });
    (
        Promise { slot: Arc::clone(&slot), fulfilled: false },
        Future { slot, thread: None },
    )
}

/// Run `task` on a new thread and return a future for its result.
///
/// Spawn failure is reported through the fatal-error callback and then
/// returned as `SpawnFailed`.
pub fn submit<T, F>(task: F) -> RtResult<Future<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (promise, mut fut) = pair();

    let spawned = thread::Builder::new()
        .name("edrt-future".into())
        .spawn(move || {
            match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => promise.set(value),
                Err(_) => promise.fail(RtError::TaskPanicked),
            }
        });

    match spawned {
        Ok(handle) => {
            fut.thread = Some(handle);
            Ok(fut)
        }
        Err(e) => {
            crate::fatal::fatal(&format!("failed to spawn future thread: {}", e));
            Err(RtError::SpawnFailed)
        }
    }
}

impl<T> Future<T> {
    /// Whether the result is available
    pub fn is_ready(&self) -> bool {
        !matches!(*self.slot.lock(), State::Pending)
    }

    /// Block until the result is available and consume the future
    pub fn get(mut self) -> RtResult<T> {
        let mut state = self.slot.lock();
        while matches!(*state, State::Pending) {
            state = self
                .slot
                .ready
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        let result = match std::mem::replace(&mut *state, State::Pending) {
            State::Ready(result) => result,
            State::Pending => unreachable!("woken while pending"),
        };
        drop(state);

        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        result
    }

    /// Take the result if it is ready; otherwise hand the future back
    pub fn try_get(self) -> Result<RtResult<T>, Self> {
        if self.is_ready() {
            Ok(self.get())
        } else {
            Err(self)
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_submit_get() {
        let fut = submit(|| 6 * 7).unwrap();
        assert_eq!(fut.get(), Ok(42));
    }

    #[test]
    fn test_try_get_not_ready_returns_future() {
        let (tx, rx) = mpsc::channel::<()>();
        let fut = submit(move || {
            rx.recv().unwrap();
            String::from("indexed")
        })
        .unwrap();

        let fut = match fut.try_get() {
            Ok(_) => panic!("result before task was released"),
            Err(fut) => fut,
        };
        assert!(!fut.is_ready());

        tx.send(()).unwrap();
        assert_eq!(fut.get().unwrap(), "indexed");
    }

    #[test]
    fn test_try_get_when_ready() {
        let fut = submit(|| vec![1u8, 2, 3]).unwrap();
        let mut fut = fut;
        loop {
            match fut.try_get() {
                Ok(v) => {
                    assert_eq!(v.unwrap(), vec![1, 2, 3]);
                    break;
                }
                Err(f) => {
                    fut = f;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    #[test]
    fn test_panicking_task_reports_error() {
        let fut = submit(|| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(fut.get(), Err(RtError::TaskPanicked));
    }

    #[test]
    fn test_dropped_promise_completes_future() {
        let (promise, fut) = pair::<u32>();
        drop(promise);
        assert_eq!(fut.get(), Err(RtError::Stopped));
    }

    #[test]
    fn test_single_delivery_across_threads() {
        let (promise, fut) = pair::<Box<u64>>();
        let waiter = thread::spawn(move || fut.get());
        thread::sleep(Duration::from_millis(10));
        promise.set(Box::new(0xfeed));
        assert_eq!(*waiter.join().unwrap().unwrap(), 0xfeed);
    }
}
