//! Scoped pause of the worker pool
//!
//! ```ignore
//! {
//!     let _guard = PauseGuard::new(&pool);
//!     // no worker is running a task here
//! }
//! // workers resume
//! ```
//!
//! Only the main thread pauses. A guard built on any other thread, a worker
//! included, does nothing, so it can never resume a pause it did not start.

use edrt_core::ktrace;

use crate::pool::WorkerPool;

/// Pauses the pool for its lifetime when created on the main thread
#[must_use = "the pool resumes when the guard is dropped"]
pub struct PauseGuard<'a> {
    pool: &'a WorkerPool,
    paused: bool,
}

impl<'a> PauseGuard<'a> {
    pub fn new(pool: &'a WorkerPool) -> Self {
        let paused = pool.is_main_thread();
        if paused {
            pool.pause_all_sub_threads(true);
        } else {
            ktrace!("pause guard off the main thread: no-op");
        }
        Self { pool, paused }
    }

    /// Whether this guard requested the pause
    pub fn is_active(&self) -> bool {
        self.paused
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if self.paused {
            self.pool.pause_all_sub_threads(false);
        }
    }
}
