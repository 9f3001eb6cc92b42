//! Fixed-size worker pool with main-thread completion callbacks
//!
//! Workers pop from a bounded [`TaskQueue`], run the task and, when the
//! caller supplied a callback, bind it to the task's result and push it onto
//! the [`CallbackQueue`]. Workers never run callbacks. The main thread runs
//! them from `drain_callbacks`, which is the only place background results
//! may reach editor state.
//!
//! Completion order across workers depends on run time; callers that need a
//! total order carry sequence numbers in their results.

mod callback_queue;
mod task_queue;

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use edrt_core::{kdebug, kerror, ktrace, kwarn, Future, Notifier, RtError, RtResult};

use crate::config::PoolConfig;
use callback_queue::{CallbackQueue, Completion};
use task_queue::{TaskQueue, WorkerTask};

thread_local! {
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks run to completion
    pub executed: u64,
    /// Tasks that panicked
    pub panicked: u64,
    /// `enqueue` calls refused with `QueueFull`
    pub rejected: u64,
}

struct PoolInner {
    tasks: TaskQueue,
    callbacks: CallbackQueue,
    notifier: Option<Arc<dyn Notifier>>,
    executed: AtomicU64,
    panicked: AtomicU64,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    config: PoolConfig,
    main_thread: ThreadId,
    workers: Mutex<Vec<JoinHandle<()>>>,
    rejected: AtomicU64,
}

impl WorkerPool {
    /// Start `config.num_workers` workers.
    ///
    /// The calling thread is recorded as the main thread: only it may drain
    /// callbacks or pause the pool through a `PauseGuard`.
    pub fn new(config: PoolConfig, notifier: Option<Arc<dyn Notifier>>) -> RtResult<Self> {
        if config.num_workers == 0 {
            return Err(RtError::InvalidConfig("num_workers must be > 0"));
        }
        if config.queue_size == 0 {
            return Err(RtError::InvalidConfig("queue_size must be > 0"));
        }

        let inner = Arc::new(PoolInner {
            tasks: TaskQueue::new(config.queue_size),
            callbacks: CallbackQueue::new(),
            notifier,
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("edrt-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_inner, worker_id));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    kerror!("pool: failed to spawn worker {}: {}", worker_id, e);
                    inner.tasks.close();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(RtError::SpawnFailed);
                }
            }
        }

        kdebug!(
            "pool: {} workers, queue {}, policy {:?}",
            config.num_workers,
            config.queue_size,
            config.policy
        );

        Ok(Self {
            inner,
            config,
            main_thread: thread::current().id(),
            workers: Mutex::new(handles),
            rejected: AtomicU64::new(0),
        })
    }

    /// Queue `function` to run on a worker; `callback(result)` later runs on
    /// the main thread from `drain_callbacks`.
    pub fn enqueue<T, F, C>(&self, function: F, callback: C) -> RtResult<()>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        self.push(WorkerTask {
            run: Box::new(move || {
                let result = function();
                Some(Box::new(move || callback(result)) as Completion)
            }),
        })
    }

    /// Queue `function` with no completion callback
    pub fn execute<F>(&self, function: F) -> RtResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(WorkerTask {
            run: Box::new(move || {
                function();
                None
            }),
        })
    }

    /// Run `task` on a worker and return a future for its result.
    ///
    /// A panicking task completes the future with `TaskPanicked`; a task
    /// dropped unstarted at shutdown completes it with `Stopped`.
    pub fn submit<T, F>(&self, task: F) -> RtResult<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (promise, future) = edrt_core::pair();
        self.execute(move || match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(value) => promise.set(value),
            Err(_) => promise.fail(RtError::TaskPanicked),
        })?;
        Ok(future)
    }

    fn push(&self, task: WorkerTask) -> RtResult<()> {
        match self.inner.tasks.push(task, self.config.policy) {
            Err(RtError::QueueFull) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                ktrace!("pool: queue full ({})", self.inner.tasks.capacity());
                Err(RtError::QueueFull)
            }
            other => other,
        }
    }

    /// Run every completion callback queued so far, in FIFO order.
    ///
    /// Main thread only; returns how many callbacks ran.
    pub fn drain_callbacks(&self) -> RtResult<usize> {
        if !self.is_main_thread() {
            return Err(RtError::NotMainThread);
        }
        let ran = self.inner.callbacks.drain();
        if ran > 0 {
            ktrace!("pool: drained {} callbacks", ran);
        }
        Ok(ran)
    }

    /// Whether the caller is the thread that created the pool
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// Pause (`true`) or resume (`false`) the workers.
    ///
    /// Pauses nest. Pausing waits until no worker is mid-task; running tasks
    /// finish and nothing new starts until the matching resume. Called from
    /// a worker, the wait is skipped since that worker is itself busy.
    pub fn pause_all_sub_threads(&self, pause: bool) {
        if pause {
            let wait = !IS_WORKER.with(|w| w.get());
            let depth = self.inner.tasks.pause(wait);
            kdebug!("pool: paused (depth {})", depth);
        } else {
            match self.inner.tasks.resume() {
                Some(0) => kdebug!("pool: resumed"),
                Some(depth) => kdebug!("pool: resume, still paused (depth {})", depth),
                None => kwarn!("pool: resume without pause"),
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.tasks.is_paused()
    }

    /// Tasks queued but not started
    pub fn queued(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Tasks currently running
    pub fn busy(&self) -> usize {
        self.inner.tasks.busy()
    }

    /// Completions waiting for `drain_callbacks`
    pub fn pending_callbacks(&self) -> usize {
        self.inner.callbacks.len()
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            executed: self.inner.executed.load(Ordering::Relaxed),
            panicked: self.inner.panicked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers and join them. Idempotent.
    ///
    /// Running tasks finish; queued tasks are dropped unstarted. Completions
    /// already queued stay available to `drain_callbacks`.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        if handles.is_empty() {
            return;
        }
        let dropped = self.inner.tasks.close();
        if !dropped.is_empty() {
            kdebug!("pool: dropping {} queued tasks", dropped.len());
        }
        drop(dropped);
        let me = thread::current().id();
        for handle in handles {
            // Last reference dropped inside a task: the worker cannot join itself.
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                kwarn!("pool: worker thread panicked");
            }
        }
        kdebug!("pool: shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.tasks.is_closed()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.config.num_workers)
            .field("queued", &self.queued())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    IS_WORKER.with(|w| w.set(true));
    ktrace!("pool: worker {} started", worker_id);

    while let Some(task) = inner.tasks.pop() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(task.run));
        inner.tasks.finish();
        match outcome {
            Ok(completion) => {
                inner.executed.fetch_add(1, Ordering::Relaxed);
                if let Some(completion) = completion {
                    inner.callbacks.push(completion);
                    if let Some(notifier) = &inner.notifier {
                        notifier.notify();
                    }
                }
            }
            Err(_) => {
                inner.panicked.fetch_add(1, Ordering::Relaxed);
                kwarn!("pool: task panicked on worker {}", worker_id);
            }
        }
    }

    ktrace!("pool: worker {} exiting", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backpressure;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn config(num_workers: usize, queue_size: usize, policy: Backpressure) -> PoolConfig {
        PoolConfig { num_workers, queue_size, policy }
    }

    fn drain_until(pool: &WorkerPool, want: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut total = 0;
        while total < want {
            assert!(Instant::now() < deadline, "only {} of {} callbacks", total, want);
            total += pool.drain_callbacks().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        total
    }

    #[test]
    fn test_every_marker_once_on_main_thread() {
        let pool = WorkerPool::new(PoolConfig::default(), None).unwrap();
        let me = thread::current().id();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for marker in 0..50usize {
            let seen = Arc::clone(&seen);
            pool.enqueue(
                move || marker * 10,
                move |result| {
                    assert_eq!(thread::current().id(), me);
                    seen.lock().unwrap().push(result);
                },
            )
            .unwrap();
        }

        assert_eq!(drain_until(&pool, 50), 50);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).map(|m| m * 10).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_single_worker_completes_in_order() {
        let pool = WorkerPool::new(config(1, 16, Backpressure::Reject), None).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            pool.enqueue(move || i, move |r| seen.lock().unwrap().push(r)).unwrap();
        }
        drain_until(&pool, 10);
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_off_main_thread_refused() {
        let pool = Arc::new(WorkerPool::new(config(1, 4, Backpressure::Reject), None).unwrap());
        let p = Arc::clone(&pool);
        let result = thread::spawn(move || p.drain_callbacks()).join().unwrap();
        assert_eq!(result, Err(RtError::NotMainThread));
        assert!(pool.is_main_thread());
    }

    #[test]
    fn test_reject_never_overruns_queue() {
        let pool = WorkerPool::new(config(1, 3, Backpressure::Reject), None).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            pool.execute(|| {}).unwrap();
        }
        assert_eq!(pool.execute(|| {}), Err(RtError::QueueFull));
        assert!(pool.queued() <= 3);
        assert_eq!(pool.stats().rejected, 1);

        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_block_waits_for_free_slot() {
        let pool = Arc::new(WorkerPool::new(config(1, 1, Backpressure::Block), None).unwrap());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.execute(|| {}).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&pool);
        let r = Arc::clone(&ran);
        let producer = thread::spawn(move || {
            p.execute(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        release_tx.send(()).unwrap();
        assert_eq!(producer.join().unwrap(), Ok(()));
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_submit_future() {
        let pool = WorkerPool::new(config(2, 8, Backpressure::Reject), None).unwrap();
        let f = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(f.get(), Ok(42));

        let bad = pool.submit(|| -> u32 { panic!("task failed") }).unwrap();
        assert_eq!(bad.get(), Err(RtError::TaskPanicked));
    }

    #[test]
    fn test_pause_holds_new_tasks() {
        let pool = WorkerPool::new(config(2, 8, Backpressure::Reject), None).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.pause_all_sub_threads(true);
        assert!(pool.is_paused());
        let r = Arc::clone(&ran);
        pool.execute(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        pool.pause_all_sub_threads(false);
        assert!(!pool.is_paused());
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_pause_waits_for_running_task() {
        let pool = WorkerPool::new(config(1, 8, Backpressure::Reject), None).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        let d = Arc::clone(&done);
        pool.execute(move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            d.store(1, Ordering::SeqCst);
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.pause_all_sub_threads(true);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.busy(), 0);
        pool.pause_all_sub_threads(false);
    }

    #[test]
    fn test_notifier_called_per_completion() {
        struct Count(AtomicUsize);
        impl Notifier for Count {
            fn notify(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(Count(AtomicUsize::new(0)));
        let notifier: Arc<dyn Notifier> = count.clone();
        let pool = WorkerPool::new(config(2, 8, Backpressure::Reject), Some(notifier)).unwrap();
        pool.enqueue(|| 1, |_| {}).unwrap();
        pool.enqueue(|| 2, |_| {}).unwrap();
        pool.execute(|| {}).unwrap();
        drain_until(&pool, 2);
        pool.shutdown();
        assert_eq!(count.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shutdown_drops_queued_and_rejects_new() {
        let pool = WorkerPool::new(config(1, 8, Backpressure::Reject), None).unwrap();
        pool.pause_all_sub_threads(true);
        let queued = pool.submit(|| 1).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert_eq!(queued.get(), Err(RtError::Stopped));
        assert_eq!(pool.execute(|| {}), Err(RtError::Stopped));
        assert!(pool.is_shut_down());
    }

    #[test]
    fn test_zero_workers_invalid() {
        let err = WorkerPool::new(config(0, 8, Backpressure::Reject), None).err();
        assert!(matches!(err, Some(RtError::InvalidConfig(_))));
    }
}
