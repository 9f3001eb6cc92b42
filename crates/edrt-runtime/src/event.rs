//! Event handler: the thread that owns editor state
//!
//! Background code never touches editor state itself. It hands a closure to
//! the handler through a [`Submitter`] and the handler's run loop executes
//! it. The loop drains every submitted callback, then blocks until more are
//! submitted or a stop is requested.
//!
//! The handler also owns the readers and listeners registered with it and
//! stops them before it is released.

use std::collections::VecDeque;
use std::os::unix::io::{OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use edrt_core::{kdebug, kerror, ktrace, kwarn, RtError, RtResult};

use crate::config::ReaderConfig;
use crate::listener::Listener;
use crate::reader::AsyncReader;

/// Zero-argument callback run on the handler thread
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

struct LoopState {
    queue: VecDeque<Callback>,
    running: bool,
    exit: Option<i32>,
    closed: bool,
}

struct HandlerShared {
    state: Mutex<LoopState>,
    wake: Condvar,
}

impl HandlerShared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle for feeding a handler from any thread
#[derive(Clone)]
pub struct Submitter {
    shared: Arc<HandlerShared>,
}

impl Submitter {
    /// Queue `cb` to run on the handler thread.
    ///
    /// Fails with `Stopped` once the handler is being released.
    pub fn submit<F>(&self, cb: F) -> RtResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(RtError::Stopped);
        }
        st.queue.push_back(Box::new(cb));
        drop(st);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Ask the run loop to return `status` after its current batch
    pub fn stop(&self, status: i32) {
        self.shared.lock().exit = Some(status);
        self.shared.wake.notify_all();
    }

    /// Callbacks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter").field("pending", &self.pending()).finish()
    }
}

enum Source {
    Reader(AsyncReader),
    Listener(Listener),
}

impl Source {
    fn fd(&self) -> RawFd {
        match self {
            Source::Reader(r) => r.fd(),
            Source::Listener(l) => l.fd(),
        }
    }

    fn stop(&self) {
        match self {
            Source::Reader(r) => r.stop(),
            Source::Listener(l) => l.stop(),
        }
    }
}

/// Run loop plus the readers/listeners feeding it
pub struct EventHandler {
    shared: Arc<HandlerShared>,
    thread: Mutex<Option<JoinHandle<i32>>>,
    sources: Mutex<Vec<Source>>,
}

impl EventHandler {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(HandlerShared {
                state: Mutex::new(LoopState {
                    queue: VecDeque::new(),
                    running: false,
                    exit: None,
                    closed: false,
                }),
                wake: Condvar::new(),
            }),
            thread: Mutex::new(None),
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn submitter(&self) -> Submitter {
        Submitter { shared: Arc::clone(&self.shared) }
    }

    /// Queue `cb` to run on the handler thread
    pub fn submit<F>(&self, cb: F) -> RtResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submitter().submit(cb)
    }

    /// Enter the run loop.
    ///
    /// With `spawn_thread == false` the loop runs on the calling thread and
    /// the status passed to `stop` is returned. With `true` the loop runs on
    /// a thread named `edrt-handler`, `Ok(0)` is returned at once and the
    /// status is collected by `join`.
    pub fn start(&self, spawn_thread: bool) -> RtResult<i32> {
        {
            let mut st = self.shared.lock();
            if st.running {
                return Err(RtError::AlreadyRunning);
            }
            if st.closed {
                return Err(RtError::Stopped);
            }
            st.running = true;
        }

        if !spawn_thread {
            return Ok(run_loop(&self.shared));
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("edrt-handler".into())
            .spawn(move || run_loop(&shared));
        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                kdebug!("event handler thread started");
                Ok(0)
            }
            Err(e) => {
                self.shared.lock().running = false;
                kerror!("event handler spawn failed: {}", e);
                Err(RtError::SpawnFailed)
            }
        }
    }

    /// Ask the run loop to return `status`; safe from any thread
    pub fn stop(&self, status: i32) {
        kdebug!("event handler stop({})", status);
        self.submitter().stop(status);
    }

    /// Wait for a spawned loop to exit and return its status
    pub fn join(&self) -> Option<i32> {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        match handle.join() {
            Ok(status) => Some(status),
            Err(_) => {
                kerror!("event handler thread panicked");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Start a reader on `fd` owned by this handler; returns the raw fd as
    /// its registration key.
    pub fn register_reader<F>(&self, fd: OwnedFd, config: ReaderConfig, callback: F) -> RtResult<RawFd>
    where
        F: FnMut(&Submitter, &[u8]) + Send + 'static,
    {
        self.ensure_open()?;
        let reader = AsyncReader::create(self.submitter(), fd, config, callback)?;
        let key = reader.fd();
        self.lock_sources().push(Source::Reader(reader));
        Ok(key)
    }

    /// Start an accept loop on a listening socket owned by this handler
    pub fn register_listener<F>(&self, fd: OwnedFd, on_accept: F) -> RtResult<RawFd>
    where
        F: FnMut(&Submitter, OwnedFd) + Send + 'static,
    {
        self.ensure_open()?;
        let listener = Listener::create(self.submitter(), fd, on_accept)?;
        let key = listener.fd();
        self.lock_sources().push(Source::Listener(listener));
        Ok(key)
    }

    /// Stop and close the source registered under `fd`
    pub fn unregister(&self, fd: RawFd) -> bool {
        let source = {
            let mut sources = self.lock_sources();
            match sources.iter().position(|s| s.fd() == fd) {
                Some(i) => sources.remove(i),
                None => return false,
            }
        };
        source.stop();
        true
    }

    /// Stop every registered reader and listener, closing their fds
    pub fn stop_sources(&self) {
        let sources = std::mem::take(&mut *self.lock_sources());
        if !sources.is_empty() {
            kdebug!("event handler: stopping {} sources", sources.len());
        }
        for source in &sources {
            source.stop();
        }
    }

    pub fn source_count(&self) -> usize {
        self.lock_sources().len()
    }

    /// Release the handler: stop its sources, end a spawned loop and join
    /// it. Returns the spawned loop's status, if there was one.
    pub fn free(self) -> Option<i32> {
        self.shutdown()
    }

    /// Same teardown as `free`, in place. Later submissions and
    /// registrations fail with `Stopped`. Idempotent.
    pub fn shutdown(&self) -> Option<i32> {
        {
            let mut st = self.shared.lock();
            st.closed = true;
        }
        self.stop_sources();

        let spawned = self.thread.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        if spawned {
            {
                let mut st = self.shared.lock();
                if st.running && st.exit.is_none() {
                    st.exit = Some(0);
                }
            }
            self.shared.wake.notify_all();
        }
        let status = self.join();

        let dropped = {
            let mut st = self.shared.lock();
            let n = st.queue.len();
            st.queue.clear();
            n
        };
        if dropped > 0 {
            kdebug!("event handler: dropped {} unrun callbacks", dropped);
        }
        status
    }

    fn ensure_open(&self) -> RtResult<()> {
        if self.shared.lock().closed {
            Err(RtError::Stopped)
        } else {
            Ok(())
        }
    }

    fn lock_sources(&self) -> MutexGuard<'_, Vec<Source>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("running", &self.is_running())
            .field("sources", &self.source_count())
            .finish()
    }
}

fn run_loop(shared: &HandlerShared) -> i32 {
    loop {
        let (batch, exit) = {
            let mut st = shared.lock();
            while st.queue.is_empty() && st.exit.is_none() {
                st = shared.wake.wait(st).unwrap_or_else(|e| e.into_inner());
            }
            (std::mem::take(&mut st.queue), st.exit.take())
        };

        if !batch.is_empty() {
            ktrace!("event handler: running {} callbacks", batch.len());
        }
        for cb in batch {
            if panic::catch_unwind(AssertUnwindSafe(cb)).is_err() {
                kwarn!("event handler: callback panicked");
            }
        }

        if let Some(status) = exit {
            shared.lock().running = false;
            kdebug!("event handler loop exit({})", status);
            return status;
        }
    }
}
