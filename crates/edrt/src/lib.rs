//! # edrt - Editor RunTime
//!
//! Concurrency runtime for a single-threaded, stateful editor core.
//!
//! The editor's buffers are only ever mutated on the main thread. Everything
//! that would block it runs elsewhere and reports back:
//!
//! - terminal output goes through an `AsyncWriter` thread
//! - terminal input arrives on an `AsyncReader` thread and is marshaled to
//!   the `EventHandler` loop
//! - CPU-bound work runs on the `WorkerPool`; its completion callbacks are
//!   drained on the main thread
//! - a `PauseGuard` freezes the pool around operations that must not race
//!   background tasks
//!
//! ## Quick Start
//!
//! ```ignore
//! use edrt::{Key, Runtime, RuntimeConfig};
//!
//! fn main() -> edrt::RtResult<()> {
//!     let rt = Runtime::new(RuntimeConfig::from_env())?;
//!     let stop = rt.submitter();
//!     rt.attach_input(
//!         stdin_fd,
//!         |bytes: &[u8]| bytes.first().map(|&b| Key::new(b as u32, false)),
//!         move |key| if key.code == 'q' as u32 { stop.stop(0) },
//!     )?;
//!     let status = rt.run()?;
//!     rt.shutdown();
//!     std::process::exit(status);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   terminal fd ──► AsyncReader ──decode──► EventHandler loop (main thread)
//!                                               ▲          │
//!          WorkerPool ──completions──► drain ───┘          ▼
//!          (N workers)                                AsyncWriter ──► stdout
//! ```

mod input;

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

pub use input::{Key, KeyDecoder};

// Re-export core types
pub use edrt_core::{
    fatal,
    pair,
    set_fatal_error_callback,
    submit,
    Future,
    IoError,
    LogSink,
    Notifier,
    Promise,
    RtError,
    RtResult,
};
pub use edrt_core::constants;
pub use edrt_core::fatal::clear_fatal_error_callback;

// Re-export kprint macros for logging
pub use edrt_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use edrt_core::kprint::{
    add_sink, clear_sinks, init as init_logging, remove_sink, set_flush_enabled, set_log_level,
    LogLevel,
};

// Re-export env utilities
pub use edrt_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use edrt_runtime::{
    connect_netlog,
    AsyncReader,
    AsyncWriter,
    Backpressure,
    DebugSink,
    EventHandler,
    Listener,
    PauseGuard,
    PoolConfig,
    PoolStats,
    ReaderConfig,
    ReaderStats,
    RuntimeConfig,
    Submitter,
    WorkerPool,
    WriterConfig,
    WriterStats,
};

/// Schedules one `drain_callbacks` job on the handler per burst of
/// completions.
struct DrainNotifier {
    submitter: Submitter,
    pool: OnceLock<Weak<WorkerPool>>,
    scheduled: Arc<AtomicBool>,
}

impl DrainNotifier {
    fn new(submitter: Submitter) -> Self {
        Self {
            submitter,
            pool: OnceLock::new(),
            scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn bind(&self, pool: &Arc<WorkerPool>) {
        let _ = self.pool.set(Arc::downgrade(pool));
    }
}

impl Notifier for DrainNotifier {
    fn notify(&self) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(pool) = self.pool.get().cloned() else {
            self.scheduled.store(false, Ordering::Release);
            return;
        };
        let scheduled = Arc::clone(&self.scheduled);
        let submitted = self.submitter.submit(move || {
            // Cleared first: completions landing mid-drain schedule a new job.
            scheduled.store(false, Ordering::Release);
            if let Some(pool) = pool.upgrade() {
                if let Err(e) = pool.drain_callbacks() {
                    kwarn!("drain on handler thread failed: {}", e);
                }
            }
        });
        if submitted.is_err() {
            self.scheduled.store(false, Ordering::Release);
        }
    }
}

/// Runtime context
///
/// Owns every long-lived component: the terminal writer, the optional log
/// sinks, the event handler and the worker pool. The thread that creates it
/// is the main thread and must be the one that calls `run()`.
pub struct Runtime {
    config: RuntimeConfig,
    stdout: Arc<AsyncWriter>,
    netlog: Option<Arc<AsyncWriter>>,
    debug: Option<Arc<DebugSink>>,
    handler: EventHandler,
    pool: Arc<WorkerPool>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Build the runtime around the process's stdout
    pub fn new(config: RuntimeConfig) -> RtResult<Self> {
        Self::with_output(config, std::io::stdout().as_raw_fd())
    }

    /// Build the runtime with terminal output going to `output`.
    ///
    /// The descriptor stays owned by the caller. Failing to start its writer
    /// is fatal: the fatal-error callback runs before the error is returned.
    pub fn with_output(config: RuntimeConfig, output: RawFd) -> RtResult<Self> {
        edrt_core::kprint::init();
        config.validate()?;

        let stdout = match AsyncWriter::create(output, config.writer()) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                fatal(&format!("cannot start terminal writer: {}", e));
                return Err(e);
            }
        };

        let handler = EventHandler::new();
        let notifier = Arc::new(DrainNotifier::new(handler.submitter()));
        let pool = Arc::new(WorkerPool::new(config.pool(), Some(notifier.clone() as Arc<dyn Notifier>))?);
        notifier.bind(&pool);

        let netlog = config.netlog.as_ref().and_then(|(host, port)| {
            match edrt_runtime::connect_netlog(host, *port, config.writer()) {
                Ok(w) => Some(Arc::new(w)),
                Err(e) => {
                    kdebug!("netlog disabled: {}", e);
                    None
                }
            }
        });
        let debug = config.debug_socket.as_ref().and_then(DebugSink::connect).map(Arc::new);

        if let Some(w) = &netlog {
            edrt_core::kprint::add_sink(Arc::clone(w) as Arc<dyn LogSink>);
        }
        if let Some(d) = &debug {
            edrt_core::kprint::add_sink(Arc::clone(d) as Arc<dyn LogSink>);
        }

        kdebug!(
            "runtime up: {} workers, netlog {}, debug socket {}",
            config.num_workers,
            netlog.is_some(),
            debug.is_some()
        );

        Ok(Self {
            config,
            stdout,
            netlog,
            debug,
            handler,
            pool,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Terminal writer
    pub fn stdout(&self) -> &AsyncWriter {
        &self.stdout
    }

    /// Network log writer, if connected
    pub fn netlog(&self) -> Option<&AsyncWriter> {
        self.netlog.as_deref()
    }

    pub fn has_debug_sink(&self) -> bool {
        self.debug.as_ref().is_some_and(|d| d.is_enabled())
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }

    pub fn submitter(&self) -> Submitter {
        self.handler.submitter()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Pause the pool until the guard drops (main thread only)
    pub fn pause(&self) -> PauseGuard<'_> {
        PauseGuard::new(&self.pool)
    }

    /// Read terminal input from `fd`.
    ///
    /// Each chunk is decoded on the reader thread; every decoded key is
    /// handed to `on_key` on the handler thread, after which terminal output
    /// is flushed so echo is prompt.
    pub fn attach_input<D, K>(&self, fd: OwnedFd, decoder: D, on_key: K) -> RtResult<RawFd>
    where
        D: KeyDecoder,
        K: FnMut(Key) + Send + 'static,
    {
        let on_key = Arc::new(Mutex::new(on_key));
        let stdout = Arc::clone(&self.stdout);
        self.handler.register_reader(fd, self.config.reader(), move |handler, bytes| {
            let Some(key) = decoder.decode(bytes) else { return };
            let on_key = Arc::clone(&on_key);
            let stdout = Arc::clone(&stdout);
            let queued = handler.submit(move || {
                (on_key.lock().unwrap_or_else(|e| e.into_inner()))(key);
                let _ = stdout.flush();
            });
            if queued.is_err() {
                ktrace!("key {:?} dropped: handler closed", key);
            }
        })
    }

    /// Run the event loop on the calling thread until `stop` is called.
    pub fn run(&self) -> RtResult<i32> {
        self.stdout.flush()?;
        self.handler.start(false)
    }

    /// Make `run()` return `status`; safe from any thread
    pub fn stop(&self, status: i32) {
        self.handler.stop(status);
    }

    /// Tear everything down, in order: input sources, event handler, worker
    /// pool, log sinks, terminal writer. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        kdebug!("runtime shutdown");

        self.handler.stop_sources();
        self.handler.shutdown();

        self.pool.shutdown();
        let stranded = self.pool.pending_callbacks();
        if stranded > 0 {
            kdebug!("{} completion callbacks never drained", stranded);
        }

        if let Some(w) = &self.netlog {
            edrt_core::kprint::remove_sink(&(Arc::clone(w) as Arc<dyn LogSink>));
        }
        if let Some(d) = &self.debug {
            edrt_core::kprint::remove_sink(&(Arc::clone(d) as Arc<dyn LogSink>));
        }
        if let Some(w) = &self.netlog {
            w.stop();
        }

        let _ = self.stdout.flush();
        self.stdout.stop();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("handler", &self.handler)
            .field("pool", &self.pool)
            .field("netlog", &self.netlog.is_some())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::thread;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn read_all(fd: OwnedFd) -> Vec<u8> {
        use std::io::Read;
        let mut out = Vec::new();
        std::fs::File::from(fd).read_to_end(&mut out).unwrap();
        out
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::new().num_workers(2)
    }

    #[test]
    fn test_completion_runs_on_main_thread() {
        let (_r, w) = pipe();
        let rt = Runtime::with_output(config(), w.as_raw_fd()).unwrap();
        let seen = Arc::new(Mutex::new(None));

        let s = Arc::clone(&seen);
        let stop = rt.submitter();
        rt.pool()
            .enqueue(
                || 6 * 7,
                move |v| {
                    *s.lock().unwrap() = Some((v, thread::current().id()));
                    stop.stop(0);
                },
            )
            .unwrap();

        assert_eq!(rt.run(), Ok(0));
        assert_eq!(*seen.lock().unwrap(), Some((42, thread::current().id())));
        rt.shutdown();
    }

    #[test]
    fn test_keys_reach_handler_and_echo() {
        let (out_r, out_w) = pipe();
        let (in_r, in_w) = pipe();
        let rt = Runtime::with_output(config(), out_w.as_raw_fd()).unwrap();

        let stop = rt.submitter();
        let echo = Arc::clone(&rt.stdout);
        let keys = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&keys);
        rt.attach_input(
            in_r,
            |bytes: &[u8]| bytes.first().map(|&b| Key::new(b as u32, false)),
            move |key| {
                k.lock().unwrap().push(key);
                let _ = echo.write(&[key.code as u8]);
                if key.code == 'q' as u32 {
                    stop.stop(3);
                }
            },
        )
        .unwrap();

        edrt_runtime::fd::write_all(in_w.as_raw_fd(), b"q").unwrap();
        assert_eq!(rt.run(), Ok(3));
        assert_eq!(*keys.lock().unwrap(), vec![Key::new('q' as u32, false)]);

        rt.shutdown();
        drop(out_w);
        assert_eq!(read_all(out_r), b"q");
    }

    #[test]
    fn test_shutdown_flushes_and_closes_handler() {
        let (r, w) = pipe();
        let rt = Runtime::with_output(config(), w.as_raw_fd()).unwrap();
        rt.stdout().write(b"bye\n").unwrap();

        rt.shutdown();
        rt.shutdown();
        assert!(rt.is_shut_down());
        assert_eq!(rt.submitter().submit(|| {}), Err(RtError::Stopped));
        assert_eq!(rt.pool().execute(|| {}), Err(RtError::Stopped));

        drop(w);
        assert_eq!(read_all(r), b"bye\n");
    }

    #[test]
    fn test_pause_and_future() {
        let (_r, w) = pipe();
        let rt = Runtime::with_output(config(), w.as_raw_fd()).unwrap();
        {
            let _guard = rt.pause();
            assert!(rt.pool().is_paused());
        }
        assert!(!rt.pool().is_paused());
        assert_eq!(rt.pool().submit(|| "done").unwrap().get(), Ok("done"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_r, w) = pipe();
        let err = Runtime::with_output(config().num_workers(0), w.as_raw_fd()).err();
        assert!(matches!(err, Some(RtError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_optional_sinks_are_silent() {
        let (_r, w) = pipe();
        let missing = std::env::temp_dir().join(format!("edrt-none-{}.sock", std::process::id()));
        let cfg = config().debug_socket(missing.to_string_lossy().into_owned());
        let rt = Runtime::with_output(cfg, w.as_raw_fd()).unwrap();
        assert!(!rt.has_debug_sink());
        assert!(rt.netlog().is_none());
    }
}
