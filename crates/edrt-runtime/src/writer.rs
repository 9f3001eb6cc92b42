//! Background writer for one descriptor
//!
//! `write()` never performs I/O on the caller's thread. Bytes accumulate in
//! a fixed-capacity coalescing buffer; when an incoming chunk would overflow
//! it, the buffer is sealed into a [`WriteTask`] and pushed onto a bounded
//! ring that a dedicated thread drains in FIFO order.
//!
//! ```text
//!  write(b1) write(b2) ...          writer thread
//!        │                               │
//!        ▼                               ▼
//!  ┌──────────────┐  seal   ┌─────────────────────┐  fcntl lock + write()
//!  │  coalescing  │ ──────► │ ring (max_tasks)    │ ─────────────────────► fd
//!  │  buffer      │         │ front ... rear      │
//!  └──────────────┘         └─────────────────────┘
//! ```
//!
//! Shutdown is `stop()` then `free()`: stop drains the ring, writes the tail
//! of the coalescing buffer and joins the thread. `free()` before that is
//! refused and hands the writer back.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use edrt_core::{kdebug, ktrace, kwarn, LogSink, RtError, RtResult};

use crate::config::{Backpressure, WriterConfig};
use crate::fd;
use crate::lock::FdWriteLock;

/// An immutable chunk awaiting transmission
pub struct WriteTask {
    data: Box<[u8]>,
}

impl WriteTask {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Counters for one writer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Bytes handed to write(2) successfully
    pub bytes_written: u64,
    /// Tasks fully written
    pub tasks_written: u64,
    /// Tasks dropped because write(2) failed
    pub write_errors: u64,
    /// Writes performed without the advisory lock
    pub lock_failures: u64,
    /// Log lines dropped because the ring was full
    pub lines_dropped: u64,
}

struct WriterState {
    ring: VecDeque<WriteTask>,
    pending: Vec<u8>,
    stop: bool,
}

struct WriterShared {
    fd: RawFd,
    config: WriterConfig,
    state: Mutex<WriterState>,
    /// Signaled when a task is queued or stop is requested
    task_ready: Condvar,
    /// Signaled when the writer thread pops a task
    slot_free: Condvar,
    bytes_written: AtomicU64,
    tasks_written: AtomicU64,
    write_errors: AtomicU64,
    lock_failures: AtomicU64,
    lines_dropped: AtomicU64,
}

/// Buffered, thread-backed writer for one descriptor
pub struct AsyncWriter {
    shared: Arc<WriterShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    /// Keeps an owned descriptor open until the thread is joined
    owned: Option<OwnedFd>,
}

impl AsyncWriter {
    /// Start a writer on a descriptor the caller keeps open
    /// (stdout, a shared log file).
    pub fn create(fd: RawFd, config: WriterConfig) -> RtResult<Self> {
        Self::spawn(fd, None, config)
    }

    /// Start a writer that owns `fd` and closes it on free
    /// (a connected log socket).
    pub fn from_owned(fd: OwnedFd, config: WriterConfig) -> RtResult<Self> {
        let raw = fd.as_raw_fd();
        Self::spawn(raw, Some(fd), config)
    }

    fn spawn(fd: RawFd, owned: Option<OwnedFd>, config: WriterConfig) -> RtResult<Self> {
        let shared = Arc::new(WriterShared {
            fd,
            state: Mutex::new(WriterState {
                ring: VecDeque::with_capacity(config.max_tasks),
                pending: Vec::with_capacity(config.buffer_size),
                stop: false,
            }),
            config,
            task_ready: Condvar::new(),
            slot_free: Condvar::new(),
            bytes_written: AtomicU64::new(0),
            tasks_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            lock_failures: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("edrt-writer-{}", fd))
            .spawn(move || writer_loop(thread_shared))
            .map_err(|e| {
                kwarn!("writer fd {}: spawn failed: {}", fd, e);
                RtError::SpawnFailed
            })?;

        kdebug!("writer fd {} started", fd);
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
            owned,
        })
    }

    /// Queue `data` for writing.
    ///
    /// Never waits on I/O. With `Backpressure::Block` it may wait for the
    /// writer thread to free a ring slot; with `Reject` it returns
    /// `QueueFull` and none of `data` is accepted.
    pub fn write(&self, data: &[u8]) -> RtResult<()> {
        self.queue(data, self.shared.config.policy)
    }

    /// Queue `data` without ever waiting for a ring slot: `QueueFull`
    /// regardless of the configured policy.
    pub fn try_write(&self, data: &[u8]) -> RtResult<()> {
        self.queue(data, Backpressure::Reject)
    }

    fn queue(&self, data: &[u8], policy: Backpressure) -> RtResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let cap = self.shared.config.buffer_size;
        let mut st = self.shared.lock();
        if st.stop {
            return Err(RtError::Stopped);
        }

        if st.pending.len() + data.len() > cap {
            if !st.pending.is_empty() {
                st = self.shared.reserve_slot(st, policy)?;
                self.shared.seal(&mut st);
            }
            if data.len() > cap {
                st = self.shared.reserve_slot(st, policy)?;
                self.shared.push(&mut st, data.into());
                return Ok(());
            }
        }
        st.pending.extend_from_slice(data);
        Ok(())
    }

    /// Format and queue; the `printf` of this writer
    pub fn printf(&self, args: fmt::Arguments<'_>) -> RtResult<()> {
        match args.as_str() {
            Some(s) => self.write(s.as_bytes()),
            None => self.write(args.to_string().as_bytes()),
        }
    }

    /// Seal the coalescing buffer into a task now.
    ///
    /// Call before blocking reads or exit so output is not left sitting in
    /// the buffer.
    pub fn flush(&self) -> RtResult<()> {
        self.seal_pending(self.shared.config.policy)
    }

    /// `flush` that fails with `QueueFull` instead of waiting
    pub fn try_flush(&self) -> RtResult<()> {
        self.seal_pending(Backpressure::Reject)
    }

    fn seal_pending(&self, policy: Backpressure) -> RtResult<()> {
        let st = self.shared.lock();
        if st.stop || st.pending.is_empty() {
            return Ok(());
        }
        let mut st = self.shared.reserve_slot(st, policy)?;
        self.shared.seal(&mut st);
        Ok(())
    }

    /// Request shutdown and join the writer thread.
    ///
    /// Everything queued before the call, including the coalescing buffer,
    /// is written first. Idempotent.
    pub fn stop(&self) {
        let first = {
            let mut st = self.shared.lock();
            !std::mem::replace(&mut st.stop, true)
        };
        // Logged outside the lock: this writer may be a log sink.
        if first {
            kdebug!("writer fd {}: stop requested", self.shared.fd);
        }
        self.shared.task_ready.notify_all();
        self.shared.slot_free.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                kwarn!("writer fd {}: thread panicked", self.shared.fd);
            }
            self.stopped.store(true, Ordering::Release);
        }
    }

    /// Whether `stop()` has completed
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Release the writer, closing an owned descriptor.
    ///
    /// Refused unless `stop()` has completed: the writer is handed back
    /// untouched.
    pub fn free(self) -> Result<(), Self> {
        if !self.is_stopped() {
            return Err(self);
        }
        drop(self);
        Ok(())
    }

    /// Tasks waiting in the ring
    pub fn pending_tasks(&self) -> usize {
        self.shared.lock().ring.len()
    }

    /// Bytes sitting in the coalescing buffer
    pub fn buffered_bytes(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    pub fn stats(&self) -> WriterStats {
        let s = &self.shared;
        WriterStats {
            bytes_written: s.bytes_written.load(Ordering::Relaxed),
            tasks_written: s.tasks_written.load(Ordering::Relaxed),
            write_errors: s.write_errors.load(Ordering::Relaxed),
            lock_failures: s.lock_failures.load(Ordering::Relaxed),
            lines_dropped: s.lines_dropped.load(Ordering::Relaxed),
        }
    }
}

impl WriterShared {
    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait (or fail, per policy) until the ring has a free slot
    fn reserve_slot<'a>(
        &'a self,
        mut st: MutexGuard<'a, WriterState>,
        policy: Backpressure,
    ) -> RtResult<MutexGuard<'a, WriterState>> {
        while st.ring.len() >= self.config.max_tasks {
            match policy {
                Backpressure::Reject => return Err(RtError::QueueFull),
                Backpressure::Block => {
                    st = self.slot_free.wait(st).unwrap_or_else(|e| e.into_inner());
                    if st.stop {
                        return Err(RtError::Stopped);
                    }
                }
            }
        }
        Ok(st)
    }

    fn seal(&self, st: &mut WriterState) {
        let data = std::mem::replace(
            &mut st.pending,
            Vec::with_capacity(self.config.buffer_size),
        );
        self.push(st, data.into_boxed_slice());
    }

    fn push(&self, st: &mut WriterState, data: Box<[u8]>) {
        debug_assert!(st.ring.len() < self.config.max_tasks);
        st.ring.push_back(WriteTask { data });
        self.task_ready.notify_one();
    }

    fn transmit(&self, data: &[u8], warned: &mut bool) {
        let guard = if self.config.advisory_lock {
            match FdWriteLock::acquire(self.fd) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    if self.lock_failures.fetch_add(1, Ordering::Relaxed) == 0 {
                        ktrace!("writer fd {}: writing unlocked: {}", self.fd, e);
                    }
                    None
                }
            }
        } else {
            None
        };

        match fd::write_all(self.fd, data) {
            Ok(()) => {
                self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
                self.tasks_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                // Once only: this writer may itself be a log sink.
                if !*warned {
                    *warned = true;
                    kwarn!("writer fd {}: dropping output: {}", self.fd, e);
                }
            }
        }
        drop(guard);
    }
}

fn writer_loop(shared: Arc<WriterShared>) {
    let mut warned = false;
    loop {
        let mut st = shared.lock();
        while st.ring.is_empty() && !st.stop {
            st = shared.task_ready.wait(st).unwrap_or_else(|e| e.into_inner());
        }

        if let Some(task) = st.ring.pop_front() {
            drop(st);
            shared.slot_free.notify_one();
            shared.transmit(&task.data, &mut warned);
            continue;
        }

        // Stop requested and the ring is drained: the coalescing buffer is
        // the last thing written.
        let tail = std::mem::take(&mut st.pending);
        drop(st);
        if !tail.is_empty() {
            shared.transmit(&tail, &mut warned);
        }
        break;
    }
    kdebug!("writer fd {} exiting", shared.fd);
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop();
        }
        // `owned` closes after the thread is gone.
        let _ = self.owned.take();
    }
}

impl io::Write for &AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AsyncWriter::write(*self, buf).map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        AsyncWriter::flush(*self).map_err(to_io_error)
    }
}

fn to_io_error(e: RtError) -> io::Error {
    let kind = match e {
        RtError::QueueFull => io::ErrorKind::WouldBlock,
        RtError::Stopped => io::ErrorKind::BrokenPipe,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

/// Never waits for a ring slot: lines arrive from any thread, including
/// this writer's own thread when a write fails. A full ring drops the line.
impl LogSink for AsyncWriter {
    fn write_line(&self, line: &str) {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        if self.try_write(&buf).is_err() {
            self.shared.lines_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let _ = self.try_flush();
    }
}

impl fmt::Debug for AsyncWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncWriter")
            .field("fd", &self.shared.fd)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::test_util::{pipe, read_to_end};
    use edrt_core::kprint::{self, LogLevel};
    use std::io::Write as _;
    use std::time::{Duration, Instant};

    fn small(buffer_size: usize, max_tasks: usize) -> WriterConfig {
        WriterConfig {
            max_tasks,
            buffer_size,
            ..WriterConfig::default()
        }
    }

    #[test]
    fn test_hello_end_to_end() {
        let (r, w) = pipe();
        let start = Instant::now();
        let writer = AsyncWriter::from_owned(w, WriterConfig::default()).unwrap();

        writer.write(b"hello").unwrap();
        writer.flush().unwrap();
        writer.stop();
        assert!(writer.free().is_ok());

        let out = read_to_end(r.as_raw_fd());
        assert_eq!(out, b"hello");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_fifo_across_splits() {
        let (r, w) = pipe();
        // Tiny buffer and ring force sealing, oversized tasks and blocking.
        let writer = AsyncWriter::from_owned(w, small(7, 2)).unwrap();
        let reader = thread::spawn(move || read_to_end(r.as_raw_fd()));

        let mut expected = Vec::new();
        for i in 0..500u32 {
            let chunk = format!("line-{}{}|", i, "x".repeat((i % 13) as usize));
            writer.write(chunk.as_bytes()).unwrap();
            expected.extend_from_slice(chunk.as_bytes());
        }
        writer.stop();
        drop(writer);

        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn test_concurrent_producers_keep_chunks_whole() {
        let (r, w) = pipe();
        let writer = Arc::new(AsyncWriter::from_owned(w, small(64, 8)).unwrap());
        let reader = thread::spawn(move || read_to_end(r.as_raw_fd()));

        let producers: Vec<_> = (0..4u8)
            .map(|id| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for _ in 0..100 {
                        writer.write(&[b'a' + id; 10]).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        writer.stop();
        drop(writer);

        let out = reader.join().unwrap();
        assert_eq!(out.len(), 4 * 100 * 10);
        for chunk in out.chunks(10) {
            assert!(chunk.iter().all(|&b| b == chunk[0]));
        }
    }

    #[test]
    fn test_free_before_stop_is_refused() {
        let (r, w) = pipe();
        let writer = AsyncWriter::from_owned(w, WriterConfig::default()).unwrap();
        writer.write(b"still alive").unwrap();

        let writer = writer.free().unwrap_err();
        assert!(!writer.is_stopped());
        writer.write(b"!").unwrap();

        writer.stop();
        writer.stop();
        assert!(writer.free().is_ok());
        assert_eq!(read_to_end(r.as_raw_fd()), b"still alive!");
    }

    #[test]
    fn test_write_after_stop() {
        let (_r, w) = pipe();
        let writer = AsyncWriter::from_owned(w, WriterConfig::default()).unwrap();
        writer.stop();
        assert_eq!(writer.write(b"late"), Err(RtError::Stopped));
        assert!(writer.flush().is_ok());
    }

    #[test]
    fn test_printf_and_io_write() {
        let (r, w) = pipe();
        let writer = AsyncWriter::from_owned(w, WriterConfig::default()).unwrap();
        writer.printf(format_args!("{}:{}", "row", 12)).unwrap();
        write!(&writer, " col {}", 3).unwrap();
        writer.write_line("[INFO]  saved");
        writer.stop();
        drop(writer);
        assert_eq!(read_to_end(r.as_raw_fd()), b"row:12 col 3[INFO]  saved\n");
    }

    #[test]
    fn test_stats_and_write_errors() {
        let (r, w) = pipe();
        let writer = AsyncWriter::from_owned(w, small(4, 4)).unwrap();
        writer.write(b"abcdefgh").unwrap();
        writer.write(b"ij").unwrap();
        writer.stop();
        let stats = writer.stats();
        assert_eq!(stats.bytes_written, 10);
        assert_eq!(stats.tasks_written, 2);
        assert_eq!(stats.write_errors, 0);
        drop(writer);
        drop(r);

        let (r, w) = pipe();
        drop(r);
        let writer = AsyncWriter::from_owned(w, WriterConfig::default()).unwrap();
        writer.write(b"nobody listens").unwrap();
        writer.stop();
        assert_eq!(writer.stats().write_errors, 1);
    }

    #[test]
    fn test_try_write_never_waits() {
        // Nobody reads the pipe: once it fills, the writer thread blocks in
        // write(2) and the one-slot ring stays full.
        let (r, w) = pipe();
        let config = WriterConfig {
            max_tasks: 1,
            buffer_size: 4,
            policy: Backpressure::Block,
            advisory_lock: false,
        };
        let writer = AsyncWriter::from_owned(w, config).unwrap();

        let mut full = false;
        for _ in 0..1_000_000 {
            if writer.try_write(b"abcd") == Err(RtError::QueueFull) {
                full = true;
                break;
            }
        }
        assert!(full);
        assert_eq!(writer.try_flush(), Err(RtError::QueueFull));

        drop(r);
        writer.stop();
        assert!(writer.stats().write_errors > 0);
    }

    #[test]
    fn test_log_sink_writer_with_failing_fd_and_full_ring() {
        // Every write fails with EPIPE and the producer keeps the one-slot
        // ring full; the writer thread's own warning comes back through the
        // sink and must not wait on the ring it alone empties.
        let (r, w) = pipe();
        drop(r);
        let config = WriterConfig {
            max_tasks: 1,
            buffer_size: 4,
            policy: Backpressure::Block,
            advisory_lock: false,
        };
        let writer = Arc::new(AsyncWriter::from_owned(w, config).unwrap());
        let sink: Arc<dyn LogSink> = writer.clone();
        kprint::set_log_level(LogLevel::Warn);
        kprint::add_sink(Arc::clone(&sink));

        let producer = {
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                for _ in 0..2000 {
                    writer.write(b"abcd").unwrap();
                }
            })
        };
        let deadline = Instant::now() + Duration::from_secs(10);
        while !producer.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let finished = producer.is_finished();

        assert!(kprint::remove_sink(&sink));
        writer.stop();
        assert!(finished, "producer stalled behind the writer thread");
        producer.join().unwrap();
        assert!(writer.stats().write_errors > 0);
    }

    #[test]
    fn test_reject_policy_when_ring_full() {
        // A second descriptor on the same file contends for the same lock,
        // so holding it stalls the writer thread.
        let path = std::env::temp_dir().join(format!("edrt-writer-reject-{}", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        let blocker = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let held = FdWriteLock::acquire(blocker.as_raw_fd()).unwrap();

        let config = WriterConfig {
            max_tasks: 2,
            buffer_size: 4,
            policy: Backpressure::Reject,
            advisory_lock: true,
        };
        let writer = AsyncWriter::create(file.as_raw_fd(), config).unwrap();

        let mut rejected = false;
        for _ in 0..16 {
            if writer.write(b"1234").is_err() {
                rejected = true;
                break;
            }
        }
        assert!(rejected);
        assert!(writer.pending_tasks() <= 2);

        drop(held);
        writer.stop();
        let written = std::fs::read(&path).unwrap();
        assert!(!written.is_empty());
        assert!(written.chunks(4).all(|c| c == b"1234"));
        let _ = std::fs::remove_file(&path);
    }
}
