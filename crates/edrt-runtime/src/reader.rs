//! Background reader for one descriptor
//!
//! A dedicated thread waits for input on the descriptor and hands every
//! chunk it reads to a callback, on the reader thread. The callback must not
//! touch editor state: it either does thread-safe work (decode and reply
//! through an `AsyncWriter`) or re-submits work to the event handler through
//! the `Submitter` it is given.
//!
//! The thread waits in poll() on the descriptor and on a private stop pipe,
//! so `stop()` returns promptly even when no input ever arrives. EOF or a
//! read error ends the loop on its own.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use edrt_core::{kdebug, ktrace, kwarn, IoError, RtError, RtResult};

use crate::config::ReaderConfig;
use crate::event::Submitter;
use crate::fd::{self, Readiness, StopPipe};

/// Counters for one reader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub bytes_read: u64,
    pub chunks: u64,
}

/// Thread + stop pipe + owned descriptor, shared by readers and listeners
pub(crate) struct Watcher {
    fd: RawFd,
    stop: Arc<StopPipe>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    ended: Arc<AtomicBool>,
    source: Option<Arc<OwnedFd>>,
}

impl Watcher {
    /// Spawn `body(fd, stop)` on a thread named `name`
    pub(crate) fn spawn<B>(name: String, source: OwnedFd, body: B) -> RtResult<Self>
    where
        B: FnOnce(RawFd, &StopPipe) + Send + 'static,
    {
        let fd = source.as_raw_fd();
        let stop = Arc::new(StopPipe::new()?);
        let source = Arc::new(source);
        let ended = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread_source = Arc::clone(&source);
        let thread_ended = Arc::clone(&ended);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                body(thread_source.as_raw_fd(), &thread_stop);
                thread_ended.store(true, Ordering::Release);
                drop(thread_source);
            })
            .map_err(|e| {
                kwarn!("fd {}: spawn failed: {}", fd, e);
                RtError::SpawnFailed
            })?;

        Ok(Self {
            fd,
            stop,
            thread: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
            ended,
            source: Some(source),
        })
    }

    /// Signal the thread and join it.
    ///
    /// Called from the watcher's own callback (a reader unregistering
    /// itself), the join is skipped: the loop sees the stop signal as soon
    /// as the callback returns, and the thread's own reference keeps the
    /// descriptor open until then.
    pub(crate) fn stop(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            self.stop.signal();
            if handle.thread().id() == thread::current().id() {
                self.stopped.store(true, Ordering::Release);
                kdebug!("fd {}: watcher stopped from its own thread", self.fd);
                return;
            }
            if handle.join().is_err() {
                kwarn!("fd {}: callback panicked", self.fd);
            }
            self.stopped.store(true, Ordering::Release);
            kdebug!("fd {}: watcher stopped", self.fd);
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
        // Last reference once the thread is joined: closes the descriptor.
        let _ = self.source.take();
    }
}

/// Thread-backed reader that streams input to a callback
pub struct AsyncReader {
    watcher: Watcher,
    bytes_read: Arc<AtomicU64>,
    chunks: Arc<AtomicU64>,
}

impl AsyncReader {
    /// Take ownership of `fd` and start reading it.
    ///
    /// `callback(handler, bytes)` runs on the reader thread for every
    /// non-empty read.
    pub fn create<F>(
        handler: Submitter,
        fd: OwnedFd,
        config: ReaderConfig,
        mut callback: F,
    ) -> RtResult<Self>
    where
        F: FnMut(&Submitter, &[u8]) + Send + 'static,
    {
        let raw = fd.as_raw_fd();
        let bytes_read = Arc::new(AtomicU64::new(0));
        let chunks = Arc::new(AtomicU64::new(0));
        let thread_bytes = Arc::clone(&bytes_read);
        let thread_chunks = Arc::clone(&chunks);

        let watcher = Watcher::spawn(format!("edrt-reader-{}", raw), fd, move |fd, stop| {
            let mut buf = vec![0u8; config.buffer_size.max(1)];
            loop {
                match fd::wait_readable(fd, stop) {
                    Ok(Readiness::Stop) => break,
                    Ok(Readiness::Readable) => {}
                    Err(e) => {
                        kwarn!("reader fd {}: {}", fd, e);
                        break;
                    }
                }
                match fd::read_some(fd, &mut buf) {
                    Ok(0) => {
                        kdebug!("reader fd {}: end of stream", fd);
                        break;
                    }
                    Ok(n) => {
                        thread_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        thread_chunks.fetch_add(1, Ordering::Relaxed);
                        ktrace!("reader fd {}: {} bytes", fd, n);
                        callback(&handler, &buf[..n]);
                    }
                    Err(IoError::Read(e)) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => {}
                    Err(e) => {
                        kdebug!("reader fd {}: {}", fd, e);
                        break;
                    }
                }
            }
        })?;

        kdebug!("reader fd {} started", raw);
        Ok(Self { watcher, bytes_read, chunks })
    }

    /// Signal the thread and join it. Idempotent.
    pub fn stop(&self) {
        self.watcher.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.watcher.is_stopped()
    }

    /// Whether the thread left its loop (EOF, error or stop)
    pub fn has_ended(&self) -> bool {
        self.watcher.has_ended()
    }

    /// Close the descriptor and release the reader.
    ///
    /// Refused unless `stop()` has completed: the reader is handed back.
    pub fn free(self) -> Result<(), Self> {
        if !self.is_stopped() {
            return Err(self);
        }
        drop(self);
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.watcher.fd()
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AsyncReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncReader")
            .field("fd", &self.fd())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventHandler;
    use crate::fd::test_util::pipe;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_chunks_reach_callback() {
        let handler = EventHandler::new();
        let (r, w) = pipe();
        let (tx, rx) = mpsc::channel::<Vec<u8>>();

        let reader = AsyncReader::create(handler.submitter(), r, ReaderConfig::default(), move |_, bytes| {
            tx.send(bytes.to_vec()).unwrap();
        })
        .unwrap();

        fd::write_all(w.as_raw_fd(), b"\x1b[A").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"\x1b[A");

        reader.stop();
        assert_eq!(reader.stats(), ReaderStats { bytes_read: 3, chunks: 1 });
        assert!(reader.free().is_ok());
    }

    #[test]
    fn test_eof_ends_loop() {
        let handler = EventHandler::new();
        let (r, w) = pipe();
        let reader = AsyncReader::create(handler.submitter(), r, ReaderConfig::default(), |_, _| {}).unwrap();

        drop(w);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !reader.has_ended() {
            assert!(Instant::now() < deadline, "reader did not see EOF");
            thread::sleep(Duration::from_millis(5));
        }
        reader.stop();
        assert!(reader.is_stopped());
    }

    #[test]
    fn test_stop_without_input_and_free_order() {
        let handler = EventHandler::new();
        let (r, _w) = pipe();
        let reader = AsyncReader::create(handler.submitter(), r, ReaderConfig::default(), |_, _| {}).unwrap();

        // free before stop is a no-op that hands the reader back
        let reader = reader.free().unwrap_err();
        assert!(!reader.is_stopped());

        let start = Instant::now();
        reader.stop();
        reader.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(reader.free().is_ok());
    }

    #[test]
    fn test_free_closes_descriptor() {
        let handler = EventHandler::new();
        let (r, w) = pipe();
        let reader = AsyncReader::create(handler.submitter(), r, ReaderConfig::default(), |_, _| {}).unwrap();
        reader.stop();
        reader.free().unwrap();

        // With the only read end closed, writing now fails with EPIPE.
        assert_eq!(fd::write_all(w.as_raw_fd(), b"x"), Err(IoError::Write(libc::EPIPE)));
    }

    #[test]
    fn test_callback_resubmits_to_handler() {
        let handler = Arc::new(EventHandler::new());
        let (r, w) = pipe();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_cb = Arc::clone(&seen);
        let reader = AsyncReader::create(handler.submitter(), r, ReaderConfig::default(), move |h, bytes| {
            let owned = bytes.to_vec();
            let seen = Arc::clone(&seen_cb);
            let stopper = h.clone();
            h.submit(move || {
                seen.lock().unwrap().extend_from_slice(&owned);
                stopper.stop(7);
            })
            .unwrap();
        })
        .unwrap();

        fd::write_all(w.as_raw_fd(), b"q").unwrap();
        assert_eq!(handler.start(false), Ok(7));
        assert_eq!(*seen.lock().unwrap(), b"q");
        reader.stop();
    }
}
