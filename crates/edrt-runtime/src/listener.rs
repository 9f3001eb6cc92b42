//! Background accept loop for a listening socket
//!
//! Same thread discipline as `AsyncReader`: poll on the socket and a stop
//! pipe, join on stop. Each accepted connection is handed to the callback as
//! an `OwnedFd`, together with the handler's `Submitter`.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use edrt_core::{kdebug, kwarn, IoError, RtResult};
use nix::errno::Errno;

use crate::event::Submitter;
use crate::fd::{self, Readiness};
use crate::reader::Watcher;

/// Thread-backed accept loop
pub struct Listener {
    watcher: Watcher,
}

impl Listener {
    /// Take ownership of a listening socket and start accepting.
    pub fn create<F>(handler: Submitter, fd: OwnedFd, mut on_accept: F) -> RtResult<Self>
    where
        F: FnMut(&Submitter, OwnedFd) + Send + 'static,
    {
        let raw = fd.as_raw_fd();
        let watcher = Watcher::spawn(format!("edrt-listener-{}", raw), fd, move |fd, stop| loop {
            match fd::wait_readable(fd, stop) {
                Ok(Readiness::Stop) => break,
                Ok(Readiness::Readable) => {}
                Err(e) => {
                    kwarn!("listener fd {}: {}", fd, e);
                    break;
                }
            }
            match accept(fd) {
                Ok(conn) => {
                    kdebug!("listener fd {}: accepted fd {}", fd, conn.as_raw_fd());
                    on_accept(&handler, conn);
                }
                Err(IoError::Accept(e))
                    if e == libc::EAGAIN || e == libc::EWOULDBLOCK || e == libc::ECONNABORTED => {}
                Err(e) => {
                    kwarn!("listener fd {}: {}", fd, e);
                    break;
                }
            }
        })?;
        kdebug!("listener fd {} started", raw);
        Ok(Self { watcher })
    }

    /// Signal the thread and join it. Idempotent.
    pub fn stop(&self) {
        self.watcher.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.watcher.is_stopped()
    }

    /// Close the socket and release the listener; refused before `stop()`.
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
}

fn accept(fd: RawFd) -> Result<OwnedFd, IoError> {
    loop {
        // Safety: null address arguments are allowed by accept(2).
        let conn = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if conn >= 0 {
            // Safety: fcntl on the descriptor accept() just returned.
            unsafe {
                libc::fcntl(conn, libc::F_SETFD, libc::FD_CLOEXEC);
            }
            // Safety: accept() transferred ownership of `conn` to us.
            return Ok(unsafe { OwnedFd::from_raw_fd(conn) });
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(IoError::Accept(e as i32)),
        }
    }
}
