//! Raw descriptor helpers shared by the reader, listener and writer threads.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use edrt_core::IoError;
use nix::errno::Errno;

/// Write all of `buf` to `fd`, retrying on EINTR and short writes
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<(), IoError> {
    while !buf.is_empty() {
        // Safety: buf is a valid slice for its whole length.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(IoError::Write(e as i32)),
            }
        }
        if n == 0 {
            return Err(IoError::Write(libc::EIO));
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// One read() into `buf`, retrying on EINTR. `Ok(0)` is end of stream.
pub fn read_some(fd: RawFd, buf: &mut [u8]) -> Result<usize, IoError> {
    loop {
        // Safety: buf is a valid mutable slice for its whole length.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(IoError::Read(e as i32)),
        }
    }
}

/// Self-pipe used to interrupt a thread blocked in poll()
pub struct StopPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl StopPipe {
    pub fn new() -> Result<Self, IoError> {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: fds has room for the two descriptors pipe() returns.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(IoError::Pipe(Errno::last() as i32));
        }
        // Safety: pipe() just handed us ownership of both descriptors.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(read.as_raw_fd());
        set_cloexec(write.as_raw_fd());
        Ok(Self { read, write })
    }

    /// Make the read end readable; wakes any poller
    pub fn signal(&self) {
        let _ = write_all(self.write.as_raw_fd(), &[1u8]);
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn set_cloexec(fd: RawFd) {
    // Safety: plain fcntl on a descriptor we own.
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

/// Outcome of waiting on a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data (or EOF/hangup) is ready on the watched fd
    Readable,
    /// The stop pipe was signaled
    Stop,
}

/// Block until `fd` is readable or `stop` is signaled.
///
/// Stop wins when both are ready, so a stopping thread does not start
/// another read.
pub fn wait_readable(fd: RawFd, stop: &StopPipe) -> Result<Readiness, IoError> {
    let mut fds = [
        libc::pollfd { fd, events: libc::POLLIN, revents: 0 },
        libc::pollfd { fd: stop.read_fd(), events: libc::POLLIN, revents: 0 },
    ];
    loop {
        // Safety: fds is a valid array of two pollfd structs.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(IoError::Poll(e as i32)),
            }
        }
        if fds[1].revents != 0 {
            return Ok(Readiness::Stop);
        }
        if fds[0].revents & libc::POLLNVAL != 0 {
            return Err(IoError::Poll(libc::EBADF));
        }
        if fds[0].revents != 0 {
            return Ok(Readiness::Readable);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// (read end, write end)
    pub fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe() failed");
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    /// Read until EOF
    pub fn read_to_end(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = read_some(fd, &mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}
