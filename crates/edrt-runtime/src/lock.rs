//! Advisory write locks on shared descriptors
//!
//! Before writing to a descriptor that another process (a forked child, a
//! second editor instance) may also write to, a whole-file write lock is
//! taken with `F_SETLKW` and released with `F_UNLCK` afterwards, so lock-aware
//! writers interleave whole chunks instead of partial writes.
//!
//! Record locks belong to the process, so two threads of one process would
//! both be granted the same lock. Holders are therefore also tracked in a
//! process-wide table keyed by file identity (device, inode): a second
//! thread waits there until the first releases.

use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex, MutexGuard};

use edrt_core::IoError;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::stat::fstat;

/// (st_dev, st_ino) of every file locked by this process
static HELD: Mutex<Vec<(u64, u64)>> = Mutex::new(Vec::new());
static RELEASED: Condvar = Condvar::new();

fn held() -> MutexGuard<'static, Vec<(u64, u64)>> {
    HELD.lock().unwrap_or_else(|e| e.into_inner())
}

/// RAII whole-file write lock; unlocked on drop
#[must_use = "the lock is released when the guard is dropped"]
pub struct FdWriteLock {
    fd: RawFd,
    key: (u64, u64),
}

fn whole_file(kind: libc::c_short) -> libc::flock {
    // Safety: flock is plain old data; all-zero is a valid value.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0; // to end of file, however far it grows
    fl
}

fn file_key(fd: RawFd) -> Result<(u64, u64), IoError> {
    let st = fstat(fd).map_err(|e| IoError::Lock(e as i32))?;
    Ok((st.st_dev as u64, st.st_ino as u64))
}

fn release_key(key: (u64, u64)) {
    let mut held = held();
    if let Some(pos) = held.iter().position(|k| *k == key) {
        held.swap_remove(pos);
    }
    drop(held);
    RELEASED.notify_all();
}

impl FdWriteLock {
    /// Block until the write lock on `fd` is held, first against other
    /// threads of this process, then against other processes.
    pub fn acquire(fd: RawFd) -> Result<Self, IoError> {
        let key = file_key(fd)?;
        {
            let mut held = held();
            while held.contains(&key) {
                held = RELEASED.wait(held).unwrap_or_else(|e| e.into_inner());
            }
            held.push(key);
        }

        let fl = whole_file(libc::F_WRLCK as libc::c_short);
        loop {
            match fcntl(fd, FcntlArg::F_SETLKW(&fl)) {
                Ok(_) => return Ok(Self { fd, key }),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    release_key(key);
                    return Err(IoError::Lock(e as i32));
                }
            }
        }
    }

    /// Descriptor this lock covers
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for FdWriteLock {
    fn drop(&mut self) {
        let fl = whole_file(libc::F_UNLCK as libc::c_short);
        let _ = fcntl(self.fd, FcntlArg::F_SETLK(&fl));
        release_key(self.key);
    }
}
