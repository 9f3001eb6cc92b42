//! Optional log sinks
//!
//! - Network log: a TCP connection wrapped in an `AsyncWriter`; raw log
//!   text, no handshake, no framing.
//! - Debug socket: a unix-domain stream socket at a well-known path; one
//!   plain text line per log call.
//!
//! Neither is essential. A failed connect disables the sink and is never
//! retried.

use std::io::Write;
use std::net::TcpStream;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use edrt_core::{kdebug, IoError, LogSink, RtError, RtResult};

use crate::config::WriterConfig;
use crate::writer::AsyncWriter;

fn connect_error(e: &std::io::Error) -> RtError {
    RtError::Io(IoError::Connect(e.raw_os_error().unwrap_or(libc::ECONNREFUSED)))
}

/// Connect to `host:port` and start an `AsyncWriter` on the socket.
///
/// The writer owns the socket. Advisory locking is turned off: record locks
/// mean nothing on a socket.
pub fn connect_netlog(host: &str, port: u16, mut config: WriterConfig) -> RtResult<AsyncWriter> {
    let stream = TcpStream::connect((host, port)).map_err(|e| {
        kdebug!("netlog {}:{}: connect failed: {}", host, port, e);
        connect_error(&e)
    })?;
    let _ = stream.set_nodelay(true);
    config.advisory_lock = false;
    kdebug!("netlog connected to {}:{}", host, port);
    AsyncWriter::from_owned(OwnedFd::from(stream), config)
}

/// Line sink on a unix-domain stream socket
pub struct DebugSink {
    path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
}

impl DebugSink {
    /// Connect to `path`; `None` when nothing is listening there
    pub fn connect(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        match UnixStream::connect(path) {
            Ok(stream) => {
                kdebug!("debug socket connected: {}", path.display());
                Some(Self { path: path.to_path_buf(), stream: Mutex::new(Some(stream)) })
            }
            Err(e) => {
                kdebug!("debug socket {}: {}", path.display(), e);
                None
            }
        }
    }

    /// False once a write has failed
    pub fn is_enabled(&self) -> bool {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for DebugSink {
    fn write_line(&self, line: &str) {
        let mut guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let Some(stream) = guard.as_mut() else { return };
        let ok = stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.write_all(b"\n"))
            .is_ok();
        if !ok {
            *guard = None;
        }
    }
}

impl std::fmt::Debug for DebugSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSink")
            .field("path", &self.path)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
