//! Error types for the edrt runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    /// Bounded queue is at capacity and the policy is reject
    QueueFull,

    /// Component was already stopped
    Stopped,

    /// `free` was called before `stop` completed
    NotStopped,

    /// Event loop is already running
    AlreadyRunning,

    /// Operation is reserved for the main thread
    NotMainThread,

    /// Failed to spawn a thread
    SpawnFailed,

    /// Task panicked before producing a result
    TaskPanicked,

    /// Configuration rejected
    InvalidConfig(&'static str),

    /// File-descriptor level failure
    Io(IoError),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::QueueFull => write!(f, "queue full"),
            RtError::Stopped => write!(f, "component stopped"),
            RtError::NotStopped => write!(f, "component not stopped"),
            RtError::AlreadyRunning => write!(f, "event loop already running"),
            RtError::NotMainThread => write!(f, "not called from the main thread"),
            RtError::SpawnFailed => write!(f, "failed to spawn thread"),
            RtError::TaskPanicked => write!(f, "task panicked"),
            RtError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            RtError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for RtError {}

/// Descriptor-level errors, each carrying the errno
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// pipe() for the stop channel failed
    Pipe(i32),

    /// poll() failed
    Poll(i32),

    /// read() failed
    Read(i32),

    /// write() failed
    Write(i32),

    /// fcntl() record lock failed
    Lock(i32),

    /// socket()/connect() failed
    Connect(i32),

    /// accept() failed
    Accept(i32),
}

impl IoError {
    /// The errno behind this error
    pub fn errno(&self) -> i32 {
        match *self {
            IoError::Pipe(e)
            | IoError::Poll(e)
            | IoError::Read(e)
            | IoError::Write(e)
            | IoError::Lock(e)
            | IoError::Connect(e)
            | IoError::Accept(e) => e,
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Pipe(e) => write!(f, "pipe: errno {}", e),
            IoError::Poll(e) => write!(f, "poll: errno {}", e),
            IoError::Read(e) => write!(f, "read: errno {}", e),
            IoError::Write(e) => write!(f, "write: errno {}", e),
            IoError::Lock(e) => write!(f, "fcntl lock: errno {}", e),
            IoError::Connect(e) => write!(f, "connect: errno {}", e),
            IoError::Accept(e) => write!(f, "accept: errno {}", e),
        }
    }
}

impl From<IoError> for RtError {
    fn from(e: IoError) -> Self {
        RtError::Io(e)
    }
}
