//! # edrt-core
//!
//! Core types for the edrt editor runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All thread and file-descriptor machinery lives in `edrt-runtime`.
//!
//! ## Modules
//!
//! - `error` - Error taxonomy shared by every component
//! - `fatal` - Process-wide fatal-error callback
//! - `future` - One-shot future/promise pair
//! - `kprint` - Kernel-style leveled logging with pluggable sinks
//! - `env` - Environment variable utilities
//! - `notifier` - Cross-thread wakeup trait

pub mod error;
pub mod fatal;
pub mod future;
pub mod kprint;
pub mod env;
pub mod notifier;

// Re-exports for convenience
pub use error::{IoError, RtError, RtResult};
pub use fatal::{fatal, set_fatal_error_callback};
pub use future::{pair, submit, Future, Promise};
pub use kprint::LogSink;
pub use notifier::Notifier;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Capacity constants
pub mod constants {
    cfg_if::cfg_if! {
        if #[cfg(feature = "large-buffers")] {
            /// Coalescing buffer size of an AsyncWriter (64 KB)
            pub const WRITER_BUFFER_SIZE: usize = 64 * 1024;
        } else {
            /// Coalescing buffer size of an AsyncWriter (4 KB)
            pub const WRITER_BUFFER_SIZE: usize = 4096;
        }
    }

    /// Pending write tasks per AsyncWriter
    pub const WRITER_MAX_TASKS: usize = 1024;

    /// Local read buffer of an AsyncReader
    pub const READER_BUFFER_SIZE: usize = 1024;

    /// Bounded task queue of the worker pool
    pub const POOL_QUEUE_SIZE: usize = 200;

    /// Worker threads in the pool
    pub const MAX_THREADS: usize = 8;

    /// Hard ceiling for configured worker count
    pub const MAX_WORKERS: usize = 64;

    /// Hard ceiling for any configured buffer (1 MB)
    pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;
}
