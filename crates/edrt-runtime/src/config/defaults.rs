//! Compiled-in defaults for `RuntimeConfig`.
//!
//! Every value here can be overridden at runtime through the matching
//! `EDRT_*` environment variable.

use edrt_core::constants;

use super::Backpressure;

// Worker threads in the pool
pub const NUM_WORKERS: usize = constants::MAX_THREADS;

// Bounded worker task queue
pub const POOL_QUEUE_SIZE: usize = constants::POOL_QUEUE_SIZE;

// enqueue() on a full pool queue fails fast
pub const POOL_POLICY: Backpressure = Backpressure::Reject;

// Pending write tasks per writer
pub const WRITER_MAX_TASKS: usize = constants::WRITER_MAX_TASKS;

// Coalescing buffer per writer
pub const WRITER_BUFFER_SIZE: usize = constants::WRITER_BUFFER_SIZE;

// write() on a full ring waits for the writer thread
pub const WRITER_POLICY: Backpressure = Backpressure::Block;

// Per-read buffer of a reader thread
pub const READER_BUFFER_SIZE: usize = constants::READER_BUFFER_SIZE;

// Take fcntl write locks around every write
pub const ADVISORY_LOCK: bool = true;
