//! # edrt-runtime
//!
//! OS-thread runtime for the edrt editor core.
//!
//! This crate provides:
//! - `AsyncWriter`: buffered background writer with advisory fd locking
//! - `AsyncReader` / `Listener`: background input threads feeding callbacks
//! - `EventHandler`: run loop that owns editor state, plus its sources
//! - `WorkerPool`: fixed worker threads with main-thread completion callbacks
//! - `PauseGuard`: scoped, main-thread-only pause of the pool
//! - Optional log sinks (network, unix debug socket)
//!
//! Every component owns its thread and joins it on stop.

#![cfg(unix)]

pub mod config;
pub mod event;
pub mod fd;
pub mod listener;
pub mod lock;
pub mod pause;
pub mod pool;
pub mod reader;
pub mod sink;
pub mod writer;

// Re-exports
pub use config::{Backpressure, ConfigError, PoolConfig, ReaderConfig, RuntimeConfig, WriterConfig};
pub use event::{Callback, EventHandler, Submitter};
pub use listener::Listener;
pub use lock::FdWriteLock;
pub use pause::PauseGuard;
pub use pool::{PoolStats, WorkerPool};
pub use reader::{AsyncReader, ReaderStats};
pub use sink::{connect_netlog, DebugSink};
pub use writer::{AsyncWriter, WriteTask, WriterStats};
