//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use edrt_runtime::config::{Backpressure, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_env()
//!     .num_workers(4)
//!     .pool_policy(Backpressure::Block);
//! ```

pub mod defaults;

use edrt_core::constants::{MAX_BUFFER_SIZE, MAX_WORKERS};
use edrt_core::env::{env_get, env_get_bool, env_get_opt, env_get_with};
use edrt_core::RtError;

/// What a bounded queue does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Caller waits until a slot frees up
    Block,
    /// Caller gets `RtError::QueueFull` immediately
    Reject,
}

impl Backpressure {
    pub fn parse(v: &str) -> Option<Self> {
        match v.to_ascii_lowercase().as_str() {
            "block" => Some(Backpressure::Block),
            "reject" => Some(Backpressure::Reject),
            _ => None,
        }
    }
}

/// Settings for one `AsyncWriter`
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Ring capacity in tasks
    pub max_tasks: usize,
    /// Coalescing buffer capacity in bytes
    pub buffer_size: usize,
    /// Behavior when the ring is full
    pub policy: Backpressure,
    /// Wrap each write in an fcntl write lock
    pub advisory_lock: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_tasks: defaults::WRITER_MAX_TASKS,
            buffer_size: defaults::WRITER_BUFFER_SIZE,
            policy: defaults::WRITER_POLICY,
            advisory_lock: defaults::ADVISORY_LOCK,
        }
    }
}

/// Settings for one `AsyncReader`
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Bytes requested per read()
    pub buffer_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self { buffer_size: defaults::READER_BUFFER_SIZE }
    }
}

/// Settings for the `WorkerPool`
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker thread count
    pub num_workers: usize,
    /// Bounded task queue capacity
    pub queue_size: usize,
    /// Behavior when the task queue is full
    pub policy: Backpressure,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            queue_size: defaults::POOL_QUEUE_SIZE,
            policy: defaults::POOL_POLICY,
        }
    }
}

/// Whole-runtime configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads in the pool
    pub num_workers: usize,
    /// Worker task queue capacity
    pub pool_queue_size: usize,
    /// Worker queue overflow behavior
    pub pool_policy: Backpressure,
    /// Pending write tasks per writer
    pub writer_max_tasks: usize,
    /// Coalescing buffer per writer
    pub writer_buffer_size: usize,
    /// Writer ring overflow behavior
    pub writer_policy: Backpressure,
    /// Per-read buffer of reader threads
    pub reader_buffer_size: usize,
    /// fcntl write locks around writes
    pub advisory_lock: bool,
    /// Network log sink (host, port)
    pub netlog: Option<(String, u16)>,
    /// Debug unix-domain socket path
    pub debug_socket: Option<String>,
}

/// Compiled-in defaults; the environment is read only by `from_env()`
impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Create config from compiled defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `EDRT_NUM_WORKERS` - Worker thread count
    /// - `EDRT_POOL_QUEUE_SIZE` - Worker task queue capacity
    /// - `EDRT_POOL_POLICY` - `block` or `reject`
    /// - `EDRT_WRITER_MAX_TASKS` - Writer ring capacity
    /// - `EDRT_WRITER_BUFFER_SIZE` - Writer coalescing buffer bytes
    /// - `EDRT_WRITER_POLICY` - `block` or `reject`
    /// - `EDRT_READER_BUFFER_SIZE` - Reader buffer bytes
    /// - `EDRT_ADVISORY_LOCK` - fcntl locking (0/1)
    /// - `EDRT_NETLOG` - `host:port` of the network log sink
    /// - `EDRT_DEBUG_SOCKET` - Path of the debug unix socket
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("EDRT_NUM_WORKERS", defaults::NUM_WORKERS),
            pool_queue_size: env_get("EDRT_POOL_QUEUE_SIZE", defaults::POOL_QUEUE_SIZE),
            pool_policy: env_get_with(
                "EDRT_POOL_POLICY",
                defaults::POOL_POLICY,
                Backpressure::parse,
            ),
            writer_max_tasks: env_get("EDRT_WRITER_MAX_TASKS", defaults::WRITER_MAX_TASKS),
            writer_buffer_size: env_get(
                "EDRT_WRITER_BUFFER_SIZE",
                defaults::WRITER_BUFFER_SIZE,
            ),
            writer_policy: env_get_with(
                "EDRT_WRITER_POLICY",
                defaults::WRITER_POLICY,
                Backpressure::parse,
            ),
            reader_buffer_size: env_get(
                "EDRT_READER_BUFFER_SIZE",
                defaults::READER_BUFFER_SIZE,
            ),
            advisory_lock: env_get_bool("EDRT_ADVISORY_LOCK", defaults::ADVISORY_LOCK),
            netlog: env_get_opt::<String>("EDRT_NETLOG").and_then(|v| parse_host_port(&v)),
            debug_socket: env_get_opt("EDRT_DEBUG_SOCKET"),
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing.
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            pool_queue_size: defaults::POOL_QUEUE_SIZE,
            pool_policy: defaults::POOL_POLICY,
            writer_max_tasks: defaults::WRITER_MAX_TASKS,
            writer_buffer_size: defaults::WRITER_BUFFER_SIZE,
            writer_policy: defaults::WRITER_POLICY,
            reader_buffer_size: defaults::READER_BUFFER_SIZE,
            advisory_lock: defaults::ADVISORY_LOCK,
            netlog: None,
            debug_socket: None,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn pool_queue_size(mut self, n: usize) -> Self {
        self.pool_queue_size = n;
        self
    }

    pub fn pool_policy(mut self, policy: Backpressure) -> Self {
        self.pool_policy = policy;
        self
    }

    pub fn writer_max_tasks(mut self, n: usize) -> Self {
        self.writer_max_tasks = n;
        self
    }

    pub fn writer_buffer_size(mut self, n: usize) -> Self {
        self.writer_buffer_size = n;
        self
    }

    pub fn writer_policy(mut self, policy: Backpressure) -> Self {
        self.writer_policy = policy;
        self
    }

    pub fn reader_buffer_size(mut self, n: usize) -> Self {
        self.reader_buffer_size = n;
        self
    }

    pub fn advisory_lock(mut self, enable: bool) -> Self {
        self.advisory_lock = enable;
        self
    }

    pub fn netlog(mut self, host: impl Into<String>, port: u16) -> Self {
        self.netlog = Some((host.into(), port));
        self
    }

    pub fn debug_socket(mut self, path: impl Into<String>) -> Self {
        self.debug_socket = Some(path.into());
        self
    }

    /// Writer settings derived from this config
    pub fn writer(&self) -> WriterConfig {
        WriterConfig {
            max_tasks: self.writer_max_tasks,
            buffer_size: self.writer_buffer_size,
            policy: self.writer_policy,
            advisory_lock: self.advisory_lock,
        }
    }

    /// Reader settings derived from this config
    pub fn reader(&self) -> ReaderConfig {
        ReaderConfig { buffer_size: self.reader_buffer_size }
    }

    /// Pool settings derived from this config
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            num_workers: self.num_workers,
            queue_size: self.pool_queue_size,
            policy: self.pool_policy,
        }
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 64"));
        }
        if self.pool_queue_size == 0 {
            return Err(ConfigError::InvalidValue("pool_queue_size must be > 0"));
        }
        if self.writer_max_tasks == 0 {
            return Err(ConfigError::InvalidValue("writer_max_tasks must be > 0"));
        }
        if self.writer_buffer_size == 0 || self.writer_buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::InvalidValue(
                "writer_buffer_size must be in 1..=1MB",
            ));
        }
        if self.reader_buffer_size == 0 || self.reader_buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::InvalidValue(
                "reader_buffer_size must be in 1..=1MB",
            ));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("edrt Configuration:");
        eprintln!("  num_workers:         {}", self.num_workers);
        eprintln!("  pool_queue_size:     {}", self.pool_queue_size);
        eprintln!("  pool_policy:         {:?}", self.pool_policy);
        eprintln!("  writer_max_tasks:    {}", self.writer_max_tasks);
        eprintln!("  writer_buffer_size:  {}", self.writer_buffer_size);
        eprintln!("  writer_policy:       {:?}", self.writer_policy);
        eprintln!("  reader_buffer_size:  {}", self.reader_buffer_size);
        eprintln!("  advisory_lock:       {}", self.advisory_lock);
        eprintln!("  netlog:              {:?}", self.netlog);
        eprintln!("  debug_socket:        {:?}", self.debug_socket);
    }
}

fn parse_host_port(v: &str) -> Option<(String, u16)> {
    let (host, port) = v.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for RtError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => RtError::InvalidConfig(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = RuntimeConfig::new();
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.pool_queue_size, 200);
        assert_eq!(config.writer_max_tasks, 1024);
        assert_eq!(config.pool_policy, Backpressure::Reject);
        assert_eq!(config.writer_policy, Backpressure::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_ignores_environment() {
        std::env::set_var("EDRT_READER_BUFFER_SIZE", "777");
        let from_default = RuntimeConfig::default();
        let from_env = RuntimeConfig::from_env();
        std::env::remove_var("EDRT_READER_BUFFER_SIZE");

        assert_eq!(from_default, RuntimeConfig::new());
        assert_eq!(from_env.reader_buffer_size, 777);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .num_workers(2)
            .pool_policy(Backpressure::Block)
            .writer_buffer_size(16)
            .netlog("127.0.0.1", 9000);

        assert_eq!(config.pool().num_workers, 2);
        assert_eq!(config.pool().policy, Backpressure::Block);
        assert_eq!(config.writer().buffer_size, 16);
        assert_eq!(config.netlog, Some(("127.0.0.1".to_string(), 9000)));
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().num_workers(0).validate().is_err());
        assert!(RuntimeConfig::new().num_workers(1000).validate().is_err());
        assert!(RuntimeConfig::new().writer_buffer_size(0).validate().is_err());

        let err: RtError = RuntimeConfig::new()
            .pool_queue_size(0)
            .validate()
            .unwrap_err()
            .into();
        assert!(matches!(err, RtError::InvalidConfig(_)));
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("localhost:4000"), Some(("localhost".into(), 4000)));
        assert_eq!(parse_host_port(":4000"), None);
        assert_eq!(parse_host_port("localhost"), None);
        assert_eq!(parse_host_port("localhost:http"), None);
        assert_eq!(Backpressure::parse("BLOCK"), Some(Backpressure::Block));
        assert_eq!(Backpressure::parse("drop"), None);
    }
}
