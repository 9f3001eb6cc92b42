//! Kernel-style print macros for edrt
//!
//! Thread-safe leveled output similar to the kernel's printk. Leveled lines
//! go to stderr until a [`LogSink`] is installed; from then on they go to the
//! sinks only, since stderr usually shares the terminal with the editor.
//!
//! # Environment Variables
//!
//! - `EDRT_FLUSH_EPRINT=1` - Flush stderr after each print
//! - `EDRT_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0..5)
//!
//! # Usage
//!
//! ```ignore
//! use edrt_core::{kdebug, kwarn};
//!
//! kdebug!("writer {} started", fd);
//! kwarn!("netlog disabled: {}", err);
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v.to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

/// Destination for formatted log lines.
///
/// Implementations must not block for long: they are called inline from
/// whatever thread logged.
pub trait LogSink: Send + Sync {
    /// Receive one line, without trailing newline.
    fn write_line(&self, line: &str);
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static SINKS: RwLock<Vec<Arc<dyn LogSink>>> = RwLock::new(Vec::new());

thread_local! {
    // Set while this thread is inside a sink, so a sink that logs does
    // not feed itself.
    static IN_SINK: Cell<bool> = const { Cell::new(false) };
}

/// Initialize logging from environment variables
///
/// Called automatically on first log.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("EDRT_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("EDRT_LOG_LEVEL") {
        let level = LogLevel::parse(&val).unwrap_or(LogLevel::Warn);
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= log_level() as u8
}

/// Install a sink; leveled lines stop going to stderr
pub fn add_sink(sink: Arc<dyn LogSink>) {
    let mut sinks = SINKS.write().unwrap_or_else(|e| e.into_inner());
    sinks.push(sink);
}

/// Detach one sink previously passed to [`add_sink`]; false if absent
pub fn remove_sink(sink: &Arc<dyn LogSink>) -> bool {
    let target = Arc::as_ptr(sink) as *const ();
    let mut sinks = SINKS.write().unwrap_or_else(|e| e.into_inner());
    let before = sinks.len();
    sinks.retain(|s| Arc::as_ptr(s) as *const () != target);
    sinks.len() != before
}

/// Detach all sinks; leveled lines go back to stderr
pub fn clear_sinks() {
    let mut sinks = SINKS.write().unwrap_or_else(|e| e.into_inner());
    sinks.clear();
}

/// Number of installed sinks
pub fn sink_count() -> usize {
    SINKS.read().map(|s| s.len()).unwrap_or(0)
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    if !IN_SINK.with(Cell::get) {
        let sinks = SINKS.read().unwrap_or_else(|e| e.into_inner());
        if !sinks.is_empty() {
            let line = format!("{} {}", level.prefix(), args);
            IN_SINK.with(|c| c.set(true));
            for sink in sinks.iter() {
                sink.write_line(&line);
            }
            IN_SINK.with(|c| c.set(false));
            return;
        }
    }

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*));
    }};
}

/// Print to stderr with newline
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprintln_impl(format_args!($($arg)*));
    }};
}

/// Error level log
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<String>>);

    impl LogSink for Capture {
        fn write_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
            // Re-entrant logging from a sink must not recurse.
            crate::kerror!("from inside sink");
        }
    }

    #[test]
    fn test_log_levels() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("3"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_sink_receives_lines() {
        set_log_level(LogLevel::Error);
        let cap = Arc::new(Capture(Mutex::new(Vec::new())));
        add_sink(cap.clone());

        crate::kerror!("writer {} failed", 3);
        crate::kdebug!("filtered out");

        let as_sink: Arc<dyn LogSink> = cap.clone();
        assert!(remove_sink(&as_sink));
        assert!(!remove_sink(&as_sink));
        clear_sinks();
        let lines = cap.0.lock().unwrap();
        assert!(lines.iter().any(|l| l == "[ERROR] writer 3 failed"));
        assert!(!lines.iter().any(|l| l.contains("filtered out")));
    }
}
