//! Process-wide fatal-error callback
//!
//! Essential-path failures (no terminal writer, a thread that cannot be
//! spawned) are routed here instead of being returned quietly. The embedding
//! editor installs a callback that restores the terminal and exits.

use std::sync::Mutex;

static CALLBACK: Mutex<Option<fn(&str)>> = Mutex::new(None);

/// Install the fatal-error callback, replacing any previous one
pub fn set_fatal_error_callback(cb: fn(&str)) {
    let mut guard = CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    *guard = Some(cb);
}

/// Remove the fatal-error callback
pub fn clear_fatal_error_callback() {
    let mut guard = CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    *guard = None;
}

/// Report a fatal error.
///
/// Logs at error level, then invokes the installed callback (if any).
/// Returns only if the callback returns.
pub fn fatal(msg: &str) {
    crate::kerror!("fatal: {}", msg);
    let cb = *CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(cb) = cb {
        cb(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn record(msg: &str) {
        assert_eq!(msg, "terminal writer unavailable");
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_callback_invoked() {
        set_fatal_error_callback(record);
        fatal("terminal writer unavailable");
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        clear_fatal_error_callback();
        fatal("terminal writer unavailable");
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }
}
