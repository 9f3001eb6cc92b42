//! Cross-thread notification abstraction.
//!
//! A `Notifier` wakes whoever consumes a queue that another thread just
//! produced into. The worker pool uses it to tell the main loop that
//! completion callbacks are waiting to be drained.
//!
//! # Implementors
//!
//! - `DrainNotifier` (edrt): schedules a callback drain on the event
//!   handler thread.

/// Wakes a consumer when new work is available.
///
/// **Contract:**
/// - `notify()` must NEVER block on the consumer.
/// - Multiple calls before the consumer wakes may be coalesced.
pub trait Notifier: Send + Sync {
    /// Signal that new work is available.
    fn notify(&self);
}
