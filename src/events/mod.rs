//! Ordered multicast events.
//!
//! - `handler`: handler identity, per-call dispatch control and the
//!   unsubscribe capability handed back to listeners.
//! - `dispatcher`: the dispatcher itself, its read-only [`Event`] view and the
//!   count-tracking variant used by live subscriptions.

/// Dispatcher, restricted event view, and count-tracking variant.
pub mod dispatcher;
/// Handler wrapper and per-dispatch control values.
pub mod handler;

pub use dispatcher::{CountedEventDispatcher, Event, EventDispatcher};
pub use handler::{DispatchControl, DispatchOutcome, Handler, SubscriptionCount, Unsubscribe};

/// Runs `task` later, off the caller's current control flow.
///
/// Inside a Tokio runtime the task is spawned on it; otherwise a plain thread
/// is used so delivery still happens eventually.
pub(crate) fn spawn_detached<F>(task: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { task() });
        }
        Err(_) => {
            std::thread::spawn(task);
        }
    }
}
