use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type HandlerFn<T> = dyn Fn(&T, &DispatchControl) + Send + Sync;

/// Shareable event handler.
///
/// Identity is pointer identity: clones of one `Handler` are the same handler
/// for [`Event::unsubscribe`](super::Event::unsubscribe) and
/// [`Event::has`](super::Event::has), two separately built handlers never are.
pub struct Handler<T> {
    f: Arc<HandlerFn<T>>,
}

impl<T> Handler<T> {
    /// Wraps a closure receiving the payload and the per-call control value.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&T, &DispatchControl) + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Returns true when both values refer to the same registered closure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }

    pub(crate) fn call(&self, argument: &T, control: &DispatchControl) {
        (self.f)(argument, control)
    }
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<T> fmt::Debug for Handler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("ptr", &Arc::as_ptr(&self.f).cast::<()>())
            .finish()
    }
}

/// Control value passed to a handler alongside the payload.
///
/// It lives for a single handler invocation.
#[derive(Debug, Default)]
pub struct DispatchControl {
    stop: Cell<bool>,
    unsubscribe: Cell<bool>,
}

impl DispatchControl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Halts delivery to the remaining handlers of a synchronous dispatch.
    ///
    /// Ignored by `dispatch_async`.
    pub fn stop_propagation(&self) {
        self.stop.set(true);
    }

    /// Removes the handler currently running from its dispatcher.
    pub fn unsubscribe(&self) {
        self.unsubscribe.set(true);
    }

    pub(crate) fn propagation_stopped(&self) -> bool {
        self.stop.get()
    }

    pub(crate) fn unsubscribe_requested(&self) -> bool {
        self.unsubscribe.get()
    }
}

/// Result of a synchronous dispatch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchOutcome {
    pub propagation_stopped: bool,
}

/// Payload of the subscriber-count meta event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscriptionCount {
    pub count: usize,
}

pub(crate) trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

/// Capability removing exactly one registration.
///
/// Calling [`Unsubscribe::unsubscribe`] more than once is a no-op, and so is
/// calling it after the dispatcher is gone. Dropping the value does not
/// unsubscribe.
pub struct Unsubscribe {
    target: Weak<dyn Detach>,
    id: u64,
    done: AtomicBool,
}

impl Unsubscribe {
    pub(crate) fn new(target: Weak<dyn Detach>, id: u64) -> Self {
        Self {
            target,
            id,
            done: AtomicBool::new(false),
        }
    }

    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(target) = self.target.upgrade() {
            target.detach(self.id);
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("id", &self.id)
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish()
    }
}
