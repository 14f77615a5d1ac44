//! Dispatcher implementation.
//!
//! Delivery always iterates a snapshot of the subscription list taken when
//! the dispatch starts. Handlers may subscribe, unsubscribe or clear while
//! running; those changes apply to the live list and show up on the next
//! dispatch. The lock guarding the list is never held while a handler runs.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::handler::{
    Detach, DispatchControl, DispatchOutcome, Handler, SubscriptionCount, Unsubscribe,
};
use super::spawn_detached;

struct Subscription<T> {
    id: u64,
    handler: Handler<T>,
    once: bool,
    executed: AtomicBool,
}

impl<T> Subscription<T> {
    /// Marks the subscription executed; false when a once-subscription
    /// already ran.
    fn begin(&self) -> bool {
        let already = self.executed.swap(true, Ordering::SeqCst);
        !(self.once && already)
    }
}

struct Inner<T> {
    subscriptions: Mutex<Vec<Arc<Subscription<T>>>>,
    next_id: AtomicU64,
    count_changes: Option<EventDispatcher<SubscriptionCount>>,
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn new(count_changes: Option<EventDispatcher<SubscriptionCount>>) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            count_changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Subscription<T>>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, handler: Handler<T>, once: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscriptions = self.lock();
            subscriptions.push(Arc::new(Subscription {
                id,
                handler,
                once,
                executed: AtomicBool::new(false),
            }));
            subscriptions.len()
        };
        self.count_changed(count);
        id
    }

    fn remove_id(&self, id: u64) -> bool {
        let count = {
            let mut subscriptions = self.lock();
            let Some(index) = subscriptions.iter().position(|sub| sub.id == id) else {
                return false;
            };
            subscriptions.remove(index);
            subscriptions.len()
        };
        self.count_changed(count);
        true
    }

    fn remove_handler(&self, handler: &Handler<T>) -> bool {
        let count = {
            let mut subscriptions = self.lock();
            let Some(index) = subscriptions
                .iter()
                .position(|sub| sub.handler.ptr_eq(handler))
            else {
                return false;
            };
            subscriptions.remove(index);
            subscriptions.len()
        };
        self.count_changed(count);
        true
    }

    fn has(&self, handler: &Handler<T>) -> bool {
        self.lock().iter().any(|sub| sub.handler.ptr_eq(handler))
    }

    fn clear(&self) {
        let removed = {
            let mut subscriptions = self.lock();
            let removed = subscriptions.len();
            subscriptions.clear();
            removed
        };
        if removed > 0 {
            self.count_changed(0);
        }
    }

    fn count(&self) -> usize {
        self.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<Subscription<T>>> {
        self.lock().clone()
    }

    fn count_changed(&self, count: usize) {
        if let Some(count_changes) = &self.count_changes {
            count_changes.dispatch(&SubscriptionCount { count });
        }
    }
}

impl<T: Send + Sync + 'static> Detach for Inner<T> {
    fn detach(&self, id: u64) {
        self.remove_id(id);
    }
}

/// Read-only view of a dispatcher handed to listeners.
///
/// It can register and remove handlers but never dispatch.
pub struct Event<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Event<T> {
    /// Appends a persistent subscription.
    pub fn subscribe(&self, handler: &Handler<T>) -> Unsubscribe {
        self.register(handler.clone(), false)
    }

    /// Appends a subscription that removes itself after its first execution.
    pub fn one(&self, handler: &Handler<T>) -> Unsubscribe {
        self.register(handler.clone(), true)
    }

    /// Shorthand for wrapping a closure and subscribing it.
    pub fn subscribe_fn<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(&T, &DispatchControl) + Send + Sync + 'static,
    {
        self.register(Handler::new(f), false)
    }

    /// Shorthand for wrapping a closure and subscribing it once.
    pub fn one_fn<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(&T, &DispatchControl) + Send + Sync + 'static,
    {
        self.register(Handler::new(f), true)
    }

    /// Removes the first registration of `handler`, if any.
    pub fn unsubscribe(&self, handler: &Handler<T>) {
        self.inner.remove_handler(handler);
    }

    pub fn has(&self, handler: &Handler<T>) -> bool {
        self.inner.has(handler)
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn count(&self) -> usize {
        self.inner.count()
    }

    fn register(&self, handler: Handler<T>, once: bool) -> Unsubscribe {
        let id = self.inner.add(handler, once);
        let inner: Arc<dyn Detach> = self.inner.clone();
        Unsubscribe::new(Arc::downgrade(&inner), id)
    }

    fn downgrade(&self) -> Weak<Inner<T>> {
        Arc::downgrade(&self.inner)
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("count", &self.count())
            .finish()
    }
}

/// Owner side of an event: everything [`Event`] offers plus dispatch.
pub struct EventDispatcher<T> {
    event: Event<T>,
}

impl<T> Clone for EventDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> EventDispatcher<T> {
    pub fn new() -> Self {
        Self::with_count_changes(None)
    }

    fn with_count_changes(count_changes: Option<EventDispatcher<SubscriptionCount>>) -> Self {
        Self {
            event: Event {
                inner: Arc::new(Inner::new(count_changes)),
            },
        }
    }

    /// Returns the restricted view. The same view is returned on every call.
    pub fn as_event(&self) -> &Event<T> {
        &self.event
    }

    pub fn subscribe(&self, handler: &Handler<T>) -> Unsubscribe {
        self.event.subscribe(handler)
    }

    pub fn one(&self, handler: &Handler<T>) -> Unsubscribe {
        self.event.one(handler)
    }

    pub fn subscribe_fn<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(&T, &DispatchControl) + Send + Sync + 'static,
    {
        self.event.subscribe_fn(f)
    }

    pub fn one_fn<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(&T, &DispatchControl) + Send + Sync + 'static,
    {
        self.event.one_fn(f)
    }

    pub fn unsubscribe(&self, handler: &Handler<T>) {
        self.event.unsubscribe(handler)
    }

    pub fn has(&self, handler: &Handler<T>) -> bool {
        self.event.has(handler)
    }

    pub fn clear(&self) {
        self.event.clear()
    }

    pub fn count(&self) -> usize {
        self.event.count()
    }

    /// Delivers `argument` synchronously, in subscription order.
    ///
    /// A handler calling [`DispatchControl::stop_propagation`] ends the pass.
    /// Once-subscriptions that ran are pruned after their turn either way.
    /// Handler panics are not caught.
    pub fn dispatch(&self, argument: &T) -> DispatchOutcome {
        let inner = &self.event.inner;
        for subscription in inner.snapshot() {
            if !subscription.begin() {
                continue;
            }

            let control = DispatchControl::new();
            subscription.handler.call(argument, &control);

            if subscription.once || control.unsubscribe_requested() {
                inner.remove_id(subscription.id);
            }
            if control.propagation_stopped() {
                return DispatchOutcome {
                    propagation_stopped: true,
                };
            }
        }
        DispatchOutcome::default()
    }

    /// Schedules every handler of the current snapshot to run independently.
    ///
    /// Returns before any handler runs. There is no ordering between handlers
    /// and no completion signal; panics inside a handler are lost with its
    /// task.
    pub fn dispatch_async(&self, argument: T)
    where
        T: Clone,
    {
        let inner = &self.event.inner;
        for subscription in inner.snapshot() {
            if !subscription.begin() {
                continue;
            }
            if subscription.once {
                inner.remove_id(subscription.id);
            }

            let weak = self.event.downgrade();
            let argument = argument.clone();
            spawn_detached(move || {
                let control = DispatchControl::new();
                subscription.handler.call(&argument, &control);
                if control.unsubscribe_requested() {
                    if let Some(inner) = weak.upgrade() {
                        inner.remove_id(subscription.id);
                    }
                }
            });
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for EventDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("count", &self.count())
            .finish()
    }
}

/// Dispatcher that also broadcasts its subscriber count.
///
/// [`on_subscription_count_change`](Self::on_subscription_count_change) fires
/// synchronously right after every membership change, including removals done
/// by once-pruning and [`DispatchControl::unsubscribe`]. `clear` only fires
/// when it removed something.
pub struct CountedEventDispatcher<T> {
    dispatcher: EventDispatcher<T>,
    count_changes: Event<SubscriptionCount>,
}

impl<T> Clone for CountedEventDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            count_changes: self.count_changes.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Default for CountedEventDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> CountedEventDispatcher<T> {
    pub fn new() -> Self {
        let count_changes = EventDispatcher::new();
        let view = count_changes.as_event().clone();
        Self {
            dispatcher: EventDispatcher::with_count_changes(Some(count_changes)),
            count_changes: view,
        }
    }

    pub fn on_subscription_count_change(&self) -> &Event<SubscriptionCount> {
        &self.count_changes
    }
}

impl<T> Deref for CountedEventDispatcher<T> {
    type Target = EventDispatcher<T>;

    fn deref(&self) -> &Self::Target {
        &self.dispatcher
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for CountedEventDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedEventDispatcher")
            .field("count", &self.count())
            .finish()
    }
}
