//! Reference-counted live subscriptions.
//!
//! A [`LiveSubscription`] keeps one remote push subscription active for a
//! resource while, and only while, its change event has at least one local
//! listener. Listeners attach and detach through
//! [`LiveSubscription::change_event`]; the remote subscribe and unsubscribe
//! calls happen behind the scenes.

/// Single-resource and collection descriptions.
pub mod resource;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::{Backend, Params};
use crate::error::ActionError;
use crate::events::{CountedEventDispatcher, Event, SubscriptionCount, Unsubscribe};

pub use resource::{ModelChangeEvent, ResourceListRef, ResourceRef};

/// Something the backend can push updates for.
pub trait Subscribable: Send + Sync + 'static {
    /// Decoded push payload delivered to local listeners.
    type Change: Clone + Send + Sync + 'static;

    fn subscribe_action(&self) -> String;

    fn unsubscribe_action(&self) -> String;

    /// Parameters identifying the resource, used for both remote calls.
    fn subscription_params(&self) -> Params;

    /// Returns the change carried by `push`, or `None` if the push is about
    /// something else.
    fn decode_push(&self, push: &Value) -> Option<Self::Change>;
}

enum Phase {
    Idle,
    Subscribing,
    /// Listeners left while the subscribe was in flight; the worker
    /// unsubscribes once it settles.
    Cancelling,
    Subscribed(Unsubscribe),
}

/// Remote calls, executed one at a time in the order they were queued.
enum RemoteCall {
    Subscribe,
    Unsubscribe,
}

/// Change event of a resource, backed by a remote push subscription.
pub struct LiveSubscription<R: Subscribable> {
    resource: Arc<R>,
    backend: Arc<dyn Backend>,
    changes: CountedEventDispatcher<R::Change>,
    phase: Mutex<Phase>,
    remote_calls: Option<mpsc::UnboundedSender<RemoteCall>>,
    count_listener: Unsubscribe,
}

impl<R: Subscribable> LiveSubscription<R> {
    /// Builds the live subscription and, inside a Tokio runtime, starts the
    /// task that performs its remote calls. Without a runtime listeners
    /// still work locally but nothing is subscribed remotely.
    pub fn new(resource: R, backend: Arc<dyn Backend>) -> Arc<Self> {
        let resource = Arc::new(resource);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let changes = CountedEventDispatcher::<R::Change>::new();
            let listener = weak.clone();
            let count_listener = changes.on_subscription_count_change().subscribe_fn(
                move |change: &SubscriptionCount, _| {
                    if let Some(live) = listener.upgrade() {
                        live.on_count_change(change.count);
                    }
                },
            );

            let remote_calls = Handle::try_current().ok().map(|handle| {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn(run_remote_calls(
                    weak.clone(),
                    Arc::clone(&backend),
                    Arc::clone(&resource),
                    rx,
                ));
                tx
            });

            Self {
                resource,
                backend,
                changes,
                phase: Mutex::new(Phase::Idle),
                remote_calls,
                count_listener,
            }
        })
    }

    /// Listener-facing change event.
    pub fn change_event(&self) -> &Event<R::Change> {
        self.changes.as_event()
    }

    /// True while the remote subscription is established.
    pub fn is_subscribed(&self) -> bool {
        matches!(*self.lock_phase(), Phase::Subscribed(_))
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, call: RemoteCall) -> bool {
        match &self.remote_calls {
            Some(tx) => tx.send(call).is_ok(),
            None => false,
        }
    }

    fn on_count_change(&self, count: usize) {
        let mut phase = self.lock_phase();

        if count == 0 {
            match std::mem::replace(&mut *phase, Phase::Idle) {
                Phase::Subscribed(push_listener) => {
                    drop(phase);
                    push_listener.unsubscribe();
                    self.queue(RemoteCall::Unsubscribe);
                }
                Phase::Subscribing | Phase::Cancelling => *phase = Phase::Cancelling,
                Phase::Idle => {}
            }
            return;
        }

        match *phase {
            Phase::Idle => {
                if self.queue(RemoteCall::Subscribe) {
                    *phase = Phase::Subscribing;
                } else {
                    warn!(
                        event = "live_subscribe_skipped",
                        action = %self.resource.subscribe_action(),
                        reason = "no tokio runtime available"
                    );
                }
            }
            // The in-flight subscribe is still wanted.
            Phase::Cancelling => *phase = Phase::Subscribing,
            Phase::Subscribing | Phase::Subscribed(_) => {}
        }
    }

    /// Applies the outcome of a remote subscribe. Returns true when the
    /// server-side subscription exists but is no longer wanted.
    fn settle_subscribe(
        live: &Arc<Self>,
        action: &str,
        outcome: Result<Value, ActionError>,
    ) -> bool {
        let mut phase = live.lock_phase();

        if let Err(err) = outcome {
            warn!(event = "live_subscribe_failed", action = %action, error = %err);
            if matches!(*phase, Phase::Subscribing | Phase::Cancelling) {
                *phase = Phase::Idle;
            }
            return false;
        }

        match *phase {
            Phase::Subscribing => {
                let listener = Arc::downgrade(live);
                let push_listener = live.backend.pushes().subscribe_fn(move |push: &Value, _| {
                    let Some(live) = listener.upgrade() else {
                        return;
                    };
                    if let Some(change) = live.resource.decode_push(push) {
                        live.changes.dispatch_async(change);
                    }
                });
                *phase = Phase::Subscribed(push_listener);
                debug!(event = "live_subscribed", action = %action);
                false
            }
            Phase::Cancelling => {
                *phase = Phase::Idle;
                debug!(event = "live_subscribe_cancelled", action = %action);
                true
            }
            Phase::Idle => true,
            Phase::Subscribed(_) => false,
        }
    }
}

impl<R: Subscribable> Drop for LiveSubscription<R> {
    fn drop(&mut self) {
        self.count_listener.unsubscribe();
        let phase = self.phase.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Phase::Subscribed(push_listener) = std::mem::replace(phase, Phase::Idle) {
            push_listener.unsubscribe();
            self.queue(RemoteCall::Unsubscribe);
        }
    }
}

/// Performs queued remote calls in order. Exits once the live subscription
/// is dropped and its queue is drained.
async fn run_remote_calls<R: Subscribable>(
    live: Weak<LiveSubscription<R>>,
    backend: Arc<dyn Backend>,
    resource: Arc<R>,
    mut calls: mpsc::UnboundedReceiver<RemoteCall>,
) {
    while let Some(call) = calls.recv().await {
        match call {
            RemoteCall::Subscribe => {
                if live.strong_count() == 0 {
                    continue;
                }
                let action = resource.subscribe_action();
                let outcome = backend
                    .perform(&action, resource.subscription_params())
                    .await;
                let unwanted = match live.upgrade() {
                    Some(live) => LiveSubscription::settle_subscribe(&live, &action, outcome),
                    None => outcome.is_ok(),
                };
                if unwanted {
                    remote_unsubscribe(backend.as_ref(), resource.as_ref()).await;
                }
            }
            RemoteCall::Unsubscribe => {
                remote_unsubscribe(backend.as_ref(), resource.as_ref()).await;
            }
        }
    }
}

async fn remote_unsubscribe<R: Subscribable>(backend: &dyn Backend, resource: &R) {
    let action = resource.unsubscribe_action();
    match backend.perform(&action, resource.subscription_params()).await {
        Ok(_) => debug!(event = "live_unsubscribed", action = %action),
        Err(err) => warn!(event = "live_unsubscribe_failed", action = %action, error = %err),
    }
}
