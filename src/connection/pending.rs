//! Table of socket requests awaiting a reply.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ActionError;

pub(crate) type Responder = oneshot::Sender<Result<Value, ActionError>>;

struct PendingRequest {
    expires_at: Option<Instant>,
    responder: Responder,
}

/// Pending requests keyed by message id.
///
/// An id leaves the table exactly once: on its reply, on expiry, or on a
/// flush. Replies for ids no longer present are reported as unmatched.
#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: Mutex<HashMap<u64, PendingRequest>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, id: u64, expires_at: Option<Instant>, responder: Responder) {
        self.lock().insert(
            id,
            PendingRequest {
                expires_at,
                responder,
            },
        );
    }

    /// Completes `id` with `outcome`. Returns false if `id` is not pending.
    pub(crate) fn resolve(&self, id: u64, outcome: Result<Value, ActionError>) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            return false;
        };
        let _ = entry.responder.send(outcome);
        true
    }

    /// Fails every entry whose deadline is at or before `now`.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut entries = self.lock();
            let ids: Vec<u64> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at.is_some_and(|deadline| deadline <= now))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = expired.len();
        for entry in expired {
            let _ = entry.responder.send(Err(ActionError::Timeout));
        }
        count
    }

    /// Fails every entry regardless of its deadline.
    pub(crate) fn flush(&self) -> usize {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.responder.send(Err(ActionError::Timeout));
        }
        count
    }

    /// Whether `id` is still pending with its deadline, if any, after `now`.
    pub(crate) fn awaits_reply(&self, id: u64, now: Instant) -> bool {
        self.lock()
            .get(&id)
            .is_some_and(|entry| entry.expires_at.map_or(true, |deadline| deadline > now))
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
