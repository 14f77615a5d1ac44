use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::Subscribable;
use crate::connection::Params;

/// Change pushed by the backend for a subscribed resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelChangeEvent {
    /// Push event name, e.g. `instance:change`.
    pub event: String,
    /// Id of the changed resource as sent by the backend: a string, a
    /// number, or `null` when the push names none.
    #[serde(default)]
    pub id: Value,
    /// Opaque change payload.
    #[serde(default)]
    pub data: Value,
}

impl ModelChangeEvent {
    fn from_push(push: &Value) -> Option<Self> {
        match serde_json::from_value(push.clone()) {
            Ok(change) => Some(change),
            Err(err) => {
                debug!(
                    event = "inbound_frame_ignored",
                    reason = "not a model change",
                    error = %err
                );
                None
            }
        }
    }

    /// Whether the push names `id`. Numeric ids compare by their decimal form.
    pub fn id_matches(&self, id: &str) -> bool {
        match &self.id {
            Value::String(own) => own == id,
            Value::Number(own) => own.to_string() == id,
            _ => false,
        }
    }
}

/// A single backend resource identified by kind and id.
///
/// Subscribes with `{kind}:subscribe` and `{ "id": id }`, and receives
/// `{kind}:change` pushes carrying the same id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl Subscribable for ResourceRef {
    type Change = ModelChangeEvent;

    fn subscribe_action(&self) -> String {
        format!("{}:subscribe", self.kind)
    }

    fn unsubscribe_action(&self) -> String {
        format!("{}:unsubscribe", self.kind)
    }

    fn subscription_params(&self) -> Params {
        let mut params = Map::new();
        params.insert("id".to_string(), Value::String(self.id.clone()));
        params
    }

    fn decode_push(&self, push: &Value) -> Option<ModelChangeEvent> {
        let change = ModelChangeEvent::from_push(push)?;
        let expected = format!("{}:change", self.kind);
        (change.event == expected && change.id_matches(&self.id)).then_some(change)
    }
}

/// A homogeneous collection of resources of one kind, narrowed by a filter.
///
/// Subscribes with `{kind}:subscribeList` and the filter as parameters, and
/// receives `{kind}:listChange` pushes.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceListRef {
    pub kind: String,
    pub filter: Params,
}

impl ResourceListRef {
    pub fn new(kind: impl Into<String>, filter: Params) -> Self {
        Self {
            kind: kind.into(),
            filter,
        }
    }
}

impl Subscribable for ResourceListRef {
    type Change = ModelChangeEvent;

    fn subscribe_action(&self) -> String {
        format!("{}:subscribeList", self.kind)
    }

    fn unsubscribe_action(&self) -> String {
        format!("{}:unsubscribeList", self.kind)
    }

    fn subscription_params(&self) -> Params {
        self.filter.clone()
    }

    fn decode_push(&self, push: &Value) -> Option<ModelChangeEvent> {
        let change = ModelChangeEvent::from_push(push)?;
        (change.event == format!("{}:listChange", self.kind)).then_some(change)
    }
}
