//! Transport seams.
//!
//! [`Transport`] is one way of carrying an action to the backend; the
//! connection holds a socket and an HTTP implementation and picks one per
//! call. [`Backend`] is what the live-subscription layer needs from a
//! connection: performing actions and observing server pushes.

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::proto::Params;
use crate::error::ActionError;
use crate::events::Event;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Whether this transport can carry a request right now.
    fn is_open(&self) -> bool;

    async fn perform(&self, action: &str, params: Params) -> Result<Value, ActionError>;
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn perform(&self, action: &str, params: Params) -> Result<Value, ActionError>;

    /// Server pushes that are neither pings nor responses.
    fn pushes(&self) -> &Event<Value>;
}
