//! Socket wire protocol.
//!
//! Outbound frames are action envelopes. Inbound frames are JSON values that
//! are either a heartbeat ping string, a response envelope correlated by
//! `messageId`, or a server push carrying an `event` name.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::ActionError;

/// Parameter object carried by an action.
pub type Params = Map<String, Value>;

const PING_PATTERN: &str = r"^primus::ping::([0-9]{13})$";
const RESPONSE_CONTEXT: &str = "response";

/// Outbound action request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
    pub message_id: u64,
    pub event: String,
    pub params: Params,
}

impl ActionEnvelope {
    /// Wraps `params` for `action`. The `action` key always carries the
    /// action name, even if `params` had its own.
    pub fn new(message_id: u64, action: &str, mut params: Params) -> Self {
        params.insert("action".to_string(), Value::String(action.to_string()));
        Self {
            message_id,
            event: "action".to_string(),
            params,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn action(&self) -> Option<&str> {
        self.params.get("action").and_then(Value::as_str)
    }
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Heartbeat; the captured millisecond timestamp is echoed back.
    Ping { timestamp: String },
    /// Reply to an earlier action.
    Response {
        message_id: u64,
        outcome: Result<Value, ActionError>,
    },
    /// Server-initiated message for live subscriptions.
    Push(Value),
}

/// Reasons an inbound frame is ignored.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unrecognized frame: {0}")]
    Unrecognized(&'static str),
}

fn ping_pattern() -> &'static Regex {
    static PING: OnceLock<Regex> = OnceLock::new();
    PING.get_or_init(|| Regex::new(PING_PATTERN).expect("ping pattern is a valid regex"))
}

/// Parses and classifies one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;

    match value {
        Value::String(ping) => {
            let captures = ping_pattern()
                .captures(&ping)
                .ok_or(FrameError::Unrecognized("string frame is not a ping"))?;
            Ok(InboundFrame::Ping {
                timestamp: captures[1].to_string(),
            })
        }
        Value::Object(mut object) => {
            let is_response = object.get("context").and_then(Value::as_str) == Some(RESPONSE_CONTEXT);
            if !is_response {
                if object.get("event").is_some_and(Value::is_string) {
                    return Ok(InboundFrame::Push(Value::Object(object)));
                }
                return Err(FrameError::Unrecognized("object frame has no context or event"));
            }

            let message_id = object
                .get("messageId")
                .and_then(Value::as_u64)
                .ok_or(FrameError::Unrecognized("response without numeric messageId"))?;

            let outcome = match object.remove("error") {
                Some(error) if !error.is_null() => Err(ActionError::Remote(error)),
                _ => {
                    object.remove("context");
                    object.remove("messageId");
                    Ok(Value::Object(object))
                }
            };
            Ok(InboundFrame::Response {
                message_id,
                outcome,
            })
        }
        _ => Err(FrameError::Unrecognized("frame is neither a string nor an object")),
    }
}

/// Heartbeat reply for a ping carrying `timestamp`.
pub fn pong_frame(timestamp: &str) -> String {
    Value::String(format!("primus::pong::{timestamp}")).to_string()
}
