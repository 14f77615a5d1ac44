//! Request/response fallback transport.
//!
//! Each action is a single `POST {rest_endpoint}?action={name}` with the
//! parameter object as JSON body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ConnectionOptions;
use crate::connection::proto::Params;
use crate::connection::transport::Transport;
use crate::error::{ActionError, ConnectionError};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(options: &ConnectionOptions) -> Result<Self, ConnectionError> {
        let mut builder = Client::builder();
        let connect_timeout = options.connect_timeout();
        if !connect_timeout.is_zero() {
            builder = builder.connect_timeout(connect_timeout);
        }
        let http = builder.build()?;

        Ok(Self {
            http,
            endpoint: options.rest_endpoint.clone(),
            api_key: options.api_key.clone(),
            request_timeout: options.request_timeout(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, action: &str, params: &Params) -> Result<Value, ActionError> {
        let mut builder = self
            .http
            .post(&self.endpoint)
            .query(&[("action", action)])
            .json(params);

        if !self.request_timeout.is_zero() {
            builder = builder.timeout(self.request_timeout);
        }
        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = builder.send().await.map_err(normalize_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(normalize_transport_error)?;

        debug!(
            event = "http_action_completed",
            action,
            status = status.as_u16()
        );
        parse_action_response(status, &body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn perform(&self, action: &str, params: Params) -> Result<Value, ActionError> {
        self.send(action, &params).await
    }
}

fn normalize_transport_error(err: reqwest::Error) -> ActionError {
    let name = if err.is_timeout() {
        "TimeoutError"
    } else if err.is_connect() {
        "ConnectionError"
    } else if err.is_decode() || err.is_body() {
        "ResponseError"
    } else {
        "RequestError"
    };
    ActionError::transport(name, err.to_string())
}

/// Maps an HTTP reply onto the action outcome.
///
/// A body carrying a non-null `error` field is the server's own error and is
/// returned verbatim, whatever the status. Anything else that is not a
/// successful JSON body becomes a normalized transport failure.
fn parse_action_response(status: StatusCode, body: &str) -> Result<Value, ActionError> {
    let parsed = serde_json::from_str::<Value>(body).ok();

    if let Some(error) = parsed
        .as_ref()
        .and_then(|value| value.get("error"))
        .filter(|error| !error.is_null())
    {
        return Err(ActionError::Remote(error.clone()));
    }

    if !status.is_success() {
        return Err(ActionError::transport(
            "HttpError",
            format!("http status {status}: {}", summarize_error_body(body)),
        ));
    }

    match parsed {
        Some(value) => Ok(value),
        None if body.trim().is_empty() => Ok(Value::Null),
        None => Err(ActionError::transport(
            "ResponseError",
            format!("response is not json: {}", summarize_error_body(body)),
        )),
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{parse_action_response, summarize_error_body, HttpTransport};
    use crate::config::ConnectionOptions;
    use crate::error::{ActionError, TransportFailure};

    #[test]
    fn success_body_is_returned_as_is() {
        let value = parse_action_response(StatusCode::OK, r#"{"healthy":true}"#).expect("ok");
        assert_eq!(value, json!({"healthy": true}));
    }

    #[test]
    fn structured_error_passes_through_for_any_status() {
        let body = r#"{"error":{"name":"NotFound","message":"no such instance","status":404,"code":12,"explanation":"gone"}}"#;
        let error = parse_action_response(StatusCode::NOT_FOUND, body).expect_err("error");
        assert_eq!(
            error,
            ActionError::Remote(json!({
                "name": "NotFound",
                "message": "no such instance",
                "status": 404,
                "code": 12,
                "explanation": "gone"
            }))
        );

        let error = parse_action_response(StatusCode::OK, r#"{"error":"nope"}"#).expect_err("error");
        assert_eq!(error, ActionError::Remote(json!("nope")));
    }

    #[test]
    fn unstructured_failures_are_normalized() {
        let error =
            parse_action_response(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>").expect_err("error");
        match error {
            ActionError::Transport(TransportFailure {
                name,
                message,
                status,
                code,
                explanation,
            }) => {
                assert_eq!(name, "HttpError");
                assert!(message.contains("502"));
                assert_eq!(status, 500);
                assert_eq!(code, 0);
                assert!(explanation.is_empty());
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn empty_success_body_is_null() {
        assert_eq!(
            parse_action_response(StatusCode::NO_CONTENT, "").expect("ok"),
            serde_json::Value::Null
        );
    }

    #[test]
    fn error_snippets_prefer_message_fields() {
        assert_eq!(summarize_error_body(r#"{"message":"busy"}"#), "busy");
        assert_eq!(summarize_error_body(&"x".repeat(500)).len(), 220);
    }

    #[test]
    fn transport_uses_rest_endpoint_from_options() {
        let options = ConnectionOptions::default().with_rest_endpoint("http://127.0.0.1:9/api");
        let transport = HttpTransport::new(&options).expect("build transport");
        assert_eq!(transport.endpoint(), "http://127.0.0.1:9/api");
    }
}
