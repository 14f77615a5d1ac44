//! Dual-transport action client.
//!
//! - `client`: the [`Connection`] handle, transport selection and disposal.
//! - `socket`: websocket transport, reconnecting worker and request sweep.
//! - `http`: request/response fallback transport.
//! - `proto`: socket envelopes and inbound frame classification.
//! - `pending`: table of socket requests awaiting replies.
//! - `transport`: the seams shared by transports and the live layer.

/// Connection handle.
pub mod client;
/// HTTP fallback transport.
pub mod http;
pub(crate) mod pending;
/// Socket wire protocol.
pub mod proto;
/// Websocket transport and worker.
pub mod socket;
/// Transport and backend traits.
pub mod transport;

pub use client::Connection;
pub use http::HttpTransport;
pub use proto::{ActionEnvelope, InboundFrame, Params};
pub use socket::{ConnectivityChange, SocketError};
pub use transport::{Backend, Transport};
