//! Client SDK for named backend actions.
//!
//! The crate is organized by concern:
//! - `connection`: the dual-transport [`Connection`] (websocket with HTTP
//!   fallback), request correlation and the reconnect loop.
//! - `events`: ordered multicast event dispatchers.
//! - `live`: reference-counted live subscriptions to backend resources.
//! - `config`: connection options and their TOML loader.
//! - `error`: caller-visible error types.
//! - `retry`: reconnect backoff and timeout utilities.

/// Connection options.
pub mod config;
/// Dual-transport action client.
pub mod connection;
/// Error types.
pub mod error;
/// Event dispatchers.
pub mod events;
/// Live resource subscriptions.
pub mod live;
/// Reconnect backoff and timeout helpers.
pub mod retry;

pub use config::ConnectionOptions;
pub use connection::{ConnectivityChange, Connection};
pub use error::{ActionError, ConnectionError};
