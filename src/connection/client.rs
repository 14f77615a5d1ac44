use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConnectionDefaults, ConnectionOptions};
use crate::connection::http::HttpTransport;
use crate::connection::proto::Params;
use crate::connection::socket::{
    sweep_pending, ConnectivityChange, SocketState, SocketTransport, SocketWorker,
};
use crate::connection::transport::{Backend, Transport};
use crate::error::{ActionError, ConnectionError};
use crate::events::Event;
use crate::live::{LiveSubscription, Subscribable};

/// Client handle for performing actions against the backend.
///
/// Cloning is cheap; clones share the socket, the pending table and the
/// events. The socket worker stops once the last clone is dropped or
/// [`Connection::dispose`] is called.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    options: ConnectionOptions,
    http: HttpTransport,
    socket: SocketTransport,
    state: Arc<SocketState>,
    disposed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.state.persist.store(false, Ordering::SeqCst);
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
    }
}

impl Connection {
    /// Builds a connection and, when persistence is enabled, starts opening
    /// the socket in the background.
    ///
    /// Must be called from within a Tokio runtime for the socket to be used.
    /// Without one the connection works over HTTP only.
    pub fn new(options: ConnectionOptions) -> Result<Self, ConnectionError> {
        options.validate()?;
        let http = HttpTransport::new(&options)?;

        let runtime = Handle::try_current().ok();
        if options.persist_connection && runtime.is_none() {
            warn!(
                event = "socket_disabled",
                reason = "no tokio runtime available"
            );
        }
        let persist = options.persist_connection && runtime.is_some();
        let state = Arc::new(SocketState::new(persist));

        let (outbound_tx, sweeper) = match runtime.filter(|_| persist) {
            Some(handle) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let worker = SocketWorker::new(&options, Arc::clone(&state));
                handle.spawn(worker.run(outbound_rx));
                let sweeper = handle.spawn(sweep_pending(
                    Arc::downgrade(&state),
                    ConnectionDefaults::SWEEP_INTERVAL,
                ));
                (Some(outbound_tx), Some(sweeper))
            }
            None => (None, None),
        };
        let socket = SocketTransport::new(
            Arc::clone(&state),
            outbound_tx,
            options.request_timeout(),
        );

        info!(
            event = "connection_created",
            socket_endpoint = %options.socket_endpoint,
            rest_endpoint = %options.rest_endpoint,
            persist
        );

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                options,
                http,
                socket,
                state,
                disposed: AtomicBool::new(false),
                sweeper: Mutex::new(sweeper),
            }),
        })
    }

    /// Connection with default options.
    pub fn with_defaults() -> Result<Self, ConnectionError> {
        Self::new(ConnectionOptions::default())
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Performs `action` with a JSON object (or `null`) as parameters.
    ///
    /// Uses the socket if it is open at call time and HTTP otherwise.
    pub async fn perform(&self, action: &str, params: Value) -> Result<Value, ActionError> {
        let params = into_params(params)?;
        self.perform_params(action, params).await
    }

    /// Like [`perform`](Self::perform) with any serializable parameter type.
    pub async fn perform_with<P>(&self, action: &str, params: &P) -> Result<Value, ActionError>
    where
        P: Serialize + ?Sized,
    {
        let params = serde_json::to_value(params)
            .map_err(|err| ActionError::InvalidParams(err.to_string()))?;
        self.perform(action, params).await
    }

    /// Performs `action` and deserializes the success payload into `T`.
    pub async fn perform_as<T>(&self, action: &str, params: Value) -> Result<T, ActionError>
    where
        T: DeserializeOwned,
    {
        let value = self.perform(action, params).await?;
        serde_json::from_value(value)
            .map_err(|err| ActionError::transport("ParseError", err.to_string()))
    }

    async fn perform_params(&self, action: &str, params: Params) -> Result<Value, ActionError> {
        let transport = self.select_transport();
        debug!(event = "action_dispatched", action, transport = transport.name());
        transport.perform(action, params).await
    }

    fn select_transport(&self) -> &dyn Transport {
        if self.inner.socket.is_open() {
            &self.inner.socket
        } else {
            &self.inner.http
        }
    }

    /// Whether the socket is currently open.
    pub fn socket_connected(&self) -> bool {
        self.inner.socket.is_open()
    }

    /// Consecutive socket closes since the last successful open.
    pub fn retry_attempts(&self) -> u32 {
        self.inner.state.retry_attempts.load(Ordering::SeqCst)
    }

    /// Socket requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.pending.len()
    }

    /// Id assigned to the most recent socket request.
    pub fn last_message_id(&self) -> u64 {
        self.inner.socket.last_message_id()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Fires `{ socketConnection: bool }` when the socket opens or closes.
    pub fn connectivity_changed(&self) -> &Event<ConnectivityChange> {
        self.inner.state.connectivity.as_event()
    }

    /// Server pushes that are neither pings nor responses.
    pub fn pushes(&self) -> &Event<Value> {
        self.inner.state.pushes.as_event()
    }

    /// Live change event for `resource`, driven by this connection.
    pub fn live<R: Subscribable>(&self, resource: R) -> Arc<LiveSubscription<R>> {
        LiveSubscription::new(resource, Arc::new(self.clone()))
    }

    /// Shuts the connection down for good.
    ///
    /// Persistence is disabled, the socket is closed, and every in-flight
    /// socket request fails with [`ActionError::Timeout`]. Later calls to
    /// [`perform`](Self::perform) go over HTTP. Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let state = &self.inner.state;
        state.persist.store(false, Ordering::SeqCst);
        state.mark_closed();
        self.inner.socket.close_queue();
        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
        let flushed = state.pending.flush();

        info!(event = "connection_disposed", flushed);
    }
}

#[async_trait]
impl Backend for Connection {
    async fn perform(&self, action: &str, params: Params) -> Result<Value, ActionError> {
        self.perform_params(action, params).await
    }

    fn pushes(&self) -> &Event<Value> {
        Connection::pushes(self)
    }
}

fn into_params(params: Value) -> Result<Params, ActionError> {
    match params {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Params::new()),
        other => Err(ActionError::InvalidParams(format!(
            "action params must be a json object, got {other}"
        ))),
    }
}
