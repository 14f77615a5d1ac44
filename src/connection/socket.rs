//! Websocket transport and its background worker.
//!
//! The worker owns the websocket. It opens the socket, answers heartbeats,
//! routes responses into the pending table and pushes onto the push event,
//! and reconnects on close following the [`ReconnectPolicy`]. Callers reach it
//! through an unbounded queue of encoded frames; closing that queue shuts the
//! worker down. Frames queued while the socket is down are replayed on the
//! next open unless their request has already timed out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::config::ConnectionOptions;
use crate::connection::pending::PendingRequests;
use crate::connection::proto::{parse_inbound, pong_frame, ActionEnvelope, InboundFrame, Params};
use crate::connection::transport::Transport;
use crate::error::ActionError;
use crate::events::EventDispatcher;
use crate::retry::{with_timeout, ReconnectPolicy};

/// Payload of the connectivity-changed event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityChange {
    pub socket_connection: bool,
}

/// Errors that end a socket session before or while opening.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    #[error("websocket handshake timed out after {0:?}")]
    ConnectTimeout(Duration),
}

/// State shared between the socket transport, its worker and the sweeper.
pub(crate) struct SocketState {
    pub(crate) open: AtomicBool,
    pub(crate) persist: AtomicBool,
    pub(crate) retry_attempts: AtomicU32,
    pub(crate) pending: PendingRequests,
    pub(crate) connectivity: EventDispatcher<ConnectivityChange>,
    pub(crate) pushes: EventDispatcher<Value>,
}

impl SocketState {
    pub(crate) fn new(persist: bool) -> Self {
        Self {
            open: AtomicBool::new(false),
            persist: AtomicBool::new(persist),
            retry_attempts: AtomicU32::new(0),
            pending: PendingRequests::default(),
            connectivity: EventDispatcher::new(),
            pushes: EventDispatcher::new(),
        }
    }

    fn mark_open(&self) {
        self.retry_attempts.store(0, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        self.connectivity.dispatch_async(ConnectivityChange {
            socket_connection: true,
        });
    }

    /// Clears the open flag, announcing the change if the socket was open.
    pub(crate) fn mark_closed(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.connectivity.dispatch_async(ConnectivityChange {
                socket_connection: false,
            });
        }
    }
}

/// Encoded action frame waiting to be written to the socket.
#[derive(Debug)]
pub(crate) struct QueuedFrame {
    pub(crate) message_id: u64,
    pub(crate) text: String,
}

/// Socket side of [`Transport`].
pub(crate) struct SocketTransport {
    state: Arc<SocketState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<QueuedFrame>>>,
    last_message_id: AtomicU64,
    request_timeout: Duration,
}

impl SocketTransport {
    pub(crate) fn new(
        state: Arc<SocketState>,
        outbound: Option<mpsc::UnboundedSender<QueuedFrame>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            state,
            outbound: Mutex::new(outbound),
            last_message_id: AtomicU64::new(0),
            request_timeout,
        }
    }

    pub(crate) fn last_message_id(&self) -> u64 {
        self.last_message_id.load(Ordering::SeqCst)
    }

    /// Closes the outbound queue; the worker closes the socket and exits.
    pub(crate) fn close_queue(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn enqueue(&self, frame: QueuedFrame) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    fn expires_at(&self) -> Option<Instant> {
        (!self.request_timeout.is_zero()).then(|| Instant::now() + self.request_timeout)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    async fn perform(&self, action: &str, params: Params) -> Result<Value, ActionError> {
        let message_id = self.last_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        let text = ActionEnvelope::new(message_id, action, params)
            .to_text()
            .map_err(|err| ActionError::InvalidParams(err.to_string()))?;

        let (responder, reply) = oneshot::channel();
        self.state
            .pending
            .insert(message_id, self.expires_at(), responder);

        if !self.enqueue(QueuedFrame { message_id, text }) {
            self.state.pending.resolve(message_id, Err(ActionError::Timeout));
        }
        debug!(event = "socket_action_sent", message_id, action);

        reply.await.unwrap_or(Err(ActionError::Timeout))
    }
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect,
}

/// Background task owning the websocket.
pub(crate) struct SocketWorker {
    url: String,
    api_key: Option<SecretString>,
    /// `None` waits for the handshake as long as the OS allows.
    connect_timeout: Option<Duration>,
    policy: ReconnectPolicy,
    state: Arc<SocketState>,
}

impl SocketWorker {
    pub(crate) fn new(options: &ConnectionOptions, state: Arc<SocketState>) -> Self {
        Self {
            url: options.socket_endpoint.clone(),
            api_key: options.api_key.clone(),
            connect_timeout: Some(options.connect_timeout())
                .filter(|timeout| !timeout.is_zero()),
            policy: options.reconnect.clone(),
            state,
        }
    }

    pub(crate) async fn run(self, mut outbound_rx: mpsc::UnboundedReceiver<QueuedFrame>) {
        let mut queued = VecDeque::new();

        loop {
            let outcome = self.run_session(&mut outbound_rx, &mut queued).await;
            self.state.mark_closed();

            match outcome {
                Ok(SessionOutcome::GracefulShutdown) => break,
                Ok(SessionOutcome::Reconnect) => {
                    info!(event = "socket_closed", url = %self.url);
                }
                Err(err) => {
                    debug!(event = "socket_open_failed", url = %self.url, error = %err);
                }
            }

            let attempt = self.state.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.state.persist.load(Ordering::SeqCst) || outbound_rx.is_closed() {
                break;
            }

            let delay = self.policy.delay_for_attempt(attempt);
            debug!(
                event = "reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64
            );
            if !collect_frames_during_delay(delay, &mut outbound_rx, &mut queued).await {
                break;
            }
        }

        info!(event = "socket_worker_stopped", url = %self.url);
    }

    async fn run_session(
        &self,
        outbound_rx: &mut mpsc::UnboundedReceiver<QueuedFrame>,
        queued: &mut VecDeque<QueuedFrame>,
    ) -> Result<SessionOutcome, SocketError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(api_key) = self.api_key.as_ref() {
            let header = api_key.expose_secret().parse()?;
            request.headers_mut().insert("x-api-key", header);
        }

        let (mut socket, _) = match self.connect_timeout {
            Some(timeout) => with_timeout(timeout, connect_async(request))
                .await
                .map_err(|_| SocketError::ConnectTimeout(timeout))??,
            None => connect_async(request).await?,
        };

        if !self.state.persist.load(Ordering::SeqCst) || outbound_rx.is_closed() {
            let _ = socket.close(None).await;
            return Ok(SessionOutcome::GracefulShutdown);
        }

        self.state.mark_open();
        info!(event = "socket_opened", url = %self.url);

        drop_stale_frames(queued, &self.state.pending);
        while let Some(frame) = queued.pop_front() {
            if socket.send(Message::Text(frame.text.clone())).await.is_err() {
                queued.push_front(frame);
                return Ok(SessionOutcome::Reconnect);
            }
        }

        loop {
            tokio::select! {
                maybe_outbound = outbound_rx.recv() => {
                    match maybe_outbound {
                        Some(frame) => {
                            if socket.send(Message::Text(frame.text.clone())).await.is_err() {
                                queued.push_front(frame);
                                return Ok(SessionOutcome::Reconnect);
                            }
                        }
                        None => {
                            let _ = socket.close(None).await;
                            return Ok(SessionOutcome::GracefulShutdown);
                        }
                    }
                }
                maybe_inbound = socket.next() => {
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_text(&text) {
                                if socket.send(Message::Text(reply)).await.is_err() {
                                    return Ok(SessionOutcome::Reconnect);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                return Ok(SessionOutcome::Reconnect);
                            }
                        }
                        Some(Ok(Message::Close(_))) => return Ok(SessionOutcome::Reconnect),
                        Some(Ok(_)) => {
                            debug!(event = "inbound_frame_ignored", reason = "non-text frame");
                        }
                        Some(Err(err)) => {
                            warn!(event = "socket_read_failed", error = %err);
                            return Ok(SessionOutcome::Reconnect);
                        }
                        None => return Ok(SessionOutcome::Reconnect),
                    }
                }
            }
        }
    }

    /// Handles one inbound text frame, returning a frame to send back.
    fn handle_text(&self, text: &str) -> Option<String> {
        match parse_inbound(text) {
            Ok(InboundFrame::Ping { timestamp }) => Some(pong_frame(&timestamp)),
            Ok(InboundFrame::Response {
                message_id,
                outcome,
            }) => {
                if !self.state.pending.resolve(message_id, outcome) {
                    debug!(event = "response_unmatched", message_id);
                }
                None
            }
            Ok(InboundFrame::Push(push)) => {
                self.state.pushes.dispatch(&push);
                None
            }
            Err(err) => {
                debug!(event = "inbound_frame_ignored", error = %err);
                None
            }
        }
    }
}

/// Periodically times out expired pending requests.
///
/// Stops once persistence is disabled or the socket state is gone.
pub(crate) async fn sweep_pending(state: Weak<SocketState>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        if !state.persist.load(Ordering::SeqCst) {
            break;
        }
        let expired = state.pending.sweep(Instant::now());
        if expired > 0 {
            debug!(event = "request_timed_out", expired);
        }
    }
}

/// Removes queued frames whose request is no longer awaiting a reply.
fn drop_stale_frames(queued: &mut VecDeque<QueuedFrame>, pending: &PendingRequests) -> usize {
    let now = Instant::now();
    let before = queued.len();
    queued.retain(|frame| pending.awaits_reply(frame.message_id, now));
    let dropped = before - queued.len();
    if dropped > 0 {
        debug!(event = "stale_frame_dropped", dropped);
    }
    dropped
}

async fn collect_frames_during_delay(
    delay: Duration,
    outbound_rx: &mut mpsc::UnboundedReceiver<QueuedFrame>,
    queued: &mut VecDeque<QueuedFrame>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => queued.push_back(frame),
                    None => return false,
                }
            }
        }
    }
}
