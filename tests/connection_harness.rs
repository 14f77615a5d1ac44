use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use actionwire::connection::ConnectivityChange;
use actionwire::live::{ModelChangeEvent, ResourceRef};
use actionwire::retry::ReconnectPolicy;
use actionwire::{ActionError, Connection, ConnectionOptions};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

const TEST_API_KEY: &str = "test-api-key";
const PING_FRAME: &str = "primus::ping::1700000000000";
const PONG_FRAME: &str = "primus::pong::1700000000000";

#[derive(Clone, Default)]
struct MockState {
    socket_actions: Arc<Mutex<Vec<String>>>,
    rest_actions: Arc<Mutex<Vec<String>>>,
    pongs: Arc<Mutex<Vec<String>>>,
    api_keys: Arc<Mutex<Vec<String>>>,
}

impl MockState {
    async fn socket_actions(&self) -> Vec<String> {
        self.socket_actions.lock().await.clone()
    }

    async fn rest_actions(&self) -> Vec<String> {
        self.rest_actions.lock().await.clone()
    }
}

struct MockBackend {
    addr: SocketAddr,
    state: MockState,
    server: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    async fn start() -> Self {
        let state = MockState::default();
        let app = Router::new()
            .route("/primus", get(ws_handler))
            .route("/api", post(rest_handler))
            .with_state(state.clone());
        let (addr, server) = spawn_server(app).await;
        Self {
            addr,
            state,
            server,
        }
    }

    fn options(&self) -> ConnectionOptions {
        ConnectionOptions::default()
            .with_socket_endpoint(format!("ws://{}/primus", self.addr))
            .with_rest_endpoint(format!("http://{}/api", self.addr))
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        immediate_attempts: 3,
        short_attempts: 24,
        short_delay: Duration::from_millis(50),
        long_delay: Duration::from_millis(100),
    }
}

fn record_connectivity(connection: &Connection) -> Arc<StdMutex<Vec<bool>>> {
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    connection
        .connectivity_changed()
        .subscribe_fn(move |change: &ConnectivityChange, _| {
            sink.lock()
                .expect("connectivity log")
                .push(change.socket_connection);
        });
    seen
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn not_found_error() -> Value {
    json!({
        "name": "NotFound",
        "message": "no such instance",
        "status": 404,
        "code": 12,
        "explanation": "the instance was deleted"
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_opens_answers_pings_and_serves_actions() {
    let backend = MockBackend::start().await;
    let connection = Connection::new(
        backend
            .options()
            .with_api_key(SecretString::new(TEST_API_KEY.to_string())),
    )
    .expect("build connection");
    let connectivity = record_connectivity(&connection);

    wait_until("socket open", || connection.socket_connected()).await;
    wait_until("connectivity event", || {
        *connectivity.lock().expect("connectivity log") == vec![true]
    })
    .await;
    assert_eq!(connection.retry_attempts(), 0);

    let health = connection
        .perform("core:health", json!({}))
        .await
        .expect("health over socket");
    assert_eq!(health.get("healthy"), Some(&json!(true)));
    assert!(health.get("error").is_none());
    assert!(health.get("messageId").is_none());

    assert_eq!(backend.state.socket_actions().await, vec!["core:health"]);
    assert!(backend.state.rest_actions().await.is_empty());
    assert_eq!(*backend.state.pongs.lock().await, vec![PONG_FRAME]);
    assert_eq!(
        *backend.state.api_keys.lock().await,
        vec![TEST_API_KEY.to_string()]
    );
    assert_eq!(connection.last_message_id(), 1);

    connection.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_connect_timeout_waits_for_the_handshake() {
    let backend = MockBackend::start().await;
    let connection = Connection::new(backend.options().with_connect_timeout(Duration::ZERO))
        .expect("build connection");

    wait_until("socket open", || connection.socket_connected()).await;
    assert_eq!(connection.retry_attempts(), 0);

    let health = connection
        .perform("core:health", json!({}))
        .await
        .expect("health over socket");
    assert_eq!(health.get("healthy"), Some(&json!(true)));
    assert_eq!(backend.state.socket_actions().await, vec!["core:health"]);

    connection.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_fallback_serves_actions_while_socket_is_unavailable() {
    let backend = MockBackend::start().await;
    let connection = Connection::new(
        backend
            .options()
            .with_socket_endpoint(format!("ws://{}/closed", backend.addr))
            .with_reconnect_policy(fast_reconnect()),
    )
    .expect("build connection");

    let health = connection
        .perform("core:health", json!({}))
        .await
        .expect("health over http");
    assert_eq!(health, json!({"healthy": true, "transport": "http"}));
    assert!(!connection.socket_connected());
    assert_eq!(backend.state.rest_actions().await, vec!["core:health"]);

    connection.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn structured_errors_pass_through_on_both_transports() {
    let backend = MockBackend::start().await;

    let http_only =
        Connection::new(backend.options().with_persist_connection(false)).expect("http connection");
    let error = http_only
        .perform("core:fail", json!({"id": "i-404"}))
        .await
        .expect_err("remote error over http");
    assert_eq!(error, ActionError::Remote(not_found_error()));
    assert_eq!(error.to_envelope(), json!({ "error": not_found_error() }));

    let socket = Connection::new(backend.options()).expect("socket connection");
    wait_until("socket open", || socket.socket_connected()).await;
    let error = socket
        .perform("core:fail", json!({"id": "i-404"}))
        .await
        .expect_err("remote error over socket");
    assert_eq!(error, ActionError::Remote(not_found_error()));
    assert_eq!(error.message(), "no such instance");

    socket.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_socket_request_times_out() {
    let backend = MockBackend::start().await;
    let connection = Connection::new(
        backend
            .options()
            .with_request_timeout(Duration::from_millis(300)),
    )
    .expect("build connection");
    wait_until("socket open", || connection.socket_connected()).await;

    let started = Instant::now();
    let error = connection
        .perform("core:silent", json!({}))
        .await
        .expect_err("request should time out");
    let elapsed = started.elapsed();

    assert!(error.is_timeout());
    assert_eq!(error.message(), "Request timed out.");
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
    assert_eq!(connection.pending_requests(), 0);

    connection.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_fails_in_flight_requests_and_stops_reconnecting() {
    let backend = MockBackend::start().await;
    let connection = Connection::new(
        backend
            .options()
            .with_request_timeout(Duration::ZERO)
            .with_reconnect_policy(fast_reconnect()),
    )
    .expect("build connection");
    let connectivity = record_connectivity(&connection);
    wait_until("socket open", || connection.socket_connected()).await;

    let in_flight = tokio::spawn({
        let connection = connection.clone();
        async move { connection.perform("core:silent", json!({})).await }
    });
    wait_until("request pending", || connection.pending_requests() == 1).await;

    connection.dispose();

    let outcome = timeout(Duration::from_secs(1), in_flight)
        .await
        .expect("in-flight request settles promptly")
        .expect("join request task");
    assert_eq!(outcome, Err(ActionError::Timeout));
    assert!(!connection.socket_connected());
    assert!(connection.is_disposed());

    tokio::time::sleep(fast_reconnect().max_delay() * 5).await;
    assert!(!connection.socket_connected());
    assert_eq!(
        *connectivity.lock().expect("connectivity log"),
        vec![true, false]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_socket_reconnects_and_resets_retry_count() {
    let backend = MockBackend::start().await;
    let connection = Connection::new(
        backend
            .options()
            .with_request_timeout(Duration::from_millis(200))
            .with_reconnect_policy(fast_reconnect()),
    )
    .expect("build connection");
    let connectivity = record_connectivity(&connection);
    wait_until("socket open", || connection.socket_connected()).await;

    let dropped = connection.perform("core:drop", json!({})).await;
    assert_eq!(dropped, Err(ActionError::Timeout));

    wait_until("reconnect", || {
        connectivity.lock().expect("connectivity log").len() == 3
    })
    .await;
    // async delivery has no ordering guarantee between notifications
    let mut seen = connectivity.lock().expect("connectivity log").clone();
    seen.sort();
    assert_eq!(seen, vec![false, true, true]);
    wait_until("socket open again", || connection.socket_connected()).await;
    assert_eq!(connection.retry_attempts(), 0);

    let health = connection
        .perform("core:health", json!({}))
        .await
        .expect("health after reconnect");
    assert_eq!(health.get("healthy"), Some(&json!(true)));

    connection.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_subscription_tracks_listeners_over_the_socket() {
    let backend = MockBackend::start().await;
    let connection = Connection::new(backend.options()).expect("build connection");
    wait_until("socket open", || connection.socket_connected()).await;

    let live = connection.live(ResourceRef::new("instance", "i-1"));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = live
        .change_event()
        .subscribe_fn(move |change: &ModelChangeEvent, _| {
            let _ = tx.send(change.clone());
        });
    wait_until("remote subscribe", || live.is_subscribed()).await;

    connection
        .perform("instance:poke", json!({"id": "i-1"}))
        .await
        .expect("poke");
    let change = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("change delivered")
        .expect("channel open");
    assert_eq!(change.event, "instance:change");
    assert_eq!(change.data, json!({"state": "running"}));

    listener.unsubscribe();
    assert!(!live.is_subscribed());

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let actions = backend.state.socket_actions().await;
        if actions.iter().any(|action| action == "instance:unsubscribe") {
            assert_eq!(
                actions,
                vec!["instance:subscribe", "instance:poke", "instance:unsubscribe"]
            );
            break;
        }
        assert!(Instant::now() < deadline, "timed out waiting for unsubscribe");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    connection.dispose();
}

async fn ws_handler(
    State(state): State<MockState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Some(api_key) = headers.get("x-api-key").and_then(|value| value.to_str().ok()) {
        state.api_keys.lock().await.push(api_key.to_string());
    }
    ws.on_upgrade(move |socket| run_socket(socket, state))
}

async fn run_socket(mut socket: WebSocket, state: MockState) {
    if send_json(&mut socket, json!(PING_FRAME)).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if let Some(pong) = frame.as_str() {
            state.pongs.lock().await.push(pong.to_string());
            continue;
        }

        let message_id = frame["messageId"].clone();
        let params = frame["params"].clone();
        let action = params["action"].as_str().unwrap_or_default().to_string();
        state.socket_actions.lock().await.push(action.clone());

        let reply = match action.as_str() {
            "core:health" => json!({"context": "response", "messageId": message_id, "healthy": true}),
            "core:fail" => {
                json!({"context": "response", "messageId": message_id, "error": not_found_error()})
            }
            "core:silent" => continue,
            "core:drop" => return,
            "instance:poke" => {
                let push = json!({
                    "event": "instance:change",
                    "id": params["id"],
                    "data": {"state": "running"}
                });
                if send_json(&mut socket, push).await.is_err() {
                    return;
                }
                json!({"context": "response", "messageId": message_id})
            }
            _ => json!({"context": "response", "messageId": message_id}),
        };
        if send_json(&mut socket, reply).await.is_err() {
            return;
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string())).await
}

async fn rest_handler(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    Json(_params): Json<Value>,
) -> impl IntoResponse {
    let action = query.get("action").cloned().unwrap_or_default();
    state.rest_actions.lock().await.push(action.clone());

    match action.as_str() {
        "core:health" => (
            StatusCode::OK,
            Json(json!({"healthy": true, "transport": "http"})),
        ),
        "core:fail" => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": not_found_error() })),
        ),
        _ => (StatusCode::OK, Json(json!({}))),
    }
}

async fn spawn_server(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server should run");
    });
    (addr, task)
}
