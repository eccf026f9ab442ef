//! Axum HTTP + WebSocket transport for the Session Broker (spec §4.6, §6): a thin collaborator
//! shell around `broker-core`. It authenticates connections through `IdentityProvider`, exposes a
//! minimal REST surface to create/list/kill sessions, and bridges the duplex terminal channel and
//! the session-list channel onto WebSocket connections. HTTP/auth framing proper is out of the
//! broker's scope (spec §1) — this is *a* binding, not the product's real auth layer.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use broker_core::broker::{CreateSessionOpts, SessionBroker};
use broker_core::collaborators::IdentityProvider;
use broker_core::error::{BrokerError, BrokerResult};
use broker_core::events::BrokerEvent;
use broker_core::session::{CommandRecord, Session, SessionId, SessionInfo, SessionStatus};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

/// Shared app state: the broker singleton and the identity provider used to authenticate
/// connections. Built once by the binary's `main` and cloned cheaply per request/connection.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SessionBroker>,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Binds `addr` and serves the REST surface plus the two WebSocket channels until the process
/// is asked to stop.
pub async fn run_web_server(addr: SocketAddr, state: AppState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new()
        .route("/api/sessions", get(list_sessions_handler).post(create_session_handler))
        .route("/api/sessions/{id}", delete(delete_session_handler))
        .route("/ws", get(ws_terminal_handler))
        .route("/ws/list", get(ws_list_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!(%addr, "broker-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------------------------
// REST surface
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn status_for(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::Forbidden(_) => StatusCode::FORBIDDEN,
        BrokerError::CapacityExceeded(_, _) | BrokerError::Conflict(_) => StatusCode::CONFLICT,
        BrokerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: &BrokerError) -> Response {
    (status_for(err), Json(ErrorBody { message: err.to_string() })).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let token = bearer_token(headers).ok_or_else(|| {
        (StatusCode::UNAUTHORIZED, Json(ErrorBody { message: "missing bearer token".to_string() })).into_response()
    })?;
    state.identity.verify(token).await.map_err(|e| error_response(&e))
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: Vec<(String, String)>,
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
}

async fn create_session_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    let user_id = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let opts = CreateSessionOpts {
        session_id: None,
        name: body.name,
        working_dir: body.working_dir,
        env: body.env,
        device_id: body.device_id,
        cols: body.cols,
        rows: body.rows,
    };
    match state.broker.create_session(&user_id, opts).await {
        Ok(session) => (StatusCode::CREATED, Json(SessionInfoWire::from(session.info()))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_sessions_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let list: Vec<SessionInfoWire> = state.broker.list_by_user(&user_id).into_iter().map(Into::into).collect();
    Json(list).into_response()
}

async fn delete_session_handler(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<SessionId>) -> Response {
    let user_id = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    if state.broker.kill(id, &user_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(ErrorBody { message: "session not found".to_string() })).into_response()
    }
}

// ---------------------------------------------------------------------------------------------
// Wire types (spec §6: JSON objects with a `type` field; camelCase payload fields)
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfoWire {
    id: SessionId,
    user_id: String,
    device_id: Option<String>,
    name: String,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    working_dir: String,
    connected_clients: u32,
    last_command: Option<String>,
    is_executing: bool,
}

impl From<SessionInfo> for SessionInfoWire {
    fn from(info: SessionInfo) -> Self {
        Self {
            id: info.id,
            user_id: info.user_id,
            device_id: info.device_id,
            name: info.name,
            status: info.status,
            created_at: info.created_at,
            last_activity: info.last_activity,
            working_dir: info.working_dir,
            connected_clients: info.connected_clients,
            last_command: info.last_command,
            is_executing: info.is_executing,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandRecordWire {
    command: String,
    timestamp: DateTime<Utc>,
}

impl From<CommandRecord> for CommandRecordWire {
    fn from(record: CommandRecord) -> Self {
        Self { command: record.command, timestamp: record.timestamp }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    TerminalInput { data: String },
    TerminalResize { cols: u16, rows: u16 },
    GetHistory,
    GetSessions,
    Ping,
    Pong,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundMessage {
    SessionInfo { session: SessionInfoWire },
    SessionList { list: Vec<SessionInfoWire> },
    SessionUpdated {
        session: SessionInfoWire,
        #[serde(rename = "eventType")]
        event_type: String,
    },
    SessionCreated { session: SessionInfoWire },
    SessionDeleted {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    TerminalData { data: String },
    TerminalClear,
    TerminalExit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    CommandHistory { history: Vec<CommandRecordWire> },
    Error { message: String },
    Pong,
}

/// Encodes raw PTY bytes as a JSON string losslessly, one `char` per byte (an ISO-8859-1-style
/// mapping: byte `b` becomes the Unicode scalar value `b`, which is always a valid `char` and
/// always round-trips to the exact same byte). Terminal output arrives from `core/src/pty/host.rs`
/// as fixed-size 4096-byte reads with no UTF-8 boundary awareness, so a multi-byte UTF-8
/// character can — and, with box-drawing glyphs or non-ASCII filenames, routinely does — straddle
/// a chunk boundary; decoding each chunk independently with `String::from_utf8_lossy` would
/// silently corrupt it into U+FFFD at the split. Mapping byte-for-byte instead means the wire
/// payload is always valid UTF-8 JSON and never depends on chunk boundaries lining up with
/// character boundaries, satisfying spec §6 and testable property 5.
fn bytes_to_wire_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

async fn send_json(tx: &mut SplitSink<WebSocket, Message>, msg: &OutboundMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => tx.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode outbound message");
            false
        }
    }
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

// ---------------------------------------------------------------------------------------------
// Terminal channel (spec §4.6 ClientBridge)
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TerminalWsQuery {
    token: String,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    device_id: Option<String>,
}

async fn ws_terminal_handler(State(state): State<AppState>, Query(query): Query<TerminalWsQuery>, ws: WebSocketUpgrade) -> Response {
    let identity = state.identity.clone();
    match identity.verify(&query.token).await {
        Ok(user_id) => ws.on_upgrade(move |socket| run_terminal_bridge(socket, state, user_id, query.session_id, query.device_id)),
        Err(_) => ws.on_upgrade(|mut socket| async move {
            let _ = socket.send(close_frame(1008, "Authentication required")).await;
        }),
    }
}

/// Resolves the handshake's `{sessionId, deviceId}` to a live session per spec §4.6: an explicit
/// `sessionId` attaches to that session; a bare `deviceId` goes through the reuse-or-create path;
/// neither creates a fresh anonymous session.
async fn resolve_session(
    broker: &Arc<SessionBroker>,
    user_id: &str,
    session_id: Option<SessionId>,
    device_id: Option<String>,
) -> BrokerResult<Arc<Session>> {
    if let Some(id) = session_id {
        return broker.attach(id, user_id);
    }
    if let Some(device) = device_id {
        let opts = CreateSessionOpts { device_id: Some(device.clone()), ..Default::default() };
        return broker.get_or_create_for_device(user_id, &device, opts).await;
    }
    broker.create_session(user_id, CreateSessionOpts::default()).await
}

async fn run_terminal_bridge(
    socket: WebSocket,
    state: AppState,
    user_id: String,
    session_id: Option<SessionId>,
    device_id: Option<String>,
) {
    let broker = state.broker.clone();

    let session = match resolve_session(&broker, &user_id, session_id, device_id.clone()).await {
        Ok(s) => s,
        Err(err) => {
            let (mut ws_tx, mut ws_rx) = socket.split();
            let _ = send_json(&mut ws_tx, &OutboundMessage::Error { message: err.to_string() }).await;
            // NotFound/CapacityExceeded/Conflict leave the channel open per spec §7's table;
            // Forbidden and Unavailable close it (1011 on Unavailable, normal closure otherwise).
            match err {
                BrokerError::Forbidden(_) => {
                    let _ = ws_tx.send(close_frame(1000, "forbidden")).await;
                }
                BrokerError::Unavailable(_) => {
                    let _ = ws_tx.send(close_frame(1011, "runtime unavailable")).await;
                }
                _ => {
                    run_sessionless_bridge(&mut ws_tx, &mut ws_rx).await;
                }
            }
            return;
        }
    };

    tracing::info!(session_id = %session.id, %user_id, "client_bridge connected");

    let replay_k = broker.config().replay_k;
    let Some((snapshot, mut live_rx)) = broker.subscribe_with_replay(session.id, replay_k) else {
        return;
    };
    let mut events_rx = broker.subscribe_events();
    let (mut ws_tx, mut ws_rx) = socket.split();

    if send_json(&mut ws_tx, &OutboundMessage::SessionInfo { session: session.info().into() }).await && !snapshot.is_empty() {
        let _ = send_json(&mut ws_tx, &OutboundMessage::TerminalClear).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let joined: Vec<u8> = snapshot.iter().flat_map(|c| c.to_vec()).collect();
        let _ = send_json(&mut ws_tx, &OutboundMessage::TerminalData { data: bytes_to_wire_string(&joined) }).await;
    }

    let mut ticker = tokio::time::interval(broker.config().ping_interval);
    ticker.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_terminal_inbound(&text, &broker, &session, &mut ws_tx, &mut awaiting_pong).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }

            chunk = live_rx.recv() => {
                match chunk {
                    Ok(bytes) => {
                        let data = bytes_to_wire_string(&bytes);
                        if !send_json(&mut ws_tx, &OutboundMessage::TerminalData { data }).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        tracing::warn!(session_id = %session.id, "slow consumer, closing transport");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            event = events_rx.recv() => {
                match event {
                    Ok(BrokerEvent::SessionUpdated { session: info, event_type }) if info.id == session.id => {
                        if !send_json(&mut ws_tx, &OutboundMessage::SessionUpdated { session: info.into(), event_type }).await {
                            break;
                        }
                    }
                    Ok(BrokerEvent::SessionDeleted { session_id: id, exit_code }) if id == session.id => {
                        let _ = send_json(&mut ws_tx, &OutboundMessage::TerminalExit { exit_code: exit_code.unwrap_or(-1) }).await;
                        let _ = send_json(&mut ws_tx, &OutboundMessage::SessionDeleted { session_id: id }).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = ticker.tick() => {
                if awaiting_pong {
                    tracing::warn!(session_id = %session.id, "heartbeat timeout, closing transport");
                    break;
                }
                awaiting_pong = true;
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    broker.detach(session.id, &user_id, device_id.as_deref());
    tracing::info!(session_id = %session.id, %user_id, "client_bridge disconnected");
}

/// Keeps a terminal connection open after `resolve_session` fails with `NotFound`,
/// `CapacityExceeded`, or `Conflict` — spec §7's table says these leave the channel open (unlike
/// `Forbidden`/`Unavailable`, which close it), so the client that already has a socket open can
/// keep it and retry rather than being forced to reconnect. There is no session to bridge output
/// for, so this just answers liveness traffic until the client disconnects.
async fn run_sessionless_bridge(ws_tx: &mut SplitSink<WebSocket, Message>, ws_rx: &mut futures_util::stream::SplitStream<WebSocket>) {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(InboundMessage::Ping) => {
                    if !send_json(ws_tx, &OutboundMessage::Pong).await {
                        break;
                    }
                }
                Ok(InboundMessage::Pong) | Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "ignoring unrecognized message on sessionless bridge"),
            },
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Ping(payload))) => {
                if ws_tx.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }
}

/// Handles one inbound text frame on the terminal channel. Returns `false` if the connection
/// should be torn down (a send failed).
async fn handle_terminal_inbound(
    text: &str,
    broker: &Arc<SessionBroker>,
    session: &Arc<Session>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    awaiting_pong: &mut bool,
) -> bool {
    match serde_json::from_str::<InboundMessage>(text) {
        Ok(InboundMessage::TerminalInput { data }) => {
            broker.write(session.id, data.as_bytes());
            true
        }
        Ok(InboundMessage::TerminalResize { cols, rows }) => {
            broker.resize(session.id, cols, rows).await;
            true
        }
        Ok(InboundMessage::GetHistory) => {
            let history: Vec<CommandRecordWire> = session.history().into_iter().map(Into::into).collect();
            send_json(ws_tx, &OutboundMessage::CommandHistory { history }).await
        }
        Ok(InboundMessage::GetSessions) => {
            // Only meaningful on the list channel (spec §4.6); a terminal connection asking
            // gets its own session back rather than being silently dropped.
            let list = vec![SessionInfoWire::from(session.info())];
            send_json(ws_tx, &OutboundMessage::SessionList { list }).await
        }
        Ok(InboundMessage::Ping) => send_json(ws_tx, &OutboundMessage::Pong).await,
        Ok(InboundMessage::Pong) => {
            *awaiting_pong = false;
            true
        }
        Err(e) => {
            tracing::debug!(session_id = %session.id, error = %e, "ignoring unrecognized message");
            true
        }
    }
}

// ---------------------------------------------------------------------------------------------
// List channel (spec §4.6 "List channel")
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListWsQuery {
    token: String,
}

async fn ws_list_handler(State(state): State<AppState>, Query(query): Query<ListWsQuery>, ws: WebSocketUpgrade) -> Response {
    let identity = state.identity.clone();
    match identity.verify(&query.token).await {
        Ok(user_id) => ws.on_upgrade(move |socket| run_list_bridge(socket, state, user_id)),
        Err(_) => ws.on_upgrade(|mut socket| async move {
            let _ = socket.send(close_frame(1008, "Authentication required")).await;
        }),
    }
}

/// Serves `session_list` subscribers (spec §4.6). Each event is broadcast on the broker-wide bus
/// shared by every list subscriber; this task filters it down to the sessions owned by the
/// connection's authenticated user, since a subscriber must only ever learn about its own
/// sessions. `known` tracks which session ids currently belong to this user so a `SessionDeleted`
/// event — which doesn't carry `userId` — can still be attributed correctly.
async fn run_list_bridge(socket: WebSocket, state: AppState, user_id: String) {
    let broker = state.broker.clone();
    let mut events_rx = broker.subscribe_events();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let initial = broker.list_by_user(&user_id);
    let mut known: HashSet<SessionId> = initial.iter().map(|s| s.id).collect();
    let list: Vec<SessionInfoWire> = initial.into_iter().map(Into::into).collect();
    if !send_json(&mut ws_tx, &OutboundMessage::SessionList { list }).await {
        return;
    }

    let mut ticker = tokio::time::interval(broker.config().ping_interval);
    ticker.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundMessage>(&text) {
                            Ok(InboundMessage::GetSessions) => {
                                let list: Vec<SessionInfoWire> = broker.list_by_user(&user_id).into_iter().map(Into::into).collect();
                                if !send_json(&mut ws_tx, &OutboundMessage::SessionList { list }).await {
                                    break;
                                }
                            }
                            Ok(InboundMessage::Ping) => {
                                if !send_json(&mut ws_tx, &OutboundMessage::Pong).await {
                                    break;
                                }
                            }
                            Ok(InboundMessage::Pong) => awaiting_pong = false,
                            _ => tracing::debug!("ignoring message on list channel"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }

            event = events_rx.recv() => {
                match event {
                    Ok(BrokerEvent::SessionCreated { session }) if session.user_id == user_id => {
                        known.insert(session.id);
                        if !send_json(&mut ws_tx, &OutboundMessage::SessionCreated { session: session.into() }).await {
                            break;
                        }
                    }
                    Ok(BrokerEvent::SessionUpdated { session, event_type }) if session.user_id == user_id => {
                        known.insert(session.id);
                        if !send_json(&mut ws_tx, &OutboundMessage::SessionUpdated { session: session.into(), event_type }).await {
                            break;
                        }
                    }
                    Ok(BrokerEvent::SessionDeleted { session_id, .. }) if known.remove(&session_id) => {
                        if !send_json(&mut ws_tx, &OutboundMessage::SessionDeleted { session_id }).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = ticker.tick() => {
                if awaiting_pong {
                    tracing::warn!(%user_id, "list channel heartbeat timeout, closing transport");
                    break;
                }
                awaiting_pong = true;
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
