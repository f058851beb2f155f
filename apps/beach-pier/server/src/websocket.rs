use std::{error::Error as StdError, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use beach_pier_core::{ErrorCode, Message};
use futures_util::{stream::SplitStream, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    client::Client,
    connection::Connection,
    error::RelayError,
    events::{ClientMessage, Disconnect, FrameError},
    registry::Admission,
    state::RelayState,
};

/// Time an `ID-TAKEN` notice gets to reach the client before the socket is
/// closed.
pub const ID_TAKEN_GRACE: Duration = Duration::from_millis(100);

/// Consecutive unclassified read errors tolerated before the stream is
/// treated as closed.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 8;

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    pub id: Option<String>,
    pub token: Option<String>,
    pub key: Option<String>,
}

impl HandshakeParams {
    /// All three parameters, or `None` when any is missing or empty.
    fn credentials(&self) -> Option<(&str, &str, &str)> {
        fn non_empty(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|v| !v.is_empty())
        }
        Some((
            non_empty(&self.id)?,
            non_empty(&self.token)?,
            non_empty(&self.key)?,
        ))
    }
}

/// How a handshake ended.
#[derive(Debug)]
pub enum HandshakeOutcome {
    Registered(Arc<Client>),
    Reconnected(Arc<Client>),
    Rejected(ErrorCode),
    IdTaken,
}

impl HandshakeOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            HandshakeOutcome::Registered(_) => "registered",
            HandshakeOutcome::Reconnected(_) => "reconnected",
            HandshakeOutcome::Rejected(ErrorCode::InvalidParameters) => "invalid_parameters",
            HandshakeOutcome::Rejected(ErrorCode::InvalidKey) => "invalid_key",
            HandshakeOutcome::Rejected(ErrorCode::ConnectionLimitExceeded) => "limit_exceeded",
            HandshakeOutcome::IdTaken => "id_taken",
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    State(state): State<RelayState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, params, state, remote_addr))
}

async fn handle_socket(
    socket: WebSocket,
    params: HandshakeParams,
    state: RelayState,
    remote_addr: Option<SocketAddr>,
) {
    let (sink, stream) = socket.split();
    let connection = Connection::attach(sink, remote_addr);

    let outcome = handshake(&state, &params, &connection);
    counter!("beach_pier_handshakes_total", 1, "outcome" => outcome.metric_label());

    match outcome {
        HandshakeOutcome::Registered(client) => {
            gauge!("beach_pier_clients_active", state.registry.len() as f64);
            info!(
                client_id = client.id(),
                connection_id = %connection.id(),
                remote_addr = ?remote_addr,
                "client registered"
            );
            if let Err(err) = connection.send(&Message::open()) {
                warn!(client_id = client.id(), error = %err, "failed to send OPEN");
            }
            read_loop(stream, client, connection, state).await;
        }
        HandshakeOutcome::Reconnected(client) => {
            // The identity is already open, so no second OPEN is sent.
            info!(
                client_id = client.id(),
                connection_id = %connection.id(),
                remote_addr = ?remote_addr,
                "client reconnected"
            );
            read_loop(stream, client, connection, state).await;
        }
        HandshakeOutcome::Rejected(code) => {
            let err = rejection_error(code, &state);
            warn!(error = %err, remote_addr = ?remote_addr, "rejecting websocket handshake");
            if let Err(err) = connection.send(&Message::error(code)) {
                debug!(error = %err, "failed to send handshake error");
            }
            connection.close();
        }
        HandshakeOutcome::IdTaken => {
            warn!(
                client_id = params.id.as_deref().unwrap_or_default(),
                remote_addr = ?remote_addr,
                error = %RelayError::Auth("id is taken by a client with a different token"),
                "rejecting websocket handshake"
            );
            if let Err(err) = connection.send(&Message::id_taken()) {
                debug!(error = %err, "failed to send ID-TAKEN");
            }
            tokio::spawn(async move {
                tokio::time::sleep(ID_TAKEN_GRACE).await;
                connection.close();
            });
        }
    }
}

fn rejection_error(code: ErrorCode, state: &RelayState) -> RelayError {
    match code {
        ErrorCode::InvalidParameters => RelayError::Protocol(code.to_string()),
        ErrorCode::InvalidKey => RelayError::Auth("invalid shared key"),
        ErrorCode::ConnectionLimitExceeded => RelayError::Capacity(state.config.concurrent_limit),
    }
}

/// Validates the upgrade parameters and admits the connection. Registry
/// state only changes for the `Registered` and `Reconnected` outcomes.
pub fn handshake(
    state: &RelayState,
    params: &HandshakeParams,
    connection: &Arc<Connection>,
) -> HandshakeOutcome {
    let Some((id, token, key)) = params.credentials() else {
        return HandshakeOutcome::Rejected(ErrorCode::InvalidParameters);
    };

    if !state.key_matches(key) {
        return HandshakeOutcome::Rejected(ErrorCode::InvalidKey);
    }

    match state.registry.admit(
        id,
        token,
        Arc::clone(connection),
        state.config.concurrent_limit,
    ) {
        Admission::Registered(client) => HandshakeOutcome::Registered(client),
        Admission::Rebound { client, previous } => {
            if let Some(previous) = previous {
                debug!(
                    client_id = id,
                    superseded = %previous.id(),
                    "connection superseded by reconnect"
                );
            }
            HandshakeOutcome::Reconnected(client)
        }
        Admission::IdTaken => HandshakeOutcome::IdTaken,
        Admission::LimitReached => {
            HandshakeOutcome::Rejected(ErrorCode::ConnectionLimitExceeded)
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    client: Arc<Client>,
    connection: Arc<Connection>,
    state: RelayState,
) {
    state.events.connected.emit(&client);
    let mut consecutive_errors = 0u32;

    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => {
                consecutive_errors = 0;
                frame
            }
            Some(Err(err)) => {
                if is_connection_reset(&err) {
                    debug!(client_id = client.id(), error = %err, "connection reset");
                    break;
                }
                consecutive_errors += 1;
                warn!(
                    client_id = client.id(),
                    connection_id = %connection.id(),
                    error = %err,
                    "websocket read error"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    warn!(client_id = client.id(), "too many read errors; closing");
                    break;
                }
                continue;
            }
            None => break,
        };

        match frame {
            WsMessage::Text(text) => handle_frame(text.as_bytes(), &client, &connection, &state),
            WsMessage::Binary(data) => handle_frame(&data, &client, &connection, &state),
            WsMessage::Close(frame) => {
                debug!(
                    client_id = client.id(),
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    let evicted = state
        .registry
        .remove_if_bound(client.id(), connection.id())
        .is_some();
    connection.close();

    if evicted {
        gauge!("beach_pier_clients_active", state.registry.len() as f64);
        info!(client_id = client.id(), connection_id = %connection.id(), "client disconnected");
    } else {
        debug!(
            client_id = client.id(),
            connection_id = %connection.id(),
            "superseded connection closed; registry entry kept"
        );
    }

    state.events.disconnected.emit(&Disconnect {
        client,
        connection: connection.id(),
        evicted,
    });
}

fn handle_frame(raw: &[u8], client: &Arc<Client>, connection: &Connection, state: &RelayState) {
    match Message::from_slice(raw) {
        Ok(mut message) => {
            message.src = Some(client.id().to_string());
            state.events.message.emit(&ClientMessage {
                client: Arc::clone(client),
                message,
            });
        }
        Err(err) => {
            counter!("beach_pier_frames_malformed_total", 1);
            warn!(client_id = client.id(), error = %err, "failed to decode client message");
            state.events.error.emit(&FrameError {
                client_id: client.id().to_string(),
                connection: connection.id(),
                reason: err.to_string(),
            });
        }
    }
}

fn is_connection_reset(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            );
        }
        source = current.source();
    }
    false
}
