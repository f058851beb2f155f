use std::{
    borrow::Cow,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use beach_pier_core::Message;
use futures_util::{stream::SplitSink, Sink, SinkExt};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify,
};
use tracing::{debug, warn};

use crate::error::RelayError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames a connection may have queued before further ones are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Process-unique identity of one accepted transport. A reconnect always
/// gets a fresh id, which is what lets a stale read loop tell it has been
/// superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Work item for the writer task that owns the socket's sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: &'static str },
}

/// Write half of an accepted WebSocket.
///
/// Every write goes through one bounded queue drained by a single writer
/// task, so frames from the router, the handshake and any other path never
/// interleave on the wire. A peer that stops reading fills the queue and
/// further frames are dropped.
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    sender: mpsc::Sender<Outbound>,
    close_signal: Arc<Notify>,
}

impl Connection {
    /// Takes ownership of the sink and spawns its writer task.
    pub fn attach(sink: SplitSink<WebSocket, WsMessage>, remote_addr: Option<SocketAddr>) -> Arc<Self> {
        let (connection, receiver) = Self::channel(remote_addr);
        tokio::spawn(run_writer(
            connection.id,
            sink,
            receiver,
            Arc::clone(&connection.close_signal),
        ));
        connection
    }

    /// A connection whose outbound queue is handed back to the caller
    /// instead of a socket writer.
    pub fn channel(remote_addr: Option<SocketAddr>) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            remote_addr,
            sender,
            close_signal: Arc::new(Notify::new()),
        });
        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn send(&self, message: &Message) -> Result<(), RelayError> {
        let text = message
            .to_json()
            .map_err(|err| RelayError::Protocol(format!("failed to encode frame: {err}")))?;
        self.send_text(text)
    }

    pub fn send_text(&self, text: String) -> Result<(), RelayError> {
        match self.sender.try_send(Outbound::Text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %self.id, "outbound queue full; dropping frame");
                Err(RelayError::Transport(format!("{} outbound queue is full", self.id)))
            }
            Err(TrySendError::Closed(_)) => {
                Err(RelayError::Transport(format!("{} is closed", self.id)))
            }
        }
    }

    /// Queues a normal closure behind any pending frames. When the queue is
    /// full the writer is told to close straight away instead. Closing an
    /// already closed connection does nothing.
    pub fn close(&self) {
        let close = Outbound::Close {
            code: close_code::NORMAL,
            reason: "",
        };
        if let Err(TrySendError::Full(_)) = self.sender.try_send(close) {
            debug!(connection_id = %self.id, "outbound queue full; closing ahead of backlog");
            self.close_signal.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_writer<S>(
    id: ConnectionId,
    mut sink: S,
    mut receiver: mpsc::Receiver<Outbound>,
    close_signal: Arc<Notify>,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = close_signal.notified() => Some(Outbound::Close {
                code: close_code::NORMAL,
                reason: "",
            }),
            next = receiver.recv() => next,
        };
        let Some(outbound) = next else {
            break;
        };

        match outbound {
            Outbound::Text(text) => {
                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                    warn!(connection_id = %id, error = %err, "websocket write failed");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: Cow::Borrowed(reason),
                };
                if let Err(err) = sink.send(WsMessage::Close(Some(frame))).await {
                    debug!(connection_id = %id, error = %err, "failed to send close frame");
                }
                if let Err(err) = sink.close().await {
                    debug!(connection_id = %id, error = %err, "failed to close websocket sink");
                }
                break;
            }
        }
    }
    debug!(connection_id = %id, "writer task finished");
}
