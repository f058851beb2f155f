use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use beach_pier_core::{Handlers, Message};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use tokio::{net::TcpStream, sync::Mutex as AsyncMutex, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        error::ProtocolError,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::{ClientError, ClientOptions};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedSink = Arc<AsyncMutex<SplitSink<WsStream, WsMessage>>>;

/// How long `close` waits for the relay to answer the closing handshake.
const CLOSE_DRAIN: Duration = Duration::from_secs(1);
/// Unclassified read errors in a row before the socket is given up on.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 8;

/// Why a read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A close frame arrived, with its code if one was sent.
    Closed(Option<u16>),
    /// The transport reported the connection as reset or already closed.
    Reset,
    /// The stream ended without a close frame.
    Ended,
    /// Too many read errors in a row.
    Failed(String),
}

/// A text frame that was not a valid message.
#[derive(Debug, Clone)]
pub struct DecodeFailure {
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct SocketEvents {
    pub message: Handlers<Message>,
    pub error: Handlers<DecodeFailure>,
    pub disconnected: Handlers<DisconnectReason>,
}

struct Link {
    generation: u64,
    sink: SharedSink,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

struct Inner {
    options: ClientOptions,
    events: Arc<SocketEvents>,
    link: Mutex<Option<Link>>,
    /// Held across a whole `start` or `close` so only one dial is ever in
    /// flight.
    lifecycle: AsyncMutex<()>,
    generations: AtomicU64,
}

impl Inner {
    /// Drops the link if it still belongs to `generation`.
    fn release(&self, generation: u64) {
        let mut slot = self.link.lock();
        if slot.as_ref().is_some_and(|link| link.generation == generation) {
            if let Some(link) = slot.take() {
                link.heartbeat.abort();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.heartbeat.abort();
            link.reader.abort();
        }
    }
}

/// One client socket to the relay.
///
/// Cloning is cheap and every clone drives the same socket. Reconnecting is
/// left to the caller: once the read loop reports a disconnect, call
/// [`PeerConnection::start`] again.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

impl PeerConnection {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                events: Arc::new(SocketEvents::default()),
                link: Mutex::new(None),
                lifecycle: AsyncMutex::new(()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn events(&self) -> &SocketEvents {
        &self.inner.events
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Dials the relay as `id` and starts the read loop and heartbeat.
    /// Does nothing when a socket is already up, including one another clone
    /// finished dialing while this call waited its turn.
    pub async fn start(&self, id: &str, token: &str) -> Result<(), ClientError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let url = self.inner.options.socket_url(id, token)?;
        debug!(url = %url, "dialing relay");
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(ClientError::Dial)?;
        let (sink, stream) = stream.split();
        let sink: SharedSink = Arc::new(AsyncMutex::new(sink));

        let mut slot = self.inner.link.lock();
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.events),
            generation,
            stream,
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&sink),
            self.inner.options.ping_interval,
        ));
        *slot = Some(Link {
            generation,
            sink,
            reader,
            heartbeat,
        });
        debug!(client_id = %id, generation, "relay socket connected");
        Ok(())
    }

    /// Writes one text frame. Succeeds without writing when not connected.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let Some(sink) = self.sink() else {
            debug!("send skipped; relay socket not connected");
            return Ok(());
        };
        write_text(&sink, text.into()).await
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), ClientError> {
        let text = message.to_json()?;
        self.send(text).await
    }

    /// Sends a normal closure and tears the socket down. Calling it without
    /// a live socket does nothing.
    ///
    /// The read loop is given a moment to see the relay's answer, which is
    /// what emits the `disconnected` event.
    pub async fn close(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let Some(link) = self.inner.link.lock().take() else {
            return;
        };
        let Link {
            sink,
            mut reader,
            heartbeat,
            ..
        } = link;
        heartbeat.abort();

        {
            let mut sink = sink.lock().await;
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            if let Err(err) = sink.send(WsMessage::Close(Some(frame))).await {
                debug!(error = %err, "failed to send close frame");
            }
            if let Err(err) = sink.close().await {
                if !is_closed_error(&err) {
                    warn!(error = %err, "relay socket close error");
                }
            }
        }

        if tokio::time::timeout(CLOSE_DRAIN, &mut reader).await.is_err() {
            debug!("relay did not finish the closing handshake in time");
            reader.abort();
        }
        debug!("relay socket closed");
    }

    fn sink(&self) -> Option<SharedSink> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| Arc::clone(&link.sink))
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("options", &self.inner.options)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn write_text(sink: &SharedSink, text: String) -> Result<(), ClientError> {
    sink.lock()
        .await
        .send(WsMessage::Text(text))
        .await
        .map_err(ClientError::Send)
}

/// Sleeps, sends one heartbeat, and arms itself again. A slow send pushes
/// the next heartbeat back by the same amount.
async fn heartbeat_loop(sink: SharedSink, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let text = match Message::heartbeat().to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode heartbeat");
                continue;
            }
        };
        if let Err(err) = write_text(&sink, text).await {
            warn!(error = %err, "failed to send heartbeat");
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    events: Arc<SocketEvents>,
    generation: u64,
    mut stream: SplitStream<WsStream>,
) {
    let mut consecutive_errors = 0u32;
    let reason = loop {
        let Some(frame) = stream.next().await else {
            break DisconnectReason::Ended;
        };
        match frame {
            Ok(WsMessage::Text(text)) => {
                consecutive_errors = 0;
                dispatch_text(&events, text);
            }
            Ok(WsMessage::Close(frame)) => {
                debug!(?frame, "relay closed the socket");
                break DisconnectReason::Closed(frame.map(|frame| u16::from(frame.code)));
            }
            Ok(WsMessage::Binary(data)) => {
                consecutive_errors = 0;
                warn!(len = data.len(), "ignoring non-text frame from relay");
            }
            Ok(_) => {
                consecutive_errors = 0;
            }
            Err(err) if is_closed_error(&err) || matches!(err, WsError::Io(_)) => {
                debug!(error = %err, "relay socket reset");
                break DisconnectReason::Reset;
            }
            Err(err) => {
                consecutive_errors += 1;
                warn!(error = %err, consecutive_errors, "relay socket read error");
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    break DisconnectReason::Failed(err.to_string());
                }
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.release(generation);
    }
    events.disconnected.emit(&reason);
}

fn dispatch_text(events: &SocketEvents, text: String) {
    match Message::from_json(&text) {
        Ok(message) => {
            debug!(kind = %message.kind, "relay frame");
            events.message.emit(&message);
        }
        Err(err) => {
            warn!(error = %err, len = text.len(), "failed to decode relay frame");
            events.error.emit(&DecodeFailure {
                raw: text,
                reason: err.to_string(),
            });
        }
    }
}

fn is_closed_error(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}
