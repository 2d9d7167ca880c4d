//! Transport seam and the default websocket transport.
//!
//! A connection drives exactly one [`Transport`] at a time. Transports report
//! connect completion, disconnects and inbound frames through the
//! [`TransportEvents`] sink they were created with; each sink is bound to one
//! transport instance so late events from a replaced transport are ignored.

use std::fmt;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{
    InvalidHeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::rta::error::RtaError;
use crate::rta::identity::UserIdentity;

/// Errors produced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Authorization or subprotocol could not be encoded as a header value.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport closed: {0}")]
    Closed(String),
}

impl From<TransportError> for RtaError {
    fn from(err: TransportError) -> Self {
        RtaError::Transport(err.to_string())
    }
}

/// Why a transport stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseStatus {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    pub fn with_code(reason: impl Into<String>, code: u16) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {code})", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    ConnectComplete(Result<(), TransportError>),
    Disconnected(CloseStatus),
    MessageReceived(String),
}

/// Event sink handed to a transport at creation.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { epoch, tx }
    }

    /// Reports the outcome of the last [`Transport::connect`] call.
    pub fn connect_complete(&self, result: Result<(), TransportError>) {
        self.emit(TransportEvent::ConnectComplete(result));
    }

    /// Reports that an established transport went away.
    pub fn disconnected(&self, status: CloseStatus) {
        self.emit(TransportEvent::Disconnected(status));
    }

    /// Delivers one inbound text frame.
    pub fn message_received(&self, message: impl Into<String>) {
        self.emit(TransportEvent::MessageReceived(message.into()));
    }

    fn emit(&self, event: TransportEvent) {
        // The owning connection may already be gone.
        let _ = self.tx.send((self.epoch, event));
    }
}

/// Exclusive transport owned by one connection.
///
/// Methods must not block; outcomes are reported through [`TransportEvents`].
pub trait Transport: Send + Sync {
    /// Starts connecting to `uri`, negotiating `subprotocol`.
    fn connect(&self, uri: &str, subprotocol: &str);

    /// Queues one text frame for delivery.
    fn send(&self, message: String) -> Result<(), TransportError>;

    /// Closes the transport. No further events need to be reported.
    fn disconnect(&self);
}

/// Creates one transport per connect cycle.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(
        &self,
        user: Arc<dyn UserIdentity>,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Factory for [`WebSocketTransport`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(
        &self,
        user: Arc<dyn UserIdentity>,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(WebSocketTransport::new(user, events)))
    }
}

enum Outbound {
    Text(String),
    Close,
}

/// tokio-tungstenite transport. Each connect spawns a worker that owns the
/// socket; sends are queued to it.
pub struct WebSocketTransport {
    user: Arc<dyn UserIdentity>,
    events: TransportEvents,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl WebSocketTransport {
    pub fn new(user: Arc<dyn UserIdentity>, events: TransportEvents) -> Self {
        Self {
            user,
            events,
            outbound: Mutex::new(None),
        }
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, uri: &str, subprotocol: &str) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        // Replacing the sender lets a previous worker observe a closed queue.
        *self.outbound.lock() = Some(outbound_tx);

        let request = build_request(uri, subprotocol, self.user.as_ref());
        let events = self.events.clone();
        tokio::spawn(async move {
            match request {
                Ok(request) => websocket_worker(request, outbound_rx, events).await,
                Err(err) => events.connect_complete(Err(err)),
            }
        });
    }

    fn send(&self, message: String) -> Result<(), TransportError> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(Outbound::Text(message))
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    fn disconnect(&self) {
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Outbound::Close);
        }
    }
}

fn build_request(
    uri: &str,
    subprotocol: &str,
    user: &dyn UserIdentity,
) -> Result<Request, TransportError> {
    let mut request = uri.into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, subprotocol.parse()?);
    if let Some(authorization) = user.authorization() {
        request
            .headers_mut()
            .insert(AUTHORIZATION, authorization.expose_secret().parse()?);
    }
    Ok(request)
}

async fn websocket_worker(
    request: Request,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEvents,
) {
    let mut socket = match connect_async(request).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            events.connect_complete(Err(TransportError::WebSocket(err)));
            return;
        }
    };
    events.connect_complete(Ok(()));

    let status = run_socket(&mut socket, &mut outbound_rx, &events).await;
    debug!(event = "websocket_closed", reason = %status);
    events.disconnected(status);
}

async fn run_socket<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    events: &TransportEvents,
) -> CloseStatus
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(Outbound::Text(text)) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            return CloseStatus::new(format!("send failed: {err}"));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = socket.close(None).await;
                        return CloseStatus::with_code("closed by client", 1000);
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => events.message_received(text),
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return CloseStatus::new("failed to answer ping");
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Binary(payload))) => {
                        warn!(event = "websocket_binary_frame_ignored", len = payload.len());
                    }
                    Some(Ok(Message::Close(frame))) => return close_status(frame),
                    Some(Err(err)) => return CloseStatus::new(err.to_string()),
                    None => return CloseStatus::new("socket ended"),
                }
            }
        }
    }
}

fn close_status(frame: Option<CloseFrame<'_>>) -> CloseStatus {
    match frame {
        Some(frame) => CloseStatus::with_code(frame.reason.to_string(), u16::from(frame.code)),
        None => CloseStatus::new("closed by server"),
    }
}
