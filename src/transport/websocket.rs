//! WebSocket transport built on `tokio-tungstenite`
//!
//! Each session runs in its own task that owns the socket. The handle talks
//! to it over an unbounded command channel, so `send` and `close` never
//! block the state machine.
//!
//! ```rust,no_run
//! use riskstream::transport::websocket::WebSocketTransport;
//! use riskstream::transport::{SessionEvent, Transport};
//! use tokio::sync::mpsc;
//!
//! # tokio_test::block_on(async {
//! let (events, mut session_events) = mpsc::unbounded_channel();
//! let transport = WebSocketTransport::new(events);
//!
//! let _session = transport.open("ws://localhost:8000/ws/risk-stream", 1);
//! while let Some((generation, event)) = session_events.recv().await {
//!     println!("session {generation}: {event:?}");
//!     if matches!(event, SessionEvent::Closed(_)) {
//!         break;
//!     }
//! }
//! # });
//! ```

use super::{
    CloseInfo, Frame, SessionEvent, SessionEventSender, Transport, TransportError,
    TransportSession, CLOSE_NORMAL,
};
use crate::error::sanitize_error_message;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, Instrument};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer closed without a status code
const CLOSE_NO_STATUS: u16 = 1005;

/// Options for WebSocket sessions
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// How long a locally initiated close waits for the peer's close frame
    pub close_grace: Duration,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            close_grace: Duration::from_secs(1),
        }
    }
}

/// Opens WebSocket sessions and reports their events on a shared channel
pub struct WebSocketTransport {
    events: SessionEventSender,
    options: WebSocketOptions,
}

impl WebSocketTransport {
    pub fn new(events: SessionEventSender) -> Self {
        Self::with_options(events, WebSocketOptions::default())
    }

    pub fn with_options(events: SessionEventSender, options: WebSocketOptions) -> Self {
        Self { events, options }
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, endpoint: &str, generation: u64) -> Box<dyn TransportSession> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let span = crate::connection_span!(
            generation = generation,
            endpoint = %sanitize_error_message(endpoint)
        );
        let task = tokio::spawn(
            run_session(
                endpoint.to_string(),
                generation,
                self.events.clone(),
                command_rx,
                self.options.close_grace,
            )
            .instrument(span),
        );

        Box::new(WebSocketSession {
            generation,
            commands: command_tx,
            task: Some(task),
        })
    }
}

/// Commands from the handle to the session task
enum SessionCommand {
    Send(Frame),
    Close(CloseInfo),
}

/// Handle to a running WebSocket session task
pub struct WebSocketSession {
    generation: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession for WebSocketSession {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.commands
            .send(SessionCommand::Send(frame))
            .map_err(|_| TransportError::SessionClosed {
                generation: self.generation,
            })
    }

    fn close(&mut self, code: u16, reason: &str) {
        // A finished task has already reported Closed
        let _ = self
            .commands
            .send(SessionCommand::Close(CloseInfo::new(code, reason)));
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Drive one connection attempt from open to close
///
/// Reports `Closed` exactly once on every exit path.
async fn run_session(
    endpoint: String,
    generation: u64,
    events: SessionEventSender,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    close_grace: Duration,
) {
    let close_info = match open_stream(&endpoint, &mut commands).await {
        Ok(stream) => {
            debug!("WebSocket session opened");
            let _ = events.send((generation, SessionEvent::Opened));
            pump(stream, generation, &events, &mut commands, close_grace).await
        }
        Err(close_info) => close_info,
    };

    debug!(
        code = close_info.code,
        reason = %close_info.reason,
        "WebSocket session closed"
    );
    let _ = events.send((generation, SessionEvent::Closed(close_info)));
}

/// Complete the handshake unless the handle closes the session first
async fn open_stream(
    endpoint: &str,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<WsStream, CloseInfo> {
    let connect = connect_async(endpoint);
    tokio::pin!(connect);

    loop {
        tokio::select! {
            // A close requested by the handle wins over a concurrent outcome
            biased;

            command = commands.recv() => match command {
                Some(SessionCommand::Close(info)) => return Err(info),
                Some(SessionCommand::Send(_)) => {
                    debug!("Dropping frame sent before the session opened");
                }
                None => return Err(CloseInfo::new(CLOSE_NORMAL, "session handle dropped")),
            },
            result = &mut connect => {
                return result.map(|(stream, _response)| stream).map_err(|e| {
                    CloseInfo::abnormal(sanitize_error_message(&format!("open failed: {e}")))
                });
            }
        }
    }
}

/// Shuttle frames between the socket and the event channel until the session ends
async fn pump(
    mut stream: WsStream,
    generation: u64,
    events: &SessionEventSender,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    close_grace: Duration,
) -> CloseInfo {
    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(frame))) => {
                    // Let tungstenite flush its close reply
                    let _ = tokio::time::timeout(close_grace, stream.flush()).await;
                    return frame
                        .map(|f| CloseInfo::new(u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| {
                            CloseInfo::new(CLOSE_NO_STATUS, "closed without status")
                        });
                }
                Some(Ok(message)) => {
                    if let Some(frame) = frame_from_message(message) {
                        let _ = events.send((generation, SessionEvent::Message(frame)));
                    }
                }
                Some(Err(e)) => {
                    return CloseInfo::abnormal(sanitize_error_message(&e.to_string()));
                }
                None => return CloseInfo::abnormal("stream ended"),
            },
            command = commands.recv() => match command {
                Some(SessionCommand::Send(frame)) => {
                    if let Err(e) = stream.send(message_from_frame(frame)).await {
                        return CloseInfo::abnormal(sanitize_error_message(&format!(
                            "send failed: {e}"
                        )));
                    }
                }
                Some(SessionCommand::Close(info)) => {
                    close_gracefully(&mut stream, &info, close_grace).await;
                    return info;
                }
                None => {
                    let info = CloseInfo::new(CLOSE_NORMAL, "session handle dropped");
                    close_gracefully(&mut stream, &info, close_grace).await;
                    return info;
                }
            }
        }
    }
}

/// Send a close frame and wait briefly for the peer to finish the handshake
async fn close_gracefully(stream: &mut WsStream, info: &CloseInfo, close_grace: Duration) {
    let frame = CloseFrame {
        code: CloseCode::from(info.code),
        reason: info.reason.clone().into(),
    };

    let handshake = async {
        if stream.close(Some(frame)).await.is_ok() {
            while let Some(Ok(_)) = stream.next().await {}
        }
    };

    if tokio::time::timeout(close_grace, handshake).await.is_err() {
        debug!("Peer did not complete the close handshake in {:?}", close_grace);
    }
}

fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(Frame::Binary(bytes)),
        Message::Ping(bytes) => Some(Frame::Ping(bytes)),
        Message::Pong(bytes) => Some(Frame::Pong(bytes)),
        Message::Close(_) | Message::Frame(_) => None,
    }
}

fn message_from_frame(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes),
        Frame::Ping(bytes) => Message::Ping(bytes),
        Frame::Pong(bytes) => Message::Pong(bytes),
    }
}
