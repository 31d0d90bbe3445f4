//! Socket adapter.
//!
//! The one place that touches the network. Everything above it sees a
//! [`SocketConn`]: a sender for outgoing text messages and a stream of
//! [`SocketEvent`]s. Payloads are opaque text here; framing lives in
//! [`crate::protocol`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// What a socket reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// The opening handshake completed. Always the first event.
    Opened,
    /// One inbound text message.
    Message(String),
    /// The socket closed, with the peer's close code when it sent one.
    Closed(Option<u16>),
    /// The socket failed; a `Closed` event follows.
    Error(String),
}

/// A live socket connection.
///
/// Dropping `outgoing` closes the write side; the read side ends with a
/// final [`SocketEvent::Closed`].
#[derive(Debug)]
pub struct SocketConn {
    pub outgoing: mpsc::Sender<String>,
    pub events: mpsc::Receiver<SocketEvent>,
}

/// Failures opening a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The dial or opening handshake failed.
    Connect(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "socket connect failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Seam between the connection machinery and the network.
///
/// Production wiring uses [`WsTransport`]; unit tests inject channel-backed
/// sockets with scripted events.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<SocketConn, TransportError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<SocketConn, TransportError> {
        log::debug!("Opening socket to {url}");
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (event_tx, event_rx) = mpsc::channel::<SocketEvent>(256);

        // The opening handshake just completed, so Opened goes out before
        // the reader task can race a message past it.
        let _ = event_tx.send(SocketEvent::Opened).await;

        // Writer task: drain outgoing messages into the sink.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    log::debug!("Socket write failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // Reader task: map inbound traffic onto socket events.
        tokio::spawn(async move {
            while let Some(incoming) = ws_receiver.next().await {
                match incoming {
                    Ok(Message::Text(text)) => {
                        if event_tx
                            .send(SocketEvent::Message(text.as_str().to_string()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        // The endpoint speaks text; tolerate UTF-8 binary.
                        match String::from_utf8(data.into()) {
                            Ok(text) => {
                                if event_tx.send(SocketEvent::Message(text)).await.is_err() {
                                    return;
                                }
                            }
                            Err(_) => log::warn!("Discarding non-UTF-8 binary message"),
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        log::debug!("Socket closed by peer (code {code:?})");
                        let _ = event_tx.send(SocketEvent::Closed(code)).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Socket read failed: {e}");
                        let _ = event_tx.send(SocketEvent::Error(e.to_string())).await;
                        let _ = event_tx.send(SocketEvent::Closed(None)).await;
                        return;
                    }
                }
            }
            // Stream ended without a close frame.
            let _ = event_tx.send(SocketEvent::Closed(None)).await;
        });

        Ok(SocketConn {
            outgoing: out_tx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Channel-backed sockets for exercising the layers above without a
    //! network.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Harness side of a scripted socket: push events the code under test
    /// will observe, read back what it wrote.
    pub struct SocketControl {
        pub event_tx: mpsc::Sender<SocketEvent>,
        pub written_rx: mpsc::Receiver<String>,
    }

    impl SocketControl {
        /// Report the opening handshake as complete.
        pub async fn open(&self) {
            let _ = self.event_tx.send(SocketEvent::Opened).await;
        }

        /// Deliver one inbound text message.
        pub async fn deliver(&self, text: impl Into<String>) {
            let _ = self.event_tx.send(SocketEvent::Message(text.into())).await;
        }

        /// Close the socket from the peer side.
        pub async fn close(&self, code: Option<u16>) {
            let _ = self.event_tx.send(SocketEvent::Closed(code)).await;
        }

        /// Next frame the code under test wrote, if any arrives in time.
        pub async fn next_written(&mut self) -> Option<String> {
            tokio::time::timeout(std::time::Duration::from_secs(1), self.written_rx.recv())
                .await
                .ok()
                .flatten()
        }
    }

    /// Builds one scripted socket pair.
    pub fn scripted_socket() -> (SocketConn, SocketControl) {
        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        let (event_tx, event_rx) = mpsc::channel::<SocketEvent>(256);
        (
            SocketConn {
                outgoing: out_tx,
                events: event_rx,
            },
            SocketControl {
                event_tx,
                written_rx: out_rx,
            },
        )
    }

    /// Transport handing out pre-scripted sockets in order. Once the
    /// script runs dry every further open fails, which doubles as a way
    /// to test unreachable-endpoint behavior.
    pub struct ChannelTransport {
        scripts: Mutex<VecDeque<Result<SocketConn, TransportError>>>,
        opens: AtomicU32,
    }

    impl ChannelTransport {
        pub fn new() -> Self {
            Self {
                scripts: Mutex::new(VecDeque::new()),
                opens: AtomicU32::new(0),
            }
        }

        /// Queue a socket for the next open call; returns the harness side.
        pub fn push_socket(&self) -> SocketControl {
            let (conn, control) = scripted_socket();
            self.scripts
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push_back(Ok(conn));
            control
        }

        /// Queue a dial failure for the next open call.
        pub fn push_failure(&self, msg: &str) {
            self.scripts
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push_back(Err(TransportError::Connect(msg.to_string())));
        }

        /// How many times open was called.
        pub fn open_count(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn open(&self, _url: &str) -> Result<SocketConn, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.scripts
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .pop_front()
                .unwrap_or_else(|| {
                    Err(TransportError::Connect("no scripted socket left".to_string()))
                })
        }
    }
}
