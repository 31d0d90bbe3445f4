//! Session protocol client.
//!
//! Sits between the socket adapter and the connection manager: encodes the
//! outbound handshake/subscribe/send/disconnect frames, decodes inbound
//! traffic into [`ClientEvent`]s, and runs the outgoing heartbeat. It does
//! not decide state transitions; the manager owns those.

use crate::protocol::{Command, Frame};
use crate::transport::{SocketConn, SocketEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Protocol-level happenings on one connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The underlying socket finished opening.
    SocketOpened,
    /// The peer acknowledged the connect handshake.
    HandshakeAck,
    /// The peer sent an ERROR frame.
    ErrorFrame(String),
    /// A MESSAGE frame addressed to a subscription.
    Delivery {
        destination: String,
        subscription: Option<String>,
        body: String,
    },
    /// Inbound traffic with nothing to route: heartbeats, receipts,
    /// unparseable frames. Still counts as liveness evidence.
    Activity,
    /// The socket reported an error; a close follows.
    SocketError(String),
    /// The socket closed.
    SocketClosed(Option<u16>),
}

/// Handle on one wired socket. Dropping it aborts the decode and heartbeat
/// tasks; frames queued beforehand still flush.
pub struct SessionClient {
    outgoing: mpsc::Sender<String>,
    decode_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl SessionClient {
    /// Wires a freshly opened socket: spawns the decode task feeding
    /// `events_out` and the outgoing heartbeat task.
    pub fn spawn(
        conn: SocketConn,
        events_out: mpsc::Sender<ClientEvent>,
        heartbeat: Duration,
    ) -> Self {
        let SocketConn {
            outgoing,
            mut events,
        } = conn;

        let decode_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let translated = match event {
                    SocketEvent::Opened => ClientEvent::SocketOpened,
                    SocketEvent::Message(text) => classify(text),
                    SocketEvent::Error(msg) => ClientEvent::SocketError(msg),
                    SocketEvent::Closed(code) => ClientEvent::SocketClosed(code),
                };
                let closed = matches!(translated, ClientEvent::SocketClosed(_));
                if events_out.send(translated).await.is_err() || closed {
                    return;
                }
            }
        });

        let heartbeat_outgoing = outgoing.clone();
        let heartbeat_task = tokio::spawn(async move {
            if heartbeat.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval(heartbeat);
            // The first tick completes immediately; the handshake already
            // proved the socket alive, so skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_outgoing
                    .send(Frame::heartbeat().encode())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        Self {
            outgoing,
            decode_task,
            heartbeat_task,
        }
    }

    /// Builds the connect handshake frame, attaching whatever credentials
    /// exist.
    pub fn connect_frame(
        heartbeat_ms: u64,
        token: Option<String>,
        username: Option<String>,
    ) -> Frame {
        let mut frame = Frame::connect(heartbeat_ms);
        if let Some(token) = token {
            frame = frame.with_header("Authorization", format!("Bearer {token}"));
        }
        if let Some(username) = username {
            frame = frame.with_header("username", username);
        }
        frame
    }

    /// Queues the connect handshake.
    pub async fn send_connect(
        &self,
        heartbeat_ms: u64,
        token: Option<String>,
        username: Option<String>,
    ) -> bool {
        let frame = Self::connect_frame(heartbeat_ms, token, username);
        self.send_frame(&frame).await
    }

    /// Queues a frame, waiting for channel capacity. False once the socket
    /// is gone.
    pub async fn send_frame(&self, frame: &Frame) -> bool {
        self.outgoing.send(frame.encode()).await.is_ok()
    }

    /// Queues a frame without waiting. Used on best-effort paths.
    pub fn try_send_frame(&self, frame: &Frame) -> bool {
        self.outgoing.try_send(frame.encode()).is_ok()
    }

    /// Clone of the outgoing sender, for queueing wire text after the
    /// client handle itself is locked away.
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.outgoing.clone()
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.decode_task.abort();
        self.heartbeat_task.abort();
    }
}

/// Maps one inbound text message onto a client event.
fn classify(text: String) -> ClientEvent {
    let frame = match Frame::parse(&text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Unparseable inbound frame: {e}");
            return ClientEvent::Activity;
        }
    };
    match frame.command {
        Command::Connected => {
            log::debug!(
                "Handshake acknowledged (version {})",
                frame.header("version").unwrap_or("?")
            );
            ClientEvent::HandshakeAck
        }
        Command::Error => {
            let message = frame
                .header("message")
                .map(str::to_string)
                .unwrap_or_else(|| frame.body.clone());
            ClientEvent::ErrorFrame(message)
        }
        Command::Message => {
            let destination = frame.destination().map(str::to_string);
            let subscription = frame.subscription().map(str::to_string);
            match destination {
                Some(destination) => ClientEvent::Delivery {
                    destination,
                    subscription,
                    body: frame.body,
                },
                None => {
                    log::warn!("MESSAGE frame without destination, dropping");
                    ClientEvent::Activity
                }
            }
        }
        Command::Heartbeat => ClientEvent::Activity,
        Command::Receipt => {
            log::trace!("Receipt {}", frame.header("receipt-id").unwrap_or("?"));
            ClientEvent::Activity
        }
        other => {
            log::debug!("Ignoring unexpected {} frame", other.as_str());
            ClientEvent::Activity
        }
    }
}
