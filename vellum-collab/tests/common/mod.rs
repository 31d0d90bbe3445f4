//! In-process collaboration relay for integration tests.
//!
//! Speaks just enough of the text protocol to exercise the client stack:
//! CONNECT is acked (or rejected, when so configured), SUBSCRIBE and
//! UNSUBSCRIBE are tracked per client, and SEND to an application
//! destination is rebroadcast as MESSAGE frames on the matching topic.
//! The sender's own subscriptions receive the broadcast too, mirroring
//! how the real relay echoes publishers.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use vellum_collab::protocol::{Command, Frame};

struct RelayShared {
    publish_tx: broadcast::Sender<(String, String)>,
    connect_headers: Mutex<Vec<Vec<(String, String)>>>,
    routed: Mutex<HashMap<String, u64>>,
    message_seq: AtomicU64,
    reject_connect: bool,
}

pub struct Relay {
    addr: SocketAddr,
    shared: Arc<RelayShared>,
    kick_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl Relay {
    pub async fn start() -> Relay {
        Self::start_inner(false).await
    }

    /// Relay that answers every CONNECT with an ERROR frame while leaving
    /// the socket open.
    pub async fn start_rejecting() -> Relay {
        Self::start_inner(true).await
    }

    async fn start_inner(reject_connect: bool) -> Relay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (publish_tx, _) = broadcast::channel(256);
        let (kick_tx, _) = broadcast::channel(8);
        let shared = Arc::new(RelayShared {
            publish_tx,
            connect_headers: Mutex::new(Vec::new()),
            routed: Mutex::new(HashMap::new()),
            message_seq: AtomicU64::new(0),
            reject_connect,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_kick = kick_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_client(
                            stream,
                            Arc::clone(&accept_shared),
                            accept_kick.subscribe(),
                        ));
                    }
                    Err(_) => return,
                }
            }
        });

        Relay {
            addr,
            shared,
            kick_tx,
            accept_task,
        }
    }

    /// Base URL for [`vellum_collab::CollabConfig`]; the socket path gets
    /// appended by the config.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Closes every currently connected client, as a crashed relay would.
    pub fn drop_clients(&self) {
        let _ = self.kick_tx.send(());
    }

    /// Stops accepting and closes everything.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let _ = self.kick_tx.send(());
    }

    /// How many CONNECT frames arrived over the relay's lifetime.
    pub async fn connect_count(&self) -> usize {
        self.shared.connect_headers.lock().await.len()
    }

    pub async fn last_connect_headers(&self) -> Option<Vec<(String, String)>> {
        self.shared.connect_headers.lock().await.last().cloned()
    }

    /// How many publishes were routed onto a topic.
    pub async fn routed_count(&self, topic: &str) -> u64 {
        *self.shared.routed.lock().await.get(topic).unwrap_or(&0)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Maps an application destination to its broadcast topic. Publishes
/// aimed straight at a topic pass through unchanged.
fn route(destination: &str) -> Option<String> {
    if let Some(rest) = destination.strip_prefix("/app/docs/") {
        if let Some(id) = rest.strip_suffix("/update") {
            return Some(format!("/topic/docs/{id}"));
        }
        if let Some(id) = rest.strip_suffix("/typing") {
            return Some(format!("/topic/docs/{id}/typing"));
        }
        return None;
    }
    if destination.starts_with("/topic/") {
        return Some(destination.to_string());
    }
    None
}

async fn serve_client(
    stream: TcpStream,
    shared: Arc<RelayShared>,
    mut kick: broadcast::Receiver<()>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut sink, mut stream) = ws.split();
    let mut publish_rx = shared.publish_tx.subscribe();
    let mut subscriptions: HashMap<String, String> = HashMap::new();

    loop {
        tokio::select! {
            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    _ => return,
                };
                let text = match message {
                    Message::Text(text) => text.as_str().to_string(),
                    Message::Close(_) => return,
                    _ => continue,
                };
                let frame = match Frame::parse(&text) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                match frame.command {
                    Command::Connect => {
                        shared.connect_headers.lock().await.push(frame.headers.clone());
                        let reply = if shared.reject_connect {
                            Frame::error("connect rejected")
                        } else {
                            Frame::connected()
                        };
                        if sink.send(Message::Text(reply.encode().into())).await.is_err() {
                            return;
                        }
                    }
                    Command::Subscribe => {
                        if let (Some(id), Some(destination)) =
                            (frame.header("id"), frame.destination())
                        {
                            subscriptions.insert(id.to_string(), destination.to_string());
                        }
                    }
                    Command::Unsubscribe => {
                        if let Some(id) = frame.header("id") {
                            subscriptions.remove(id);
                        }
                    }
                    Command::Send => {
                        if let Some(topic) = frame.destination().and_then(route) {
                            *shared.routed.lock().await.entry(topic.clone()).or_insert(0) += 1;
                            let _ = shared.publish_tx.send((topic, frame.body.clone()));
                        }
                    }
                    Command::Disconnect => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                    Command::Heartbeat => {
                        if sink
                            .send(Message::Text(Frame::heartbeat().encode().into()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    _ => {}
                }
            }
            published = publish_rx.recv() => {
                let (topic, body) = match published {
                    Ok(published) => published,
                    Err(_) => continue,
                };
                for (id, destination) in &subscriptions {
                    if *destination == topic {
                        let seq = shared.message_seq.fetch_add(1, Ordering::SeqCst);
                        let frame =
                            Frame::message(&topic, id, &format!("msg-{seq}"), body.clone());
                        if sink.send(Message::Text(frame.encode().into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            _ = kick.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}
