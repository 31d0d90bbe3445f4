//! # vellum-collab — Real-time collaboration client for Vellum
//!
//! Connects a document editor to a collaboration relay over WebSocket,
//! speaking a STOMP-style text protocol: one managed connection, topic
//! subscriptions with decoded payload callbacks, and per-document
//! sessions that debounce edits and track who is typing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  fetch   ┌──────────────────┐
//! │ DocumentSource  │ ◄──────── │ DocumentSession  │──▶ SessionEvent
//! │ (injected)      │           │ (per document)   │    stream
//! └─────────────────┘           └────────┬─────────┘
//!                                        │ subscribe / send
//!                                        ▼
//! ┌─────────────────┐  frames  ┌──────────────────┐
//! │ Subscription    │ ◄──────── │ ConnectionManager│──▶ status watch
//! │ Registry        │           │ (one per app)    │
//! └─────────────────┘           └────────┬─────────┘
//!                                        │ CONNECT / SEND / MESSAGE
//!                                        ▼
//!                               ┌──────────────────┐
//!                               │ Transport        │
//!                               │ (WebSocket)      │
//!                               └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Text wire protocol (frame encoding and parsing)
//! - [`transport`] — Socket adapter turning a WebSocket into events
//! - [`client`] — Per-socket protocol client (handshake, heartbeats)
//! - [`connection`] — Connection state machine with reconnect policy
//! - [`subscription`] — Destination registry and payload decoding
//! - [`presence`] — Typing statuses and the active-user roster
//! - [`session`] — Per-document editing session
//! - [`config`] — Endpoint, timing, and reconnect configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use config::{CollabConfig, ReconnectPolicy, SessionTuning, SOCKET_PATH};
pub use connection::{
    apply_liveness, ConnectError, ConnectionManager, ConnectionState, ConnectionStatus,
    LivenessSignal,
};
pub use presence::{PresenceRoster, TypingStatus};
pub use protocol::{Command, Frame, ProtocolError};
pub use session::{
    content_destination, content_topic, typing_destination, typing_topic, ContentUpdate,
    DocumentSession, SessionEvent,
};
pub use subscription::{Payload, SubscriptionHandle, SubscriptionRegistry};
pub use transport::{SocketConn, SocketEvent, Transport, TransportError, WsTransport};
pub use vellum_core::{CredentialSource, Document, DocumentError, DocumentSource, StaticCredentials};
