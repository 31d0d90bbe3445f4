//! Connection manager.
//!
//! Owns the connection state machine and the reconnect policy, and wires
//! together transport, protocol client, and subscription registry. One
//! owned instance serves the whole application; transport and credentials
//! are injected at construction.
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──liveness──▶ Connected
//!       ▲                          │                        │
//!       │  max attempts,           │ timeout,               │ socket
//!       │  explicit disconnect     │ handshake failure      │ closed
//!       │                          ▼                        ▼
//!       └───────────────────── Reconnecting ◀───────────────┘
//!                        (backoff, then connect again)
//! ```
//!
//! A reconnect cycle is only entered when an established connection drops;
//! failures of a fresh first attempt surface to the caller and stop there.

use crate::client::{ClientEvent, SessionClient};
use crate::config::CollabConfig;
use crate::protocol::Frame;
use crate::subscription::{Payload, SubscriptionHandle, SubscriptionRegistry};
use crate::transport::{Transport, TransportError, WsTransport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use vellum_core::CredentialSource;

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot of the state machine for callers and status watchers.
///
/// `is_reconnecting` holds for the whole reconnect cycle, including the
/// Connecting window of each retry, so it can overlap `is_connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub is_reconnecting: bool,
}

/// Evidence that the connection is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessSignal {
    /// The peer acknowledged the connect handshake.
    HandshakeAck,
    /// The adapter reported the socket open.
    SocketOpened,
    /// Any inbound frame arrived, heartbeats included.
    InboundFrame,
}

/// Transition rule for liveness evidence. Any single signal promotes an
/// in-progress connection to Connected; signals reaching a torn-down
/// machine change nothing.
pub fn apply_liveness(state: ConnectionState, signal: LivenessSignal) -> ConnectionState {
    match (state, signal) {
        (ConnectionState::Disconnected, _) => ConnectionState::Disconnected,
        (_, _) => ConnectionState::Connected,
    }
}

/// Failures surfaced by [`ConnectionManager::connect`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectError {
    /// Another connect attempt is already pending.
    AlreadyConnecting,
    /// No liveness signal arrived within the connect timeout.
    Timeout,
    /// The peer rejected the handshake before the socket ever opened.
    Handshake(String),
    /// The socket could not be opened.
    Transport(TransportError),
    /// The attempt was torn down by an explicit disconnect.
    Aborted,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::AlreadyConnecting => write!(f, "a connect attempt is already pending"),
            ConnectError::Timeout => write!(f, "connect attempt timed out"),
            ConnectError::Handshake(msg) => write!(f, "handshake rejected: {msg}"),
            ConnectError::Transport(e) => write!(f, "{e}"),
            ConnectError::Aborted => write!(f, "connect attempt aborted by disconnect"),
        }
    }
}

impl std::error::Error for ConnectError {}

struct Machine {
    state: ConnectionState,
    /// True for the whole reconnect cycle, across its Connecting windows.
    reconnecting: bool,
    /// The current attempt's socket reported open at least once.
    socket_opened: bool,
    attempts: u32,
    /// Bumped on every teardown; events from older wiring are ignored.
    epoch: u64,
    client: Option<SessionClient>,
    completion: Option<oneshot::Sender<Result<(), ConnectError>>>,
    connect_timer: Option<JoinHandle<()>>,
    backoff_timer: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnecting: false,
            socket_opened: false,
            attempts: 0,
            epoch: 0,
            client: None,
            completion: None,
            connect_timer: None,
            backoff_timer: None,
            pump: None,
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            is_connected: self.state == ConnectionState::Connected,
            is_connecting: self.state == ConnectionState::Connecting,
            is_reconnecting: self.reconnecting,
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        for task in [
            self.connect_timer.take(),
            self.backoff_timer.take(),
            self.pump.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct Inner {
    config: CollabConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    registry: SubscriptionRegistry,
    machine: Mutex<Machine>,
    status_tx: watch::Sender<ConnectionStatus>,
}

/// The connection manager. Cheap to share behind an [`Arc`]; all methods
/// take `&self`. Background tasks hold weak references only, so dropping
/// the manager tears down whatever is live.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: CollabConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                credentials,
                registry: SubscriptionRegistry::new(),
                machine: Mutex::new(Machine::new()),
                status_tx,
            }),
        }
    }

    /// Production wiring over the WebSocket transport.
    pub fn over_websocket(config: CollabConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::new(config, Arc::new(WsTransport), credentials)
    }

    /// Establishes the connection.
    ///
    /// Completes when any liveness signal arrives. Fails immediately with
    /// [`ConnectError::AlreadyConnecting`] while another attempt is
    /// pending, and succeeds immediately when already connected.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.inner.connect().await
    }

    /// Tears the connection down: every subscription is removed, a
    /// best-effort protocol disconnect goes out, and the socket closes.
    ///
    /// With `reset_flags` the state machine is zeroed as well; without it
    /// the reconnect context (cycle flag, attempt counter, scheduled
    /// backoff) survives the teardown.
    pub async fn disconnect(&self, reset_flags: bool) {
        self.inner.disconnect(reset_flags).await;
    }

    /// Publishes a JSON payload to a destination. False when the payload
    /// cannot be encoded or the connection is down; the latter also kicks
    /// off one best-effort reconnect.
    pub async fn send<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) -> bool {
        self.inner.send(destination, payload).await
    }

    /// Registers a handler for a destination and issues the wire
    /// subscription. The returned handle is valid immediately, before any
    /// wire ack. A failed wire subscribe is retried once after the
    /// configured delay and then abandoned.
    pub async fn subscribe<F>(&self, destination: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.inner.subscribe(destination, handler).await
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.inner.unsubscribe(handle).await;
    }

    /// Re-issues the wire subscription for one live registration. False
    /// when the registration is gone or the connection is down.
    ///
    /// Registrations survive a reconnect but their wire subscriptions die
    /// with the old socket; callers decide when to drive this, typically
    /// from a status watcher that just saw the connection come back. Each
    /// subscriber re-drives only the handles it owns, so subscribers
    /// sharing the manager never duplicate each other's frames.
    pub async fn resubscribe(&self, handle: &SubscriptionHandle) -> bool {
        if !self.inner.registry.contains(&handle.id).await {
            return false;
        }
        self.inner.wire_subscribe(handle).await
    }

    /// Bulk form of [`ConnectionManager::resubscribe`] covering every live
    /// registration, for an application that owns all of them.
    pub async fn resubscribe_all(&self) -> usize {
        let handles = self.inner.registry.snapshot().await;
        let mut wired = 0;
        for handle in &handles {
            if self.inner.wire_subscribe(handle).await {
                wired += 1;
            }
        }
        if wired > 0 {
            log::info!("Re-subscribed {wired} destinations");
        }
        wired
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch channel carrying every status transition.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.machine.lock().await.state
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.registry.len().await
    }
}

impl Inner {
    fn publish_status(&self, machine: &Machine) {
        self.status_tx.send_replace(machine.status());
    }

    /// Cancels the current attempt's wiring. With `reset` the whole state
    /// machine is zeroed, backoff timer included. A pending connect call
    /// observes [`ConnectError::Aborted`] either way.
    fn teardown_wiring(machine: &mut Machine, reset: bool) {
        if let Some(timer) = machine.connect_timer.take() {
            timer.abort();
        }
        if let Some(pump) = machine.pump.take() {
            pump.abort();
        }
        machine.client = None;
        machine.epoch += 1;
        if let Some(tx) = machine.completion.take() {
            let _ = tx.send(Err(ConnectError::Aborted));
        }
        if reset {
            if let Some(timer) = machine.backoff_timer.take() {
                timer.abort();
            }
            machine.state = ConnectionState::Disconnected;
            machine.reconnecting = false;
            machine.socket_opened = false;
            machine.attempts = 0;
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        let (epoch, receiver) = {
            let mut machine = self.machine.lock().await;
            match machine.state {
                ConnectionState::Connecting => {
                    log::warn!("Connect requested while an attempt is pending");
                    return Err(ConnectError::AlreadyConnecting);
                }
                ConnectionState::Connected => {
                    log::debug!("Connect requested while already connected");
                    return Ok(());
                }
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }
            // Stale wiring from a previous connection must not leak into
            // this attempt.
            Self::teardown_wiring(&mut machine, false);
            machine.state = ConnectionState::Connecting;
            machine.socket_opened = false;
            let (tx, rx) = oneshot::channel();
            machine.completion = Some(tx);
            self.publish_status(&machine);
            log::info!("Connecting to {}", self.config.socket_url());
            (machine.epoch, rx)
        };

        // One timeout budget spans the whole attempt; the dial and the wait
        // for a liveness signal draw from the same window.
        let started = tokio::time::Instant::now();
        let dialed = tokio::time::timeout(
            self.config.connect_timeout(),
            self.transport.open(&self.config.socket_url()),
        )
        .await;

        match dialed {
            Err(_) => {
                let mut machine = self.machine.lock().await;
                if machine.epoch == epoch {
                    log::error!("Socket open timed out");
                    machine.state = ConnectionState::Disconnected;
                    if let Some(tx) = machine.completion.take() {
                        let _ = tx.send(Err(ConnectError::Timeout));
                    }
                    if machine.reconnecting {
                        self.schedule_reconnect(&mut machine);
                    }
                    self.publish_status(&machine);
                }
            }
            Ok(Ok(conn)) => {
                let mut machine = self.machine.lock().await;
                if machine.epoch != epoch {
                    log::debug!("Discarding socket opened for a torn-down attempt");
                } else {
                    let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(256);
                    let client =
                        SessionClient::spawn(conn, event_tx, self.config.heartbeat_interval());
                    let frame = SessionClient::connect_frame(
                        self.config.heartbeat_ms,
                        self.credentials.token(),
                        self.credentials.username(),
                    );
                    if !client.try_send_frame(&frame) {
                        log::warn!("Could not queue the connect handshake");
                    }
                    machine.client = Some(client);
                    machine.pump = Some(self.spawn_pump(event_rx, epoch));
                    let remaining = self.config.connect_timeout().saturating_sub(started.elapsed());
                    machine.connect_timer = Some(self.spawn_connect_timer(epoch, remaining));
                }
            }
            Ok(Err(e)) => {
                let mut machine = self.machine.lock().await;
                if machine.epoch == epoch {
                    log::warn!("Socket open failed: {e}");
                    machine.state = ConnectionState::Disconnected;
                    if let Some(tx) = machine.completion.take() {
                        let _ = tx.send(Err(ConnectError::Transport(e)));
                    }
                    if machine.reconnecting {
                        self.schedule_reconnect(&mut machine);
                    }
                    self.publish_status(&machine);
                }
            }
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Aborted),
        }
    }

    fn spawn_pump(self: &Arc<Self>, mut events: mpsc::Receiver<ClientEvent>, epoch: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                inner.handle_event(event, epoch).await;
            }
        })
    }

    async fn handle_event(self: &Arc<Self>, event: ClientEvent, epoch: u64) {
        // Deliveries leave the lock before running handlers.
        let delivery = {
            let mut machine = self.machine.lock().await;
            if machine.epoch != epoch {
                return;
            }
            match event {
                ClientEvent::SocketOpened => {
                    machine.socket_opened = true;
                    self.note_liveness(&mut machine, LivenessSignal::SocketOpened);
                    None
                }
                ClientEvent::HandshakeAck => {
                    self.note_liveness(&mut machine, LivenessSignal::HandshakeAck);
                    None
                }
                ClientEvent::Activity => {
                    self.note_liveness(&mut machine, LivenessSignal::InboundFrame);
                    None
                }
                ClientEvent::Delivery {
                    destination,
                    subscription,
                    body,
                } => {
                    self.note_liveness(&mut machine, LivenessSignal::InboundFrame);
                    Some((destination, subscription, body))
                }
                ClientEvent::ErrorFrame(message) => {
                    self.on_error_frame(&mut machine, message);
                    None
                }
                ClientEvent::SocketError(message) => {
                    log::warn!("Socket error: {message}");
                    None
                }
                ClientEvent::SocketClosed(code) => {
                    self.on_socket_closed(&mut machine, code);
                    None
                }
            }
        };

        if let Some((destination, subscription, body)) = delivery {
            let delivered = self
                .registry
                .dispatch(&destination, subscription.as_deref(), &body)
                .await;
            if delivered == 0 {
                log::debug!("Message to {destination} had no subscriber");
            }
        }
    }

    /// Applies one liveness signal; on promotion, settles the pending
    /// attempt and clears the reconnect cycle.
    fn note_liveness(&self, machine: &mut Machine, signal: LivenessSignal) {
        let next = apply_liveness(machine.state, signal);
        if next == ConnectionState::Connected && machine.state != ConnectionState::Connected {
            machine.state = ConnectionState::Connected;
            machine.attempts = 0;
            machine.reconnecting = false;
            if let Some(timer) = machine.backoff_timer.take() {
                timer.abort();
            }
            if let Some(timer) = machine.connect_timer.take() {
                timer.abort();
            }
            if let Some(tx) = machine.completion.take() {
                let _ = tx.send(Ok(()));
            }
            self.publish_status(machine);
            log::info!("Connection established ({signal:?})");
        }
    }

    fn on_error_frame(self: &Arc<Self>, machine: &mut Machine, message: String) {
        if machine.completion.is_none() {
            // Established connection: protocol errors are logged and
            // liveness holds.
            log::error!("Protocol error frame: {message}");
            return;
        }
        if machine.socket_opened {
            log::warn!("Handshake error with the socket open, keeping the connection: {message}");
            self.note_liveness(machine, LivenessSignal::SocketOpened);
        } else {
            log::error!("Handshake failed: {message}");
            machine.state = ConnectionState::Disconnected;
            machine.client = None;
            if let Some(timer) = machine.connect_timer.take() {
                timer.abort();
            }
            if let Some(tx) = machine.completion.take() {
                let _ = tx.send(Err(ConnectError::Handshake(message)));
            }
            if machine.reconnecting {
                self.schedule_reconnect(machine);
            }
            self.publish_status(machine);
        }
    }

    fn on_socket_closed(self: &Arc<Self>, machine: &mut Machine, code: Option<u16>) {
        log::info!("Socket closed (code {code:?})");
        let had_liveness = machine.state == ConnectionState::Connected || machine.socket_opened;
        machine.client = None;
        machine.socket_opened = false;

        if machine.completion.is_some() {
            // Mid-attempt close without any liveness evidence. The attempt
            // stays pending; the connect timer decides its fate.
            log::debug!("Socket closed before any liveness signal");
            return;
        }

        if had_liveness {
            machine.reconnecting = true;
            self.schedule_reconnect(machine);
        } else {
            machine.state = ConnectionState::Disconnected;
        }
        self.publish_status(machine);
    }

    /// Schedules the next reconnect attempt, or gives up once the policy
    /// is exhausted. At most one backoff timer is ever live.
    fn schedule_reconnect(self: &Arc<Self>, machine: &mut Machine) {
        if machine.backoff_timer.is_some() {
            // A failed attempt inside the armed window lands here with the
            // state left Disconnected; the cycle is still live.
            machine.state = ConnectionState::Reconnecting;
            log::debug!("Reconnect already scheduled");
            return;
        }
        let policy = &self.config.reconnect;
        if !policy.can_retry(machine.attempts) {
            log::error!(
                "Giving up after {} reconnect attempts; connect() must be called explicitly",
                machine.attempts
            );
            machine.reconnecting = false;
            machine.state = ConnectionState::Disconnected;
            return;
        }
        let delay = policy.delay_for(machine.attempts);
        log::info!(
            "Reconnecting in {:?} (attempt {} of {})",
            delay,
            machine.attempts + 1,
            policy.max_attempts
        );
        machine.state = ConnectionState::Reconnecting;
        machine.reconnecting = true;
        let weak = Arc::downgrade(self);
        machine.backoff_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            {
                let mut machine = inner.machine.lock().await;
                machine.backoff_timer = None;
                machine.attempts += 1;
            }
            if let Err(e) = inner.connect().await {
                log::warn!("Reconnect attempt failed: {e}");
            }
        }));
    }

    fn spawn_connect_timer(self: &Arc<Self>, epoch: u64, remaining: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let mut machine = inner.machine.lock().await;
            if machine.epoch != epoch {
                return;
            }
            machine.connect_timer = None;
            let tx = match machine.completion.take() {
                Some(tx) => tx,
                None => return,
            };
            if machine.socket_opened {
                // The socket is up even though no handshake ack arrived;
                // degraded but usable.
                log::warn!("Connect timed out after the socket opened; treating as connected");
                machine.state = ConnectionState::Connected;
                machine.attempts = 0;
                machine.reconnecting = false;
                if let Some(timer) = machine.backoff_timer.take() {
                    timer.abort();
                }
                let _ = tx.send(Ok(()));
            } else {
                log::error!("Connect timed out with no liveness signal");
                machine.state = ConnectionState::Disconnected;
                machine.client = None;
                let _ = tx.send(Err(ConnectError::Timeout));
                if machine.reconnecting {
                    inner.schedule_reconnect(&mut machine);
                }
            }
            inner.publish_status(&machine);
        })
    }

    async fn disconnect(self: &Arc<Self>, reset_flags: bool) {
        let handles = self.registry.teardown().await;
        let mut machine = self.machine.lock().await;
        log::info!(
            "Disconnecting, {} subscriptions torn down{}",
            handles.len(),
            if reset_flags { "" } else { " (reconnect context kept)" }
        );
        if let Some(client) = &machine.client {
            for handle in &handles {
                let _ = client.try_send_frame(&Frame::unsubscribe(&handle.id));
            }
            let _ = client.try_send_frame(&Frame::disconnect());
        }
        Self::teardown_wiring(&mut machine, reset_flags);
        self.publish_status(&machine);
    }

    async fn send<T: Serialize + ?Sized>(self: &Arc<Self>, destination: &str, payload: &T) -> bool {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                log::error!("Could not encode payload for {destination}: {e}");
                return false;
            }
        };

        let sender = {
            let machine = self.machine.lock().await;
            if machine.state == ConnectionState::Connected {
                machine.client.as_ref().map(|client| client.sender())
            } else {
                None
            }
        };

        match sender {
            Some(sender) => {
                let frame = Frame::send(destination, body);
                if sender.send(frame.encode()).await.is_ok() {
                    true
                } else {
                    log::warn!("Send to {destination} failed, socket gone");
                    false
                }
            }
            None => {
                log::warn!("Cannot send to {destination} while disconnected");
                self.kick_reconnect();
                false
            }
        }
    }

    /// One best-effort reconnect; overlapping kicks collapse into the
    /// pending attempt.
    fn kick_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            if let Err(e) = inner.connect().await {
                log::debug!("Best-effort reconnect failed: {e}");
            }
        });
    }

    async fn subscribe<F>(self: &Arc<Self>, destination: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        let handle = self.registry.register(destination, handler).await;
        if self.wire_subscribe(&handle).await {
            log::debug!("Subscribed {} to {destination}", handle.id);
            return handle;
        }

        let delay = self.config.subscribe_retry_delay();
        log::warn!("Subscribe to {destination} failed, retrying once in {delay:?}");
        let weak = Arc::downgrade(self);
        let retry = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            if !inner.registry.contains(&retry.id).await {
                return;
            }
            match inner.connect().await {
                Ok(()) | Err(ConnectError::AlreadyConnecting) => {}
                Err(e) => {
                    log::error!(
                        "Abandoning subscription to {}: reconnect failed: {e}",
                        retry.destination
                    );
                    return;
                }
            }
            if inner.wire_subscribe(&retry).await {
                log::info!("Subscription to {} established on retry", retry.destination);
            } else {
                log::error!(
                    "Abandoning subscription to {} after failed retry",
                    retry.destination
                );
            }
        });
        handle
    }

    async fn wire_subscribe(&self, handle: &SubscriptionHandle) -> bool {
        let machine = self.machine.lock().await;
        match (&machine.client, machine.state) {
            (Some(client), ConnectionState::Connected) => {
                client.try_send_frame(&Frame::subscribe(&handle.id, &handle.destination))
            }
            _ => false,
        }
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if self.registry.remove(&handle.id).await {
            log::debug!("Unsubscribed {} from {}", handle.id, handle.destination);
        }
        let machine = self.machine.lock().await;
        if let Some(client) = &machine.client {
            let _ = client.try_send_frame(&Frame::unsubscribe(&handle.id));
        }
    }
}
