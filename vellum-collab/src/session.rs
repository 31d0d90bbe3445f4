//! Collaborative document session.
//!
//! One `DocumentSession` drives everything a single open document needs:
//!
//! ```text
//!   DocumentSource ──fetch──▶ DocumentSession ◀──watch── ConnectionManager
//!                                 │    ▲
//!            debounced updates ───┘    └─── content + typing topics
//!                                 │
//!                                 ▼
//!                          SessionEvent stream
//! ```
//!
//! Local edits are applied to the in-memory document immediately and
//! flushed to the wire on a trailing-edge debounce. Typing state is
//! broadcast eagerly on the first edit, kept alive by a heartbeat, and
//! retired by an inactivity timer with exactly one final stopped
//! broadcast. A slower probe re-announces the current status so a peer
//! roster that expires entries keeps seeing this participant.

use crate::config::SessionTuning;
use crate::connection::ConnectionManager;
use crate::presence::{PresenceRoster, TypingStatus};
use crate::subscription::SubscriptionHandle;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;
use vellum_core::{Document, DocumentSource};

/// Broadcast topic carrying whole-content updates for a document.
pub fn content_topic(document_id: Uuid) -> String {
    format!("/topic/docs/{document_id}")
}

/// Broadcast topic carrying typing statuses for a document.
pub fn typing_topic(document_id: Uuid) -> String {
    format!("/topic/docs/{document_id}/typing")
}

/// Application destination for publishing content updates.
pub fn content_destination(document_id: Uuid) -> String {
    format!("/app/docs/{document_id}/update")
}

/// Application destination for publishing typing statuses.
pub fn typing_destination(document_id: Uuid) -> String {
    format!("/app/docs/{document_id}/typing")
}

/// Whole-content update as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUpdate {
    pub document_id: Uuid,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

/// What the session reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DocumentLoaded(Document),
    LoadFailed(String),
    RemoteContent {
        content: String,
        updated_by: Option<String>,
    },
    ActiveUsers(Vec<TypingStatus>),
    Status(crate::connection::ConnectionStatus),
}

struct SessionState {
    document: Option<Document>,
    load_error: Option<String>,
    roster: PresenceRoster,
    typing: bool,
    pending_content: Option<String>,
    subscriptions: Vec<SubscriptionHandle>,
}

#[derive(Default)]
struct Timers {
    debounce: Option<JoinHandle<()>>,
    inactivity: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
    status_watch: Option<JoinHandle<()>>,
}

struct SessionInner {
    document_id: Uuid,
    manager: Arc<ConnectionManager>,
    source: Arc<dyn DocumentSource>,
    username: Option<String>,
    tuning: SessionTuning,
    state: Mutex<SessionState>,
    timers: Mutex<Timers>,
    event_tx: mpsc::Sender<SessionEvent>,
}

/// A live editing session on one document.
pub struct DocumentSession {
    inner: Arc<SessionInner>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl DocumentSession {
    pub fn new(
        document_id: Uuid,
        manager: Arc<ConnectionManager>,
        source: Arc<dyn DocumentSource>,
        username: Option<String>,
        tuning: SessionTuning,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        let inner = Arc::new(SessionInner {
            document_id,
            manager,
            source,
            username: username.clone(),
            tuning,
            state: Mutex::new(SessionState {
                document: None,
                load_error: None,
                roster: PresenceRoster::new(username),
                typing: false,
                pending_content: None,
                subscriptions: Vec::new(),
            }),
            timers: Mutex::new(Timers::default()),
            event_tx,
        });
        Self {
            inner,
            event_rx: Some(event_rx),
        }
    }

    /// The session's event stream. Yields once; the caller owns it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Loads the document, connects, and wires the collaboration topics.
    ///
    /// A load failure is reported and collaboration proceeds without the
    /// snapshot; a connect failure is logged and the subscription retry
    /// machinery takes it from there.
    pub async fn start(&self) {
        let inner = &self.inner;
        if !inner.state().subscriptions.is_empty() {
            log::warn!("Session for document {} already started", inner.document_id);
            return;
        }

        match inner.source.fetch(inner.document_id).await {
            Ok(document) => {
                inner.state().document = Some(document.clone());
                inner.emit(SessionEvent::DocumentLoaded(document));
            }
            Err(e) => {
                log::error!("Document {} failed to load: {e}", inner.document_id);
                inner.state().load_error = Some(e.to_string());
                inner.emit(SessionEvent::LoadFailed(e.to_string()));
            }
        }

        inner.spawn_status_watcher();

        if let Err(e) = inner.manager.connect().await {
            log::warn!("Initial connect failed: {e}");
        }

        let content_handle = inner.subscribe_content().await;
        let typing_handle = inner.subscribe_typing().await;
        inner.state().subscriptions = vec![content_handle, typing_handle];

        inner.spawn_probe();
        log::info!("Session started for document {}", inner.document_id);
    }

    /// Applies a local edit: the in-memory document changes immediately,
    /// typing is announced, and the wire update goes out once the edit
    /// burst settles.
    pub async fn update_content(&self, content: &str) {
        self.inner.local_edit(content.to_string()).await;
    }

    /// Marks the local user as typing without changing content. Repeats
    /// extend the inactivity window without re-broadcasting.
    pub async fn start_typing(&self) {
        let became_typing = {
            let mut state = self.inner.state();
            let was = state.typing;
            state.typing = true;
            !was
        };
        if became_typing {
            self.inner.send_typing(true).await;
            self.inner.arm_heartbeat();
        }
        self.inner.arm_inactivity();
    }

    /// Marks the local user as stopped, broadcasting exactly one stopped
    /// status if they were typing.
    pub async fn stop_typing(&self) {
        self.inner.halt_typing().await;
    }

    /// Ends the session: a final stopped status goes out if needed, the
    /// topics are unsubscribed, and the roster clears. The underlying
    /// connection stays up for other sessions.
    pub async fn stop(&self) {
        self.inner.halt_typing().await;
        {
            let mut timers = self.inner.timers();
            for task in [
                timers.debounce.take(),
                timers.probe.take(),
                timers.status_watch.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
        }
        let handles = std::mem::take(&mut self.inner.state().subscriptions);
        for handle in &handles {
            self.inner.manager.unsubscribe(handle).await;
        }
        self.inner.state().roster.clear();
        log::info!("Session stopped for document {}", self.inner.document_id);
    }

    pub fn document_id(&self) -> Uuid {
        self.inner.document_id
    }

    /// Current in-memory document, if the load succeeded.
    pub fn document(&self) -> Option<Document> {
        self.inner.state().document.clone()
    }

    pub fn load_error(&self) -> Option<String> {
        self.inner.state().load_error.clone()
    }

    pub fn active_users(&self) -> Vec<TypingStatus> {
        self.inner.state().roster.active()
    }

    pub fn is_typing(&self) -> bool {
        self.inner.state().typing
    }

    pub fn is_connected(&self) -> bool {
        self.inner.manager.status().is_connected
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        let mut timers = self.inner.timers();
        for task in [
            timers.debounce.take(),
            timers.inactivity.take(),
            timers.heartbeat.take(),
            timers.probe.take(),
            timers.status_watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::trace!("Session event dropped, receiver gone or backlogged");
        }
    }

    async fn subscribe_content(self: &Arc<Self>) -> SubscriptionHandle {
        let weak = Arc::downgrade(self);
        self.manager
            .subscribe(&content_topic(self.document_id), move |payload| {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let update: ContentUpdate = match payload.parse() {
                    Some(update) => update,
                    None => {
                        log::warn!("Unrecognized content payload, ignoring");
                        return;
                    }
                };
                // The server echoes our own updates back; named echoes are
                // dropped here.
                if update.updated_by.is_some() && update.updated_by == inner.username {
                    return;
                }
                {
                    let mut state = inner.state();
                    if let Some(document) = state.document.as_mut() {
                        document.content = update.content.clone();
                    }
                }
                inner.emit(SessionEvent::RemoteContent {
                    content: update.content,
                    updated_by: update.updated_by,
                });
            })
            .await
    }

    async fn subscribe_typing(self: &Arc<Self>) -> SubscriptionHandle {
        let weak = Arc::downgrade(self);
        self.manager
            .subscribe(&typing_topic(self.document_id), move |payload| {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let status: TypingStatus = match payload.parse() {
                    Some(status) => status,
                    None => {
                        log::debug!("Unrecognized typing payload, ignoring");
                        return;
                    }
                };
                let users = {
                    let mut state = inner.state();
                    if !state.roster.apply(status) {
                        return;
                    }
                    state.roster.active()
                };
                inner.emit(SessionEvent::ActiveUsers(users));
            })
            .await
    }

    /// Emits status changes and re-issues this session's wire
    /// subscriptions whenever the connection comes back.
    fn spawn_status_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut status_rx = self.manager.watch_status();
        let task = tokio::spawn(async move {
            let mut was_connected = status_rx.borrow().is_connected;
            // The start path wires its own subscriptions; only a connection
            // that drops and comes back needs them re-issued.
            let mut ever_connected = was_connected;
            loop {
                if status_rx.changed().await.is_err() {
                    return;
                }
                let status = *status_rx.borrow_and_update();
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                inner.emit(SessionEvent::Status(status));
                if status.is_connected && !was_connected && ever_connected {
                    inner.resubscribe_own().await;
                }
                ever_connected |= status.is_connected;
                was_connected = status.is_connected;
            }
        });
        if let Some(old) = self.timers().status_watch.replace(task) {
            old.abort();
        }
    }

    /// Re-drives only this session's registrations. Sessions sharing the
    /// manager each do the same for theirs.
    async fn resubscribe_own(&self) {
        let handles = self.state().subscriptions.clone();
        let mut wired = 0;
        for handle in &handles {
            if self.manager.resubscribe(handle).await {
                wired += 1;
            }
        }
        if wired > 0 {
            log::info!(
                "Re-issued {wired} topic subscriptions for document {}",
                self.document_id
            );
        }
    }

    async fn local_edit(self: &Arc<Self>, content: String) {
        let became_typing = {
            let mut state = self.state();
            if let Some(document) = state.document.as_mut() {
                document.content = content.clone();
            }
            state.pending_content = Some(content);
            let was = state.typing;
            state.typing = true;
            !was
        };

        if became_typing {
            self.send_typing(true).await;
            self.arm_heartbeat();
        }
        self.arm_inactivity();
        self.arm_debounce();
    }

    /// Flushes the latest pending content. Runs from the debounce timer;
    /// each edit re-arms the timer, so only the trailing edge fires.
    async fn flush_content(&self) {
        let content = match self.state().pending_content.take() {
            Some(content) => content,
            None => return,
        };
        self.timers().debounce = None;
        let update = ContentUpdate {
            document_id: self.document_id,
            content,
            updated_by: self.username.clone(),
        };
        if !self
            .manager
            .send(&content_destination(self.document_id), &update)
            .await
        {
            // The next edit carries the full content again.
            log::warn!("Content update for {} not delivered", self.document_id);
        }
    }

    async fn send_typing(&self, is_typing: bool) {
        let username = match &self.username {
            Some(username) => username.clone(),
            None => return,
        };
        let status = TypingStatus::new(username, is_typing);
        if !self
            .manager
            .send(&typing_destination(self.document_id), &status)
            .await
        {
            log::debug!("Typing broadcast for {} not delivered", self.document_id);
        }
    }

    /// Stops typing from a user-facing path. The inactivity task has its
    /// own inline version so it never aborts itself mid-broadcast.
    async fn halt_typing(&self) {
        let was_typing = {
            let mut state = self.state();
            let was = state.typing;
            state.typing = false;
            was
        };
        {
            let mut timers = self.timers();
            if let Some(task) = timers.inactivity.take() {
                task.abort();
            }
            if let Some(task) = timers.heartbeat.take() {
                task.abort();
            }
        }
        if was_typing {
            self.send_typing(false).await;
        }
    }

    fn arm_debounce(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.tuning.debounce();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_content().await;
            }
        });
        if let Some(old) = self.timers().debounce.replace(task) {
            old.abort();
        }
    }

    fn arm_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.tuning.typing_heartbeat();
        let task = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                if !inner.state().typing {
                    return;
                }
                inner.send_typing(true).await;
            }
        });
        if let Some(old) = self.timers().heartbeat.replace(task) {
            old.abort();
        }
    }

    fn arm_inactivity(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let window = self.tuning.typing_inactivity();
        let task = tokio::spawn(async move {
            sleep(window).await;
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let was_typing = {
                let mut state = inner.state();
                let was = state.typing;
                state.typing = false;
                was
            };
            {
                let mut timers = inner.timers();
                // This task's own handle; dropped, not aborted.
                timers.inactivity = None;
                if let Some(task) = timers.heartbeat.take() {
                    task.abort();
                }
            }
            if was_typing {
                inner.send_typing(false).await;
            }
        });
        if let Some(old) = self.timers().inactivity.replace(task) {
            old.abort();
        }
    }

    /// Re-announces the current typing status on a slow cadence.
    fn spawn_probe(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.tuning.probe_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let typing = inner.state().typing;
                inner.send_typing(typing).await;
            }
        });
        if let Some(old) = self.timers().probe.replace(task) {
            old.abort();
        }
    }
}
