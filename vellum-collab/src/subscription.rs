//! Subscription registry.
//!
//! Maps opaque destination strings to handler callbacks and owns the one
//! place where inbound frame bodies are decoded. Registrations survive
//! only as long as the registry says so; the wire-level subscribe and its
//! acks are the connection manager's business.

use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

type Handler = dyn Fn(Payload) + Send + Sync;

/// Decoded body of an inbound frame. Bodies that are not valid JSON are
/// handed over raw instead of being dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Raw(String),
}

impl Payload {
    /// Decodes one frame body. Every inbound body funnels through here.
    pub fn decode(body: &str) -> Self {
        match serde_json::from_str(body) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                log::debug!("Inbound payload is not JSON, delivering raw: {e}");
                Payload::Raw(body.to_string())
            }
        }
    }

    /// Typed view of a JSON payload. None for raw payloads and for shape
    /// mismatches.
    pub fn parse<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            Payload::Json(value) => serde_json::from_value(value.clone()).ok(),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Payload::Raw(text) => Some(text),
            Payload::Json(_) => None,
        }
    }
}

/// Caller's grip on one registration. Valid from the moment subscribe
/// returns, before any wire ack exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub destination: String,
}

struct Registration {
    id: String,
    destination: String,
    handler: Arc<Handler>,
}

/// Handler registrations, keyed by generated subscription id.
pub struct SubscriptionRegistry {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn register<F>(&self, destination: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut registrations = self.registrations.lock().await;
        registrations.push(Registration {
            id: id.clone(),
            destination: destination.to_string(),
            handler: Arc::new(handler),
        });
        log::debug!("Registered {id} for {destination}");
        SubscriptionHandle {
            id,
            destination: destination.to_string(),
        }
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut registrations = self.registrations.lock().await;
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.registrations.lock().await.iter().any(|r| r.id == id)
    }

    /// Handles for every live registration. Registrations survive a
    /// reconnect while wire subscriptions do not; this is what a caller
    /// walks to re-issue them.
    pub async fn snapshot(&self) -> Vec<SubscriptionHandle> {
        self.registrations
            .lock()
            .await
            .iter()
            .map(|r| SubscriptionHandle {
                id: r.id.clone(),
                destination: r.destination.clone(),
            })
            .collect()
    }

    /// Empties the registry, returning the handles so the caller can issue
    /// wire-level unsubscribes for them.
    pub async fn teardown(&self) -> Vec<SubscriptionHandle> {
        let mut registrations = self.registrations.lock().await;
        registrations
            .drain(..)
            .map(|r| SubscriptionHandle {
                id: r.id,
                destination: r.destination,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.registrations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registrations.lock().await.is_empty()
    }

    /// Routes one inbound body and returns how many handlers ran.
    ///
    /// A message carrying a subscription id goes to that registration; a
    /// missing or stale id falls back to every registration matching the
    /// destination. Handlers run after the registry lock is released, so a
    /// handler may touch the registry again without deadlocking.
    pub async fn dispatch(
        &self,
        destination: &str,
        subscription: Option<&str>,
        body: &str,
    ) -> usize {
        let targets: Vec<Arc<Handler>> = {
            let registrations = self.registrations.lock().await;
            let mut targets: Vec<Arc<Handler>> = Vec::new();
            if let Some(id) = subscription {
                targets.extend(
                    registrations
                        .iter()
                        .filter(|r| r.id == id)
                        .map(|r| Arc::clone(&r.handler)),
                );
            }
            if targets.is_empty() {
                targets.extend(
                    registrations
                        .iter()
                        .filter(|r| r.destination == destination)
                        .map(|r| Arc::clone(&r.handler)),
                );
            }
            targets
        };

        if targets.is_empty() {
            return 0;
        }
        let payload = Payload::decode(body);
        let count = targets.len();
        for handler in targets {
            handler(payload.clone());
        }
        count
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
