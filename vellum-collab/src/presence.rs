//! Presence tracking.
//!
//! A roster of who is actively typing in a document, fed by typing
//! broadcasts. The roster mirrors the wire and nothing else: a `true`
//! entry inserts or refreshes a participant, a `false` entry removes one,
//! and the local user is filtered out so their own echoes never land in
//! their roster.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One participant's typing broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStatus {
    pub username: String,
    /// Serialized as `isTyping`; peers that send `typing` parse too.
    #[serde(rename = "isTyping", alias = "typing", default)]
    pub is_typing: bool,
}

impl TypingStatus {
    pub fn new(username: impl Into<String>, is_typing: bool) -> Self {
        Self {
            username: username.into(),
            is_typing,
        }
    }
}

/// Active-participant roster for one document.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    local_username: Option<String>,
    entries: HashMap<String, TypingStatus>,
}

impl PresenceRoster {
    pub fn new(local_username: Option<String>) -> Self {
        Self {
            local_username,
            entries: HashMap::new(),
        }
    }

    /// Merges one broadcast and reports whether the roster changed.
    /// Re-announcing an unchanged status is a no-op, as is removing
    /// someone who was never present.
    pub fn apply(&mut self, status: TypingStatus) -> bool {
        if self.local_username.as_deref() == Some(status.username.as_str()) {
            return false;
        }
        if status.is_typing {
            match self.entries.get(&status.username) {
                Some(existing) if *existing == status => false,
                _ => {
                    self.entries.insert(status.username.clone(), status);
                    true
                }
            }
        } else {
            self.entries.remove(&status.username).is_some()
        }
    }

    /// Everyone currently marked active. Order is unspecified.
    pub fn active(&self) -> Vec<TypingStatus> {
        self.entries.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
