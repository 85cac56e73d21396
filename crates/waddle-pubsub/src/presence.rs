//! Presence lookup for presence-based delivery.
//!
//! The engine never tracks presence itself. It asks a [`PresenceLookup`]
//! for the current show values of a subscriber when a subscription (or the
//! node) restricts delivery by presence.

use std::collections::HashSet;

use dashmap::DashMap;
use jid::Jid;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Presence show value (RFC 6121 Section 4.7.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Show {
    /// Available (default)
    #[default]
    #[serde(alias = "online")]
    Available,
    /// Away
    Away,
    /// Free for chat
    Chat,
    /// Do not disturb
    Dnd,
    /// Extended away
    Xa,
}

impl Show {
    /// Parse a show value. `online` is accepted as an alias for `available`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "available" | "online" => Some(Show::Available),
            "away" => Some(Show::Away),
            "chat" => Some(Show::Chat),
            "dnd" => Some(Show::Dnd),
            "xa" => Some(Show::Xa),
            _ => None,
        }
    }
}

impl std::fmt::Display for Show {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Show::Available => write!(f, "available"),
            Show::Away => write!(f, "away"),
            Show::Chat => write!(f, "chat"),
            Show::Dnd => write!(f, "dnd"),
            Show::Xa => write!(f, "xa"),
        }
    }
}

/// Answers "what is this address's presence right now?".
pub trait PresenceLookup: Send + Sync {
    /// Show values of every available resource behind the address. A bare
    /// JID covers all of the entity's resources. Empty when unavailable.
    fn show_presences(&self, jid: &Jid) -> HashSet<Show>;
}

/// Presence table held in memory.
///
/// Keyed by the address the presence was received from (normally a full
/// JID). A bare-JID query collects every available resource of that entity.
#[derive(Debug, Default)]
pub struct InMemoryPresence {
    presences: DashMap<Jid, Show>,
}

impl InMemoryPresence {
    /// Create an empty presence table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an available presence.
    pub fn set(&self, jid: Jid, show: Show) {
        debug!(jid = %jid, show = %show, "Presence updated");
        self.presences.insert(jid, show);
    }

    /// Record that the address went offline.
    pub fn set_unavailable(&self, jid: &Jid) {
        if self.presences.remove(jid).is_some() {
            debug!(jid = %jid, "Presence removed");
        }
    }

    /// Number of addresses with a recorded presence.
    pub fn len(&self) -> usize {
        self.presences.len()
    }

    /// Whether no presence is recorded.
    pub fn is_empty(&self) -> bool {
        self.presences.is_empty()
    }
}

impl PresenceLookup for InMemoryPresence {
    fn show_presences(&self, jid: &Jid) -> HashSet<Show> {
        if jid.resource().is_some() {
            return self.presences.get(jid).map(|show| *show).into_iter().collect();
        }
        let bare = jid.to_bare();
        self.presences
            .iter()
            .filter(|entry| entry.key().to_bare() == bare)
            .map(|entry| *entry.value())
            .collect()
    }
}
