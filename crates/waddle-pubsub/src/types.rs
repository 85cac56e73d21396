//! Common types for the pubsub engine.

use serde::{Deserialize, Serialize};

/// Affiliation of an entity with a node (XEP-0060 Section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// Banned from subscribing and publishing
    Outcast,
    /// No affiliation; may subscribe
    None,
    /// May publish items
    Publisher,
    /// Node owner
    Owner,
}

impl Affiliation {
    /// Parse an affiliation from its XEP-0060 name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "outcast" => Some(Affiliation::Outcast),
            "none" => Some(Affiliation::None),
            "publisher" => Some(Affiliation::Publisher),
            "owner" => Some(Affiliation::Owner),
            _ => None,
        }
    }
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Affiliation::Outcast => write!(f, "outcast"),
            Affiliation::None => write!(f, "none"),
            Affiliation::Publisher => write!(f, "publisher"),
            Affiliation::Owner => write!(f, "owner"),
        }
    }
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Not subscribed
    None,
    /// Waiting for an owner to approve
    Pending,
    /// Waiting for the subscriber to configure the subscription
    Unconfigured,
    /// Active subscription
    Subscribed,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionState::None => write!(f, "none"),
            SubscriptionState::Pending => write!(f, "pending"),
            SubscriptionState::Unconfigured => write!(f, "unconfigured"),
            SubscriptionState::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// What a subscription to a collection node is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Items published to descendant leaf nodes
    Items,
    /// Nodes being associated with or removed from the collection
    #[default]
    Nodes,
}

impl SubscriptionType {
    /// Parse a subscription type from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "items" => Some(SubscriptionType::Items),
            "nodes" => Some(SubscriptionType::Nodes),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionType::Items => write!(f, "items"),
            SubscriptionType::Nodes => write!(f, "nodes"),
        }
    }
}

/// How deep below a collection node a subscription reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubscriptionDepth {
    /// Direct children only (`1`)
    #[default]
    Direct,
    /// All descendants (`all`, stored as `0`)
    All,
}

impl SubscriptionDepth {
    /// Numeric value as stored by the original data model (1 or 0).
    pub fn as_u8(&self) -> u8 {
        match self {
            SubscriptionDepth::Direct => 1,
            SubscriptionDepth::All => 0,
        }
    }

    /// Parse from the form value (`"1"` or `"all"`) or the stored number.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1" => Some(SubscriptionDepth::Direct),
            "all" | "0" => Some(SubscriptionDepth::All),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionDepth::Direct => write!(f, "1"),
            SubscriptionDepth::All => write!(f, "all"),
        }
    }
}
