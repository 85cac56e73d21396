//! PubSub node configuration.
//!
//! Defines the typed configuration bundle of a node, the leaf and collection
//! specific settings, and [`NodeConfigUpdate`], the already-parsed form a
//! protocol handler hands to [`Node::configure`](super::Node::configure).

use std::fmt;

use jid::Jid;
use serde::{Deserialize, Serialize};

/// Access model for a PubSub node.
///
/// Determines who can subscribe to and retrieve items from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessModel {
    /// Anyone can subscribe and retrieve items.
    #[default]
    Open,
    /// Entities with a presence subscription to an owner can access.
    Presence,
    /// Entities in allowed roster groups of an owner can access.
    Roster,
    /// Subscriptions must be approved by an owner.
    Authorize,
    /// Only explicitly whitelisted JIDs can access.
    Whitelist,
}

impl AccessModel {
    /// Parse an access model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "authorize" => Some(AccessModel::Authorize),
            "whitelist" => Some(AccessModel::Whitelist),
            _ => None,
        }
    }

    /// Whether new subscriptions must be approved by a node owner.
    pub fn is_authorization_required(&self) -> bool {
        matches!(self, AccessModel::Authorize)
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Authorize => "authorize",
            AccessModel::Whitelist => "whitelist",
        };
        write!(f, "{}", s)
    }
}

/// Publisher model for a PubSub node.
///
/// Determines who can publish to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherModel {
    /// Anyone can publish.
    Open,
    /// Only owners and publishers can publish.
    #[default]
    Publishers,
    /// Owners, publishers and subscribers can publish.
    Subscribers,
}

impl PublisherModel {
    /// Parse a publisher model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PublisherModel::Open),
            "publishers" => Some(PublisherModel::Publishers),
            "subscribers" => Some(PublisherModel::Subscribers),
            _ => None,
        }
    }
}

impl fmt::Display for PublisherModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublisherModel::Open => "open",
            PublisherModel::Publishers => "publishers",
            PublisherModel::Subscribers => "subscribers",
        };
        write!(f, "{}", s)
    }
}

/// Who may associate new leaf nodes with a collection node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeafNodeAssociationPolicy {
    /// Any entity.
    #[default]
    All,
    /// Node owners and service admins.
    Owners,
    /// Owners, admins and whitelisted entities.
    Whitelist,
}

impl LeafNodeAssociationPolicy {
    /// Parse a policy from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "all" => Some(LeafNodeAssociationPolicy::All),
            "owners" => Some(LeafNodeAssociationPolicy::Owners),
            "whitelist" => Some(LeafNodeAssociationPolicy::Whitelist),
            _ => None,
        }
    }
}

impl fmt::Display for LeafNodeAssociationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeafNodeAssociationPolicy::All => "all",
            LeafNodeAssociationPolicy::Owners => "owners",
            LeafNodeAssociationPolicy::Whitelist => "whitelist",
        };
        write!(f, "{}", s)
    }
}

/// Configuration shared by leaf and collection nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Whether to deliver payloads with event notifications.
    pub deliver_payloads: bool,
    /// Whether to notify subscribers when the configuration changes.
    pub notify_config: bool,
    /// Whether to notify subscribers when the node is deleted.
    pub notify_delete: bool,
    /// Whether to notify subscribers when items are retracted.
    pub notify_retract: bool,
    /// Whether to deliver only to subscribers that are available.
    pub presence_based_delivery: bool,
    /// Whether to send the last published item to new subscribers.
    pub send_item_subscribe: bool,
    /// Whether subscriptions are allowed at all.
    pub subscribe: bool,
    /// Whether new subscriptions must be configured before delivery.
    pub subscription_required: bool,
    /// Access model (who can subscribe/retrieve).
    pub access_model: AccessModel,
    /// Publisher model (who can publish).
    pub publisher_model: PublisherModel,
    /// Friendly name of the node.
    pub title: Option<String>,
    /// Description of the node.
    pub description: Option<String>,
    /// Payload namespace carried by items of this node.
    pub payload_type: Option<String>,
    /// Default language of the node.
    pub language: Option<String>,
    /// Entities to contact with questions about the node.
    pub contacts: Vec<Jid>,
    /// Roster groups allowed under the roster access model.
    pub roster_groups_allowed: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::leaf_default()
    }
}

impl NodeConfig {
    /// Defaults for new leaf nodes.
    pub fn leaf_default() -> Self {
        Self {
            deliver_payloads: true,
            notify_config: true,
            notify_delete: true,
            notify_retract: true,
            presence_based_delivery: false,
            send_item_subscribe: true,
            subscribe: true,
            subscription_required: false,
            access_model: AccessModel::Open,
            publisher_model: PublisherModel::Publishers,
            title: None,
            description: None,
            payload_type: None,
            language: None,
            contacts: Vec::new(),
            roster_groups_allowed: Vec::new(),
        }
    }

    /// Defaults for new collection nodes. Collections hold no items, so
    /// there is nothing to send on subscribe.
    pub fn collection_default() -> Self {
        Self {
            deliver_payloads: false,
            send_item_subscribe: false,
            ..Self::leaf_default()
        }
    }

    /// Multiple subscriptions per entity are always enabled.
    pub fn multiple_subscriptions(&self) -> bool {
        true
    }
}

/// Leaf-node retention settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafConfig {
    /// Whether published items are kept (and persisted).
    pub persist_items: bool,
    /// Maximum number of items kept in the log.
    pub max_items: usize,
    /// Maximum payload size in bytes.
    pub max_payload_size: usize,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            persist_items: true,
            max_items: 10,
            max_payload_size: 5120,
        }
    }
}

impl LeafConfig {
    /// Capacity of the item log. Pinned to 1 when items are not persisted.
    pub fn effective_max_items(&self) -> usize {
        if self.persist_items {
            self.max_items.max(1)
        } else {
            1
        }
    }
}

/// Collection-node association settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Who may associate new leaf nodes.
    pub association_policy: LeafNodeAssociationPolicy,
    /// Entities trusted under the whitelist policy.
    pub association_whitelist: Vec<Jid>,
    /// Maximum number of leaf children, `-1` for unbounded.
    pub max_leaf_nodes: i32,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            association_policy: LeafNodeAssociationPolicy::All,
            association_whitelist: Vec::new(),
            max_leaf_nodes: -1,
        }
    }
}

/// A configuration change request.
///
/// Every field is optional: `None` leaves the current value untouched.
/// `owners` and `publishers` replace the whole affiliation list, and
/// `children` replaces the child set of a collection node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfigUpdate {
    pub deliver_payloads: Option<bool>,
    pub notify_config: Option<bool>,
    pub notify_delete: Option<bool>,
    pub notify_retract: Option<bool>,
    pub presence_based_delivery: Option<bool>,
    pub send_item_subscribe: Option<bool>,
    pub subscribe: Option<bool>,
    pub subscription_required: Option<bool>,
    pub access_model: Option<AccessModel>,
    pub publisher_model: Option<PublisherModel>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub payload_type: Option<String>,
    pub language: Option<String>,
    pub contacts: Option<Vec<Jid>>,
    pub roster_groups_allowed: Option<Vec<String>>,

    /// New owner list. Must not be empty.
    pub owners: Option<Vec<Jid>>,
    /// New publisher list.
    pub publishers: Option<Vec<Jid>>,

    // Leaf only
    pub persist_items: Option<bool>,
    pub max_items: Option<usize>,
    pub max_payload_size: Option<usize>,

    // Collection only
    pub association_policy: Option<LeafNodeAssociationPolicy>,
    pub association_whitelist: Option<Vec<Jid>>,
    pub max_leaf_nodes: Option<i32>,
    pub children: Option<Vec<String>>,
}

impl NodeConfigUpdate {
    /// Apply the shared fields to a node configuration.
    pub(crate) fn apply_to(&self, config: &mut NodeConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = &self.$field {
                    config.$field = value.clone();
                })*
            };
        }
        set!(
            deliver_payloads,
            notify_config,
            notify_delete,
            notify_retract,
            presence_based_delivery,
            send_item_subscribe,
            subscribe,
            subscription_required,
            access_model,
            publisher_model,
            contacts,
            roster_groups_allowed,
        );
        if let Some(title) = &self.title {
            config.title = Some(title.clone());
        }
        if let Some(description) = &self.description {
            config.description = Some(description.clone());
        }
        if let Some(payload_type) = &self.payload_type {
            config.payload_type = Some(payload_type.clone());
        }
        if let Some(language) = &self.language {
            config.language = Some(language.clone());
        }
    }

    /// Apply the leaf-only fields.
    pub(crate) fn apply_to_leaf(&self, config: &mut LeafConfig) {
        if let Some(persist_items) = self.persist_items {
            config.persist_items = persist_items;
        }
        if let Some(max_items) = self.max_items {
            config.max_items = max_items.max(1);
        }
        if let Some(max_payload_size) = self.max_payload_size {
            config.max_payload_size = max_payload_size;
        }
    }

    /// Apply the collection-only fields (except `children`).
    pub(crate) fn apply_to_collection(&self, config: &mut CollectionConfig) {
        if let Some(policy) = self.association_policy {
            config.association_policy = policy;
        }
        if let Some(whitelist) = &self.association_whitelist {
            config.association_whitelist = whitelist.clone();
        }
        if let Some(max_leaf_nodes) = self.max_leaf_nodes {
            config.max_leaf_nodes = max_leaf_nodes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_model_parse() {
        assert_eq!(AccessModel::from_str("authorize"), Some(AccessModel::Authorize));
        assert_eq!(AccessModel::from_str("invalid"), None);
        assert!(AccessModel::Authorize.is_authorization_required());
        assert!(!AccessModel::Whitelist.is_authorization_required());
    }

    #[test]
    fn test_publisher_model_display() {
        assert_eq!(PublisherModel::Subscribers.to_string(), "subscribers");
        assert_eq!(PublisherModel::from_str("open"), Some(PublisherModel::Open));
    }

    #[test]
    fn test_collection_defaults() {
        let config = NodeConfig::collection_default();
        assert!(!config.deliver_payloads);
        assert!(!config.send_item_subscribe);
        assert!(config.notify_delete);
        assert!(config.multiple_subscriptions());
    }

    #[test]
    fn test_max_items_pinned_when_not_persisting() {
        let mut leaf = LeafConfig {
            persist_items: false,
            max_items: 20,
            max_payload_size: 5120,
        };
        assert_eq!(leaf.effective_max_items(), 1);

        leaf.persist_items = true;
        assert_eq!(leaf.effective_max_items(), 20);
    }

    #[test]
    fn test_update_touches_only_supplied_fields() {
        let mut config = NodeConfig::leaf_default();
        let update = NodeConfigUpdate {
            notify_retract: Some(false),
            access_model: Some(AccessModel::Whitelist),
            title: Some("Princely Musings".to_string()),
            ..Default::default()
        };
        update.apply_to(&mut config);

        assert!(!config.notify_retract);
        assert_eq!(config.access_model, AccessModel::Whitelist);
        assert_eq!(config.title.as_deref(), Some("Princely Musings"));
        assert!(config.deliver_payloads);
        assert!(config.notify_delete);
    }

    #[test]
    fn test_leaf_update_clamps_max_items() {
        let mut leaf = LeafConfig::default();
        let update = NodeConfigUpdate {
            max_items: Some(0),
            ..Default::default()
        };
        update.apply_to_leaf(&mut leaf);
        assert_eq!(leaf.max_items, 1);
    }
}
