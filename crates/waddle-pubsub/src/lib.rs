//! # waddle-pubsub
//!
//! Publish-subscribe node engine (XEP-0060) for Waddle Social.
//!
//! The crate models the node tree of a pubsub service and the rules that
//! decide who receives which event. Wire encoding, access control and
//! routing belong to the embedding XMPP server; it talks to this crate
//! through typed requests and receives [`Notification`]s to send.
//!
//! ## Architecture
//!
//! - **Nodes**: collection nodes form a tree; leaf nodes hold a bounded,
//!   newest-last item log
//! - **Affiliations & subscriptions**: per-node membership with
//!   owner/publisher/none/outcast levels and approval workflow
//! - **Fan-out**: item events reach leaf and ancestor subscribers, grouped
//!   so each address receives one notification per event
//! - **Collaborators**: persistence, presence lookup and notification
//!   delivery are traits with in-memory and channel-backed implementations
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use waddle_pubsub::{
//!     ChannelDelivery, InMemoryPersistence, InMemoryPresence, PubSubService, PubSubSettings,
//! };
//!
//! let (delivery, mut outbound) = ChannelDelivery::new(1024);
//! let service = PubSubService::new(
//!     PubSubSettings::default(),
//!     Arc::new(InMemoryPersistence::new()),
//!     Arc::new(InMemoryPresence::new()),
//!     Arc::new(delivery),
//! )?;
//!
//! let owner = "ann@example.com".parse()?;
//! let news = service.create_leaf_node("news", None, &owner, None)?;
//! news.publish(service.context(), &owner, None, Some("<entry/>".into()))?;
//! ```

pub mod item;
pub mod metrics;
pub mod node;
pub mod notify;
pub mod persistence;
pub mod presence;
pub mod service;
pub mod settings;
pub mod telemetry;

mod error;
mod types;

pub use error::{PubSubError, StanzaErrorCondition};
pub use item::PublishedItem;
pub use node::{
    AccessModel, CollectionConfig, LeafConfig, LeafNodeAssociationPolicy, Node, NodeAffiliate,
    NodeConfig, NodeConfigUpdate, NodeKind, NodeSubscription, PublisherModel,
    SubscriptionOptions,
};
pub use notify::{
    ChannelDelivery, DeliveryResult, EventKind, Notification, NotificationDelivery,
    OutboundNotification,
};
pub use persistence::{
    InMemoryPersistence, PersistenceOp, PubSubPersistence, PubSubStore, QueuedPersistence,
};
pub use presence::{InMemoryPresence, PresenceLookup, Show};
pub use service::{NodeRegistry, PubSubService, ServiceContext};
pub use settings::{load_settings_from, load_settings_from_str, PubSubSettings, SettingsError};
pub use types::*;
