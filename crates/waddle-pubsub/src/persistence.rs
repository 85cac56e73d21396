//! PubSub persistence.
//!
//! The engine calls [`PubSubPersistence`] synchronously after each in-memory
//! change, and only once the node is saved. Failures are logged by the
//! engine and never undo the in-memory change.
//!
//! Each call is turned into an owned [`PersistenceOp`], so a backend only
//! has to implement [`PubSubPersistence::write`]. Two backends ship here:
//!
//! - [`InMemoryPersistence`]: DashMap tables, used by tests and by
//!   deployments without durable storage.
//! - [`QueuedPersistence`]: pushes ops on an unbounded channel drained by a
//!   tokio task that applies them to an async [`PubSubStore`], so publish
//!   latency is not tied to storage latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::Jid;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PubSubError;
use crate::item::PublishedItem;
use crate::metrics;
use crate::node::{
    CollectionConfig, LeafConfig, Node, NodeAffiliate, NodeConfig, NodeKind, NodeSubscription,
};

/// Stored form of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub parent_id: Option<String>,
    pub creator: Jid,
    pub creation_date: DateTime<Utc>,
    pub modification_date: DateTime<Utc>,
    pub config: NodeConfig,
    /// Present for leaf nodes.
    pub leaf: Option<LeafConfig>,
    /// Present for collection nodes.
    pub collection: Option<CollectionConfig>,
}

impl NodeRecord {
    pub fn from_node(node: &Node) -> Self {
        let (leaf, collection) = match node.kind() {
            NodeKind::Leaf(leaf) => (Some(leaf.config()), None),
            NodeKind::Collection(collection) => (None, Some(collection.config())),
        };
        Self {
            node_id: node.id().to_string(),
            parent_id: node.parent_id(),
            creator: node.creator().clone(),
            creation_date: node.creation_date(),
            modification_date: node.modification_date(),
            config: node.config(),
            leaf,
            collection,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf.is_some()
    }
}

/// Stored form of a published item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub node_id: String,
    pub item_id: String,
    pub publisher: Jid,
    pub creation_date: DateTime<Utc>,
    pub payload: Option<String>,
}

impl From<&PublishedItem> for ItemRecord {
    fn from(item: &PublishedItem) -> Self {
        Self {
            node_id: item.node_id.clone(),
            item_id: item.id.clone(),
            publisher: item.publisher.clone(),
            creation_date: item.creation_date,
            payload: item.payload.clone(),
        }
    }
}

/// One persistence write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistenceOp {
    CreateNode(NodeRecord),
    UpdateNode(NodeRecord),
    RemoveNode { node_id: String },
    SaveAffiliation { affiliate: NodeAffiliate, is_new: bool },
    RemoveAffiliation { affiliate: NodeAffiliate },
    SaveSubscription { subscription: NodeSubscription, is_new: bool },
    RemoveSubscription { subscription: NodeSubscription },
    SavePublishedItem(ItemRecord),
    RemovePublishedItem { node_id: String, item_id: String },
}

impl PersistenceOp {
    /// Operation name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            PersistenceOp::CreateNode(_) => "create_node",
            PersistenceOp::UpdateNode(_) => "update_node",
            PersistenceOp::RemoveNode { .. } => "remove_node",
            PersistenceOp::SaveAffiliation { .. } => "save_affiliation",
            PersistenceOp::RemoveAffiliation { .. } => "remove_affiliation",
            PersistenceOp::SaveSubscription { .. } => "save_subscription",
            PersistenceOp::RemoveSubscription { .. } => "remove_subscription",
            PersistenceOp::SavePublishedItem(_) => "save_published_item",
            PersistenceOp::RemovePublishedItem { .. } => "remove_published_item",
        }
    }

    /// ID of the node the write belongs to.
    pub fn node_id(&self) -> &str {
        match self {
            PersistenceOp::CreateNode(record) | PersistenceOp::UpdateNode(record) => {
                &record.node_id
            }
            PersistenceOp::RemoveNode { node_id }
            | PersistenceOp::RemovePublishedItem { node_id, .. } => node_id,
            PersistenceOp::SaveAffiliation { affiliate, .. }
            | PersistenceOp::RemoveAffiliation { affiliate } => &affiliate.node_id,
            PersistenceOp::SaveSubscription { subscription, .. }
            | PersistenceOp::RemoveSubscription { subscription } => &subscription.node_id,
            PersistenceOp::SavePublishedItem(record) => &record.node_id,
        }
    }
}

/// Synchronous persistence capability used by the engine.
pub trait PubSubPersistence: Send + Sync {
    /// Apply one write.
    fn write(&self, op: PersistenceOp) -> Result<(), PubSubError>;

    fn create_node(&self, node: &Node) -> Result<(), PubSubError> {
        self.write(PersistenceOp::CreateNode(NodeRecord::from_node(node)))
    }

    fn update_node(&self, node: &Node) -> Result<(), PubSubError> {
        self.write(PersistenceOp::UpdateNode(NodeRecord::from_node(node)))
    }

    fn remove_node(&self, node: &Node) -> Result<(), PubSubError> {
        self.write(PersistenceOp::RemoveNode {
            node_id: node.id().to_string(),
        })
    }

    fn save_affiliation(
        &self,
        _node: &Node,
        affiliate: &NodeAffiliate,
        is_new: bool,
    ) -> Result<(), PubSubError> {
        self.write(PersistenceOp::SaveAffiliation {
            affiliate: affiliate.clone(),
            is_new,
        })
    }

    fn remove_affiliation(
        &self,
        _node: &Node,
        affiliate: &NodeAffiliate,
    ) -> Result<(), PubSubError> {
        self.write(PersistenceOp::RemoveAffiliation {
            affiliate: affiliate.clone(),
        })
    }

    fn save_subscription(
        &self,
        _node: &Node,
        subscription: &NodeSubscription,
        is_new: bool,
    ) -> Result<(), PubSubError> {
        self.write(PersistenceOp::SaveSubscription {
            subscription: subscription.clone(),
            is_new,
        })
    }

    fn remove_subscription(
        &self,
        _node: &Node,
        subscription: &NodeSubscription,
    ) -> Result<(), PubSubError> {
        self.write(PersistenceOp::RemoveSubscription {
            subscription: subscription.clone(),
        })
    }

    fn save_published_item(&self, item: &PublishedItem) -> Result<(), PubSubError> {
        self.write(PersistenceOp::SavePublishedItem(ItemRecord::from(item)))
    }

    fn remove_published_item(&self, item: &PublishedItem) -> Result<(), PubSubError> {
        self.write(PersistenceOp::RemovePublishedItem {
            node_id: item.node_id.clone(),
            item_id: item.id.clone(),
        })
    }
}

/// Asynchronous store drained by [`QueuedPersistence`].
#[async_trait]
pub trait PubSubStore: Send + Sync {
    async fn apply(&self, op: PersistenceOp) -> Result<(), PubSubError>;
}

/// In-memory persistence backend.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    nodes: DashMap<String, NodeRecord>,
    affiliations: DashMap<(String, Jid), NodeAffiliate>,
    subscriptions: DashMap<(String, String), NodeSubscription>,
    items: DashMap<(String, String), ItemRecord>,
    unavailable: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail, as an unreachable database would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Apply one write to the tables.
    pub fn apply_op(&self, op: PersistenceOp) -> Result<(), PubSubError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(PubSubError::persistence(format!(
                "store unavailable for {} on node '{}'",
                op.name(),
                op.node_id()
            )));
        }

        match op {
            PersistenceOp::CreateNode(record) => {
                if self.nodes.contains_key(&record.node_id) {
                    return Err(PubSubError::persistence(format!(
                        "node '{}' already stored",
                        record.node_id
                    )));
                }
                self.nodes.insert(record.node_id.clone(), record);
            }
            PersistenceOp::UpdateNode(record) => {
                self.nodes.insert(record.node_id.clone(), record);
            }
            PersistenceOp::RemoveNode { node_id } => {
                self.nodes.remove(&node_id);
                self.affiliations.retain(|(node, _), _| node != &node_id);
                self.subscriptions.retain(|(node, _), _| node != &node_id);
                self.items.retain(|(node, _), _| node != &node_id);
            }
            PersistenceOp::SaveAffiliation { affiliate, .. } => {
                self.affiliations
                    .insert((affiliate.node_id.clone(), affiliate.jid.clone()), affiliate);
            }
            PersistenceOp::RemoveAffiliation { affiliate } => {
                self.affiliations
                    .remove(&(affiliate.node_id.clone(), affiliate.jid.clone()));
            }
            PersistenceOp::SaveSubscription { subscription, .. } => {
                self.subscriptions.insert(
                    (subscription.node_id.clone(), subscription.id.clone()),
                    subscription,
                );
            }
            PersistenceOp::RemoveSubscription { subscription } => {
                self.subscriptions
                    .remove(&(subscription.node_id.clone(), subscription.id.clone()));
            }
            PersistenceOp::SavePublishedItem(record) => {
                self.items
                    .insert((record.node_id.clone(), record.item_id.clone()), record);
            }
            PersistenceOp::RemovePublishedItem { node_id, item_id } => {
                self.items.remove(&(node_id, item_id));
            }
        }
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn affiliations(&self, node_id: &str) -> Vec<NodeAffiliate> {
        self.affiliations
            .iter()
            .filter(|entry| entry.key().0 == node_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn subscriptions(&self, node_id: &str) -> Vec<NodeSubscription> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.key().0 == node_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Stored items of a node, oldest first.
    pub fn items(&self, node_id: &str) -> Vec<ItemRecord> {
        let mut items: Vec<ItemRecord> = self
            .items
            .iter()
            .filter(|entry| entry.key().0 == node_id)
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by_key(|item| item.creation_date);
        items
    }
}

impl PubSubPersistence for InMemoryPersistence {
    fn write(&self, op: PersistenceOp) -> Result<(), PubSubError> {
        self.apply_op(op)
    }
}

#[async_trait]
impl PubSubStore for InMemoryPersistence {
    async fn apply(&self, op: PersistenceOp) -> Result<(), PubSubError> {
        self.apply_op(op)
    }
}

/// Persistence that queues writes for a background task.
///
/// `write` only fails when the worker is gone. Store failures happen later,
/// on the worker, and are logged there.
#[derive(Debug, Clone)]
pub struct QueuedPersistence {
    sender: mpsc::UnboundedSender<PersistenceOp>,
}

impl QueuedPersistence {
    /// Spawn the writer task. It runs until every `QueuedPersistence`
    /// clone is dropped and the queue is drained.
    pub fn spawn<S>(store: Arc<S>) -> (Self, JoinHandle<()>)
    where
        S: PubSubStore + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<PersistenceOp>();
        let handle = tokio::spawn(async move {
            info!("PubSub persistence writer started");
            while let Some(op) = receiver.recv().await {
                let name = op.name();
                let node_id = op.node_id().to_string();
                match store.apply(op).await {
                    Ok(()) => debug!(operation = name, node = %node_id, "Persistence op applied"),
                    Err(e) => {
                        metrics::record_persistence_failure(name);
                        warn!(operation = name, node = %node_id, error = %e, "Persistence op failed");
                    }
                }
            }
            info!("PubSub persistence writer stopped");
        });
        (Self { sender }, handle)
    }
}

impl PubSubPersistence for QueuedPersistence {
    fn write(&self, op: PersistenceOp) -> Result<(), PubSubError> {
        self.sender
            .send(op)
            .map_err(|e| {
                PubSubError::persistence(format!("writer stopped, dropped {}", e.0.name()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelDelivery;
    use crate::presence::InMemoryPresence;
    use crate::service::ServiceContext;
    use crate::types::{Affiliation, SubscriptionState};
    use tracing_test::traced_test;

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    fn leaf_node() -> Node {
        Node::new_leaf(
            "news",
            Some(String::new()),
            jid("creator@example.com"),
            NodeConfig::leaf_default(),
            LeafConfig::default(),
        )
    }

    #[test]
    fn test_in_memory_tables() {
        let store = InMemoryPersistence::new();
        let node = leaf_node();
        store.create_node(&node).expect("create");
        assert!(store.create_node(&node).is_err());

        let affiliate = NodeAffiliate::new("news", jid("owner@example.com"), Affiliation::Owner);
        store.save_affiliation(&node, &affiliate, true).expect("save");
        let subscription = NodeSubscription::new(
            "sub1",
            "news",
            jid("owner@example.com"),
            jid("owner@example.com"),
            SubscriptionState::Subscribed,
        );
        store.save_subscription(&node, &subscription, true).expect("save");
        let item = PublishedItem::new("news", "item1", jid("owner@example.com"), None);
        store.save_published_item(&item).expect("save");

        assert!(store.node("news").is_some_and(|record| record.is_leaf()));
        assert_eq!(store.affiliations("news"), vec![affiliate]);
        assert_eq!(store.subscriptions("news").len(), 1);
        assert_eq!(store.items("news").len(), 1);

        store.remove_node(&node).expect("remove");
        assert_eq!(store.node_count(), 0);
        assert!(store.affiliations("news").is_empty());
        assert!(store.items("news").is_empty());
    }

    #[test]
    fn test_unavailable_store_fails_writes() {
        let store = InMemoryPersistence::new();
        store.set_unavailable(true);
        let err = store.create_node(&leaf_node()).expect_err("store is down");
        assert!(matches!(err, PubSubError::Persistence(_)));
    }

    #[test]
    fn test_op_serializes_with_tag() {
        let op = PersistenceOp::RemovePublishedItem {
            node_id: "news".to_string(),
            item_id: "item1".to_string(),
        };
        let json = serde_json::to_value(&op).expect("serialize");
        assert_eq!(json["op"], "remove_published_item");
        assert_eq!(op.node_id(), "news");
    }

    #[tokio::test]
    async fn test_queued_writes_reach_store() {
        let store = Arc::new(InMemoryPersistence::new());
        let (queued, handle) = QueuedPersistence::spawn(store.clone());

        let node = leaf_node();
        queued.create_node(&node).expect("enqueue");
        let item = PublishedItem::new("news", "item1", jid("editor@example.com"), None);
        queued.save_published_item(&item).expect("enqueue");

        drop(queued);
        handle.await.expect("writer task");

        assert!(store.node("news").is_some());
        assert_eq!(store.items("news").len(), 1);
    }

    #[tokio::test]
    async fn test_write_fails_once_worker_is_gone() {
        let store = Arc::new(InMemoryPersistence::new());
        let (queued, handle) = QueuedPersistence::spawn(store);
        handle.abort();
        let _ = handle.await;

        let err = queued.create_node(&leaf_node()).expect_err("worker stopped");
        assert!(matches!(err, PubSubError::Persistence(_)));
    }

    #[test]
    #[traced_test]
    fn test_failed_write_is_logged_not_raised() {
        let store = Arc::new(InMemoryPersistence::new());
        let (delivery, _receiver) = ChannelDelivery::new(16);
        let ctx = ServiceContext::new(
            jid("pubsub.example.com"),
            "",
            Vec::<Jid>::new(),
            store.clone(),
            Arc::new(InMemoryPresence::new()),
            Arc::new(delivery),
        );
        let node = leaf_node();
        node.save(&ctx).expect("save");

        store.set_unavailable(true);
        let item = node
            .publish(&ctx, &jid("editor@example.com"), Some("item1"), None)
            .expect("publish succeeds")
            .expect("item kept");

        assert_eq!(node.get_published_item("item1"), Some(item));
        assert!(store.items("news").is_empty());
        assert!(logs_contain("Persistence write failed"));
        assert!(logs_contain("save_published_item"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_queued_failures_are_logged() {
        let store = Arc::new(InMemoryPersistence::new());
        store.set_unavailable(true);
        let (queued, handle) = QueuedPersistence::spawn(store.clone());

        queued.create_node(&leaf_node()).expect("enqueue");
        drop(queued);
        handle.await.expect("writer task");

        assert_eq!(store.node_count(), 0);
        assert!(logs_contain("Persistence op failed"));
    }
}
