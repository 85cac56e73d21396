//! The pubsub service: node arena, shared context and node lifecycle.
//!
//! Nodes reference each other by ID only. [`NodeRegistry`] is the arena
//! that resolves those IDs, and [`ServiceContext`] bundles it with the
//! collaborators every node operation needs (persistence, presence,
//! notification delivery, service admins).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::Jid;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::error::PubSubError;
use crate::metrics;
use crate::node::{Node, NodeConfigUpdate};
use crate::notify::{self, EventKind, NotificationDelivery};
use crate::persistence::PubSubPersistence;
use crate::presence::PresenceLookup;
use crate::settings::{PubSubSettings, SettingsError};

/// Every node of the service, keyed by node ID.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.get(node_id).map(|n| n.value().clone())
    }

    /// Insert or replace a node.
    pub fn insert(&self, node: Arc<Node>) -> Option<Arc<Node>> {
        self.nodes.insert(node.id().to_string(), node)
    }

    /// Insert a node unless its ID is taken. Returns the node back on
    /// conflict.
    pub fn try_insert(&self, node: Arc<Node>) -> Result<(), Arc<Node>> {
        match self.nodes.entry(node.id().to_string()) {
            Entry::Occupied(_) => Err(node),
            Entry::Vacant(entry) => {
                entry.insert(node);
                Ok(())
            }
        }
    }

    pub fn remove(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.remove(node_id).map(|(_, node)| node)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|n| n.value().clone()).collect()
    }
}

/// Shared state handed to node operations.
pub struct ServiceContext {
    pub nodes: NodeRegistry,
    pub persistence: Arc<dyn PubSubPersistence>,
    pub presence: Arc<dyn PresenceLookup>,
    pub delivery: Arc<dyn NotificationDelivery>,
    /// Address of the service.
    pub address: Jid,
    pub root_node_id: String,
    admins: HashSet<Jid>,
}

impl ServiceContext {
    pub fn new(
        address: Jid,
        root_node_id: impl Into<String>,
        admins: impl IntoIterator<Item = Jid>,
        persistence: Arc<dyn PubSubPersistence>,
        presence: Arc<dyn PresenceLookup>,
        delivery: Arc<dyn NotificationDelivery>,
    ) -> Self {
        Self {
            nodes: NodeRegistry::new(),
            persistence,
            presence,
            delivery,
            address,
            root_node_id: root_node_id.into(),
            admins: admins.into_iter().collect(),
        }
    }

    /// Whether the address is a service-wide administrator. Exact match;
    /// callers retry with the bare JID.
    pub fn is_service_admin(&self, jid: &Jid) -> bool {
        self.admins.contains(jid)
    }

    pub fn root_node(&self) -> Option<Arc<Node>> {
        self.nodes.get(&self.root_node_id)
    }
}

/// Entry point of the engine: owns the context and the node lifecycle.
pub struct PubSubService {
    ctx: ServiceContext,
    settings: PubSubSettings,
}

impl PubSubService {
    /// Build the service and create its root collection node.
    ///
    /// Fails when the configured addresses do not parse or when the store
    /// refuses the root node.
    #[instrument(skip_all, fields(address = %settings.service.address))]
    pub fn new(
        settings: PubSubSettings,
        persistence: Arc<dyn PubSubPersistence>,
        presence: Arc<dyn PresenceLookup>,
        delivery: Arc<dyn NotificationDelivery>,
    ) -> Result<Self, PubSubError> {
        let address = settings.service.address_jid().map_err(settings_error)?;
        let admins = settings.service.admin_jids().map_err(settings_error)?;
        let ctx = ServiceContext::new(
            address.clone(),
            settings.service.root_node_id.clone(),
            admins,
            persistence,
            presence,
            delivery,
        );

        let root = Arc::new(Node::new_collection(
            ctx.root_node_id.clone(),
            None,
            address,
            settings.collection.node_config(),
            settings.collection.collection_config(),
        ));
        root.save(&ctx)?;
        ctx.nodes.insert(root);

        info!(root = %ctx.root_node_id, "PubSub service started");
        Ok(Self { ctx, settings })
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub fn settings(&self) -> &PubSubSettings {
        &self.settings
    }

    pub fn root_node(&self) -> Option<Arc<Node>> {
        self.ctx.root_node()
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.ctx.nodes.get(node_id)
    }

    /// Create a leaf node under `parent` (the root when `None`).
    ///
    /// The parent's association policy and leaf limit apply to the creator.
    #[instrument(skip(self, config), fields(node = %node_id, creator = %creator))]
    pub fn create_leaf_node(
        &self,
        node_id: &str,
        parent: Option<&str>,
        creator: &Jid,
        config: Option<NodeConfigUpdate>,
    ) -> Result<Arc<Node>, PubSubError> {
        let parent = self.creation_parent(node_id, parent)?;
        if !parent.is_association_allowed(&self.ctx, creator) {
            return Err(PubSubError::not_allowed(format!(
                "{} may not associate leaf nodes with '{}'",
                creator,
                parent.id()
            )));
        }
        if parent.is_max_leaf_nodes_reached(&self.ctx) {
            return Err(PubSubError::not_allowed(format!(
                "Collection '{}' reached its maximum number of leaf nodes",
                parent.id()
            )));
        }

        let node = Node::new_leaf(
            node_id,
            Some(parent.id().to_string()),
            creator.clone(),
            self.settings.leaf.node_config(),
            self.settings.leaf.leaf_config(),
        );
        self.register_new_node(node, &parent, creator, config)
    }

    /// Create a collection node under `parent` (the root when `None`).
    #[instrument(skip(self, config), fields(node = %node_id, creator = %creator))]
    pub fn create_collection_node(
        &self,
        node_id: &str,
        parent: Option<&str>,
        creator: &Jid,
        config: Option<NodeConfigUpdate>,
    ) -> Result<Arc<Node>, PubSubError> {
        let parent = self.creation_parent(node_id, parent)?;
        let node = Node::new_collection(
            node_id,
            Some(parent.id().to_string()),
            creator.clone(),
            self.settings.collection.node_config(),
            self.settings.collection.collection_config(),
        );
        self.register_new_node(node, &parent, creator, config)
    }

    fn creation_parent(
        &self,
        node_id: &str,
        parent: Option<&str>,
    ) -> Result<Arc<Node>, PubSubError> {
        if self.ctx.nodes.contains(node_id) {
            return Err(PubSubError::conflict(format!(
                "Node '{}' already exists",
                node_id
            )));
        }
        let parent_id = parent.unwrap_or(&self.ctx.root_node_id);
        let parent = self
            .ctx
            .nodes
            .get(parent_id)
            .ok_or_else(|| PubSubError::node_not_found(parent_id))?;
        if !parent.is_collection() {
            return Err(PubSubError::not_allowed(format!(
                "Parent node '{}' is not a collection",
                parent_id
            )));
        }
        Ok(parent)
    }

    /// Grant the creator ownership, apply the initial configuration, save,
    /// register and attach to the parent, in that order.
    fn register_new_node(
        &self,
        node: Node,
        parent: &Arc<Node>,
        creator: &Jid,
        config: Option<NodeConfigUpdate>,
    ) -> Result<Arc<Node>, PubSubError> {
        let ctx = &self.ctx;
        let node = Arc::new(node);
        let mut update = config.unwrap_or_default();
        let children = match update.children.take() {
            Some(ids) => Some(node.resolve_children(ctx, &ids)?),
            None => None,
        };

        node.add_owner(ctx, creator);
        node.configure(ctx, update)?;
        node.save(ctx)?;

        if let Err(node) = ctx.nodes.try_insert(Arc::clone(&node)) {
            warn!(node = %node.id(), "Node ID taken during creation, discarding");
            if let Err(e) = ctx.persistence.remove_node(&node) {
                metrics::record_persistence_failure("remove_node");
                warn!(node = %node.id(), error = %e, "Failed to discard node record");
            }
            return Err(PubSubError::conflict(format!(
                "Node '{}' already exists",
                node.id()
            )));
        }

        parent.add_child_node(node.id());
        notify::broadcast_child_event(
            ctx,
            parent,
            EventKind::ChildAssociated {
                child_id: node.id().to_string(),
            },
        );
        if let Some(children) = children {
            node.set_children(ctx, children);
        }

        info!(
            node = %node.id(),
            parent = %parent.id(),
            collection = node.is_collection(),
            "Node created"
        );
        Ok(node)
    }

    /// Delete a node.
    ///
    /// The store record is removed first; if that fails nothing changes.
    /// Children of a deleted collection move to its parent.
    #[instrument(skip(self), fields(node = %node_id))]
    pub fn delete_node(&self, node_id: &str) -> Result<(), PubSubError> {
        let ctx = &self.ctx;
        if node_id == ctx.root_node_id {
            return Err(PubSubError::not_allowed("The root node cannot be deleted"));
        }
        let node = ctx
            .nodes
            .get(node_id)
            .ok_or_else(|| PubSubError::node_not_found(node_id))?;

        if node.is_saved() {
            ctx.persistence.remove_node(&node).inspect_err(|e| {
                metrics::record_persistence_failure("remove_node");
                warn!(node = %node_id, error = %e, "Failed to remove node from store");
            })?;
        }

        let parent = node.parent_id().and_then(|id| ctx.nodes.get(&id));
        if let Some(parent) = &parent {
            parent.remove_child_node(node_id);
            notify::broadcast_child_event(
                ctx,
                parent,
                EventKind::ChildDisassociated {
                    child_id: node_id.to_string(),
                },
            );
        }

        if node.is_collection() {
            if let Some(new_parent) = parent.or_else(|| ctx.root_node()) {
                for child in node.child_ids().iter().filter_map(|id| ctx.nodes.get(id)) {
                    new_parent.adopt(ctx, &child);
                }
            }
        }

        if node.config().notify_delete {
            notify::broadcast_node_event(ctx, &node, EventKind::Deleted, true);
        }

        ctx.nodes.remove(node_id);
        node.clear();
        info!(node = %node_id, "Node deleted");
        Ok(())
    }

    /// Cancel every subscription whose expiry has passed. Returns how many
    /// were cancelled.
    pub fn sweep_expired_subscriptions(&self) -> usize {
        let now = Utc::now();
        let cancelled: usize = self
            .ctx
            .nodes
            .all()
            .iter()
            .map(|node| node.cancel_expired_subscriptions(&self.ctx, now).len())
            .sum();
        if cancelled > 0 {
            info!(cancelled, "Expired subscriptions swept");
        } else {
            debug!("No expired subscriptions");
        }
        cancelled
    }

    /// Run [`sweep_expired_subscriptions`](Self::sweep_expired_subscriptions)
    /// every `period` until the task is aborted.
    pub fn spawn_expiry_sweeper(service: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_secs = period.as_secs(), "Subscription expiry sweeper started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                service.sweep_expired_subscriptions();
            }
        })
    }
}

fn settings_error(e: SettingsError) -> PubSubError {
    PubSubError::internal(e.to_string())
}

#[cfg(test)]
pub(crate) fn test_context() -> ServiceContext {
    test_context_with_receiver().0
}

#[cfg(test)]
pub(crate) fn test_context_with_receiver() -> (
    ServiceContext,
    tokio::sync::mpsc::Receiver<crate::notify::OutboundNotification>,
) {
    use crate::node::{CollectionConfig, NodeConfig};
    use crate::notify::ChannelDelivery;
    use crate::persistence::InMemoryPersistence;
    use crate::presence::InMemoryPresence;

    let (delivery, receiver) = ChannelDelivery::new(256);
    let address: Jid = "pubsub.example.com".parse().expect("valid jid");
    let admin: Jid = "admin@example.com".parse().expect("valid jid");
    let ctx = ServiceContext::new(
        address.clone(),
        "",
        [admin],
        Arc::new(InMemoryPersistence::new()),
        Arc::new(InMemoryPresence::new()),
        Arc::new(delivery),
    );
    ctx.nodes.insert(Arc::new(Node::new_collection(
        "",
        None,
        address,
        NodeConfig::collection_default(),
        CollectionConfig::default(),
    )));
    (ctx, receiver)
}
