//! Collection nodes: child links and leaf association rules.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashSet;
use jid::Jid;
use tracing::{debug, info};

use super::{CollectionConfig, LeafNodeAssociationPolicy, Node};
use crate::error::PubSubError;
use crate::notify::{self, EventKind};
use crate::service::ServiceContext;

/// Collection-specific node state. Children are stored by node ID; the
/// nodes themselves live in the service's node registry.
#[derive(Debug)]
pub struct CollectionNode {
    config: RwLock<CollectionConfig>,
    children: DashSet<String>,
}

impl CollectionNode {
    pub(crate) fn new(config: CollectionConfig) -> Self {
        Self {
            config: RwLock::new(config),
            children: DashSet::new(),
        }
    }

    pub fn config(&self) -> CollectionConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn update_config(&self, f: impl FnOnce(&mut CollectionConfig)) {
        f(&mut self.config.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn contains_child(&self, node_id: &str) -> bool {
        self.children.contains(node_id)
    }

    /// IDs of the direct children.
    pub fn child_ids(&self) -> Vec<String> {
        self.children.iter().map(|id| id.key().clone()).collect()
    }
}

impl Node {
    /// Attach a direct child. Only call once the child has been saved.
    pub fn add_child_node(&self, child_id: &str) {
        if let Some(collection) = self.as_collection() {
            collection.children.insert(child_id.to_string());
        }
    }

    /// Detach a direct child. Unknown IDs are ignored.
    pub fn remove_child_node(&self, child_id: &str) {
        if let Some(collection) = self.as_collection() {
            collection.children.remove(child_id);
        }
    }

    /// IDs of the direct children. Empty for leaf nodes.
    pub fn child_ids(&self) -> Vec<String> {
        self.as_collection()
            .map(CollectionNode::child_ids)
            .unwrap_or_default()
    }

    /// Whether the entity may associate a new leaf node with this
    /// collection. Always false for leaf nodes.
    pub fn is_association_allowed(&self, ctx: &ServiceContext, jid: &Jid) -> bool {
        let Some(collection) = self.as_collection() else {
            return false;
        };
        let config = collection.config();
        match config.association_policy {
            LeafNodeAssociationPolicy::All => true,
            LeafNodeAssociationPolicy::Owners => self.is_admin(ctx, jid),
            LeafNodeAssociationPolicy::Whitelist => {
                self.is_admin(ctx, jid) || config.association_whitelist.contains(jid)
            }
        }
    }

    /// Whether the number of leaf children reached the configured maximum.
    pub fn is_max_leaf_nodes_reached(&self, ctx: &ServiceContext) -> bool {
        let Some(collection) = self.as_collection() else {
            return false;
        };
        let max_leaf_nodes = collection.config().max_leaf_nodes;
        if max_leaf_nodes < 0 {
            return false;
        }
        let leaf_children = collection
            .child_ids()
            .iter()
            .filter_map(|id| ctx.nodes.get(id))
            .filter(|child| child.is_leaf())
            .count();
        leaf_children >= max_leaf_nodes as usize
    }

    /// Look up the nodes named by a `children` configuration field.
    pub(crate) fn resolve_children(
        &self,
        ctx: &ServiceContext,
        child_ids: &[String],
    ) -> Result<Vec<Arc<Node>>, PubSubError> {
        if !self.is_collection() {
            return Err(PubSubError::not_acceptable(format!(
                "Leaf node '{}' cannot have children",
                self.id
            )));
        }
        let ancestors = self.parents(&ctx.nodes);
        child_ids
            .iter()
            .map(|id| {
                let child = ctx.nodes.get(id).ok_or_else(|| {
                    PubSubError::not_acceptable(format!("Child node '{}' does not exist", id))
                })?;
                if child.id == self.id || ancestors.iter().any(|ancestor| ancestor.id == child.id) {
                    return Err(PubSubError::not_acceptable(format!(
                        "Node '{}' cannot become a child of '{}'",
                        id, self.id
                    )));
                }
                Ok(child)
            })
            .collect()
    }

    /// Replace the child set. Children not listed move to the root node;
    /// listed nodes move here from their current parent.
    pub(crate) fn set_children(&self, ctx: &ServiceContext, children: Vec<Arc<Node>>) {
        let is_root = self.id == ctx.root_node_id;
        if !is_root {
            if let Some(root) = ctx.nodes.get(&ctx.root_node_id) {
                for child_id in self.child_ids() {
                    if children.iter().any(|child| child.id == child_id) {
                        continue;
                    }
                    if let Some(child) = ctx.nodes.get(&child_id) {
                        root.adopt(ctx, &child);
                    }
                }
            }
        }
        for child in &children {
            self.adopt(ctx, child);
        }
    }

    /// Move `child` under this collection, notifying subscribers of the old
    /// and new parent.
    pub(crate) fn adopt(&self, ctx: &ServiceContext, child: &Node) {
        let old_parent = child.parent_id();
        if old_parent.as_deref() == Some(self.id.as_str()) {
            return;
        }
        if let Some(old_parent) = old_parent.and_then(|id| ctx.nodes.get(&id)) {
            old_parent.remove_child_node(&child.id);
            notify::broadcast_child_event(
                ctx,
                &old_parent,
                EventKind::ChildDisassociated {
                    child_id: child.id.clone(),
                },
            );
        }

        child.set_parent(Some(self.id.clone()));
        self.add_child_node(&child.id);
        info!(node = %child.id, parent = %self.id, "Node moved to new parent");
        notify::broadcast_child_event(
            ctx,
            self,
            EventKind::ChildAssociated {
                child_id: child.id.clone(),
            },
        );
        child.persist(ctx, "update_node", |store| store.update_node(child));
        debug!(node = %child.id, "Parent change persisted");
    }
}
