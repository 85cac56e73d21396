//! PubSub nodes (XEP-0060).
//!
//! A [`Node`] holds the state shared by every topic (configuration,
//! affiliates, subscriptions, hierarchy link) plus a [`NodeKind`] payload:
//! the child set of a collection node or the item log of a leaf node.
//!
//! ## Concurrency
//!
//! - The affiliate set is copy-on-write. Fan-out iterates an `Arc` snapshot
//!   while grants and revocations swap in a new map.
//! - Subscriptions live in a `DashMap` keyed by subscription ID.
//! - Compound affiliation/subscription changes (grant owner and create its
//!   subscription, cancel a subscription and collect its affiliate) are
//!   serialized by a per-node membership lock. Public methods take the lock
//!   and call the `*_locked` helpers.
//! - The leaf item log has its own mutex (see [`leaf`]).
//!
//! No lock is ever held across nodes.

mod affiliate;
mod collection;
mod config;
mod leaf;
mod subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::Jid;
use tracing::{debug, info, instrument, warn};

pub use affiliate::NodeAffiliate;
pub use collection::CollectionNode;
pub use config::{
    AccessModel, CollectionConfig, LeafConfig, LeafNodeAssociationPolicy, NodeConfig,
    NodeConfigUpdate, PublisherModel,
};
pub use leaf::LeafNode;
pub use subscription::{NodeSubscription, SubscriptionOptions, DEFAULT_DIGEST_FREQUENCY};

use crate::error::PubSubError;
use crate::metrics;
use crate::notify::{self, EventKind};
use crate::persistence::PubSubPersistence;
use crate::service::{NodeRegistry, ServiceContext};
use crate::types::{Affiliation, SubscriptionState};
use subscription::generate_subscription_id;

/// Variant-specific part of a node.
#[derive(Debug)]
pub enum NodeKind {
    /// Contains other nodes.
    Collection(CollectionNode),
    /// Contains published items.
    Leaf(LeafNode),
}

/// A pubsub topic.
#[derive(Debug)]
pub struct Node {
    id: String,
    parent: RwLock<Option<String>>,
    creator: Jid,
    creation_date: DateTime<Utc>,
    modification_date: RwLock<DateTime<Utc>>,
    config: RwLock<NodeConfig>,
    affiliates: RwLock<Arc<HashMap<Jid, NodeAffiliate>>>,
    subscriptions: DashMap<String, NodeSubscription>,
    membership: Mutex<()>,
    saved: AtomicBool,
    kind: NodeKind,
}

impl Node {
    fn new(
        id: impl Into<String>,
        parent: Option<String>,
        creator: Jid,
        config: NodeConfig,
        kind: NodeKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent: RwLock::new(parent),
            creator,
            creation_date: now,
            modification_date: RwLock::new(now),
            config: RwLock::new(config),
            affiliates: RwLock::new(Arc::new(HashMap::new())),
            subscriptions: DashMap::new(),
            membership: Mutex::new(()),
            saved: AtomicBool::new(false),
            kind,
        }
    }

    /// Create an unsaved leaf node.
    pub fn new_leaf(
        id: impl Into<String>,
        parent: Option<String>,
        creator: Jid,
        config: NodeConfig,
        leaf: LeafConfig,
    ) -> Self {
        Self::new(id, parent, creator, config, NodeKind::Leaf(LeafNode::new(leaf)))
    }

    /// Create an unsaved collection node.
    pub fn new_collection(
        id: impl Into<String>,
        parent: Option<String>,
        creator: Jid,
        config: NodeConfig,
        collection: CollectionConfig,
    ) -> Self {
        Self::new(
            id,
            parent,
            creator,
            config,
            NodeKind::Collection(CollectionNode::new(collection)),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creator(&self) -> &Jid {
        &self.creator
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub fn modification_date(&self) -> DateTime<Utc> {
        *self
            .modification_date
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .modification_date
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    /// ID of the parent collection node. Only the root has none.
    pub fn parent_id(&self) -> Option<String> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_parent(&self, parent: Option<String>) {
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = parent;
    }

    /// Snapshot of the node configuration.
    pub fn config(&self) -> NodeConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, NodeKind::Collection(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn as_collection(&self) -> Option<&CollectionNode> {
        match &self.kind {
            NodeKind::Collection(collection) => Some(collection),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match &self.kind {
            NodeKind::Leaf(leaf) => Some(leaf),
            NodeKind::Collection(_) => None,
        }
    }

    /// Whether the node has been written to the persistence backend.
    /// Unsaved nodes skip per-entity persistence.
    pub fn is_saved(&self) -> bool {
        self.saved.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Hierarchy
    // ------------------------------------------------------------------

    /// Whether `node_id` is a direct child. Always false for leaf nodes.
    pub fn is_child_node(&self, node_id: &str) -> bool {
        self.as_collection()
            .is_some_and(|collection| collection.contains_child(node_id))
    }

    /// Whether `node_id` is a child or a descendant of any child.
    pub fn is_descendant_node(&self, nodes: &NodeRegistry, node_id: &str) -> bool {
        let Some(collection) = self.as_collection() else {
            return false;
        };
        if collection.contains_child(node_id) {
            return true;
        }
        collection.child_ids().iter().any(|child_id| {
            nodes
                .get(child_id)
                .is_some_and(|child| child.is_descendant_node(nodes, node_id))
        })
    }

    /// Chain of ancestors from the parent up to the root. Empty for the root.
    pub fn parents(&self, nodes: &NodeRegistry) -> Vec<Arc<Node>> {
        let mut parents = Vec::new();
        let mut next = self.parent_id();
        while let Some(parent_id) = next {
            let Some(parent) = nodes.get(&parent_id) else {
                break;
            };
            // Guard against a corrupted hierarchy looping back on itself.
            if parent.id == self.id || parents.iter().any(|p: &Arc<Node>| p.id == parent.id) {
                warn!(node = %self.id, parent = %parent_id, "Cycle in node hierarchy");
                break;
            }
            next = parent.parent_id();
            parents.push(parent);
        }
        parents
    }

    // ------------------------------------------------------------------
    // Affiliations
    // ------------------------------------------------------------------

    fn lock_membership(&self) -> MutexGuard<'_, ()> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the affiliate set. Later changes do not affect it.
    pub fn affiliate_snapshot(&self) -> Arc<HashMap<Jid, NodeAffiliate>> {
        self.affiliates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_affiliates<R>(&self, f: impl FnOnce(&mut HashMap<Jid, NodeAffiliate>) -> R) -> R {
        let mut guard = self.affiliates.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }

    /// All affiliates of the node.
    pub fn affiliates(&self) -> Vec<NodeAffiliate> {
        self.affiliate_snapshot().values().cloned().collect()
    }

    /// The affiliate record of exactly this address.
    pub fn affiliate(&self, jid: &Jid) -> Option<NodeAffiliate> {
        self.affiliate_snapshot().get(jid).cloned()
    }

    fn jids_with(&self, affiliation: Affiliation) -> Vec<Jid> {
        self.affiliate_snapshot()
            .values()
            .filter(|affiliate| affiliate.affiliation == affiliation)
            .map(|affiliate| affiliate.jid.clone())
            .collect()
    }

    pub fn owners(&self) -> Vec<Jid> {
        self.jids_with(Affiliation::Owner)
    }

    pub fn publishers(&self) -> Vec<Jid> {
        self.jids_with(Affiliation::Publisher)
    }

    /// Whether the entity may administer the node: an owner or a service
    /// admin. A full JID that does not match is retried as its bare JID.
    pub fn is_admin(&self, ctx: &ServiceContext, jid: &Jid) -> bool {
        let affiliates = self.affiliate_snapshot();
        let is_owner = |jid: &Jid| affiliates.get(jid).is_some_and(NodeAffiliate::is_owner);
        if is_owner(jid) || ctx.is_service_admin(jid) {
            return true;
        }
        if jid.resource().is_some() {
            let bare = Jid::from(jid.to_bare());
            return is_owner(&bare) || ctx.is_service_admin(&bare);
        }
        false
    }

    /// Grant owner affiliation. Creates a subscription for the entity if it
    /// has none; existing subscriptions (even pending ones) are untouched.
    #[instrument(skip(self, ctx), fields(node = %self.id, jid = %jid))]
    pub fn add_owner(&self, ctx: &ServiceContext, jid: &Jid) {
        let _membership = self.lock_membership();
        self.add_owner_locked(ctx, jid);
    }

    fn add_owner_locked(&self, ctx: &ServiceContext, jid: &Jid) {
        self.add_affiliation_locked(ctx, jid, Affiliation::Owner);
        self.ensure_subscription_locked(ctx, jid);
    }

    /// Revoke owner affiliation. The affiliate and its subscriptions are
    /// removed if the entity was an owner.
    #[instrument(skip(self, ctx), fields(node = %self.id, jid = %jid))]
    pub fn remove_owner(&self, ctx: &ServiceContext, jid: &Jid) {
        let _membership = self.lock_membership();
        self.remove_owner_locked(ctx, jid);
    }

    fn remove_owner_locked(&self, ctx: &ServiceContext, jid: &Jid) {
        if self.remove_affiliation_locked(ctx, jid, Affiliation::Owner) {
            self.remove_subscriptions_locked(ctx, jid);
        }
    }

    /// Grant publisher affiliation. Same subscription side effect as
    /// [`Node::add_owner`].
    #[instrument(skip(self, ctx), fields(node = %self.id, jid = %jid))]
    pub fn add_publisher(&self, ctx: &ServiceContext, jid: &Jid) {
        let _membership = self.lock_membership();
        self.add_publisher_locked(ctx, jid);
    }

    fn add_publisher_locked(&self, ctx: &ServiceContext, jid: &Jid) {
        self.add_affiliation_locked(ctx, jid, Affiliation::Publisher);
        self.ensure_subscription_locked(ctx, jid);
    }

    #[instrument(skip(self, ctx), fields(node = %self.id, jid = %jid))]
    pub fn remove_publisher(&self, ctx: &ServiceContext, jid: &Jid) {
        let _membership = self.lock_membership();
        self.remove_publisher_locked(ctx, jid);
    }

    fn remove_publisher_locked(&self, ctx: &ServiceContext, jid: &Jid) {
        if self.remove_affiliation_locked(ctx, jid, Affiliation::Publisher) {
            self.remove_subscriptions_locked(ctx, jid);
        }
    }

    /// Set affiliation `none`, which allows the entity to subscribe.
    #[instrument(skip(self, ctx), fields(node = %self.id, jid = %jid))]
    pub fn add_none_affiliation(&self, ctx: &ServiceContext, jid: &Jid) {
        let _membership = self.lock_membership();
        self.add_affiliation_locked(ctx, jid, Affiliation::None);
    }

    /// Ban the entity. All of its subscriptions are cancelled.
    #[instrument(skip(self, ctx), fields(node = %self.id, jid = %jid))]
    pub fn add_outcast(&self, ctx: &ServiceContext, jid: &Jid) {
        let _membership = self.lock_membership();
        self.add_affiliation_locked(ctx, jid, Affiliation::Outcast);
        self.remove_subscriptions_locked(ctx, jid);
    }

    /// Lift a ban. The entity is left with no affiliation at all.
    #[instrument(skip(self, ctx), fields(node = %self.id, jid = %jid))]
    pub fn remove_outcast(&self, ctx: &ServiceContext, jid: &Jid) {
        let _membership = self.lock_membership();
        self.remove_affiliation_locked(ctx, jid, Affiliation::Outcast);
    }

    fn add_affiliation_locked(&self, ctx: &ServiceContext, jid: &Jid, affiliation: Affiliation) {
        let change = self.update_affiliates(|affiliates| match affiliates.get_mut(jid) {
            Some(existing) if existing.affiliation == affiliation => None,
            Some(existing) => {
                existing.affiliation = affiliation;
                Some((existing.clone(), false))
            }
            None => {
                let affiliate = NodeAffiliate::new(self.id.clone(), jid.clone(), affiliation);
                affiliates.insert(jid.clone(), affiliate.clone());
                Some((affiliate, true))
            }
        });

        if let Some((affiliate, is_new)) = change {
            debug!(affiliation = %affiliation, is_new, "Affiliation set");
            self.persist(ctx, "save_affiliation", |store| {
                store.save_affiliation(self, &affiliate, is_new)
            });
        }
    }

    /// Delete the affiliate if its level matches. Returns whether it did.
    fn remove_affiliation_locked(
        &self,
        ctx: &ServiceContext,
        jid: &Jid,
        affiliation: Affiliation,
    ) -> bool {
        let removed = self.update_affiliates(|affiliates| {
            match affiliates.get(jid) {
                Some(existing) if existing.affiliation == affiliation => affiliates.remove(jid),
                _ => None,
            }
        });
        match removed {
            Some(affiliate) => {
                debug!(affiliation = %affiliation, "Affiliation removed");
                self.remove_affiliate_record(ctx, &affiliate);
                true
            }
            None => false,
        }
    }

    fn remove_affiliate_record(&self, ctx: &ServiceContext, affiliate: &NodeAffiliate) {
        self.persist(ctx, "remove_affiliation", |store| {
            store.remove_affiliation(self, affiliate)
        });
    }

    fn ensure_subscription_locked(&self, ctx: &ServiceContext, jid: &Jid) {
        let has_subscription = self.subscriptions.iter().any(|entry| &entry.owner == jid);
        if !has_subscription {
            self.add_subscription_locked(ctx, jid, jid, SubscriptionState::Subscribed, None);
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn subscription(&self, id: &str) -> Option<NodeSubscription> {
        self.subscriptions.get(id).map(|entry| entry.value().clone())
    }

    /// Subscriptions owned by the entity.
    pub fn subscriptions_of(&self, owner: &Jid) -> Vec<NodeSubscription> {
        self.subscriptions
            .iter()
            .filter(|entry| &entry.owner == owner)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn all_subscriptions(&self) -> Vec<NodeSubscription> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Subscriptions waiting for owner approval. Empty unless the access
    /// model requires authorization.
    pub fn pending_subscriptions(&self) -> Vec<NodeSubscription> {
        if !self.config().access_model.is_authorization_required() {
            return Vec::new();
        }
        self.subscriptions
            .iter()
            .filter(|entry| entry.is_authorization_pending())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Subscribe `subscriber` on behalf of `owner`.
    ///
    /// Creates a `none` affiliate for the owner if it has none. The initial
    /// state is `pending` when owner approval is required, else
    /// `unconfigured` when the node requires configuration, else
    /// `subscribed`.
    ///
    /// Outcasts are refused with [`PubSubError::Forbidden`]. A second
    /// request for a subscriber that is still awaiting approval is refused
    /// with [`PubSubError::PendingSubscription`]. Neither changes any state.
    #[instrument(skip(self, ctx, options), fields(node = %self.id, owner = %owner, subscriber = %subscriber))]
    pub fn create_subscription(
        &self,
        ctx: &ServiceContext,
        owner: &Jid,
        subscriber: &Jid,
        options: Option<&SubscriptionOptions>,
    ) -> Result<NodeSubscription, PubSubError> {
        let subscription = {
            let _membership = self.lock_membership();
            let affiliation = self.affiliate(owner).map(|affiliate| affiliate.affiliation);
            if affiliation == Some(Affiliation::Outcast) {
                debug!("Subscription refused, entity is an outcast");
                return Err(PubSubError::forbidden(format!(
                    "{owner} is banned from node '{}'",
                    self.id
                )));
            }

            let config = self.config();
            let state = if config.access_model.is_authorization_required()
                && !self.is_admin(ctx, owner)
            {
                SubscriptionState::Pending
            } else if config.subscription_required {
                SubscriptionState::Unconfigured
            } else {
                SubscriptionState::Subscribed
            };
            if state == SubscriptionState::Pending && self.has_pending_subscription(subscriber) {
                debug!("Subscription refused, approval already pending");
                return Err(PubSubError::pending_subscription(format!(
                    "{subscriber} already awaits approval on node '{}'",
                    self.id
                )));
            }

            if affiliation.is_none() {
                self.add_affiliation_locked(ctx, owner, Affiliation::None);
            }
            self.add_subscription_locked(ctx, owner, subscriber, state, options)
        };

        if subscription.is_authorization_pending() {
            notify::send_authorization_request(ctx, self, &subscription);
        } else {
            notify::send_last_published_item(ctx, self, &subscription);
        }
        Ok(subscription)
    }

    fn has_pending_subscription(&self, subscriber: &Jid) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| &entry.jid == subscriber && entry.is_authorization_pending())
    }

    fn add_subscription_locked(
        &self,
        ctx: &ServiceContext,
        owner: &Jid,
        jid: &Jid,
        state: SubscriptionState,
        options: Option<&SubscriptionOptions>,
    ) -> NodeSubscription {
        let mut id = generate_subscription_id();
        while self.subscriptions.contains_key(&id) {
            id = generate_subscription_id();
        }

        let mut subscription =
            NodeSubscription::new(id.clone(), self.id.clone(), owner.clone(), jid.clone(), state);
        if let Some(options) = options {
            if subscription.apply_options(options)
                && subscription.state == SubscriptionState::Unconfigured
            {
                subscription.state = SubscriptionState::Subscribed;
            }
        }
        self.subscriptions.insert(id, subscription.clone());

        debug!(subscription = %subscription.id, state = %subscription.state, "Subscription created");
        metrics::record_subscription_created(&subscription.state.to_string());
        self.persist(ctx, "save_subscription", |store| {
            store.save_subscription(self, &subscription, true)
        });
        subscription
    }

    /// Cancel a subscription. If the owner's affiliation is `none` and this
    /// was its last subscription, the affiliate is removed too.
    #[instrument(skip(self, ctx), fields(node = %self.id))]
    pub fn cancel_subscription(&self, ctx: &ServiceContext, id: &str) -> Option<NodeSubscription> {
        let _membership = self.lock_membership();
        self.cancel_subscription_locked(ctx, id)
    }

    fn cancel_subscription_locked(
        &self,
        ctx: &ServiceContext,
        id: &str,
    ) -> Option<NodeSubscription> {
        let (_, subscription) = self.subscriptions.remove(id)?;
        debug!(subscription = %id, owner = %subscription.owner, "Subscription cancelled");
        metrics::record_subscription_cancelled();

        let owner = &subscription.owner;
        let collect = self
            .affiliate(owner)
            .is_some_and(|affiliate| affiliate.affiliation == Affiliation::None)
            && !self.subscriptions.iter().any(|entry| &entry.owner == owner);
        if collect {
            let removed = self.update_affiliates(|affiliates| affiliates.remove(owner));
            if let Some(affiliate) = removed {
                debug!(jid = %owner, "Removed affiliate without subscriptions");
                self.remove_affiliate_record(ctx, &affiliate);
            }
        }

        self.persist(ctx, "remove_subscription", |store| {
            store.remove_subscription(self, &subscription)
        });
        Some(subscription)
    }

    fn remove_subscriptions_locked(&self, ctx: &ServiceContext, owner: &Jid) {
        let ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| &entry.owner == owner)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, subscription)) = self.subscriptions.remove(&id) {
                metrics::record_subscription_cancelled();
                self.persist(ctx, "remove_subscription", |store| {
                    store.remove_subscription(self, &subscription)
                });
            }
        }
    }

    /// Apply subscription options.
    ///
    /// When an `unconfigured` subscription gets delivery options it becomes
    /// `pending` (and owners are asked to approve) or `subscribed` (and the
    /// last published item is sent).
    #[instrument(skip(self, ctx, options), fields(node = %self.id))]
    pub fn configure_subscription(
        &self,
        ctx: &ServiceContext,
        id: &str,
        options: &SubscriptionOptions,
    ) -> Option<NodeSubscription> {
        let (subscription, was_unconfigured) = {
            let _membership = self.lock_membership();
            let owner = self.subscriptions.get(id)?.owner.clone();
            let authorization_required = self.config().access_model.is_authorization_required()
                && !self.is_admin(ctx, &owner);

            let mut entry = self.subscriptions.get_mut(id)?;
            let was_unconfigured = entry.state == SubscriptionState::Unconfigured;
            if entry.apply_options(options) && was_unconfigured {
                entry.state = if authorization_required {
                    SubscriptionState::Pending
                } else {
                    SubscriptionState::Subscribed
                };
            }
            let subscription = entry.value().clone();
            drop(entry);

            debug!(subscription = %id, state = %subscription.state, "Subscription configured");
            self.persist(ctx, "save_subscription", |store| {
                store.save_subscription(self, &subscription, false)
            });
            (subscription, was_unconfigured)
        };

        if was_unconfigured {
            match subscription.state {
                SubscriptionState::Pending => {
                    notify::send_authorization_request(ctx, self, &subscription)
                }
                SubscriptionState::Subscribed => {
                    notify::send_last_published_item(ctx, self, &subscription)
                }
                _ => {}
            }
        }
        Some(subscription)
    }

    /// Answer a pending subscription request. Approval activates the
    /// subscription; rejection cancels it. Returns `None` if the
    /// subscription does not exist or is not pending.
    #[instrument(skip(self, ctx), fields(node = %self.id))]
    pub fn approve_subscription(
        &self,
        ctx: &ServiceContext,
        id: &str,
        approved: bool,
    ) -> Option<NodeSubscription> {
        let subscription = {
            let _membership = self.lock_membership();
            if !self.subscriptions.get(id)?.is_authorization_pending() {
                return None;
            }
            if !approved {
                info!(subscription = %id, "Subscription request rejected");
                return self.cancel_subscription_locked(ctx, id);
            }

            let mut entry = self.subscriptions.get_mut(id)?;
            entry.state = SubscriptionState::Subscribed;
            let subscription = entry.value().clone();
            drop(entry);

            info!(subscription = %id, "Subscription request approved");
            self.persist(ctx, "save_subscription", |store| {
                store.save_subscription(self, &subscription, false)
            });
            subscription
        };

        notify::send_last_published_item(ctx, self, &subscription);
        Some(subscription)
    }

    /// Cancel every subscription that expired before `now`. Returns the
    /// cancelled subscriptions.
    pub fn cancel_expired_subscriptions(
        &self,
        ctx: &ServiceContext,
        now: DateTime<Utc>,
    ) -> Vec<NodeSubscription> {
        let expired: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }

        let _membership = self.lock_membership();
        expired
            .iter()
            .filter_map(|id| self.cancel_subscription_locked(ctx, id))
            .collect()
    }

    // ------------------------------------------------------------------
    // Configuration and persistence
    // ------------------------------------------------------------------

    /// Apply a configuration change.
    ///
    /// An update whose owner list is empty is rejected before anything
    /// changes, as is a `children` list naming unknown nodes, this node or
    /// one of its ancestors. An owner named in the publisher list stays an
    /// owner.
    #[instrument(skip(self, ctx, update), fields(node = %self.id))]
    pub fn configure(
        &self,
        ctx: &ServiceContext,
        update: NodeConfigUpdate,
    ) -> Result<(), PubSubError> {
        if update.owners.as_ref().is_some_and(Vec::is_empty) {
            return Err(PubSubError::not_acceptable(format!(
                "Node '{}' must keep at least one owner",
                self.id
            )));
        }
        let children = match &update.children {
            Some(children) => Some(self.resolve_children(ctx, children)?),
            None => None,
        };

        {
            let _membership = self.lock_membership();
            {
                let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
                update.apply_to(&mut config);
            }
            match &self.kind {
                NodeKind::Leaf(leaf) => leaf.update_config(|config| update.apply_to_leaf(config)),
                NodeKind::Collection(collection) => {
                    collection.update_config(|config| update.apply_to_collection(config))
                }
            }

            if let Some(owners) = &update.owners {
                let current = self.owners();
                for jid in current.iter().filter(|jid| !owners.contains(jid)) {
                    self.remove_owner_locked(ctx, jid);
                }
                for jid in owners.iter().filter(|jid| !current.contains(jid)) {
                    self.add_owner_locked(ctx, jid);
                }
            }
            if let Some(publishers) = &update.publishers {
                // Owners keep their level when also listed as publishers.
                let owners = self.owners();
                let current = self.publishers();
                for jid in current.iter().filter(|jid| !publishers.contains(jid)) {
                    self.remove_publisher_locked(ctx, jid);
                }
                for jid in publishers
                    .iter()
                    .filter(|jid| !current.contains(jid) && !owners.contains(jid))
                {
                    self.add_publisher_locked(ctx, jid);
                }
            }
            self.touch();
        }

        if self.is_leaf() {
            self.enforce_retention(ctx);
        }
        if let Some(children) = children {
            self.set_children(ctx, children);
        }

        debug!("Node configuration updated");
        if self.is_saved() {
            if self.config().notify_config {
                notify::broadcast_node_event(ctx, self, EventKind::ConfigurationChanged, false);
            }
            self.persist(ctx, "update_node", |store| store.update_node(self));
        }
        Ok(())
    }

    /// Write the node to the persistence backend.
    ///
    /// The first save creates the node and then writes every current
    /// affiliate and subscription. A failed create leaves the node unsaved
    /// and is returned to the caller. Later saves update the node
    /// best-effort.
    pub fn save(&self, ctx: &ServiceContext) -> Result<(), PubSubError> {
        if self.is_saved() {
            self.persist(ctx, "update_node", |store| store.update_node(self));
            return Ok(());
        }

        ctx.persistence.create_node(self).inspect_err(|e| {
            metrics::record_persistence_failure("create_node");
            warn!(node = %self.id, error = %e, "Failed to create node in store");
        })?;
        self.saved.store(true, Ordering::Release);

        for affiliate in self.affiliate_snapshot().values() {
            self.persist(ctx, "save_affiliation", |store| {
                store.save_affiliation(self, affiliate, true)
            });
        }
        for subscription in self.all_subscriptions() {
            self.persist(ctx, "save_subscription", |store| {
                store.save_subscription(self, &subscription, true)
            });
        }
        info!(node = %self.id, "Node saved");
        Ok(())
    }

    /// Drop every affiliate and subscription and stop writing to the store.
    /// Used after deletion.
    pub(crate) fn clear(&self) {
        let _membership = self.lock_membership();
        self.saved.store(false, Ordering::Release);
        self.update_affiliates(HashMap::clear);
        self.subscriptions.clear();
    }

    /// Run a persistence write if the node is saved. Failures are logged
    /// and never undo the in-memory change.
    fn persist(
        &self,
        ctx: &ServiceContext,
        operation: &'static str,
        write: impl FnOnce(&dyn PubSubPersistence) -> Result<(), PubSubError>,
    ) {
        if !self.is_saved() {
            return;
        }
        if let Err(e) = write(ctx.persistence.as_ref()) {
            metrics::record_persistence_failure(operation);
            warn!(node = %self.id, operation, error = %e, "Persistence write failed");
        }
    }
}
