//! Leaf nodes and their published-item log.
//!
//! The log is a chronological `VecDeque` plus an index by item ID, both
//! behind one mutex. Publish (resolve ID, evict, append) and snapshot reads
//! take that mutex, so concurrent publishers cannot interleave and readers
//! never see a half-applied publish.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use jid::Jid;
use tracing::{debug, instrument};

use super::{LeafConfig, Node};
use crate::error::PubSubError;
use crate::item::PublishedItem;
use crate::metrics;
use crate::notify::{self, EventKind};
use crate::service::ServiceContext;

/// Leaf-specific node state.
#[derive(Debug)]
pub struct LeafNode {
    config: RwLock<LeafConfig>,
    log: Mutex<ItemLog>,
}

impl LeafNode {
    pub(crate) fn new(config: LeafConfig) -> Self {
        Self {
            config: RwLock::new(config),
            log: Mutex::new(ItemLog::default()),
        }
    }

    pub fn config(&self) -> LeafConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update_config(&self, f: impl FnOnce(&mut LeafConfig)) {
        f(&mut self.config.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// Whether publishing creates an item record: the node persists items
    /// or delivers payloads.
    pub fn is_item_required(&self, node: &Node) -> bool {
        self.config().persist_items || node.config().deliver_payloads
    }

    fn lock_log(&self) -> MutexGuard<'_, ItemLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Chronological item log with an ID index.
#[derive(Debug, Default)]
struct ItemLog {
    items: VecDeque<Arc<PublishedItem>>,
    index: HashMap<String, Arc<PublishedItem>>,
}

impl ItemLog {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Evict from the front until there is room, then append.
    fn push(&mut self, item: Arc<PublishedItem>, max_items: usize) -> Vec<Arc<PublishedItem>> {
        let mut evicted = Vec::new();
        while !self.items.is_empty() && self.items.len() >= max_items {
            if let Some(oldest) = self.pop_oldest() {
                evicted.push(oldest);
            }
        }
        self.index.insert(item.id.clone(), item.clone());
        self.items.push_back(item);
        evicted
    }

    /// Evict from the front until at most `max_items` remain.
    fn trim(&mut self, max_items: usize) -> Vec<Arc<PublishedItem>> {
        let mut evicted = Vec::new();
        while self.items.len() > max_items {
            if let Some(oldest) = self.pop_oldest() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    fn pop_oldest(&mut self) -> Option<Arc<PublishedItem>> {
        let oldest = self.items.pop_front()?;
        self.index.remove(&oldest.id);
        Some(oldest)
    }

    fn remove(&mut self, id: &str) -> Option<Arc<PublishedItem>> {
        let item = self.index.remove(id)?;
        self.items.retain(|entry| entry.id != id);
        Some(item)
    }

    fn get(&self, id: &str) -> Option<Arc<PublishedItem>> {
        self.index.get(id).cloned()
    }

    fn last(&self) -> Option<Arc<PublishedItem>> {
        self.items.back().cloned()
    }

    /// The newest `count` items, oldest first.
    fn latest(&self, count: usize) -> Vec<Arc<PublishedItem>> {
        let skip = self.items.len().saturating_sub(count);
        self.items.iter().skip(skip).cloned().collect()
    }
}

fn generate_item_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Node {
    fn leaf_or_not_allowed(&self, operation: &str) -> Result<&LeafNode, PubSubError> {
        self.as_leaf().ok_or_else(|| {
            PubSubError::not_allowed(format!(
                "Cannot {} on collection node '{}'",
                operation, self.id
            ))
        })
    }

    /// Publish to a leaf node.
    ///
    /// When the node neither persists items nor delivers payloads no item
    /// is kept and subscribers get an item-less notification. Otherwise the
    /// supplied ID is used unless it is taken (or absent), in which case a
    /// fresh one is generated. The oldest items are evicted so the log
    /// never exceeds its capacity. Returns the new item, if one was created.
    #[instrument(skip(self, ctx, payload), fields(node = %self.id, publisher = %publisher))]
    pub fn publish(
        &self,
        ctx: &ServiceContext,
        publisher: &Jid,
        item_id: Option<&str>,
        payload: Option<String>,
    ) -> Result<Option<Arc<PublishedItem>>, PubSubError> {
        let leaf = self.leaf_or_not_allowed("publish")?;
        let leaf_config = leaf.config();

        let mut evicted = Vec::new();
        let item = if leaf.is_item_required(self) {
            let mut log = leaf.lock_log();
            let mut id = item_id.map(str::to_string).unwrap_or_else(generate_item_id);
            while log.contains(&id) {
                id = generate_item_id();
            }
            let item = Arc::new(PublishedItem::new(
                self.id.clone(),
                id,
                publisher.clone(),
                payload,
            ));
            evicted = log.push(item.clone(), leaf_config.effective_max_items());
            Some(item)
        } else {
            None
        };

        if let Some(item) = &item {
            debug!(item = %item.id, evicted = evicted.len(), "Item published");
            if leaf_config.persist_items {
                self.persist(ctx, "save_published_item", |store| {
                    store.save_published_item(item)
                });
            }
        }
        self.remove_items_from_store(ctx, &evicted);
        metrics::record_item_published(&self.id);
        metrics::record_items_evicted(&self.id, evicted.len() as u64);

        notify::broadcast_item_event(
            ctx,
            self,
            EventKind::Published {
                item: item.clone(),
                delayed: false,
            },
            item.as_deref(),
        );
        Ok(item)
    }

    /// Remove every item except the most recent one. Does nothing when the
    /// log holds at most one item.
    #[instrument(skip(self, ctx), fields(node = %self.id))]
    pub fn purge(&self, ctx: &ServiceContext) -> Result<(), PubSubError> {
        let leaf = self.leaf_or_not_allowed("purge")?;
        let removed = {
            let mut log = leaf.lock_log();
            if log.len() <= 1 {
                return Ok(());
            }
            log.trim(1)
        };

        debug!(removed = removed.len(), "Node purged");
        self.remove_items_from_store(ctx, &removed);
        notify::broadcast_node_event(ctx, self, EventKind::Purged, false);
        Ok(())
    }

    /// Retract items by ID. Unknown IDs are ignored. Returns the removed
    /// items.
    #[instrument(skip(self, ctx), fields(node = %self.id))]
    pub fn retract_items(
        &self,
        ctx: &ServiceContext,
        item_ids: &[String],
    ) -> Result<Vec<Arc<PublishedItem>>, PubSubError> {
        let leaf = self.leaf_or_not_allowed("retract items")?;
        let removed: Vec<Arc<PublishedItem>> = {
            let mut log = leaf.lock_log();
            item_ids.iter().filter_map(|id| log.remove(id)).collect()
        };
        if removed.is_empty() {
            return Ok(removed);
        }

        debug!(removed = removed.len(), "Items retracted");
        self.remove_items_from_store(ctx, &removed);
        if self.config().notify_retract {
            let item_ids = removed.iter().map(|item| item.id.clone()).collect();
            notify::broadcast_item_event(ctx, self, EventKind::Retracted { item_ids }, None);
        }
        Ok(removed)
    }

    /// The newest `count` items in publication order. Empty for collection
    /// nodes.
    pub fn get_published_items(&self, count: usize) -> Vec<Arc<PublishedItem>> {
        self.as_leaf()
            .map(|leaf| leaf.lock_log().latest(count))
            .unwrap_or_default()
    }

    /// Every retained item in publication order.
    pub fn all_published_items(&self) -> Vec<Arc<PublishedItem>> {
        self.get_published_items(usize::MAX)
    }

    pub fn get_published_item(&self, item_id: &str) -> Option<Arc<PublishedItem>> {
        self.as_leaf()?.lock_log().get(item_id)
    }

    pub fn last_published_item(&self) -> Option<Arc<PublishedItem>> {
        self.as_leaf()?.lock_log().last()
    }

    /// Trim the log to the current capacity. Called after configuration
    /// changes that may shrink it.
    pub(crate) fn enforce_retention(&self, ctx: &ServiceContext) {
        let Some(leaf) = self.as_leaf() else {
            return;
        };
        let max_items = leaf.config().effective_max_items();
        let evicted = leaf.lock_log().trim(max_items);
        if !evicted.is_empty() {
            debug!(node = %self.id, evicted = evicted.len(), max_items, "Log trimmed to new capacity");
            self.remove_items_from_store(ctx, &evicted);
            metrics::record_items_evicted(&self.id, evicted.len() as u64);
        }
    }

    fn remove_items_from_store(&self, ctx: &ServiceContext, items: &[Arc<PublishedItem>]) {
        for item in items {
            self.persist(ctx, "remove_published_item", |store| {
                store.remove_published_item(item)
            });
        }
    }
}
