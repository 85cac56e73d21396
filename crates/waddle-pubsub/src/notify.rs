//! Event notifications and fan-out.
//!
//! Every event is turned into at most one delivery per distinct recipient
//! address. Subscriptions that pass their filters are grouped by delivery
//! address, and the matched subscription IDs travel with the notification
//! so the protocol layer can add them as SHIM headers.
//!
//! Item events (publish, retract) reach subscribers of the leaf node and of
//! every ancestor collection. Structural events (purge, configuration
//! change, delete) only reach the node's own subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use jid::Jid;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::item::PublishedItem;
use crate::metrics;
use crate::node::{Node, NodeSubscription};
use crate::service::ServiceContext;

/// What happened on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// An item was published. `item` is `None` when the node keeps no item
    /// records. `delayed` marks a replay of the last item to a new
    /// subscriber.
    Published {
        item: Option<Arc<PublishedItem>>,
        delayed: bool,
    },
    /// Items were retracted.
    Retracted { item_ids: Vec<String> },
    /// All items but the newest were removed.
    Purged,
    /// The node was deleted.
    Deleted,
    /// The node configuration changed.
    ConfigurationChanged,
    /// A node became a child of this collection.
    ChildAssociated { child_id: String },
    /// A node stopped being a child of this collection.
    ChildDisassociated { child_id: String },
    /// A subscription awaits approval by an owner.
    AuthorizationRequest {
        subscription_id: String,
        subscriber: Jid,
    },
}

impl EventKind {
    /// Short name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Published { .. } => "items",
            EventKind::Retracted { .. } => "retract",
            EventKind::Purged => "purge",
            EventKind::Deleted => "delete",
            EventKind::ConfigurationChanged => "configuration",
            EventKind::ChildAssociated { .. } => "associate",
            EventKind::ChildDisassociated { .. } => "disassociate",
            EventKind::AuthorizationRequest { .. } => "authorization",
        }
    }
}

/// An event notification, before wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Node the event is about.
    pub node_id: String,
    pub kind: EventKind,
    /// Whether item payloads should be included.
    pub include_payload: bool,
    /// Whether a human-readable body should be added.
    pub include_body: bool,
}

/// Sends notifications towards recipients.
///
/// Called once per distinct address per event. Implementations must not
/// block; delivery is fire-and-forget and never retried by the engine.
pub trait NotificationDelivery: Send + Sync {
    fn deliver(&self, to: &Jid, notification: &Notification, subscription_ids: &[String]);
}

/// A notification queued for a recipient.
#[derive(Debug, Clone)]
pub struct OutboundNotification {
    pub to: Jid,
    pub notification: Notification,
    pub subscription_ids: Vec<String>,
}

/// Result of handing a notification to the outbound channel.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Queued for delivery
    Sent,
    /// The channel is full (backpressure); the notification was dropped
    ChannelFull,
    /// The receiving side is gone
    ChannelClosed,
}

/// Delivery over a bounded tokio channel, drained by the stanza router.
#[derive(Debug, Clone)]
pub struct ChannelDelivery {
    sender: mpsc::Sender<OutboundNotification>,
}

impl ChannelDelivery {
    /// Create a delivery channel with the given capacity.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundNotification>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn send(&self, outbound: OutboundNotification) -> DeliveryResult {
        match self.sender.try_send(outbound) {
            Ok(()) => DeliveryResult::Sent,
            Err(mpsc::error::TrySendError::Full(outbound)) => {
                warn!(to = %outbound.to, node = %outbound.notification.node_id, "Notification channel full, dropping notification");
                DeliveryResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(outbound)) => {
                debug!(to = %outbound.to, "Notification channel closed");
                DeliveryResult::ChannelClosed
            }
        }
    }
}

impl NotificationDelivery for ChannelDelivery {
    fn deliver(&self, to: &Jid, notification: &Notification, subscription_ids: &[String]) {
        self.send(OutboundNotification {
            to: to.clone(),
            notification: notification.clone(),
            subscription_ids: subscription_ids.to_vec(),
        });
    }
}

/// Matched subscriptions grouped by delivery address.
#[derive(Debug, Default)]
struct Recipients {
    by_address: HashMap<Jid, Recipient>,
}

#[derive(Debug, Default)]
struct Recipient {
    subscription_ids: Vec<String>,
    include_body: bool,
}

impl Recipients {
    fn add(&mut self, subscription: &NodeSubscription) {
        let recipient = self.by_address.entry(subscription.jid.clone()).or_default();
        if !recipient.subscription_ids.contains(&subscription.id) {
            recipient.subscription_ids.push(subscription.id.clone());
        }
        recipient.include_body |= subscription.include_body;
    }

    fn dispatch(self, ctx: &ServiceContext, node_id: &str, kind: EventKind, include_payload: bool) {
        let event = kind.name();
        debug!(node = %node_id, event, recipients = self.by_address.len(), "Dispatching notification");
        for (to, recipient) in self.by_address {
            let notification = Notification {
                node_id: node_id.to_string(),
                kind: kind.clone(),
                include_payload,
                include_body: recipient.include_body,
            };
            ctx.delivery
                .deliver(&to, &notification, &recipient.subscription_ids);
            metrics::record_notification_sent(event);
        }
    }
}

/// Fan out an item event from `leaf` to the subscribers of the leaf and of
/// every ancestor collection.
///
/// Each (node, affiliate) pair is visited once. A subscription passes when
/// it is active, wants notifications, matches the presence and keyword
/// filters and, on a collection, has type `items` and reaches the leaf at
/// its depth.
pub(crate) fn broadcast_item_event(
    ctx: &ServiceContext,
    leaf: &Node,
    kind: EventKind,
    item: Option<&PublishedItem>,
) {
    let mut recipients = Recipients::default();
    let mut visited: HashSet<(String, Jid)> = HashSet::new();

    let mut collect = |node: &Node, owner: &Jid, recipients: &mut Recipients| {
        if !visited.insert((node.id().to_string(), owner.clone())) {
            return;
        }
        for subscription in node.subscriptions_of(owner) {
            if subscription.can_send_publication_event(ctx, node, leaf, item) {
                recipients.add(&subscription);
            }
        }
    };

    for owner in leaf.affiliate_snapshot().keys() {
        collect(leaf, owner, &mut recipients);
    }
    for ancestor in leaf.parents(&ctx.nodes) {
        let owners: HashSet<Jid> = ancestor
            .all_subscriptions()
            .into_iter()
            .map(|subscription| subscription.owner)
            .collect();
        for owner in &owners {
            collect(ancestor.as_ref(), owner, &mut recipients);
        }
    }

    let include_payload = leaf.config().deliver_payloads;
    recipients.dispatch(ctx, leaf.id(), kind, include_payload);
}

/// Send a structural event to the node's own subscribers. With
/// `include_all` subscriptions that are not approved are included too.
pub(crate) fn broadcast_node_event(
    ctx: &ServiceContext,
    node: &Node,
    kind: EventKind,
    include_all: bool,
) {
    let mut recipients = Recipients::default();
    for subscription in node.all_subscriptions() {
        if subscription.can_send_node_event(ctx, node, include_all) {
            recipients.add(&subscription);
        }
    }
    recipients.dispatch(ctx, node.id(), kind, false);
}

/// Tell `nodes`-type subscribers of `parent` and its ancestors that a child
/// was associated or disassociated.
pub(crate) fn broadcast_child_event(ctx: &ServiceContext, parent: &Node, kind: EventKind) {
    let mut recipients = Recipients::default();
    let mut collect = |node: &Node, distance: usize| {
        for subscription in node.all_subscriptions() {
            if subscription.can_send_child_node_event(ctx, node, distance) {
                recipients.add(&subscription);
            }
        }
    };

    collect(parent, 1);
    for (index, ancestor) in parent.parents(&ctx.nodes).iter().enumerate() {
        collect(ancestor.as_ref(), index + 2);
    }
    recipients.dispatch(ctx, parent.id(), kind, false);
}

/// Replay the node's last item to a new or newly activated subscription.
pub(crate) fn send_last_published_item(
    ctx: &ServiceContext,
    node: &Node,
    subscription: &NodeSubscription,
) {
    let config = node.config();
    if !config.send_item_subscribe {
        return;
    }
    let Some(item) = node.last_published_item() else {
        return;
    };
    if !subscription.can_send_publication_event(ctx, node, node, Some(&item)) {
        return;
    }

    let mut recipients = Recipients::default();
    recipients.add(subscription);
    recipients.dispatch(
        ctx,
        node.id(),
        EventKind::Published {
            item: Some(item),
            delayed: true,
        },
        config.deliver_payloads,
    );
}

/// Ask every owner to approve a pending subscription.
pub(crate) fn send_authorization_request(
    ctx: &ServiceContext,
    node: &Node,
    subscription: &NodeSubscription,
) {
    let notification = Notification {
        node_id: node.id().to_string(),
        kind: EventKind::AuthorizationRequest {
            subscription_id: subscription.id.clone(),
            subscriber: subscription.jid.clone(),
        },
        include_payload: false,
        include_body: false,
    };
    for owner in node.owners() {
        debug!(node = %node.id(), owner = %owner, subscription = %subscription.id, "Requesting subscription approval");
        ctx.delivery.deliver(&owner, &notification, &[]);
        metrics::record_notification_sent(notification.kind.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    fn notification() -> Notification {
        Notification {
            node_id: "news".to_string(),
            kind: EventKind::Purged,
            include_payload: false,
            include_body: false,
        }
    }

    #[test]
    fn test_channel_delivery_sends() {
        let (delivery, mut receiver) = ChannelDelivery::new(4);
        delivery.deliver(&jid("ann@example.com/phone"), &notification(), &["sub1".to_string()]);

        let outbound = receiver.try_recv().expect("queued notification");
        assert_eq!(outbound.to, jid("ann@example.com/phone"));
        assert_eq!(outbound.subscription_ids, vec!["sub1".to_string()]);
        assert_eq!(outbound.notification.kind, EventKind::Purged);
    }

    #[test]
    fn test_channel_delivery_full_and_closed() {
        let (delivery, receiver) = ChannelDelivery::new(1);
        let outbound = OutboundNotification {
            to: jid("ann@example.com"),
            notification: notification(),
            subscription_ids: Vec::new(),
        };

        assert_eq!(delivery.send(outbound.clone()), DeliveryResult::Sent);
        assert_eq!(delivery.send(outbound.clone()), DeliveryResult::ChannelFull);

        drop(receiver);
        assert_eq!(delivery.send(outbound), DeliveryResult::ChannelClosed);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::Deleted.name(), "delete");
        assert_eq!(
            EventKind::Retracted {
                item_ids: vec!["a".to_string()]
            }
            .name(),
            "retract"
        );
    }
}
