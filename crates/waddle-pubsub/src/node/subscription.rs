//! Node subscriptions and the per-subscription delivery filters.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jid::Jid;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Node;
use crate::item::PublishedItem;
use crate::presence::Show;
use crate::service::ServiceContext;
use crate::types::{SubscriptionDepth, SubscriptionState, SubscriptionType};

/// Length of generated subscription IDs.
const SUBSCRIPTION_ID_LEN: usize = 40;

/// Default digest frequency in milliseconds (one day).
pub const DEFAULT_DIGEST_FREQUENCY: u64 = 86_400_000;

/// Generate a random alphanumeric subscription ID.
pub(crate) fn generate_subscription_id() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(SUBSCRIPTION_ID_LEN)
        .map(char::from)
        .collect()
}

/// An entity's registration to receive events from a node.
///
/// `owner` is the affiliated entity; `jid` is where notifications go and may
/// differ from the owner (typically by resource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSubscription {
    /// Server-generated ID, unique within the node.
    pub id: String,
    /// ID of the subscribed node.
    pub node_id: String,
    /// Affiliated entity that owns the subscription.
    pub owner: Jid,
    /// Delivery address.
    pub jid: Jid,
    /// Lifecycle state.
    pub state: SubscriptionState,
    /// Set while the node requires configuration and the subscriber has not
    /// configured the subscription yet.
    pub configuration_pending: bool,
    pub deliver_notifications: bool,
    pub using_digest: bool,
    /// Digest frequency in milliseconds.
    pub digest_frequency: u64,
    /// When the subscription stops being active.
    pub expire: Option<DateTime<Utc>>,
    pub include_body: bool,
    /// Presence show values for which notifications are delivered. Empty
    /// means no presence filter.
    pub presence_states: HashSet<Show>,
    /// Only meaningful for subscriptions to collection nodes.
    pub subscription_type: SubscriptionType,
    /// Only meaningful for subscriptions to collection nodes.
    pub depth: SubscriptionDepth,
    /// Only items whose payload contains this keyword are delivered.
    pub keyword: Option<String>,
}

impl NodeSubscription {
    pub fn new(
        id: impl Into<String>,
        node_id: impl Into<String>,
        owner: Jid,
        jid: Jid,
        state: SubscriptionState,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            owner,
            jid,
            state,
            configuration_pending: state == SubscriptionState::Unconfigured,
            deliver_notifications: true,
            using_digest: false,
            digest_frequency: DEFAULT_DIGEST_FREQUENCY,
            expire: None,
            include_body: false,
            presence_states: HashSet::new(),
            subscription_type: SubscriptionType::default(),
            depth: SubscriptionDepth::default(),
            keyword: None,
        }
    }

    /// Whether an owner approved the subscription.
    pub fn is_approved(&self) -> bool {
        self.state == SubscriptionState::Subscribed
    }

    pub fn is_authorization_pending(&self) -> bool {
        self.state == SubscriptionState::Pending
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire.is_some_and(|expire| expire <= now)
    }

    /// Whether the subscription is eligible for delivery: approved,
    /// configured if required, and not expired.
    pub fn is_active(&self) -> bool {
        self.is_approved() && !self.configuration_pending && !self.is_expired(Utc::now())
    }

    /// Whether the item passes the keyword filter. No keyword passes all.
    pub fn keyword_matches(&self, item: &PublishedItem) -> bool {
        match self.keyword.as_deref() {
            Some(keyword) if !keyword.is_empty() => item.contains_keyword(keyword),
            _ => true,
        }
    }

    /// Apply subscription options. Returns true if a delivery option was
    /// supplied, which counts as the subscriber configuring the subscription.
    pub fn apply_options(&mut self, options: &SubscriptionOptions) -> bool {
        if let Some(subscription_type) = options.subscription_type {
            self.subscription_type = subscription_type;
        }
        if let Some(depth) = options.depth {
            self.depth = depth;
        }
        if !options.has_delivery_options() {
            return false;
        }
        if let Some(deliver) = options.deliver {
            self.deliver_notifications = deliver;
        }
        if let Some(digest) = options.digest {
            self.using_digest = digest;
        }
        if let Some(frequency) = options.digest_frequency {
            self.digest_frequency = frequency;
        }
        if let Some(expire) = options.expire {
            self.expire = Some(expire);
        }
        if let Some(include_body) = options.include_body {
            self.include_body = include_body;
        }
        if let Some(states) = &options.show_values {
            self.presence_states = states.clone();
        }
        if let Some(keyword) = &options.keyword {
            self.keyword = (!keyword.is_empty()).then(|| keyword.clone());
        }
        self.configuration_pending = false;
        true
    }

    /// Active-state, deliver flag and presence checks shared by every event.
    pub(crate) fn can_send_events(&self, ctx: &ServiceContext, node: &Node) -> bool {
        self.is_active() && self.deliver_notifications && self.presence_allows(ctx, node)
    }

    /// Whether a publication (or retraction) on `leaf` should reach this
    /// subscription. `node` is the node the subscription belongs to: the
    /// leaf itself or one of its ancestors.
    pub(crate) fn can_send_publication_event(
        &self,
        ctx: &ServiceContext,
        node: &Node,
        leaf: &Node,
        item: Option<&PublishedItem>,
    ) -> bool {
        if !self.can_send_events(ctx, node) {
            return false;
        }
        if let Some(item) = item {
            if !self.keyword_matches(item) {
                return false;
            }
        }
        if node.is_collection() {
            if self.subscription_type != SubscriptionType::Items {
                return false;
            }
            let reachable = match self.depth {
                SubscriptionDepth::Direct => node.is_child_node(leaf.id()),
                SubscriptionDepth::All => node.is_descendant_node(&ctx.nodes, leaf.id()),
            };
            if !reachable {
                return false;
            }
        }
        true
    }

    /// Whether a child association event should reach this subscription.
    /// `distance` is 1 when `node` is the child's parent and grows by one for
    /// each further ancestor.
    pub(crate) fn can_send_child_node_event(
        &self,
        ctx: &ServiceContext,
        node: &Node,
        distance: usize,
    ) -> bool {
        if !node.is_collection() || self.subscription_type != SubscriptionType::Nodes {
            return false;
        }
        if self.depth == SubscriptionDepth::Direct && distance != 1 {
            return false;
        }
        self.can_send_events(ctx, node)
    }

    /// Filter for structural node events (configuration change, purge,
    /// delete). With `include_all` unapproved subscriptions are included.
    pub(crate) fn can_send_node_event(
        &self,
        ctx: &ServiceContext,
        node: &Node,
        include_all: bool,
    ) -> bool {
        if !include_all && !(self.is_active() && self.deliver_notifications) {
            return false;
        }
        self.presence_allows(ctx, node)
    }

    fn presence_allows(&self, ctx: &ServiceContext, node: &Node) -> bool {
        let presence_based = node.config().presence_based_delivery;
        if !presence_based && self.presence_states.is_empty() {
            return true;
        }
        let shows = ctx.presence.show_presences(&self.jid);
        if shows.is_empty() {
            return false;
        }
        self.presence_states.is_empty() || !self.presence_states.is_disjoint(&shows)
    }
}

/// Already-parsed subscription options (XEP-0060 Section 6.3).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub subscription_type: Option<SubscriptionType>,
    pub depth: Option<SubscriptionDepth>,
    pub deliver: Option<bool>,
    pub digest: Option<bool>,
    pub digest_frequency: Option<u64>,
    pub expire: Option<DateTime<Utc>>,
    pub include_body: Option<bool>,
    pub show_values: Option<HashSet<Show>>,
    /// An empty keyword clears the filter.
    pub keyword: Option<String>,
}

impl SubscriptionOptions {
    /// Whether any option other than type and depth is present.
    pub fn has_delivery_options(&self) -> bool {
        self.deliver.is_some()
            || self.digest.is_some()
            || self.digest_frequency.is_some()
            || self.expire.is_some()
            || self.include_body.is_some()
            || self.show_values.is_some()
            || self.keyword.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    fn subscription(state: SubscriptionState) -> NodeSubscription {
        NodeSubscription::new(
            generate_subscription_id(),
            "news",
            jid("ann@example.com"),
            jid("ann@example.com/phone"),
            state,
        )
    }

    #[test]
    fn test_generated_ids() {
        let id = generate_subscription_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_subscription_id());
    }

    #[test]
    fn test_active_requires_subscribed_state() {
        assert!(subscription(SubscriptionState::Subscribed).is_active());
        assert!(!subscription(SubscriptionState::Pending).is_active());
        assert!(!subscription(SubscriptionState::None).is_active());
    }

    #[test]
    fn test_unconfigured_is_configuration_pending() {
        let sub = subscription(SubscriptionState::Unconfigured);
        assert!(sub.configuration_pending);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_expiry() {
        let mut sub = subscription(SubscriptionState::Subscribed);
        sub.expire = Some(Utc::now() + Duration::hours(1));
        assert!(sub.is_active());

        sub.expire = Some(Utc::now() - Duration::seconds(1));
        assert!(!sub.is_active());
        assert!(sub.is_expired(Utc::now()));
    }

    #[test]
    fn test_keyword_filter() {
        let publisher = jid("editor@example.com");
        let sports = PublishedItem::new("news", "1", publisher.clone(), Some("<p>sports</p>".into()));
        let weather = PublishedItem::new("news", "2", publisher.clone(), Some("<p>rain</p>".into()));
        let empty = PublishedItem::new("news", "3", publisher, None);

        let mut sub = subscription(SubscriptionState::Subscribed);
        assert!(sub.keyword_matches(&weather));
        assert!(sub.keyword_matches(&empty));

        sub.keyword = Some("sports".to_string());
        assert!(sub.keyword_matches(&sports));
        assert!(!sub.keyword_matches(&weather));
        assert!(!sub.keyword_matches(&empty));
    }

    #[test]
    fn test_type_and_depth_do_not_configure() {
        let mut sub = subscription(SubscriptionState::Unconfigured);
        let options = SubscriptionOptions {
            subscription_type: Some(SubscriptionType::Items),
            depth: Some(SubscriptionDepth::All),
            ..Default::default()
        };
        assert!(!sub.apply_options(&options));
        assert!(sub.configuration_pending);
        assert_eq!(sub.subscription_type, SubscriptionType::Items);
        assert_eq!(sub.depth, SubscriptionDepth::All);
    }

    #[test]
    fn test_delivery_options_configure() {
        let mut sub = subscription(SubscriptionState::Unconfigured);
        let options = SubscriptionOptions {
            deliver: Some(false),
            show_values: Some(HashSet::from([Show::Away, Show::Xa])),
            keyword: Some("sports".to_string()),
            ..Default::default()
        };
        assert!(sub.apply_options(&options));
        assert!(!sub.configuration_pending);
        assert!(!sub.deliver_notifications);
        assert!(sub.presence_states.contains(&Show::Away));
        assert_eq!(sub.keyword.as_deref(), Some("sports"));

        let clear = SubscriptionOptions {
            keyword: Some(String::new()),
            ..Default::default()
        };
        sub.apply_options(&clear);
        assert_eq!(sub.keyword, None);
    }
}
