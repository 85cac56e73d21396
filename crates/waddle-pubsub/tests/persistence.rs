//! Persistence through the service, synchronous and queued.

mod common;

use std::sync::Arc;

use common::{init_tracing, jid, TestService};
use waddle_pubsub::{
    ChannelDelivery, InMemoryPersistence, InMemoryPresence, PubSubService, PubSubSettings,
    QueuedPersistence, SubscriptionState,
};

#[tokio::test]
async fn queued_writes_reach_the_store() {
    init_tracing();
    let store = Arc::new(InMemoryPersistence::new());
    let (queued, writer) = QueuedPersistence::spawn(store.clone());
    let (delivery, _outbound) = ChannelDelivery::new(64);
    let service = PubSubService::new(
        PubSubSettings::default(),
        Arc::new(queued),
        Arc::new(InMemoryPresence::new()),
        Arc::new(delivery),
    )
    .expect("service starts");

    let owner = jid("owner@example.com");
    let bob = jid("bob@example.com");
    let news = service
        .create_leaf_node("news", None, &owner, None)
        .expect("create");
    let subscription = news
        .create_subscription(service.context(), &bob, &bob, None)
        .expect("subscribe");
    news.publish(service.context(), &owner, Some("one"), None)
        .expect("publish");
    news.publish(service.context(), &owner, Some("two"), None)
        .expect("publish");
    news.cancel_subscription(service.context(), &subscription.id)
        .expect("cancelled");

    // Dropping the service closes the queue; the writer drains and stops.
    drop(news);
    drop(service);
    writer.await.expect("writer task");

    assert!(store.node("").is_some());
    assert!(store.node("news").is_some());
    let affiliations = store.affiliations("news");
    assert_eq!(affiliations.len(), 1);
    assert_eq!(affiliations[0].jid, owner);
    let subscriptions = store.subscriptions("news");
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].owner, owner);
    let mut items: Vec<String> = store.items("news").into_iter().map(|item| item.item_id).collect();
    items.sort();
    assert_eq!(items, vec!["one".to_string(), "two".to_string()]);
}

#[test]
fn store_outage_keeps_live_state() {
    let t = TestService::new();
    let owner = jid("owner@example.com");
    let news = t
        .service
        .create_leaf_node("news", None, &owner, None)
        .expect("create");

    t.store.set_unavailable(true);
    let carol = jid("carol@example.com");
    let subscription = news.create_subscription(t.ctx(), &carol, &carol, None).expect("subscribe");
    news.publish(t.ctx(), &owner, Some("during-outage"), None)
        .expect("publish");

    assert_eq!(
        news.subscription(&subscription.id).map(|s| s.state),
        Some(SubscriptionState::Subscribed)
    );
    assert!(news.get_published_item("during-outage").is_some());
    assert_eq!(t.store.subscriptions("news").len(), 1);
    assert!(t.store.items("news").is_empty());

    t.store.set_unavailable(false);
    news.publish(t.ctx(), &owner, Some("after-outage"), None)
        .expect("publish");
    let items: Vec<String> = t.store.items("news").into_iter().map(|item| item.item_id).collect();
    assert_eq!(items, vec!["after-outage".to_string()]);
}

#[test]
fn saved_node_record_matches_live_node() {
    let t = TestService::new();
    let owner = jid("owner@example.com");
    let sports = t
        .service
        .create_collection_node("sports", None, &owner, None)
        .expect("create");
    let scores = t
        .service
        .create_leaf_node("scores", Some("sports"), &owner, None)
        .expect("create");

    let record = t.store.node("scores").expect("stored");
    assert!(record.is_leaf());
    assert_eq!(record.parent_id.as_deref(), Some("sports"));
    assert_eq!(record.creator, owner);
    assert_eq!(record.config, scores.config());

    let record = t.store.node("sports").expect("stored");
    assert!(!record.is_leaf());
    assert_eq!(record.collection, sports.as_collection().map(|c| c.config()));
}
