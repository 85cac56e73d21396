//! Notification fan-out across the node tree.

mod common;

use std::collections::HashSet;

use common::{jid, recipients, TestService};
use waddle_pubsub::{
    EventKind, NodeConfigUpdate, Show, SubscriptionDepth, SubscriptionOptions, SubscriptionType,
};

fn items_subscription(depth: SubscriptionDepth) -> SubscriptionOptions {
    SubscriptionOptions {
        subscription_type: Some(SubscriptionType::Items),
        depth: Some(depth),
        ..Default::default()
    }
}

/// Tree used by the depth tests:
///
/// ```text
/// root
/// └── sports (collection)
///     ├── headlines (leaf)
///     └── football (collection)
///         └── scores (leaf)
/// ```
fn build_tree(t: &TestService) {
    let owner = jid("owner@example.com");
    t.service
        .create_collection_node("sports", None, &owner, None)
        .expect("create sports");
    t.service
        .create_leaf_node("headlines", Some("sports"), &owner, None)
        .expect("create headlines");
    t.service
        .create_collection_node("football", Some("sports"), &owner, None)
        .expect("create football");
    t.service
        .create_leaf_node("scores", Some("football"), &owner, None)
        .expect("create scores");
}

#[test]
fn depth_limits_collection_subscriptions() {
    let mut t = TestService::new();
    build_tree(&t);
    let sports = t.service.node("sports").expect("sports");
    let x = jid("x@example.com");
    let y = jid("y@example.com");
    let direct = items_subscription(SubscriptionDepth::Direct);
    let all = items_subscription(SubscriptionDepth::All);
    sports.create_subscription(t.ctx(), &x, &x, Some(&direct)).expect("subscribe");
    sports.create_subscription(t.ctx(), &y, &y, Some(&all)).expect("subscribe");
    t.drain();

    let owner = jid("owner@example.com");
    let headlines = t.service.node("headlines").expect("headlines");
    headlines
        .publish(t.ctx(), &owner, None, Some("<entry>kick-off</entry>".to_string()))
        .expect("publish");
    let to = recipients(&t.drain_published());
    assert!(to.contains(&x));
    assert!(to.contains(&y));

    let scores = t.service.node("scores").expect("scores");
    scores
        .publish(t.ctx(), &owner, None, Some("<entry>1-0</entry>".to_string()))
        .expect("publish");
    let to = recipients(&t.drain_published());
    assert!(!to.contains(&x));
    assert!(to.contains(&y));
}

#[test]
fn nodes_subscriptions_skip_item_events() {
    let mut t = TestService::new();
    build_tree(&t);
    let sports = t.service.node("sports").expect("sports");
    let watcher = jid("watcher@example.com");
    sports
        .create_subscription(
            t.ctx(),
            &watcher,
            &watcher,
            Some(&SubscriptionOptions {
                subscription_type: Some(SubscriptionType::Nodes),
                depth: Some(SubscriptionDepth::All),
                ..Default::default()
            }),
        )
        .expect("subscribe");
    t.drain();

    let headlines = t.service.node("headlines").expect("headlines");
    headlines
        .publish(t.ctx(), &jid("owner@example.com"), None, None)
        .expect("publish");
    assert!(!recipients(&t.drain_published()).contains(&watcher));
}

#[test]
fn child_events_reach_nodes_subscribers_by_depth() {
    let mut t = TestService::new();
    build_tree(&t);
    let sports = t.service.node("sports").expect("sports");
    let direct = jid("direct@example.com");
    let deep = jid("deep@example.com");
    let nodes_subscription = |depth| SubscriptionOptions {
        subscription_type: Some(SubscriptionType::Nodes),
        depth: Some(depth),
        ..Default::default()
    };
    let direct_options = nodes_subscription(SubscriptionDepth::Direct);
    let deep_options = nodes_subscription(SubscriptionDepth::All);
    sports
        .create_subscription(t.ctx(), &direct, &direct, Some(&direct_options))
        .expect("subscribe");
    sports.create_subscription(t.ctx(), &deep, &deep, Some(&deep_options)).expect("subscribe");
    t.drain();

    t.service
        .create_leaf_node("transfers", Some("football"), &jid("owner@example.com"), None)
        .expect("create");

    let associated: Vec<_> = t
        .drain()
        .into_iter()
        .filter(|n| {
            n.notification.kind
                == EventKind::ChildAssociated {
                    child_id: "transfers".to_string(),
                }
        })
        .collect();
    let to = recipients(&associated);
    assert!(to.contains(&deep));
    assert!(!to.contains(&direct));
    assert!(associated.iter().all(|n| n.notification.node_id == "football"));
}

#[test]
fn presence_states_gate_delivery() {
    let mut t = TestService::new();
    let owner = jid("owner@example.com");
    let news = t
        .service
        .create_leaf_node("news", None, &owner, None)
        .expect("create");
    let z = jid("zed@example.com");
    news
        .create_subscription(
            t.ctx(),
            &z,
            &z,
            Some(&SubscriptionOptions {
                show_values: Some(HashSet::from([Show::Away])),
                ..Default::default()
            }),
        )
        .expect("subscribe");
    t.drain();

    t.presence.set(jid("zed@example.com/phone"), Show::Available);
    news.publish(t.ctx(), &owner, None, Some("<entry/>".to_string()))
        .expect("publish");
    assert!(!recipients(&t.drain_published()).contains(&z));

    t.presence.set(jid("zed@example.com/phone"), Show::Away);
    news.publish(t.ctx(), &owner, None, Some("<entry/>".to_string()))
        .expect("publish");
    assert!(recipients(&t.drain_published()).contains(&z));

    t.presence.set_unavailable(&jid("zed@example.com/phone"));
    news.publish(t.ctx(), &owner, None, Some("<entry/>".to_string()))
        .expect("publish");
    assert!(!recipients(&t.drain_published()).contains(&z));
}

#[test]
fn presence_states_match_any_online_resource() {
    let mut t = TestService::new();
    let owner = jid("owner@example.com");
    let news = t
        .service
        .create_leaf_node("news", None, &owner, None)
        .expect("create");
    let z = jid("zed@example.com");
    let y = jid("yan@example.com");
    for (subscriber, show) in [(&z, Show::Away), (&y, Show::Xa)] {
        news.create_subscription(
            t.ctx(),
            subscriber,
            subscriber,
            Some(&SubscriptionOptions {
                show_values: Some(HashSet::from([show])),
                ..Default::default()
            }),
        )
        .expect("subscribe");
    }
    t.drain();

    let resources = [
        ("laptop", Show::Available),
        ("phone", Show::Away),
        ("tab", Show::Dnd),
    ];
    for (resource, show) in resources {
        t.presence.set(jid(&format!("zed@example.com/{resource}")), show);
        t.presence.set(jid(&format!("yan@example.com/{resource}")), show);
    }

    for _ in 0..20 {
        news.publish(t.ctx(), &owner, None, Some("<entry/>".to_string()))
            .expect("publish");
        let to = recipients(&t.drain_published());
        assert!(to.contains(&z));
        assert!(!to.contains(&y));
    }
}

#[test]
fn presence_based_delivery_requires_availability() {
    let mut t = TestService::new();
    let owner = jid("owner@example.com");
    let news = t
        .service
        .create_leaf_node(
            "news",
            None,
            &owner,
            Some(NodeConfigUpdate {
                presence_based_delivery: Some(true),
                ..Default::default()
            }),
        )
        .expect("create");
    let reader = jid("reader@example.com/laptop");
    news
        .create_subscription(t.ctx(), &jid("reader@example.com"), &reader, None)
        .expect("subscribe");
    t.drain();

    news.publish(t.ctx(), &owner, None, None).expect("publish");
    assert!(!recipients(&t.drain_published()).contains(&reader));

    t.presence.set(reader.clone(), Show::Dnd);
    news.publish(t.ctx(), &owner, None, None).expect("publish");
    assert!(recipients(&t.drain_published()).contains(&reader));
}

#[test]
fn keyword_filters_items() {
    let mut t = TestService::new();
    let owner = jid("owner@example.com");
    let news = t
        .service
        .create_leaf_node("news", None, &owner, None)
        .expect("create");
    let fan = jid("fan@example.com");
    news
        .create_subscription(
            t.ctx(),
            &fan,
            &fan,
            Some(&SubscriptionOptions {
                keyword: Some("sports".to_string()),
                ..Default::default()
            }),
        )
        .expect("subscribe");
    t.drain();

    news.publish(t.ctx(), &owner, None, Some("<entry>weather</entry>".to_string()))
        .expect("publish");
    assert!(!recipients(&t.drain_published()).contains(&fan));

    news.publish(t.ctx(), &owner, None, Some("<entry>sports results</entry>".to_string()))
        .expect("publish");
    assert!(recipients(&t.drain_published()).contains(&fan));
}

#[test]
fn one_dispatch_per_address() {
    let mut t = TestService::new();
    let owner = jid("owner@example.com");
    let news = t
        .service
        .create_leaf_node("news", None, &owner, None)
        .expect("create");
    let dana = jid("dana@example.com");
    let first = news.create_subscription(t.ctx(), &dana, &dana, None).expect("subscribe");
    let second = news.create_subscription(t.ctx(), &dana, &dana, None).expect("subscribe");
    t.drain();

    news.publish(t.ctx(), &owner, None, Some("<entry/>".to_string()))
        .expect("publish");

    let to_dana: Vec<_> = t
        .drain_published()
        .into_iter()
        .filter(|n| n.to == dana)
        .collect();
    assert_eq!(to_dana.len(), 1);
    let ids: HashSet<_> = to_dana[0].subscription_ids.iter().cloned().collect();
    assert_eq!(ids, HashSet::from([first.id, second.id]));
}

#[test]
fn leaf_and_ancestor_subscriptions_share_one_dispatch() {
    let mut t = TestService::new();
    build_tree(&t);
    let erin = jid("erin@example.com");
    let sports = t.service.node("sports").expect("sports");
    let scores = t.service.node("scores").expect("scores");
    let all = items_subscription(SubscriptionDepth::All);
    let on_collection = sports
        .create_subscription(t.ctx(), &erin, &erin, Some(&all))
        .expect("subscribe");
    let on_leaf = scores.create_subscription(t.ctx(), &erin, &erin, None).expect("subscribe");
    t.drain();

    scores
        .publish(t.ctx(), &jid("owner@example.com"), None, Some("<entry/>".to_string()))
        .expect("publish");

    let to_erin: Vec<_> = t
        .drain_published()
        .into_iter()
        .filter(|n| n.to == erin)
        .collect();
    assert_eq!(to_erin.len(), 1);
    assert_eq!(to_erin[0].notification.node_id, "scores");
    let ids: HashSet<_> = to_erin[0].subscription_ids.iter().cloned().collect();
    assert_eq!(ids, HashSet::from([on_collection.id, on_leaf.id]));
}

#[test]
fn payload_follows_deliver_payloads() {
    let mut t = TestService::new();
    let owner = jid("owner@example.com");
    let news = t
        .service
        .create_leaf_node(
            "news",
            None,
            &owner,
            Some(NodeConfigUpdate {
                deliver_payloads: Some(false),
                ..Default::default()
            }),
        )
        .expect("create");
    t.drain();

    news.publish(t.ctx(), &owner, Some("first"), Some("<entry/>".to_string()))
        .expect("publish");
    let sent = t.drain_published();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].notification.include_payload);
    match &sent[0].notification.kind {
        EventKind::Published { item, delayed } => {
            assert!(!delayed);
            assert_eq!(item.as_ref().map(|i| i.id.as_str()), Some("first"));
        }
        other => panic!("expected publish event, got {other:?}"),
    }
}

#[test]
fn inactive_subscriptions_receive_nothing() {
    let mut t = TestService::new();
    let owner = jid("owner@example.com");
    let news = t
        .service
        .create_leaf_node(
            "news",
            None,
            &owner,
            Some(NodeConfigUpdate {
                subscription_required: Some(true),
                ..Default::default()
            }),
        )
        .expect("create");
    let quiet = jid("quiet@example.com");
    let muted = jid("muted@example.com");
    news.create_subscription(t.ctx(), &quiet, &quiet, None).expect("subscribe");
    news
        .create_subscription(
            t.ctx(),
            &muted,
            &muted,
            Some(&SubscriptionOptions {
                deliver: Some(false),
                ..Default::default()
            }),
        )
        .expect("subscribe");
    t.drain();

    news.publish(t.ctx(), &owner, None, None).expect("publish");
    let to = recipients(&t.drain_published());
    assert!(to.contains(&owner));
    assert!(!to.contains(&quiet));
    assert!(!to.contains(&muted));
}
