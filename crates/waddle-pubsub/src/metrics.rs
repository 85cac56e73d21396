//! PubSub metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which must be installed by
//! the host server. Without one the instruments are no-ops.

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-pubsub"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for items published to leaf nodes.
pub fn items_published() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.items.published")
        .with_description("Total items published to leaf nodes")
        .with_unit("item")
        .build()
}

/// Counter for items dropped from a node's log by the retention bound.
pub fn items_evicted() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.items.evicted")
        .with_description("Total items evicted by the retention bound")
        .with_unit("item")
        .build()
}

/// Counter for notifications handed to the delivery collaborator.
pub fn notifications_sent() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.notifications.sent")
        .with_description("Total notifications dispatched, one per recipient address")
        .with_unit("notification")
        .build()
}

/// Counter for subscriptions created.
pub fn subscriptions_created() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.subscriptions.created")
        .with_description("Total subscriptions created")
        .with_unit("subscription")
        .build()
}

/// Counter for subscriptions cancelled.
pub fn subscriptions_cancelled() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.subscriptions.cancelled")
        .with_description("Total subscriptions cancelled")
        .with_unit("subscription")
        .build()
}

/// Counter for persistence writes that failed.
pub fn persistence_failures() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.persistence.failures")
        .with_description("Total persistence writes that failed")
        .with_unit("operation")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a publish to a node.
pub fn record_item_published(node_id: &str) {
    items_published().add(1, &[KeyValue::new("node", node_id.to_string())]);
}

/// Record items evicted from a node.
pub fn record_items_evicted(node_id: &str, count: u64) {
    if count > 0 {
        items_evicted().add(count, &[KeyValue::new("node", node_id.to_string())]);
    }
}

/// Record a notification dispatch.
pub fn record_notification_sent(event: &str) {
    notifications_sent().add(1, &[KeyValue::new("event", event.to_string())]);
}

/// Record a subscription being created.
pub fn record_subscription_created(state: &str) {
    subscriptions_created().add(1, &[KeyValue::new("state", state.to_string())]);
}

/// Record a subscription being cancelled.
pub fn record_subscription_cancelled() {
    subscriptions_cancelled().add(1, &[]);
}

/// Record a failed persistence write.
pub fn record_persistence_failure(operation: &str) {
    persistence_failures().add(1, &[KeyValue::new("operation", operation.to_string())]);
}
