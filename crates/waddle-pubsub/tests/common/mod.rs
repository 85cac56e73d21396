//! Shared harness for pubsub integration tests.
//!
//! Builds a service wired to in-memory collaborators and exposes the
//! outbound notification channel so tests can inspect what was sent.

#![allow(dead_code)]

use std::sync::Arc;

use jid::Jid;
use tokio::sync::mpsc;
use waddle_pubsub::{
    ChannelDelivery, EventKind, InMemoryPersistence, InMemoryPresence, OutboundNotification,
    PubSubService, PubSubSettings, ServiceContext,
};

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn jid(s: &str) -> Jid {
    s.parse().expect("valid jid")
}

pub struct TestService {
    pub service: Arc<PubSubService>,
    pub store: Arc<InMemoryPersistence>,
    pub presence: Arc<InMemoryPresence>,
    receiver: mpsc::Receiver<OutboundNotification>,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_settings(PubSubSettings::default())
    }

    pub fn with_settings(mut settings: PubSubSettings) -> Self {
        init_tracing();
        if settings.service.admins.is_empty() {
            settings.service.admins = vec!["admin@example.com".to_string()];
        }
        let store = Arc::new(InMemoryPersistence::new());
        let presence = Arc::new(InMemoryPresence::new());
        let (delivery, receiver) = ChannelDelivery::new(1024);
        let service = PubSubService::new(
            settings,
            store.clone(),
            presence.clone(),
            Arc::new(delivery),
        )
        .expect("service starts");
        Self {
            service: Arc::new(service),
            store,
            presence,
            receiver,
        }
    }

    pub fn ctx(&self) -> &ServiceContext {
        self.service.context()
    }

    /// Take every notification sent so far.
    pub fn drain(&mut self) -> Vec<OutboundNotification> {
        std::iter::from_fn(|| self.receiver.try_recv().ok()).collect()
    }

    /// Take every notification sent so far and keep the publish events.
    pub fn drain_published(&mut self) -> Vec<OutboundNotification> {
        self.drain()
            .into_iter()
            .filter(|n| matches!(n.notification.kind, EventKind::Published { .. }))
            .collect()
    }
}

/// Recipient addresses of a batch of notifications.
pub fn recipients(sent: &[OutboundNotification]) -> Vec<Jid> {
    sent.iter().map(|n| n.to.clone()).collect()
}
