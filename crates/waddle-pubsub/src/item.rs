//! Published items.

use chrono::{DateTime, Utc};
use jid::Jid;

/// One publication to a leaf node.
///
/// Immutable once created. The owning leaf node's log holds it behind an
/// `Arc` until it is evicted, retracted or purged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedItem {
    /// ID of the leaf node the item was published to.
    pub node_id: String,
    /// Item ID, unique within the node.
    pub id: String,
    /// Entity that published the item.
    pub publisher: Jid,
    /// When the item was published.
    pub creation_date: DateTime<Utc>,
    /// The item payload as an XML string, if any.
    pub payload: Option<String>,
}

impl PublishedItem {
    /// Create a new item stamped with the current time.
    pub fn new(
        node_id: impl Into<String>,
        id: impl Into<String>,
        publisher: Jid,
        payload: Option<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            id: id.into(),
            publisher,
            creation_date: Utc::now(),
            payload,
        }
    }

    /// Whether the payload contains the keyword. Items without a payload
    /// never match.
    pub fn contains_keyword(&self, keyword: &str) -> bool {
        self.payload
            .as_deref()
            .map(|payload| payload.contains(keyword))
            .unwrap_or(false)
    }
}
