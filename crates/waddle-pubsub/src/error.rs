//! Error types for the pubsub engine.

use thiserror::Error;

/// PubSub engine errors.
///
/// Most node-level operations never fail: unknown subscriptions or affiliates
/// yield `None` or an empty result. The variants below cover the validation
/// failures that must reach the caller and the service-level operations
/// (node creation and deletion) that the protocol layer maps onto IQ errors.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The request was well-formed but cannot be applied (e.g. it would leave
    /// a node without owners).
    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    /// No node with the given ID exists.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// A node with the given ID already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The operation is not allowed on this node.
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// The entity is banned from the node.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The entity already has a subscription awaiting owner approval.
    #[error("Pending subscription: {0}")]
    PendingSubscription(String),

    /// The persistence backend rejected a write.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PubSubError {
    /// Create a new not-acceptable error.
    pub fn not_acceptable(msg: impl Into<String>) -> Self {
        Self::NotAcceptable(msg.into())
    }

    /// Create a new node-not-found error.
    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::NodeNotFound(node_id.into())
    }

    /// Create a new conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new not-allowed error.
    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::NotAllowed(msg.into())
    }

    /// Create a new forbidden error.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a new pending-subscription error.
    pub fn pending_subscription(msg: impl Into<String>) -> Self {
        Self::PendingSubscription(msg.into())
    }

    /// Create a new persistence error.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The stanza error condition a protocol handler should answer with.
    pub fn condition(&self) -> StanzaErrorCondition {
        match self {
            Self::NotAcceptable(_) => StanzaErrorCondition::NotAcceptable,
            Self::NodeNotFound(_) => StanzaErrorCondition::ItemNotFound,
            Self::Conflict(_) => StanzaErrorCondition::Conflict,
            Self::NotAllowed(_) => StanzaErrorCondition::NotAllowed,
            Self::Forbidden(_) => StanzaErrorCondition::Forbidden,
            Self::PendingSubscription(_) => StanzaErrorCondition::NotAuthorized,
            Self::Persistence(_) | Self::Internal(_) => StanzaErrorCondition::InternalServerError,
        }
    }

    /// Application-specific condition from the `pubsub#errors` namespace,
    /// if any.
    pub fn pubsub_condition(&self) -> Option<&'static str> {
        match self {
            Self::PendingSubscription(_) => Some("pending-subscription"),
            _ => None,
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3) used by pubsub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Conflict (e.g., node already exists)
    Conflict,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conditions() {
        assert_eq!(
            PubSubError::not_acceptable("no owners").condition(),
            StanzaErrorCondition::NotAcceptable
        );
        assert_eq!(
            PubSubError::node_not_found("news").condition(),
            StanzaErrorCondition::ItemNotFound
        );
        assert_eq!(
            PubSubError::persistence("db down").condition(),
            StanzaErrorCondition::InternalServerError
        );
        assert_eq!(
            PubSubError::forbidden("banned").condition(),
            StanzaErrorCondition::Forbidden
        );
    }

    #[test]
    fn test_pending_subscription_condition() {
        let err = PubSubError::pending_subscription("bob@example.com");
        assert_eq!(err.condition(), StanzaErrorCondition::NotAuthorized);
        assert_eq!(err.pubsub_condition(), Some("pending-subscription"));
        assert_eq!(PubSubError::not_allowed("x").pubsub_condition(), None);
    }

    #[test]
    fn test_error_display() {
        let err = PubSubError::conflict("Node 'news' already exists");
        assert_eq!(err.to_string(), "Conflict: Node 'news' already exists");
        assert_eq!(StanzaErrorCondition::NotAllowed.to_string(), "not-allowed");
    }
}
