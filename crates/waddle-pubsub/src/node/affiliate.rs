use jid::Jid;
use serde::{Deserialize, Serialize};

use crate::types::Affiliation;

/// The affiliation of one entity with one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffiliate {
    /// ID of the node.
    pub node_id: String,
    /// Affiliated entity.
    pub jid: Jid,
    /// Current affiliation level.
    pub affiliation: Affiliation,
}

impl NodeAffiliate {
    pub fn new(node_id: impl Into<String>, jid: Jid, affiliation: Affiliation) -> Self {
        Self {
            node_id: node_id.into(),
            jid,
            affiliation,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.affiliation == Affiliation::Owner
    }

    pub fn is_publisher(&self) -> bool {
        self.affiliation == Affiliation::Publisher
    }

    pub fn is_outcast(&self) -> bool {
        self.affiliation == Affiliation::Outcast
    }
}
