//! The wire envelope exchanged between proxies.
//!
//! One [`XprisoMessage`] carries everything two mesh bases need to tell
//! each other: conveyed replicas, first-time requests, change records,
//! lock and home replica traffic, resynchronization requests and the
//! channel-teardown signal. Messages are pure data; all interpretation
//! happens in the proxy and transaction layers.

use serde::{Deserialize, Serialize};

use crate::{
    error::ProtocolViolation,
    keys::{MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier, PropertyValue},
    mesh::ExternalizedMeshObject,
};

/// A single protocol message from `sender` to `receiver`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XprisoMessage {
    pub sender: MeshBaseIdentifier,
    pub receiver: MeshBaseIdentifier,
    /// Send token, assigned by the sending proxy when the message actually
    /// goes out. `None` until then.
    pub token: Option<u64>,
    /// Highest token of the partner's messages processed so far,
    /// piggybacked for acknowledgment.
    pub acknowledged_token: Option<u64>,
    pub time_created: i64,
    /// Full replica snapshots transported to the receiver.
    pub conveyed: Vec<ExternalizedMeshObject>,
    /// Objects the sender wants replicas of.
    pub requested_first_time: Vec<MeshObjectIdentifier>,
    /// Objects deleted at the sender.
    pub deletions: Vec<DeletionRecord>,
    /// Objects the sender wants the update lock for.
    pub requested_locks: Vec<MeshObjectIdentifier>,
    /// Objects whose update lock the sender hereby gives to the receiver.
    pub pushed_locks: Vec<MeshObjectIdentifier>,
    /// Objects the sender wants home replica status for.
    pub requested_home_replicas: Vec<MeshObjectIdentifier>,
    /// Objects whose home replica status the sender gives to the receiver.
    pub pushed_home_replicas: Vec<MeshObjectIdentifier>,
    /// Objects the sender wants authoritative replica data for.
    pub resynchronize_requests: Vec<MeshObjectIdentifier>,
    /// Changes committed at the sender, to ripple into the receiver.
    pub changes: Vec<ChangeRecord>,
    /// The sender is tearing down the channel; no further messages follow.
    pub cease_communications: bool,
}

impl XprisoMessage {
    pub fn new(sender: MeshBaseIdentifier, receiver: MeshBaseIdentifier) -> Self {
        XprisoMessage {
            sender,
            receiver,
            token: None,
            acknowledged_token: None,
            time_created: crate::keys::now_millis(),
            conveyed: Vec::new(),
            requested_first_time: Vec::new(),
            deletions: Vec::new(),
            requested_locks: Vec::new(),
            pushed_locks: Vec::new(),
            requested_home_replicas: Vec::new(),
            pushed_home_replicas: Vec::new(),
            resynchronize_requests: Vec::new(),
            changes: Vec::new(),
            cease_communications: false,
        }
    }

    /// Validates internal consistency.
    ///
    /// A message can request or push a given transfer, never both at once.
    pub fn check(&self) -> Result<(), ProtocolViolation> {
        let malformed = |reason| ProtocolViolation::Malformed {
            sender: self.sender.clone(),
            reason,
        };
        if self.sender == self.receiver {
            return Err(malformed("sender equals receiver"));
        }
        if self
            .requested_locks
            .iter()
            .any(|id| self.pushed_locks.contains(id))
        {
            return Err(malformed("lock both requested and pushed"));
        }
        if self
            .requested_home_replicas
            .iter()
            .any(|id| self.pushed_home_replicas.contains(id))
        {
            return Err(malformed("home replica both requested and pushed"));
        }
        Ok(())
    }

    /// Whether the message carries any payload worth sending.
    pub fn is_empty(&self) -> bool {
        self.conveyed.is_empty()
            && self.requested_first_time.is_empty()
            && self.deletions.is_empty()
            && self.requested_locks.is_empty()
            && self.pushed_locks.is_empty()
            && self.requested_home_replicas.is_empty()
            && self.pushed_home_replicas.is_empty()
            && self.resynchronize_requests.is_empty()
            && self.changes.is_empty()
            && !self.cease_communications
            && self.acknowledged_token.is_none()
    }
}

/// An object death, carried with the origin's update time so receivers
/// can stamp their replica consistently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub identifier: MeshObjectIdentifier,
    pub time_updated: Option<i64>,
}

/// One committed change, replayed verbatim on receiving replicas.
///
/// Every variant names the affected object and carries the origin's
/// `time_updated`; `None` leaves the receiver's timestamp untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeRecord {
    TypesAdded {
        object: MeshObjectIdentifier,
        types: Vec<MeshTypeIdentifier>,
        time_updated: Option<i64>,
    },
    TypesRemoved {
        object: MeshObjectIdentifier,
        types: Vec<MeshTypeIdentifier>,
        time_updated: Option<i64>,
    },
    PropertiesSet {
        object: MeshObjectIdentifier,
        properties: Vec<(MeshTypeIdentifier, PropertyValue)>,
        time_updated: Option<i64>,
    },
    NeighborAdded {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<MeshTypeIdentifier>,
        time_updated: Option<i64>,
    },
    NeighborRemoved {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        time_updated: Option<i64>,
    },
    RolesAdded {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<MeshTypeIdentifier>,
        time_updated: Option<i64>,
    },
    RolesRemoved {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<MeshTypeIdentifier>,
        time_updated: Option<i64>,
    },
    EquivalentAdded {
        object: MeshObjectIdentifier,
        peer: MeshObjectIdentifier,
        time_updated: Option<i64>,
    },
    EquivalentRemoved {
        object: MeshObjectIdentifier,
        peer: MeshObjectIdentifier,
        time_updated: Option<i64>,
    },
}

impl ChangeRecord {
    /// The object this change applies to.
    pub fn object(&self) -> &MeshObjectIdentifier {
        match self {
            ChangeRecord::TypesAdded { object, .. }
            | ChangeRecord::TypesRemoved { object, .. }
            | ChangeRecord::PropertiesSet { object, .. }
            | ChangeRecord::NeighborAdded { object, .. }
            | ChangeRecord::NeighborRemoved { object, .. }
            | ChangeRecord::RolesAdded { object, .. }
            | ChangeRecord::RolesRemoved { object, .. }
            | ChangeRecord::EquivalentAdded { object, .. }
            | ChangeRecord::EquivalentRemoved { object, .. } => object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_until_payload() {
        let mut msg = XprisoMessage::new("m1".into(), "m2".into());
        assert!(msg.is_empty());

        msg.requested_first_time.push("obj".into());
        assert!(!msg.is_empty());

        let mut msg = XprisoMessage::new("m1".into(), "m2".into());
        msg.acknowledged_token = Some(3);
        // a bare acknowledgment is still worth sending
        assert!(!msg.is_empty());

        let mut msg = XprisoMessage::new("m1".into(), "m2".into());
        msg.cease_communications = true;
        assert!(!msg.is_empty());
    }

    #[test]
    fn check_rejects_contradictions() {
        let mut msg = XprisoMessage::new("m1".into(), "m2".into());
        msg.check().unwrap();

        msg.requested_locks.push("obj".into());
        msg.pushed_locks.push("obj".into());
        assert!(msg.check().is_err());

        let msg = XprisoMessage::new("m1".into(), "m1".into());
        assert!(msg.check().is_err());
    }

    #[test]
    fn change_record_names_its_object() {
        let rec = ChangeRecord::PropertiesSet {
            object: "obj".into(),
            properties: vec![("X".into(), PropertyValue::Boolean(true))],
            time_updated: Some(1),
        };
        assert_eq!(rec.object().as_str(), "obj");
    }
}
