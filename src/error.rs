//! Error taxonomy for the replication core.
//!
//! A closed set of variants instead of an open hierarchy: protocol
//! violations, structural conflicts, authorization failures and persistence
//! failures are distinct types so callers can match on them.

use crate::{
    codec::{DecodeError, EncodeError},
    keys::{MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier},
    store::StoreError,
};

/// Top-level error for mesh base operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Conflict(#[from] StructuralConflict),
    #[error(transparent)]
    NotAuthorized(#[from] NotAuthorized),
    /// A Store failure surfaced during write-back. The in-memory commit
    /// stands; only persistence is affected.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// A message or operation violated the replication protocol.
///
/// These are rejected and logged, never silently applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("message sender {actual} does not match proxy partner {expected}")]
    SenderMismatch {
        expected: MeshBaseIdentifier,
        actual: MeshBaseIdentifier,
    },
    #[error("message receiver {actual} does not match local mesh base {expected}")]
    ReceiverMismatch {
        expected: MeshBaseIdentifier,
        actual: MeshBaseIdentifier,
    },
    #[error("no proxy towards {0} is known")]
    UnknownProxy(MeshBaseIdentifier),
    #[error("received message without a send token from {0}")]
    MissingToken(MeshBaseIdentifier),
    #[error("malformed message from {sender}: {reason}")]
    Malformed {
        sender: MeshBaseIdentifier,
        reason: &'static str,
    },
    #[error("resynchronization data references a proxy index out of range")]
    InvalidResynchronization,
}

/// The presented proxy may not perform the requested transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotAuthorized {
    #[error("proxy towards {partner} is not in the replica set of {object}")]
    UnrecognizedProxy {
        partner: MeshBaseIdentifier,
        object: MeshObjectIdentifier,
    },
    #[error("proxy towards {partner} is not the lock source of {object}")]
    NotLockSource {
        partner: MeshBaseIdentifier,
        object: MeshObjectIdentifier,
    },
    #[error("proxy towards {partner} is not the home source of {object}")]
    NotHomeSource {
        partner: MeshBaseIdentifier,
        object: MeshObjectIdentifier,
    },
    #[error("the update lock for {0} is held by another replica")]
    LockNotHere(MeshObjectIdentifier),
    #[error("the home replica of {0} is elsewhere; only home may delete")]
    HomeNotHere(MeshObjectIdentifier),
}

/// A mutation conflicts with the current structure of the graph.
///
/// Locally these are returned to the caller. On the ripple path they are a
/// symptom of replica drift: the origin already validated the change against
/// its own state, so the receiver logs and skips them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralConflict {
    #[error("{0} is dead and accepts no further mutation")]
    IsDead(MeshObjectIdentifier),
    #[error("{0} already exists")]
    AlreadyExists(MeshObjectIdentifier),
    #[error("{0} is not known in this mesh base")]
    UnknownObject(MeshObjectIdentifier),
    #[error("{object} is already blessed with {entity_type}")]
    AlreadyBlessed {
        object: MeshObjectIdentifier,
        entity_type: MeshTypeIdentifier,
    },
    #[error("{object} is not blessed with {entity_type}")]
    NotBlessed {
        object: MeshObjectIdentifier,
        entity_type: MeshTypeIdentifier,
    },
    #[error("{object} and {neighbor} are already related")]
    AlreadyRelated {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },
    #[error("{object} and {neighbor} are not related")]
    NotRelated {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },
    #[error("the relationship {object} -> {neighbor} is already blessed with {role_type}")]
    RoleAlreadyBlessed {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        role_type: MeshTypeIdentifier,
    },
    #[error("the relationship {object} -> {neighbor} is not blessed with {role_type}")]
    RoleNotBlessed {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        role_type: MeshTypeIdentifier,
    },
    #[error("{object} and {peer} are already equivalent")]
    AlreadyEquivalent {
        object: MeshObjectIdentifier,
        peer: MeshObjectIdentifier,
    },
    #[error("{object} and {peer} are not equivalent")]
    NotEquivalent {
        object: MeshObjectIdentifier,
        peer: MeshObjectIdentifier,
    },
}
