//! Replication core for a distributed graph data store.
//!
//! A [`MeshBase`] holds graph objects ([`MeshObject`]) and keeps replicas
//! of them coherent with other mesh bases. Each shared object has exactly
//! one home replica (lifecycle authority) and at most one holder of the
//! update lock (mutation authority); both move between replicas only
//! through explicit surrender and push transitions. Changes committed by
//! a [`Transaction`] ripple outward as [`XprisoMessage`]s over per-partner
//! [`Proxy`] channels with ordered, resumable, at-least-once delivery.
//! Transport is out of scope: callers drain outgoing messages with
//! [`MeshBase::take_outgoing`] and feed incoming ones to
//! [`MeshBase::receive_from`].
//!
//! Persistence is pluggable through the [`Store`] trait, a flat ordered
//! key-to-blob map; [`MemoryStore`] and the redb-backed [`FsStore`] are
//! provided.

pub mod base;
pub mod codec;
pub mod error;
pub mod keys;
pub mod mesh;
pub mod message;
pub mod proxy;
pub mod replica;
pub mod store;
pub mod transaction;

pub use self::{
    base::MeshBase,
    error::Error,
    keys::{
        MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier, PropertyValue, Timestamps,
    },
    mesh::{ExternalizedMeshObject, MeshObject},
    message::{ChangeRecord, DeletionRecord, XprisoMessage},
    proxy::{CoherenceSpecification, ExternalizedProxy, Proxy},
    replica::ReplicaState,
    store::{FsStore, MemoryStore, Store, StoreCursor, StoreError, StoreValue},
    transaction::Transaction,
};
