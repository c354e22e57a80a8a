//! The mesh object model: graph nodes with type blessings, properties,
//! relationships and equivalence, plus the ripple mutations that mirror
//! changes committed on other replicas.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::StructuralConflict,
    keys::{
        MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier, PropertyValue, Timestamps,
    },
    replica::ReplicaState,
};

/// A graph node held by one mesh base.
///
/// Replicas of the same object in other mesh bases are separate
/// `MeshObject` instances correlated only by identifier; the embedded
/// [`ReplicaState`] tracks where home and update lock currently are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshObject {
    identifier: MeshObjectIdentifier,
    types: BTreeSet<MeshTypeIdentifier>,
    properties: BTreeMap<MeshTypeIdentifier, PropertyValue>,
    neighbors: BTreeMap<MeshObjectIdentifier, BTreeSet<MeshTypeIdentifier>>,
    equivalents: BTreeSet<MeshObjectIdentifier>,
    timestamps: Timestamps,
    is_dead: bool,
    replica: ReplicaState,
}

impl MeshObject {
    /// A fresh, unreplicated object homed in the creating mesh base.
    pub fn new(identifier: MeshObjectIdentifier, timestamps: Timestamps) -> Self {
        MeshObject {
            identifier,
            types: BTreeSet::new(),
            properties: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            equivalents: BTreeSet::new(),
            timestamps,
            is_dead: false,
            replica: ReplicaState::local(),
        }
    }

    pub fn identifier(&self) -> &MeshObjectIdentifier {
        &self.identifier
    }

    pub fn types(&self) -> impl Iterator<Item = &MeshTypeIdentifier> {
        self.types.iter()
    }

    pub fn is_blessed_with(&self, entity_type: &MeshTypeIdentifier) -> bool {
        self.types.contains(entity_type)
    }

    pub fn property_value(&self, property_type: &MeshTypeIdentifier) -> Option<&PropertyValue> {
        self.properties.get(property_type)
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &MeshObjectIdentifier> {
        self.neighbors.keys()
    }

    pub fn is_related_to(&self, neighbor: &MeshObjectIdentifier) -> bool {
        self.neighbors.contains_key(neighbor)
    }

    pub fn roles_towards(
        &self,
        neighbor: &MeshObjectIdentifier,
    ) -> Option<&BTreeSet<MeshTypeIdentifier>> {
        self.neighbors.get(neighbor)
    }

    pub fn equivalents(&self) -> impl Iterator<Item = &MeshObjectIdentifier> {
        self.equivalents.iter()
    }

    pub fn timestamps(&self) -> Timestamps {
        self.timestamps
    }

    pub fn is_dead(&self) -> bool {
        self.is_dead
    }

    pub fn replica(&self) -> &ReplicaState {
        &self.replica
    }

    pub(crate) fn replica_mut(&mut self) -> &mut ReplicaState {
        &mut self.replica
    }

    pub(crate) fn mark_read(&mut self, now: i64) {
        self.timestamps.read = now;
    }

    fn check_alive(&self) -> Result<(), StructuralConflict> {
        if self.is_dead {
            Err(StructuralConflict::IsDead(self.identifier.clone()))
        } else {
            Ok(())
        }
    }

    fn touch(&mut self, now: i64) {
        self.timestamps.updated = now;
    }

    // Ripple operations carry the originating replica's update time; `None`
    // means leave the local timestamp alone.
    fn touch_ripple(&mut self, time_updated: Option<i64>) {
        if let Some(t) = time_updated {
            self.timestamps.updated = t;
        }
    }

    // --- local mutations -------------------------------------------------
    //
    // Invoked on behalf of local application code, inside a transaction.
    // The update-lock check happens at the transaction layer; here only
    // structural invariants are enforced.

    pub(crate) fn bless(
        &mut self,
        types: &[MeshTypeIdentifier],
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        for t in types {
            if self.types.contains(t) {
                return Err(StructuralConflict::AlreadyBlessed {
                    object: self.identifier.clone(),
                    entity_type: t.clone(),
                });
            }
        }
        self.types.extend(types.iter().cloned());
        self.touch(now);
        Ok(())
    }

    pub(crate) fn unbless(
        &mut self,
        types: &[MeshTypeIdentifier],
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        for t in types {
            if !self.types.contains(t) {
                return Err(StructuralConflict::NotBlessed {
                    object: self.identifier.clone(),
                    entity_type: t.clone(),
                });
            }
        }
        for t in types {
            self.types.remove(t);
        }
        self.touch(now);
        Ok(())
    }

    pub(crate) fn relate(
        &mut self,
        neighbor: MeshObjectIdentifier,
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        if self.neighbors.contains_key(&neighbor) {
            return Err(StructuralConflict::AlreadyRelated {
                object: self.identifier.clone(),
                neighbor,
            });
        }
        self.neighbors.insert(neighbor, BTreeSet::new());
        self.touch(now);
        Ok(())
    }

    pub(crate) fn unrelate(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        if self.neighbors.remove(neighbor).is_none() {
            return Err(StructuralConflict::NotRelated {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            });
        }
        self.touch(now);
        Ok(())
    }

    pub(crate) fn bless_roles(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        roles: &[MeshTypeIdentifier],
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        let Some(existing) = self.neighbors.get_mut(neighbor) else {
            return Err(StructuralConflict::NotRelated {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            });
        };
        for r in roles {
            if existing.contains(r) {
                return Err(StructuralConflict::RoleAlreadyBlessed {
                    object: self.identifier.clone(),
                    neighbor: neighbor.clone(),
                    role_type: r.clone(),
                });
            }
        }
        existing.extend(roles.iter().cloned());
        self.touch(now);
        Ok(())
    }

    pub(crate) fn unbless_roles(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        roles: &[MeshTypeIdentifier],
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        let Some(existing) = self.neighbors.get_mut(neighbor) else {
            return Err(StructuralConflict::NotRelated {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            });
        };
        for r in roles {
            if !existing.contains(r) {
                return Err(StructuralConflict::RoleNotBlessed {
                    object: self.identifier.clone(),
                    neighbor: neighbor.clone(),
                    role_type: r.clone(),
                });
            }
        }
        for r in roles {
            existing.remove(r);
        }
        self.touch(now);
        Ok(())
    }

    pub(crate) fn add_equivalent(
        &mut self,
        peer: MeshObjectIdentifier,
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        if !self.equivalents.insert(peer.clone()) {
            return Err(StructuralConflict::AlreadyEquivalent {
                object: self.identifier.clone(),
                peer,
            });
        }
        self.touch(now);
        Ok(())
    }

    pub(crate) fn remove_equivalent(
        &mut self,
        peer: &MeshObjectIdentifier,
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        if !self.equivalents.remove(peer) {
            return Err(StructuralConflict::NotEquivalent {
                object: self.identifier.clone(),
                peer: peer.clone(),
            });
        }
        self.touch(now);
        Ok(())
    }

    pub(crate) fn set_property_value(
        &mut self,
        property_type: MeshTypeIdentifier,
        value: PropertyValue,
        now: i64,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        self.properties.insert(property_type, value);
        self.touch(now);
        Ok(())
    }

    /// The terminal death transition. Idempotent; a dead object stays dead.
    pub(crate) fn die(&mut self, now: i64) {
        if !self.is_dead {
            self.is_dead = true;
            self.touch(now);
        }
    }

    // --- ripple mutations ------------------------------------------------
    //
    // These mirror a change already validated and committed on another
    // replica. Authorization was enforced at the origin; only structural
    // invariants apply here. All of them are idempotent: replaying the
    // same change with the same `time_updated` leaves the object unchanged
    // and succeeds.

    pub(crate) fn ripple_bless(
        &mut self,
        types: &[MeshTypeIdentifier],
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        let missing: Vec<_> = types
            .iter()
            .filter(|t| !self.types.contains(*t))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.types.extend(missing);
        self.touch_ripple(time_updated);
        Ok(())
    }

    pub(crate) fn ripple_unbless(
        &mut self,
        types: &[MeshTypeIdentifier],
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        let mut removed = false;
        for t in types {
            removed |= self.types.remove(t);
        }
        if removed {
            self.touch_ripple(time_updated);
        }
        Ok(())
    }

    pub(crate) fn ripple_relate(
        &mut self,
        neighbor: MeshObjectIdentifier,
        roles: Vec<MeshTypeIdentifier>,
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        if let Some(existing) = self.neighbors.get_mut(&neighbor) {
            // duplicate delivery; merge any roles we might have missed
            existing.extend(roles);
            return Ok(());
        }
        self.neighbors.insert(neighbor, roles.into_iter().collect());
        self.touch_ripple(time_updated);
        Ok(())
    }

    pub(crate) fn ripple_unrelate(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        if self.neighbors.remove(neighbor).is_some() {
            self.touch_ripple(time_updated);
        }
        Ok(())
    }

    pub(crate) fn ripple_bless_roles(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        roles: &[MeshTypeIdentifier],
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        let existing = self.neighbors.get_mut(neighbor).ok_or_else(|| {
            StructuralConflict::NotRelated {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            }
        })?;
        let before = existing.len();
        existing.extend(roles.iter().cloned());
        if existing.len() != before {
            self.touch_ripple(time_updated);
        }
        Ok(())
    }

    pub(crate) fn ripple_unbless_roles(
        &mut self,
        neighbor: &MeshObjectIdentifier,
        roles: &[MeshTypeIdentifier],
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        let existing = self.neighbors.get_mut(neighbor).ok_or_else(|| {
            StructuralConflict::NotRelated {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            }
        })?;
        let mut removed = false;
        for r in roles {
            removed |= existing.remove(r);
        }
        if removed {
            self.touch_ripple(time_updated);
        }
        Ok(())
    }

    pub(crate) fn ripple_add_equivalent(
        &mut self,
        peer: MeshObjectIdentifier,
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        if self.equivalents.insert(peer) {
            self.touch_ripple(time_updated);
        }
        Ok(())
    }

    pub(crate) fn ripple_remove_equivalent(
        &mut self,
        peer: &MeshObjectIdentifier,
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        if self.equivalents.remove(peer) {
            self.touch_ripple(time_updated);
        }
        Ok(())
    }

    pub(crate) fn ripple_set_property_values(
        &mut self,
        properties: &[(MeshTypeIdentifier, PropertyValue)],
        time_updated: Option<i64>,
    ) -> Result<(), StructuralConflict> {
        self.check_alive()?;
        let unchanged = properties
            .iter()
            .all(|(k, v)| self.properties.get(k) == Some(v))
            && time_updated
                .map(|t| t == self.timestamps.updated)
                .unwrap_or(true);
        if unchanged {
            return Ok(());
        }
        for (k, v) in properties {
            self.properties.insert(k.clone(), v.clone());
        }
        self.touch_ripple(time_updated);
        Ok(())
    }

    pub(crate) fn ripple_delete(&mut self, time_updated: Option<i64>) {
        if !self.is_dead {
            self.is_dead = true;
            self.touch_ripple(time_updated);
        }
    }

    /// Replaces the whole content of this replica with authoritative data,
    /// leaving the replica set untouched. Drift recovery path.
    pub(crate) fn reset_content_from(&mut self, ext: ExternalizedMeshObject) {
        self.types = ext.types.into_iter().collect();
        self.properties = ext.properties.into_iter().collect();
        self.neighbors = ext
            .neighbors
            .into_iter()
            .map(|(n, roles)| (n, roles.into_iter().collect()))
            .collect();
        self.equivalents = ext.equivalents.into_iter().collect();
        self.timestamps = ext.timestamps;
        self.is_dead = ext.is_dead;
    }

    // --- externalization -------------------------------------------------

    /// Flat snapshot of the full externalizable state.
    pub fn to_externalized(&self) -> ExternalizedMeshObject {
        ExternalizedMeshObject {
            identifier: self.identifier.clone(),
            types: self.types.iter().cloned().collect(),
            properties: self
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            neighbors: self
                .neighbors
                .iter()
                .map(|(n, roles)| (n.clone(), roles.iter().cloned().collect()))
                .collect(),
            equivalents: self.equivalents.iter().cloned().collect(),
            timestamps: self.timestamps,
            is_dead: self.is_dead,
            proxies: self.replica.proxies().to_vec(),
            home_proxy: self.replica.home_index(),
            lock_proxy: self.replica.lock_index(),
        }
    }

    /// Rebuilds an object from its externalized form.
    pub fn from_externalized(ext: ExternalizedMeshObject) -> Self {
        let mut replica = ReplicaState::local();
        // indexes were validated on the encoding side; out-of-range data
        // collapses to the local default rather than panicking
        if let Err(cause) = replica.resynchronize(ext.proxies, ext.home_proxy, ext.lock_proxy) {
            warn!(object = %ext.identifier, %cause, "discarding invalid replica pointers");
        }
        MeshObject {
            identifier: ext.identifier,
            types: ext.types.into_iter().collect(),
            properties: ext.properties.into_iter().collect(),
            neighbors: ext
                .neighbors
                .into_iter()
                .map(|(n, roles)| (n, roles.into_iter().collect()))
                .collect(),
            equivalents: ext.equivalents.into_iter().collect(),
            timestamps: ext.timestamps,
            is_dead: ext.is_dead,
            replica,
        }
    }
}

/// Serializable snapshot of a [`MeshObject`]; pure data, no behavior.
///
/// Neighbors and equivalents are carried by identifier only, so decoding
/// never requires the referenced objects to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalizedMeshObject {
    pub identifier: MeshObjectIdentifier,
    pub types: Vec<MeshTypeIdentifier>,
    pub properties: Vec<(MeshTypeIdentifier, PropertyValue)>,
    pub neighbors: Vec<(MeshObjectIdentifier, Vec<MeshTypeIdentifier>)>,
    pub equivalents: Vec<MeshObjectIdentifier>,
    pub timestamps: Timestamps,
    pub is_dead: bool,
    /// Partner mesh bases holding replicas of this object.
    pub proxies: Vec<MeshBaseIdentifier>,
    /// Index into `proxies` towards the home replica; `None` = here.
    pub home_proxy: Option<usize>,
    /// Index into `proxies` towards the lock holder; `None` = here.
    pub lock_proxy: Option<usize>,
}
