//! Transactions over a mesh base.
//!
//! All mutation goes through a [`Transaction`]: it holds the base's
//! single-writer guard, applies changes to the in-memory cache immediately
//! and records them in an ordered change log. `commit` computes the net
//! store outcome per object from that log, writes it back, and turns the
//! same changes into outgoing messages for every partner holding a replica
//! of an affected object.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::{
    base::MeshBase,
    error::{Error, NotAuthorized, StructuralConflict},
    keys::{now_millis, MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier,
        PropertyValue, Timestamps},
    mesh::MeshObject,
    message::{ChangeRecord, DeletionRecord, XprisoMessage},
    store::Store,
};

/// One entry of the change log.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    Created(MeshObjectIdentifier),
    Deleted {
        object: MeshObjectIdentifier,
        time_updated: Option<i64>,
    },
    Record(ChangeRecord),
}

impl Change {
    /// The objects whose state this change touched.
    fn affected(&self) -> Vec<&MeshObjectIdentifier> {
        match self {
            Change::Created(object) | Change::Deleted { object, .. } => vec![object],
            Change::Record(rec) => match rec {
                ChangeRecord::NeighborAdded { object, neighbor, .. }
                | ChangeRecord::NeighborRemoved { object, neighbor, .. }
                | ChangeRecord::RolesAdded { object, neighbor, .. }
                | ChangeRecord::RolesRemoved { object, neighbor, .. } => vec![object, neighbor],
                ChangeRecord::EquivalentAdded { object, peer, .. }
                | ChangeRecord::EquivalentRemoved { object, peer, .. } => vec![object, peer],
                other => vec![other.object()],
            },
        }
    }
}

/// An open transaction against one mesh base.
///
/// Transactions are serialized; holding one excludes every other writer.
/// Mutations take effect in memory as they are made and become durable and
/// visible to partners at [`commit`](Self::commit). A transaction dropped
/// without committing leaves its in-memory changes unpersisted and
/// unpropagated; callers are expected to commit.
#[derive(Debug)]
pub struct Transaction<'a, S: Store> {
    base: &'a MeshBase<S>,
    _guard: MutexGuard<'a, ()>,
    /// Partner whose incoming message caused this transaction, if any.
    /// Changes are never echoed back to it.
    origin: Option<MeshBaseIdentifier>,
    changes: Vec<Change>,
}

impl<'a, S: Store> Transaction<'a, S> {
    pub(crate) fn new(
        base: &'a MeshBase<S>,
        guard: MutexGuard<'a, ()>,
        origin: Option<MeshBaseIdentifier>,
    ) -> Self {
        Transaction {
            base,
            _guard: guard,
            origin,
            changes: Vec::new(),
        }
    }

    fn record(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Update-lock gate for local mutations: a replicated object may only
    /// be changed where its lock currently is.
    fn authorize(&self, object: &MeshObject) -> Result<(), Error> {
        if self.origin.is_none()
            && object.replica().is_replicated()
            && !object.replica().holds_lock()
        {
            return Err(NotAuthorized::LockNotHere(object.identifier().clone()).into());
        }
        Ok(())
    }

    fn with_object<R>(
        &self,
        id: &MeshObjectIdentifier,
        f: impl FnOnce(&mut MeshObject) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.base.with_cached_object(id, |obj| {
            self.authorize(obj)?;
            f(obj)
        })
    }

    // --- collaborator operations ----------------------------------------

    /// Creates a new object, homed and locked here.
    pub fn create_mesh_object(&mut self, id: MeshObjectIdentifier) -> Result<(), Error> {
        if self.base.contains(&id)? {
            return Err(StructuralConflict::AlreadyExists(id).into());
        }
        self.base
            .insert_into_cache(MeshObject::new(id.clone(), Timestamps::now()));
        self.record(Change::Created(id));
        Ok(())
    }

    pub fn bless(
        &mut self,
        id: &MeshObjectIdentifier,
        types: &[MeshTypeIdentifier],
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(id, |obj| Ok(obj.bless(types, now)?))?;
        self.record(Change::Record(ChangeRecord::TypesAdded {
            object: id.clone(),
            types: types.to_vec(),
            time_updated: Some(now),
        }));
        Ok(())
    }

    pub fn unbless(
        &mut self,
        id: &MeshObjectIdentifier,
        types: &[MeshTypeIdentifier],
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(id, |obj| Ok(obj.unbless(types, now)?))?;
        self.record(Change::Record(ChangeRecord::TypesRemoved {
            object: id.clone(),
            types: types.to_vec(),
            time_updated: Some(now),
        }));
        Ok(())
    }

    /// Relates two objects. Both sides are updated and both must be
    /// mutable here.
    pub fn relate(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(a, |obj| Ok(obj.relate(b.clone(), now)?))?;
        if let Err(e) = self.with_object(b, |obj| Ok(obj.relate(a.clone(), now)?)) {
            // roll the first side back so the relationship stays symmetric
            let _ = self.base.with_cached_object(a, |obj| Ok(obj.unrelate(b, now)?));
            return Err(e);
        }
        self.record(Change::Record(ChangeRecord::NeighborAdded {
            object: a.clone(),
            neighbor: b.clone(),
            roles: Vec::new(),
            time_updated: Some(now),
        }));
        Ok(())
    }

    pub fn unrelate(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(a, |obj| Ok(obj.unrelate(b, now)?))?;
        self.with_object(b, |obj| Ok(obj.unrelate(a, now)?))?;
        self.record(Change::Record(ChangeRecord::NeighborRemoved {
            object: a.clone(),
            neighbor: b.clone(),
            time_updated: Some(now),
        }));
        Ok(())
    }

    /// Blesses the relationship as seen from `a` towards `b`. Role
    /// blessings are directional.
    pub fn bless_roles(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles: &[MeshTypeIdentifier],
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(a, |obj| Ok(obj.bless_roles(b, roles, now)?))?;
        self.record(Change::Record(ChangeRecord::RolesAdded {
            object: a.clone(),
            neighbor: b.clone(),
            roles: roles.to_vec(),
            time_updated: Some(now),
        }));
        Ok(())
    }

    pub fn unbless_roles(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles: &[MeshTypeIdentifier],
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(a, |obj| Ok(obj.unbless_roles(b, roles, now)?))?;
        self.record(Change::Record(ChangeRecord::RolesRemoved {
            object: a.clone(),
            neighbor: b.clone(),
            roles: roles.to_vec(),
            time_updated: Some(now),
        }));
        Ok(())
    }

    pub fn set_property_value(
        &mut self,
        id: &MeshObjectIdentifier,
        property_type: MeshTypeIdentifier,
        value: PropertyValue,
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(id, |obj| {
            Ok(obj.set_property_value(property_type.clone(), value.clone(), now)?)
        })?;
        self.record(Change::Record(ChangeRecord::PropertiesSet {
            object: id.clone(),
            properties: vec![(property_type, value)],
            time_updated: Some(now),
        }));
        Ok(())
    }

    pub fn add_equivalent(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(a, |obj| Ok(obj.add_equivalent(b.clone(), now)?))?;
        if let Err(e) = self.with_object(b, |obj| Ok(obj.add_equivalent(a.clone(), now)?)) {
            let _ = self
                .base
                .with_cached_object(a, |obj| Ok(obj.remove_equivalent(b, now)?));
            return Err(e);
        }
        self.record(Change::Record(ChangeRecord::EquivalentAdded {
            object: a.clone(),
            peer: b.clone(),
            time_updated: Some(now),
        }));
        Ok(())
    }

    pub fn remove_equivalent(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<(), Error> {
        let now = now_millis();
        self.with_object(a, |obj| Ok(obj.remove_equivalent(b, now)?))?;
        self.with_object(b, |obj| Ok(obj.remove_equivalent(a, now)?))?;
        self.record(Change::Record(ChangeRecord::EquivalentRemoved {
            object: a.clone(),
            peer: b.clone(),
            time_updated: Some(now),
        }));
        Ok(())
    }

    /// Kills the object: it is unrelated from all neighbors, marked dead,
    /// and removed from the store at commit.
    ///
    /// Lifecycle authority stays with the home replica: holding the update
    /// lock alone does not permit deletion.
    pub fn delete(&mut self, id: &MeshObjectIdentifier) -> Result<(), Error> {
        let now = now_millis();
        let neighbors: Vec<MeshObjectIdentifier> = self.with_object(id, |obj| {
            if !obj.replica().is_home() {
                return Err(NotAuthorized::HomeNotHere(id.clone()).into());
            }
            Ok(obj.neighbors().cloned().collect())
        })?;
        for n in &neighbors {
            // structural maintenance on the neighbor side; the dying object
            // holds the deletion authority
            self.base.with_cached_object(n, |obj| {
                obj.ripple_unrelate(id, Some(now))?;
                Ok(())
            })?;
            self.record(Change::Record(ChangeRecord::NeighborRemoved {
                object: n.clone(),
                neighbor: id.clone(),
                time_updated: Some(now),
            }));
        }
        self.with_object(id, |obj| {
            obj.die(now);
            Ok(())
        })?;
        self.record(Change::Deleted {
            object: id.clone(),
            time_updated: Some(now),
        });
        Ok(())
    }

    // --- ripple operations ----------------------------------------------

    /// Replays one change record received from a partner.
    ///
    /// Authorization was enforced at the origin. A relational change names
    /// two objects and either, both or neither may be replicated here, so
    /// every locally held side is updated independently. If something was
    /// applied the record is re-recorded so commit propagates it onward to
    /// third replicas.
    pub(crate) fn ripple_apply(&mut self, record: ChangeRecord) -> Result<(), Error> {
        let applied = match &record {
            ChangeRecord::TypesAdded { object, types, time_updated } => {
                self.ripple_side(object, |obj| obj.ripple_bless(types, *time_updated))?
            }
            ChangeRecord::TypesRemoved { object, types, time_updated } => {
                self.ripple_side(object, |obj| obj.ripple_unbless(types, *time_updated))?
            }
            ChangeRecord::PropertiesSet { object, properties, time_updated } => {
                self.ripple_side(object, |obj| {
                    obj.ripple_set_property_values(properties, *time_updated)
                })?
            }
            ChangeRecord::NeighborAdded { object, neighbor, roles, time_updated } => {
                self.ripple_side(object, |obj| {
                    obj.ripple_relate(neighbor.clone(), roles.clone(), *time_updated)
                })? | self.ripple_side(neighbor, |obj| {
                    obj.ripple_relate(object.clone(), Vec::new(), *time_updated)
                })?
            }
            ChangeRecord::NeighborRemoved { object, neighbor, time_updated } => {
                self.ripple_side(object, |obj| obj.ripple_unrelate(neighbor, *time_updated))?
                    | self.ripple_side(neighbor, |obj| {
                        obj.ripple_unrelate(object, *time_updated)
                    })?
            }
            // role blessings are directional; only the `object` side holds
            // state for them
            ChangeRecord::RolesAdded { object, neighbor, roles, time_updated } => {
                self.ripple_side(object, |obj| {
                    obj.ripple_bless_roles(neighbor, roles, *time_updated)
                })?
            }
            ChangeRecord::RolesRemoved { object, neighbor, roles, time_updated } => {
                self.ripple_side(object, |obj| {
                    obj.ripple_unbless_roles(neighbor, roles, *time_updated)
                })?
            }
            ChangeRecord::EquivalentAdded { object, peer, time_updated } => {
                self.ripple_side(object, |obj| {
                    obj.ripple_add_equivalent(peer.clone(), *time_updated)
                })? | self.ripple_side(peer, |obj| {
                    obj.ripple_add_equivalent(object.clone(), *time_updated)
                })?
            }
            ChangeRecord::EquivalentRemoved { object, peer, time_updated } => {
                self.ripple_side(object, |obj| obj.ripple_remove_equivalent(peer, *time_updated))?
                    | self.ripple_side(peer, |obj| {
                        obj.ripple_remove_equivalent(object, *time_updated)
                    })?
            }
        };
        if applied {
            self.record(Change::Record(record));
        } else {
            // partners target changes at the union of affected objects; not
            // holding a replica of any of them is routine, not drift
            debug!(object = %record.object(), "ignoring change for objects not replicated here");
        }
        Ok(())
    }

    /// Applies one side of a ripple if a replica of `id` is held here.
    /// Returns whether it was.
    fn ripple_side(
        &self,
        id: &MeshObjectIdentifier,
        f: impl FnOnce(&mut MeshObject) -> Result<(), StructuralConflict>,
    ) -> Result<bool, Error> {
        if !self.base.contains(id)? {
            return Ok(false);
        }
        self.base.with_cached_object(id, |obj| Ok(f(obj)?))?;
        Ok(true)
    }

    /// Replays an object death received from a partner.
    pub(crate) fn ripple_delete(
        &mut self,
        id: &MeshObjectIdentifier,
        time_updated: Option<i64>,
    ) -> Result<(), Error> {
        if !self.base.contains(id)? {
            // never replicated here; nothing to kill
            return Ok(());
        }
        let neighbors: Vec<MeshObjectIdentifier> =
            self.base.with_cached_object(id, |obj| Ok(obj.neighbors().cloned().collect()))?;
        for n in &neighbors {
            self.ripple_side(n, |obj| obj.ripple_unrelate(id, time_updated))?;
        }
        self.base.with_cached_object(id, |obj| {
            obj.ripple_delete(time_updated);
            Ok(())
        })?;
        self.record(Change::Deleted {
            object: id.clone(),
            time_updated,
        });
        Ok(())
    }

    // --- commit ----------------------------------------------------------

    /// Commits the transaction: net write-back to the store, then message
    /// construction for every partner holding a replica of a changed
    /// object (except the ripple origin).
    ///
    /// The in-memory changes stand regardless; a store failure is returned
    /// after the full net set has been attempted.
    pub fn commit(self) -> Result<(), Error> {
        let Transaction { base, _guard, origin, changes } = self;
        if changes.is_empty() {
            return Ok(());
        }
        debug!(count = changes.len(), "committing transaction");

        // Net store outcome per object: the last change in log order wins,
        // so scan backwards and act on first sight only. An object created
        // and deleted in the same transaction nets out to nothing.
        let mut seen: BTreeSet<MeshObjectIdentifier> = BTreeSet::new();
        let mut first_error: Option<Error> = None;
        for change in changes.iter().rev() {
            for id in change.affected() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                let result = if matches!(change, Change::Deleted { object, .. } if object == id) {
                    base.remove_object_record(id)
                } else {
                    match base.contains(id) {
                        // a relational ripple can name an object that was
                        // never replicated here
                        Ok(false) => Ok(()),
                        Ok(true) => base.persist_object(id),
                        Err(e) => Err(e),
                    }
                };
                if let Err(e) = result {
                    warn!(object = %id, %e, "write-back failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        // Outgoing propagation, one message per partner.
        let mut outgoing: BTreeMap<MeshBaseIdentifier, XprisoMessage> = BTreeMap::new();
        let local = base.identifier().clone();
        for change in &changes {
            let mut partners: BTreeSet<MeshBaseIdentifier> = BTreeSet::new();
            for id in change.affected() {
                for p in base.replica_partners(id)? {
                    partners.insert(p);
                }
            }
            if let Some(origin) = &origin {
                partners.remove(origin);
            }
            for partner in partners {
                let msg = outgoing
                    .entry(partner.clone())
                    .or_insert_with(|| XprisoMessage::new(local.clone(), partner.clone()));
                match change {
                    Change::Created(_) => {}
                    Change::Deleted { object, time_updated } => {
                        msg.deletions.push(DeletionRecord {
                            identifier: object.clone(),
                            time_updated: *time_updated,
                        });
                    }
                    Change::Record(rec) => msg.changes.push(rec.clone()),
                }
            }
        }
        for (partner, msg) in outgoing {
            if msg.is_empty() {
                continue;
            }
            if let Err(e) = base.enqueue_and_persist(&partner, msg) {
                warn!(partner = %partner, %e, "failed to queue propagation");
                if matches!(e, Error::Store(_)) {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
