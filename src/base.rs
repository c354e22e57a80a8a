//! The mesh base: object cache over a [`Store`], proxy management, and the
//! receive path that applies incoming protocol messages.
//!
//! A [`MeshBase`] is a cheaply cloneable handle; clones share the cache,
//! the proxy map and the single-writer transaction guard. All graph
//! mutation happens through [`Transaction`]s; all partner communication
//! happens through the per-partner [`Proxy`] objects this type manages.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::{
    codec,
    error::{Error, NotAuthorized, ProtocolViolation, StructuralConflict},
    keys::{now_millis, Interner, MeshBaseIdentifier, MeshObjectIdentifier, ResolutionContext},
    mesh::{ExternalizedMeshObject, MeshObject},
    message::XprisoMessage,
    proxy::{CoherenceSpecification, Proxy},
    replica::ReplicaState,
    store::{Store, StoreError, StoreValue},
    transaction::Transaction,
};

const MESH_KEY_PREFIX: &str = "mesh/";
const PROXY_KEY_PREFIX: &str = "proxy/";

fn mesh_key(id: &MeshObjectIdentifier) -> String {
    format!("{MESH_KEY_PREFIX}{id}")
}

fn proxy_key(partner: &MeshBaseIdentifier) -> String {
    format!("{PROXY_KEY_PREFIX}{partner}")
}

#[derive(Debug)]
struct BaseInner<S> {
    identifier: MeshBaseIdentifier,
    store: S,
    /// Write-through cache over the store's mesh objects.
    cache: RwLock<HashMap<MeshObjectIdentifier, MeshObject>>,
    proxies: RwLock<BTreeMap<MeshBaseIdentifier, Proxy>>,
    interner: Interner,
    /// Serializes transactions; one writer at a time.
    tx_lock: Mutex<()>,
    /// Requests relayed towards the current lock/home holder, by object:
    /// when the authority arrives here it is passed on to the requester.
    /// In-memory only; a requester re-requests after a restart.
    pending_lock_requests: RwLock<BTreeMap<MeshObjectIdentifier, MeshBaseIdentifier>>,
    pending_home_requests: RwLock<BTreeMap<MeshObjectIdentifier, MeshBaseIdentifier>>,
}

/// One graph database participating in replication.
#[derive(Debug, Clone)]
pub struct MeshBase<S: Store> {
    inner: Arc<BaseInner<S>>,
}

impl<S: Store> MeshBase<S> {
    /// Opens the mesh base over `store`, restoring all persisted proxies.
    pub fn create(identifier: MeshBaseIdentifier, store: S) -> Result<Self, Error> {
        store.initialize_if_necessary()?;
        let base = MeshBase {
            inner: Arc::new(BaseInner {
                identifier,
                store,
                cache: RwLock::new(HashMap::new()),
                proxies: RwLock::new(BTreeMap::new()),
                interner: Interner::new(),
                tx_lock: Mutex::new(()),
                pending_lock_requests: RwLock::new(BTreeMap::new()),
                pending_home_requests: RwLock::new(BTreeMap::new()),
            }),
        };
        base.restore_proxies()?;
        Ok(base)
    }

    pub fn identifier(&self) -> &MeshBaseIdentifier {
        &self.inner.identifier
    }

    fn restore_proxies(&self) -> Result<(), Error> {
        let mut cursor = self.inner.store.cursor()?;
        let mut proxies = self.inner.proxies.write();
        while let Some((key, value)) = cursor.next() {
            if !key.starts_with(PROXY_KEY_PREFIX) {
                continue;
            }
            let ext = codec::decode_proxy(&value.encoding_id, &value.data, &self.inner.interner)?;
            let proxy = Proxy::from_externalized(ext);
            proxies.insert(proxy.partner(), proxy);
        }
        if !proxies.is_empty() {
            debug!(count = proxies.len(), "restored proxies");
        }
        Ok(())
    }

    // --- object access ---------------------------------------------------

    /// Looks up an object, refreshing the cache from the store on a miss.
    /// Returns a snapshot; mutation goes through transactions.
    pub fn find(&self, id: &MeshObjectIdentifier) -> Result<Option<MeshObject>, Error> {
        if !self.ensure_loaded(id)? {
            return Ok(None);
        }
        let mut cache = self.inner.cache.write();
        let Some(obj) = cache.get_mut(id) else {
            return Ok(None);
        };
        obj.mark_read(now_millis());
        Ok(Some(obj.clone()))
    }

    /// Snapshots of all neighbors of `id`.
    pub fn traverse(&self, id: &MeshObjectIdentifier) -> Result<Vec<MeshObject>, Error> {
        let neighbors: Vec<MeshObjectIdentifier> =
            self.with_cached_object(id, |obj| Ok(obj.neighbors().cloned().collect()))?;
        let mut out = Vec::with_capacity(neighbors.len());
        for n in &neighbors {
            if let Some(obj) = self.find(n)? {
                out.push(obj);
            }
        }
        Ok(out)
    }

    pub(crate) fn contains(&self, id: &MeshObjectIdentifier) -> Result<bool, Error> {
        self.ensure_loaded(id)
    }

    /// Loads `id` into the cache from the store if absent. Returns whether
    /// the object is known.
    fn ensure_loaded(&self, id: &MeshObjectIdentifier) -> Result<bool, Error> {
        if self.inner.cache.read().contains_key(id) {
            return Ok(true);
        }
        match self.inner.store.get(&mesh_key(id)) {
            Ok(value) => {
                let ext =
                    codec::decode_mesh_object(&value.encoding_id, &value.data, &self.inner.interner)?;
                let obj = MeshObject::from_externalized(ext);
                self.inner.cache.write().entry(id.clone()).or_insert(obj);
                Ok(true)
            }
            Err(StoreError::KeyNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn with_cached_object<R>(
        &self,
        id: &MeshObjectIdentifier,
        f: impl FnOnce(&mut MeshObject) -> Result<R, Error>,
    ) -> Result<R, Error> {
        if !self.ensure_loaded(id)? {
            return Err(StructuralConflict::UnknownObject(id.clone()).into());
        }
        let mut cache = self.inner.cache.write();
        let obj = cache
            .get_mut(id)
            .ok_or_else(|| StructuralConflict::UnknownObject(id.clone()))?;
        f(obj)
    }

    pub(crate) fn insert_into_cache(&self, object: MeshObject) {
        self.inner
            .cache
            .write()
            .insert(object.identifier().clone(), object);
    }

    /// Writes the cached state of `id` through to the store.
    pub(crate) fn persist_object(&self, id: &MeshObjectIdentifier) -> Result<(), Error> {
        let (ext, timestamps) = {
            let cache = self.inner.cache.read();
            let obj = cache
                .get(id)
                .ok_or_else(|| StructuralConflict::UnknownObject(id.clone()))?;
            (obj.to_externalized(), obj.timestamps())
        };
        let data = codec::encode_mesh_object(&ext)?;
        let value = StoreValue::new(codec::MESH_OBJECT_ENCODING, timestamps, data);
        self.inner.store.put_or_update(&mesh_key(id), value)?;
        Ok(())
    }

    /// Removes the store record of a dead object. The cached tombstone
    /// stays so replicas still observe the death.
    pub(crate) fn remove_object_record(&self, id: &MeshObjectIdentifier) -> Result<(), Error> {
        match self.inner.store.delete(&mesh_key(id)) {
            Ok(()) | Err(StoreError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn replica_partners(
        &self,
        id: &MeshObjectIdentifier,
    ) -> Result<Vec<MeshBaseIdentifier>, Error> {
        if !self.ensure_loaded(id)? {
            return Ok(Vec::new());
        }
        let cache = self.inner.cache.read();
        Ok(cache
            .get(id)
            .map(|obj| obj.replica().proxies().to_vec())
            .unwrap_or_default())
    }

    // --- transactions ----------------------------------------------------

    /// Opens a transaction on behalf of local application code.
    pub fn begin_transaction(&self) -> Transaction<'_, S> {
        Transaction::new(self, self.inner.tx_lock.lock(), None)
    }

    /// Opens a transaction replaying changes received from `origin`;
    /// authorization checks are skipped and nothing is echoed back.
    pub(crate) fn begin_ripple(&self, origin: MeshBaseIdentifier) -> Transaction<'_, S> {
        Transaction::new(self, self.inner.tx_lock.lock(), Some(origin))
    }

    // --- proxy management ------------------------------------------------

    /// Returns the proxy towards `partner`, creating and persisting it on
    /// first contact.
    pub fn obtain_proxy(
        &self,
        partner: MeshBaseIdentifier,
        coherence: CoherenceSpecification,
    ) -> Result<Proxy, Error> {
        if let Some(found) = self.inner.proxies.read().get(&partner) {
            return Ok(found.clone());
        }
        let proxy = {
            let mut proxies = self.inner.proxies.write();
            proxies
                .entry(partner.clone())
                .or_insert_with(|| Proxy::new(self.inner.identifier.clone(), partner, coherence))
                .clone()
        };
        self.persist_proxy(&proxy)?;
        Ok(proxy)
    }

    pub fn proxy_towards(&self, partner: &MeshBaseIdentifier) -> Option<Proxy> {
        self.inner.proxies.read().get(partner).cloned()
    }

    pub fn proxies(&self) -> Vec<Proxy> {
        self.inner.proxies.read().values().cloned().collect()
    }

    pub(crate) fn persist_proxy(&self, proxy: &Proxy) -> Result<(), Error> {
        let ext = proxy.to_externalized();
        let data = codec::encode_proxy(&ext)?;
        let value = StoreValue::new(codec::PROXY_ENCODING, ext.timestamps, data);
        self.inner
            .store
            .put_or_update(&proxy_key(&ext.partner), value)?;
        Ok(())
    }

    pub(crate) fn enqueue_and_persist(
        &self,
        partner: &MeshBaseIdentifier,
        message: XprisoMessage,
    ) -> Result<(), Error> {
        let proxy = self.obtain_proxy(partner.clone(), CoherenceSpecification::default())?;
        proxy.enqueue_for_send(message)?;
        self.persist_proxy(&proxy)
    }

    /// Drains the outgoing queue towards `partner`, assigning send tokens,
    /// and persists the proxy so tokens survive a restart. The caller hands
    /// the returned messages to transport.
    pub fn take_outgoing(
        &self,
        partner: &MeshBaseIdentifier,
    ) -> Result<Vec<XprisoMessage>, Error> {
        let proxy = self
            .proxy_towards(partner)
            .ok_or_else(|| ProtocolViolation::UnknownProxy(partner.clone()))?;
        let messages = proxy.mark_sent();
        self.persist_proxy(&proxy)?;
        Ok(messages)
    }

    /// Tears down the channel towards `partner`: a final
    /// `cease_communications` message is returned for delivery, the proxy
    /// record is removed, and the partner is dropped from every replica set.
    pub fn destroy_proxy(
        &self,
        partner: &MeshBaseIdentifier,
    ) -> Result<Vec<XprisoMessage>, Error> {
        let proxy = self
            .proxy_towards(partner)
            .ok_or_else(|| ProtocolViolation::UnknownProxy(partner.clone()))?;
        let mut farewell = XprisoMessage::new(self.inner.identifier.clone(), partner.clone());
        farewell.cease_communications = true;
        proxy.enqueue_for_send(farewell)?;
        let messages = proxy.mark_sent();
        self.forget_partner(partner)?;
        Ok(messages)
    }

    /// Removes the proxy record and strips `partner` from all replica sets.
    fn forget_partner(&self, partner: &MeshBaseIdentifier) -> Result<(), Error> {
        self.inner.proxies.write().remove(partner);
        self.inner
            .pending_lock_requests
            .write()
            .retain(|_, requester| requester != partner);
        self.inner
            .pending_home_requests
            .write()
            .retain(|_, requester| requester != partner);
        match self.inner.store.delete(&proxy_key(partner)) {
            Ok(()) | Err(StoreError::KeyNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        // every persisted object referencing the partner needs fixing, not
        // just the currently cached ones
        let mut cursor = self.inner.store.cursor()?;
        let mut affected = Vec::new();
        while let Some((key, _)) = cursor.next() {
            if let Some(raw) = key.strip_prefix(MESH_KEY_PREFIX) {
                affected.push(self.inner.interner.object_identifier(raw));
            }
        }
        for id in affected {
            let changed = self.with_cached_object(&id, |obj| {
                if obj.replica().proxies().contains(partner) {
                    obj.replica_mut().remove_proxy(partner);
                    Ok(true)
                } else {
                    Ok(false)
                }
            })?;
            if changed {
                self.persist_object(&id)?;
            }
        }
        Ok(())
    }

    // --- replication surface ---------------------------------------------

    /// Conveys the full state of `id` to `partner`, adding the partner to
    /// the object's replica set.
    pub fn export_replica(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<(), Error> {
        let ext = self.export_snapshot(id, partner)?;
        let mut msg = XprisoMessage::new(self.inner.identifier.clone(), partner.clone());
        msg.conveyed.push(ext);
        self.enqueue_and_persist(partner, msg)
    }

    fn export_snapshot(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<ExternalizedMeshObject, Error> {
        let ext = self.with_cached_object(id, |obj| {
            obj.replica_mut().add_proxy(partner.clone());
            Ok(obj.to_externalized())
        })?;
        self.persist_object(id)?;
        Ok(ext)
    }

    /// Asks `partner` for a first-time replica of `id`.
    pub fn request_replica(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<(), Error> {
        let mut msg = XprisoMessage::new(self.inner.identifier.clone(), partner.clone());
        msg.requested_first_time.push(id.clone());
        self.enqueue_and_persist(partner, msg)
    }

    /// Asks the current lock direction for the update lock of `id`.
    /// A no-op if the lock is already here.
    pub fn request_lock(&self, id: &MeshObjectIdentifier) -> Result<(), Error> {
        let towards =
            self.with_cached_object(id, |obj| Ok(obj.replica().lock_partner().cloned()))?;
        let Some(partner) = towards else {
            return Ok(());
        };
        let mut msg = XprisoMessage::new(self.inner.identifier.clone(), partner.clone());
        msg.requested_locks.push(id.clone());
        self.enqueue_and_persist(&partner, msg)
    }

    /// Asks the current home direction for home replica status of `id`.
    pub fn request_home_replica(&self, id: &MeshObjectIdentifier) -> Result<(), Error> {
        let towards =
            self.with_cached_object(id, |obj| Ok(obj.replica().home_partner().cloned()))?;
        let Some(partner) = towards else {
            return Ok(());
        };
        let mut msg = XprisoMessage::new(self.inner.identifier.clone(), partner.clone());
        msg.requested_home_replicas.push(id.clone());
        self.enqueue_and_persist(&partner, msg)
    }

    /// Asks the home direction for authoritative replica data of `id`,
    /// the recovery path after drift.
    pub fn request_resynchronize(&self, id: &MeshObjectIdentifier) -> Result<(), Error> {
        let towards =
            self.with_cached_object(id, |obj| Ok(obj.replica().home_partner().cloned()))?;
        let Some(partner) = towards else {
            return Ok(());
        };
        let mut msg = XprisoMessage::new(self.inner.identifier.clone(), partner.clone());
        msg.resynchronize_requests.push(id.clone());
        self.enqueue_and_persist(&partner, msg)
    }

    // --- receive path ----------------------------------------------------

    /// Applies a batch of incoming messages from `partner`.
    ///
    /// The proxy filters endpoint mismatches, duplicates and malformed
    /// messages; everything accepted is processed in token order. Replies
    /// (conveyed replicas, granted locks) are queued on the proxy for the
    /// next [`take_outgoing`](Self::take_outgoing).
    pub fn receive_from(
        &self,
        partner: &MeshBaseIdentifier,
        messages: Vec<XprisoMessage>,
    ) -> Result<(), Error> {
        let proxy = self
            .proxy_towards(partner)
            .ok_or_else(|| ProtocolViolation::UnknownProxy(partner.clone()))?;
        let accepted = proxy.receive(messages);
        let mut cease = false;
        for msg in accepted {
            self.process_message(&proxy, partner, msg, &mut cease)?;
        }
        self.persist_proxy(&proxy)?;
        if cease {
            debug!(partner = %partner, "partner ceased communications");
            self.forget_partner(partner)?;
        }
        Ok(())
    }

    fn process_message(
        &self,
        proxy: &Proxy,
        partner: &MeshBaseIdentifier,
        msg: XprisoMessage,
        cease: &mut bool,
    ) -> Result<(), Error> {
        let mut reply = XprisoMessage::new(self.inner.identifier.clone(), partner.clone());

        // conveyed replicas: first-time materialization or authoritative
        // reset, depending on whether we already hold one
        let had_conveyed = !msg.conveyed.is_empty();
        for ext in msg.conveyed {
            self.materialize_replica(partner, ext)?;
        }
        if had_conveyed {
            proxy.clear_drift();
        }

        for id in &msg.requested_first_time {
            if self.contains(id)? {
                reply.conveyed.push(self.export_snapshot(id, partner)?);
            } else {
                warn!(object = %id, partner = %partner, "first-time request for unknown object");
            }
        }

        for id in &msg.resynchronize_requests {
            if self.contains(id)? {
                reply.conveyed.push(self.export_snapshot(id, partner)?);
            } else {
                warn!(object = %id, partner = %partner, "resynchronize request for unknown object");
            }
        }

        // ripple changes and deletions, one transaction per message
        if !msg.changes.is_empty() || !msg.deletions.is_empty() {
            let mut txn = self.begin_ripple(partner.clone());
            for record in msg.changes {
                match txn.ripple_apply(record) {
                    Ok(()) => {}
                    Err(Error::Conflict(cause)) => {
                        warn!(partner = %partner, %cause, "skipping conflicting ripple change");
                        proxy.note_drift();
                    }
                    Err(e) => return Err(e),
                }
            }
            for deletion in msg.deletions {
                match txn.ripple_delete(&deletion.identifier, deletion.time_updated) {
                    Ok(()) => {}
                    Err(Error::Conflict(cause)) => {
                        warn!(partner = %partner, %cause, "skipping conflicting ripple deletion");
                        proxy.note_drift();
                    }
                    Err(e) => return Err(e),
                }
            }
            txn.commit()?;
        }

        // lock traffic
        for id in &msg.requested_locks {
            if self.grant_lock(id, partner)? {
                reply.pushed_locks.push(id.clone());
            } else {
                self.forward_lock_request(id, partner)?;
            }
        }
        for id in &msg.pushed_locks {
            self.accept_lock_push(id, partner)?;
        }

        // home replica traffic
        for id in &msg.requested_home_replicas {
            if self.grant_home(id, partner)? {
                reply.pushed_home_replicas.push(id.clone());
            } else {
                self.forward_home_request(id, partner)?;
            }
        }
        for id in &msg.pushed_home_replicas {
            self.accept_home_push(id, partner)?;
        }

        if msg.cease_communications {
            *cease = true;
        }

        if !reply.is_empty() {
            proxy.enqueue_for_send(reply)?;
        }
        Ok(())
    }

    /// First-time materialization or authoritative reset of a conveyed
    /// replica.
    fn materialize_replica(
        &self,
        partner: &MeshBaseIdentifier,
        ext: ExternalizedMeshObject,
    ) -> Result<(), Error> {
        let id = ext.identifier.clone();
        if self.contains(&id)? {
            // full reset of content; the local replica set survives, with
            // the sender guaranteed present
            self.with_cached_object(&id, |obj| {
                obj.reset_content_from(ext);
                obj.replica_mut().add_proxy(partner.clone());
                Ok(())
            })?;
        } else {
            let mut obj = MeshObject::from_externalized(ext);
            // home and lock lead towards wherever the replica came from
            *obj.replica_mut() = ReplicaState::towards(partner.clone());
            self.insert_into_cache(obj);
        }
        self.persist_object(&id)
    }

    /// Grants a lock request if the lock is held here. An unsatisfiable
    /// request produces no push record and no error; the receive path
    /// forwards it towards the lock direction instead.
    fn grant_lock(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<bool, Error> {
        if !self.contains(id)? {
            warn!(object = %id, partner = %partner, "lock request for unknown object");
            return Ok(false);
        }
        let granted = self.with_cached_object(id, |obj| {
            if !obj.replica().holds_lock() {
                return Ok(false);
            }
            match obj.replica_mut().surrender_lock(id, partner) {
                Ok(_) => Ok(true),
                Err(cause) => {
                    error!(object = %id, partner = %partner, %cause, "rejecting lock request");
                    Ok(false)
                }
            }
        })?;
        if granted {
            self.persist_object(id)?;
        }
        Ok(granted)
    }

    /// Relays a lock request towards the current lock direction when the
    /// lock is not held here, remembering the requester so the grant can
    /// be passed on once the lock arrives.
    fn forward_lock_request(
        &self,
        id: &MeshObjectIdentifier,
        requester: &MeshBaseIdentifier,
    ) -> Result<(), Error> {
        if !self.contains(id)? {
            return Ok(());
        }
        let towards =
            self.with_cached_object(id, |obj| Ok(obj.replica().lock_partner().cloned()))?;
        let Some(next) = towards else {
            return Ok(());
        };
        if next == *requester {
            // the requester's own view is stale; nothing to relay
            return Ok(());
        }
        debug!(object = %id, requester = %requester, towards = %next, "forwarding lock request");
        self.inner
            .pending_lock_requests
            .write()
            .insert(id.clone(), requester.clone());
        let mut msg = XprisoMessage::new(self.inner.identifier.clone(), next.clone());
        msg.requested_locks.push(id.clone());
        self.enqueue_and_persist(&next, msg)
    }

    fn forward_home_request(
        &self,
        id: &MeshObjectIdentifier,
        requester: &MeshBaseIdentifier,
    ) -> Result<(), Error> {
        if !self.contains(id)? {
            return Ok(());
        }
        let towards =
            self.with_cached_object(id, |obj| Ok(obj.replica().home_partner().cloned()))?;
        let Some(next) = towards else {
            return Ok(());
        };
        if next == *requester {
            return Ok(());
        }
        debug!(object = %id, requester = %requester, towards = %next, "forwarding home request");
        self.inner
            .pending_home_requests
            .write()
            .insert(id.clone(), requester.clone());
        let mut msg = XprisoMessage::new(self.inner.identifier.clone(), next.clone());
        msg.requested_home_replicas.push(id.clone());
        self.enqueue_and_persist(&next, msg)
    }

    fn accept_lock_push(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<(), Error> {
        if !self.contains(id)? {
            warn!(object = %id, partner = %partner, "lock push for unknown object");
            return Ok(());
        }
        let accepted = self.with_cached_object(id, |obj| {
            match obj.replica_mut().push_lock(id, partner) {
                Ok(()) => Ok(true),
                Err(cause) => {
                    error!(object = %id, partner = %partner, %cause, "rejecting lock push");
                    Ok(false)
                }
            }
        })?;
        if accepted {
            self.persist_object(id)?;
            self.pass_on_lock(id)?;
        }
        Ok(())
    }

    /// Hands a just-arrived lock onward to a requester a request was
    /// forwarded for.
    fn pass_on_lock(&self, id: &MeshObjectIdentifier) -> Result<(), Error> {
        let Some(requester) = self.inner.pending_lock_requests.write().remove(id) else {
            return Ok(());
        };
        if self.grant_lock(id, &requester)? {
            let mut msg = XprisoMessage::new(self.inner.identifier.clone(), requester.clone());
            msg.pushed_locks.push(id.clone());
            self.enqueue_and_persist(&requester, msg)?;
        }
        Ok(())
    }

    fn grant_home(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<bool, Error> {
        if !self.contains(id)? {
            warn!(object = %id, partner = %partner, "home request for unknown object");
            return Ok(false);
        }
        let granted = self.with_cached_object(id, |obj| {
            if !obj.replica().is_home() {
                return Ok(false);
            }
            match obj.replica_mut().surrender_home(id, partner) {
                Ok(_) => Ok(true),
                Err(cause) => {
                    error!(object = %id, partner = %partner, %cause, "rejecting home request");
                    Ok(false)
                }
            }
        })?;
        if granted {
            self.persist_object(id)?;
        }
        Ok(granted)
    }

    fn accept_home_push(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<(), Error> {
        if !self.contains(id)? {
            warn!(object = %id, partner = %partner, "home push for unknown object");
            return Ok(());
        }
        let accepted = self.with_cached_object(id, |obj| {
            match obj.replica_mut().push_home(id, partner) {
                Ok(()) => Ok(true),
                Err(cause) => {
                    error!(object = %id, partner = %partner, %cause, "rejecting home push");
                    Ok(false)
                }
            }
        })?;
        if accepted {
            self.persist_object(id)?;
            self.pass_on_home(id)?;
        }
        Ok(())
    }

    fn pass_on_home(&self, id: &MeshObjectIdentifier) -> Result<(), Error> {
        let Some(requester) = self.inner.pending_home_requests.write().remove(id) else {
            return Ok(());
        };
        if self.grant_home(id, &requester)? {
            let mut msg = XprisoMessage::new(self.inner.identifier.clone(), requester.clone());
            msg.pushed_home_replicas.push(id.clone());
            self.enqueue_and_persist(&requester, msg)?;
        }
        Ok(())
    }

    /// Hands the replicated operations a `NotAuthorized` when a transfer
    /// is attempted through an unrecognized proxy; exposed for callers
    /// driving the lock state machine directly.
    pub fn surrender_lock(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<bool, Error> {
        self.require_proxy(partner)?;
        let moved =
            self.with_cached_object(id, |obj| Ok(obj.replica_mut().surrender_lock(id, partner)?))?;
        self.persist_object(id)?;
        Ok(moved)
    }

    pub fn push_lock(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<(), Error> {
        self.require_proxy(partner)?;
        self.with_cached_object(id, |obj| Ok(obj.replica_mut().push_lock(id, partner)?))?;
        self.persist_object(id)
    }

    pub fn surrender_home(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<bool, Error> {
        self.require_proxy(partner)?;
        let moved =
            self.with_cached_object(id, |obj| Ok(obj.replica_mut().surrender_home(id, partner)?))?;
        self.persist_object(id)?;
        Ok(moved)
    }

    pub fn push_home(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<(), Error> {
        self.require_proxy(partner)?;
        self.with_cached_object(id, |obj| Ok(obj.replica_mut().push_home(id, partner)?))?;
        self.persist_object(id)
    }

    /// Idempotent full reset of an object's replica state from
    /// authoritative data, gated on a recognized proxy.
    pub fn resynchronize_replica(
        &self,
        id: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
        proxies: Vec<MeshBaseIdentifier>,
        home: Option<usize>,
        lock: Option<usize>,
    ) -> Result<(), Error> {
        self.require_proxy(partner)?;
        self.with_cached_object(id, |obj| {
            if !obj.replica().proxies().contains(partner) {
                return Err(NotAuthorized::UnrecognizedProxy {
                    partner: partner.clone(),
                    object: id.clone(),
                }
                .into());
            }
            obj.replica_mut().resynchronize(proxies, home, lock)?;
            Ok(())
        })?;
        self.persist_object(id)
    }

    fn require_proxy(&self, partner: &MeshBaseIdentifier) -> Result<Proxy, Error> {
        self.proxy_towards(partner)
            .ok_or_else(|| ProtocolViolation::UnknownProxy(partner.clone()).into())
    }
}
