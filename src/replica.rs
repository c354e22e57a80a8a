//! Per-object replica state: update lock and home replica tracking.
//!
//! For every shared mesh object, each mesh base tracks which member of the
//! replica set currently holds the update lock and which one is home. The
//! only legal transitions are surrender and push, both gated on a
//! recognized proxy; application code never mutates this state directly.
//! That gating is the protocol's core safety property: a local actor cannot
//! unilaterally declare itself authoritative.

use serde::{Deserialize, Serialize};

use crate::{
    error::{NotAuthorized, ProtocolViolation},
    keys::{MeshBaseIdentifier, MeshObjectIdentifier},
};

/// Replica-set state of a single mesh object, as seen from one mesh base.
///
/// `proxies` lists the partner mesh bases that also hold a replica. `home`
/// and `lock` index into that list and point towards the member that is
/// (or leads towards) the home replica or lock holder; `None` means the
/// local replica itself is it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    proxies: Vec<MeshBaseIdentifier>,
    home: Option<usize>,
    lock: Option<usize>,
}

impl ReplicaState {
    /// State of an unreplicated, locally created object: no proxies, home
    /// and lock both here.
    pub fn local() -> Self {
        ReplicaState {
            proxies: Vec::new(),
            home: None,
            lock: None,
        }
    }

    /// State of a freshly materialized replica: home and lock both lead
    /// towards the partner the replica came from.
    pub fn towards(partner: MeshBaseIdentifier) -> Self {
        ReplicaState {
            proxies: vec![partner],
            home: Some(0),
            lock: Some(0),
        }
    }

    pub fn is_home(&self) -> bool {
        self.home.is_none()
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.is_none()
    }

    /// Whether this object is shared with any partner at all.
    pub fn is_replicated(&self) -> bool {
        !self.proxies.is_empty()
    }

    pub fn proxies(&self) -> &[MeshBaseIdentifier] {
        &self.proxies
    }

    /// The partner that leads towards the home replica, if it is not local.
    pub fn home_partner(&self) -> Option<&MeshBaseIdentifier> {
        self.home.map(|i| &self.proxies[i])
    }

    /// The partner that leads towards the lock holder, if it is not local.
    pub fn lock_partner(&self) -> Option<&MeshBaseIdentifier> {
        self.lock.map(|i| &self.proxies[i])
    }

    fn index_of(&self, partner: &MeshBaseIdentifier) -> Option<usize> {
        self.proxies.iter().position(|p| p == partner)
    }

    /// Adds `partner` to the replica set. Idempotent.
    pub(crate) fn add_proxy(&mut self, partner: MeshBaseIdentifier) -> usize {
        match self.index_of(&partner) {
            Some(idx) => idx,
            None => {
                self.proxies.push(partner);
                self.proxies.len() - 1
            }
        }
    }

    /// Drops `partner` from the replica set, fixing up the home and lock
    /// pointers. A pointer towards the removed partner collapses to local.
    pub(crate) fn remove_proxy(&mut self, partner: &MeshBaseIdentifier) {
        let Some(idx) = self.index_of(partner) else {
            return;
        };
        self.proxies.remove(idx);
        self.home = adjust_index(self.home, idx);
        self.lock = adjust_index(self.lock, idx);
    }

    /// Gives the update lock away towards `partner`.
    ///
    /// Returns `Ok(false)` if the lock was not held locally, so callers can
    /// treat the transition as already satisfied.
    pub fn surrender_lock(
        &mut self,
        object: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<bool, NotAuthorized> {
        let idx = self.recognized(object, partner)?;
        if self.lock.is_some() {
            return Ok(false);
        }
        self.lock = Some(idx);
        Ok(true)
    }

    /// Accepts the update lock pushed from the designated lock-source
    /// proxy. A push while the lock is already held locally is a no-op
    /// (duplicate delivery).
    pub fn push_lock(
        &mut self,
        object: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<(), NotAuthorized> {
        self.recognized(object, partner)?;
        match self.lock {
            None => Ok(()),
            Some(idx) if self.proxies[idx] == *partner => {
                self.lock = None;
                Ok(())
            }
            Some(_) => Err(NotAuthorized::NotLockSource {
                partner: partner.clone(),
                object: object.clone(),
            }),
        }
    }

    /// Gives home replica status away towards `partner`.
    ///
    /// Returns `Ok(false)` if the local replica was not home.
    pub fn surrender_home(
        &mut self,
        object: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<bool, NotAuthorized> {
        let idx = self.recognized(object, partner)?;
        if self.home.is_some() {
            return Ok(false);
        }
        self.home = Some(idx);
        Ok(true)
    }

    /// Accepts home replica status pushed from the designated home-source
    /// proxy.
    pub fn push_home(
        &mut self,
        object: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<(), NotAuthorized> {
        self.recognized(object, partner)?;
        match self.home {
            None => Ok(()),
            Some(idx) if self.proxies[idx] == *partner => {
                self.home = None;
                Ok(())
            }
            Some(_) => Err(NotAuthorized::NotHomeSource {
                partner: partner.clone(),
                object: object.clone(),
            }),
        }
    }

    /// Full reset from an authoritative description of the replica set.
    ///
    /// This is the recovery path after drift; applying it twice with the
    /// same data yields the same state.
    pub fn resynchronize(
        &mut self,
        proxies: Vec<MeshBaseIdentifier>,
        home: Option<usize>,
        lock: Option<usize>,
    ) -> Result<(), ProtocolViolation> {
        let in_range = |idx: Option<usize>| idx.map(|i| i < proxies.len()).unwrap_or(true);
        if !in_range(home) || !in_range(lock) {
            return Err(ProtocolViolation::InvalidResynchronization);
        }
        self.proxies = proxies;
        self.home = home;
        self.lock = lock;
        Ok(())
    }

    pub(crate) fn home_index(&self) -> Option<usize> {
        self.home
    }

    pub(crate) fn lock_index(&self) -> Option<usize> {
        self.lock
    }

    fn recognized(
        &self,
        object: &MeshObjectIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Result<usize, NotAuthorized> {
        self.index_of(partner)
            .ok_or_else(|| NotAuthorized::UnrecognizedProxy {
                partner: partner.clone(),
                object: object.clone(),
            })
    }
}

fn adjust_index(current: Option<usize>, removed: usize) -> Option<usize> {
    match current {
        Some(i) if i == removed => None,
        Some(i) if i > removed => Some(i - 1),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> MeshObjectIdentifier {
        "obj".into()
    }

    #[test]
    fn lock_surrender_and_push() {
        let m2: MeshBaseIdentifier = "m2".into();
        let mut state = ReplicaState::local();
        state.add_proxy(m2.clone());
        assert!(state.holds_lock());

        // surrendering moves the pointer towards the partner
        assert!(state.surrender_lock(&object(), &m2).unwrap());
        assert!(!state.holds_lock());
        assert_eq!(state.lock_partner(), Some(&m2));

        // surrendering again reports already-satisfied
        assert!(!state.surrender_lock(&object(), &m2).unwrap());

        // only the designated lock source may push it back
        state.push_lock(&object(), &m2).unwrap();
        assert!(state.holds_lock());
        // duplicate push is a no-op
        state.push_lock(&object(), &m2).unwrap();
        assert!(state.holds_lock());
    }

    #[test]
    fn push_from_wrong_proxy_rejected() {
        let m2: MeshBaseIdentifier = "m2".into();
        let m3: MeshBaseIdentifier = "m3".into();
        let mut state = ReplicaState::local();
        state.add_proxy(m2.clone());
        state.add_proxy(m3.clone());
        state.surrender_lock(&object(), &m2).unwrap();

        let err = state.push_lock(&object(), &m3).unwrap_err();
        assert!(matches!(err, NotAuthorized::NotLockSource { .. }));
        assert!(!state.holds_lock());
    }

    #[test]
    fn unrecognized_proxy_rejected() {
        let mut state = ReplicaState::local();
        let err = state.surrender_lock(&object(), &"stranger".into()).unwrap_err();
        assert!(matches!(err, NotAuthorized::UnrecognizedProxy { .. }));
    }

    #[test]
    fn at_most_one_authority_direction() {
        // across any sequence of transitions the state never reports both
        // "held here" and a pointer elsewhere at the same time, because
        // both are the same Option
        let m2: MeshBaseIdentifier = "m2".into();
        let mut state = ReplicaState::towards(m2.clone());
        assert!(!state.is_home());
        assert!(!state.holds_lock());
        state.push_home(&object(), &m2).unwrap();
        assert!(state.is_home());
        assert!(state.surrender_home(&object(), &m2).unwrap());
        assert!(!state.is_home());
    }

    #[test]
    fn resynchronize_is_idempotent() {
        let proxies: Vec<MeshBaseIdentifier> = vec!["m2".into(), "m3".into()];
        let mut state = ReplicaState::local();
        state
            .resynchronize(proxies.clone(), Some(1), None)
            .unwrap();
        let snapshot = state.clone();
        state.resynchronize(proxies, Some(1), None).unwrap();
        assert_eq!(state, snapshot);
        assert_eq!(state.home_partner().unwrap().as_str(), "m3");
        assert!(state.holds_lock());
    }

    #[test]
    fn resynchronize_rejects_bad_index() {
        let mut state = ReplicaState::local();
        let err = state
            .resynchronize(vec!["m2".into()], Some(3), None)
            .unwrap_err();
        assert_eq!(err, ProtocolViolation::InvalidResynchronization);
    }

    #[test]
    fn remove_proxy_fixes_pointers() {
        let mut state = ReplicaState::local();
        state.add_proxy("m2".into());
        state.add_proxy("m3".into());
        state
            .resynchronize(vec!["m2".into(), "m3".into()], Some(0), Some(1))
            .unwrap();
        state.remove_proxy(&"m2".into());
        // home pointed at the removed partner and collapses to local
        assert!(state.is_home());
        // lock index shifts down with the removal
        assert_eq!(state.lock_partner().unwrap().as_str(), "m3");
    }
}
