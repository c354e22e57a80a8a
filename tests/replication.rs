//! End-to-end replication scenarios between two in-process mesh bases,
//! with messages carried by hand in place of a transport.

use anyhow::Result;
use meshbase::{
    CoherenceSpecification, Error, MeshBase, MeshBaseIdentifier, MeshObjectIdentifier,
    MemoryStore, PropertyValue, Store, XprisoMessage,
};

fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshbase=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn base(name: &str) -> MeshBase<MemoryStore> {
    MeshBase::create(name.into(), MemoryStore::new()).unwrap()
}

/// Connects two bases in both directions.
fn connect(a: &MeshBase<MemoryStore>, b: &MeshBase<MemoryStore>) {
    a.obtain_proxy(b.identifier().clone(), CoherenceSpecification::default())
        .unwrap();
    b.obtain_proxy(a.identifier().clone(), CoherenceSpecification::default())
        .unwrap();
}

/// Carries all queued messages from `from` to `to`, returning them for
/// inspection.
fn deliver(from: &MeshBase<MemoryStore>, to: &MeshBase<MemoryStore>) -> Vec<XprisoMessage> {
    let messages = from.take_outgoing(to.identifier()).unwrap();
    to.receive_from(from.identifier(), messages.clone()).unwrap();
    messages
}

/// Runs message exchange in both directions until neither side has
/// anything left to say.
fn settle(a: &MeshBase<MemoryStore>, b: &MeshBase<MemoryStore>) {
    loop {
        let ab = deliver(a, b);
        let ba = deliver(b, a);
        if ab.is_empty() && ba.is_empty() {
            break;
        }
    }
}

/// Runs message exchange between every connected pair until the whole
/// network is quiet.
fn settle_all(bases: &[&MeshBase<MemoryStore>]) {
    loop {
        let mut quiet = true;
        for from in bases {
            for to in bases {
                if from.identifier() == to.identifier()
                    || from.proxy_towards(to.identifier()).is_none()
                {
                    continue;
                }
                if !deliver(from, to).is_empty() {
                    quiet = false;
                }
            }
        }
        if quiet {
            break;
        }
    }
}

fn replicate(
    home: &MeshBase<MemoryStore>,
    other: &MeshBase<MemoryStore>,
    id: &MeshObjectIdentifier,
) {
    other.request_replica(id, home.identifier()).unwrap();
    settle(other, home);
}

#[test]
fn property_change_ripples_with_origin_timestamp() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;

    replicate(&m1, &m2, &id);
    let replica = m2.find(&id)?.expect("replicated");
    assert!(!replica.replica().is_home());
    assert!(!replica.replica().holds_lock());

    let mut txn = m1.begin_transaction();
    txn.set_property_value(&id, "Name".into(), PropertyValue::Text("Ada".into()))?;
    txn.commit()?;
    let origin = m1.find(&id)?.unwrap();

    settle(&m1, &m2);
    let replica = m2.find(&id)?.unwrap();
    assert_eq!(
        replica.property_value(&"Name".into()),
        Some(&PropertyValue::Text("Ada".into()))
    );
    // the replica carries the origin's update time, not its own clock
    assert_eq!(replica.timestamps().updated, origin.timestamps().updated);
    Ok(())
}

#[test]
fn send_tokens_count_up_per_partner() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    m1.export_replica(&id, m2.identifier())?;

    let mut all = deliver(&m1, &m2);
    for i in 0..6 {
        let mut txn = m1.begin_transaction();
        txn.set_property_value(&id, "N".into(), PropertyValue::Int(i))?;
        txn.commit()?;
        all.extend(deliver(&m1, &m2));
    }
    let tokens: Vec<u64> = all.iter().map(|m| m.token.unwrap()).collect();
    assert_eq!(tokens, vec![1, 2, 3, 4, 5, 6, 7]);
    Ok(())
}

#[test]
fn redelivered_message_is_a_noop() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    m1.export_replica(&id, m2.identifier())?;
    settle(&m1, &m2);

    let mut sent = Vec::new();
    for i in 0..3 {
        let mut txn = m1.begin_transaction();
        txn.bless(&id, &[format!("Type-{i}").as_str().into()])?;
        txn.commit()?;
        sent.extend(m1.take_outgoing(m2.identifier())?);
    }
    m2.receive_from(m1.identifier(), sent.clone())?;
    let after_first = m2.find(&id)?.unwrap();

    // the transport redelivers an already-processed message
    m2.receive_from(m1.identifier(), vec![sent[1].clone()])?;
    let after_second = m2.find(&id)?.unwrap();
    assert_eq!(
        after_second.types().collect::<Vec<_>>(),
        after_first.types().collect::<Vec<_>>()
    );
    assert_eq!(
        after_second.timestamps().updated,
        after_first.timestamps().updated
    );
    Ok(())
}

#[test]
fn lock_transfer_flips_mutation_authority() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    replicate(&m1, &m2, &id);

    m2.request_lock(&id)?;
    settle(&m2, &m1);

    assert!(!m1.find(&id)?.unwrap().replica().holds_lock());
    assert!(m2.find(&id)?.unwrap().replica().holds_lock());

    // the former holder may no longer mutate
    let mut txn = m1.begin_transaction();
    let err = txn
        .set_property_value(&id, "X".into(), PropertyValue::Int(1))
        .unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));
    drop(txn);

    // the new holder may, and the change ripples back
    let mut txn = m2.begin_transaction();
    txn.set_property_value(&id, "X".into(), PropertyValue::Int(2))?;
    txn.commit()?;
    settle(&m2, &m1);
    assert_eq!(
        m1.find(&id)?.unwrap().property_value(&"X".into()),
        Some(&PropertyValue::Int(2))
    );
    Ok(())
}

#[test]
fn relating_reaches_a_replica_of_only_the_neighbor() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let a: MeshObjectIdentifier = "a".into();
    let b: MeshObjectIdentifier = "b".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(a.clone())?;
    txn.create_mesh_object(b.clone())?;
    txn.commit()?;
    // m2 holds a replica of b only
    replicate(&m1, &m2, &b);

    let mut txn = m1.begin_transaction();
    txn.relate(&a, &b)?;
    txn.commit()?;
    settle(&m1, &m2);

    let replica = m2.find(&b)?.unwrap();
    assert!(replica.is_related_to(&a));
    let proxy = m2.proxy_towards(m1.identifier()).unwrap();
    assert!(!proxy.has_drifted());

    // the removal reaches it the same way
    let mut txn = m1.begin_transaction();
    txn.unrelate(&a, &b)?;
    txn.commit()?;
    settle(&m1, &m2);
    assert!(!m2.find(&b)?.unwrap().is_related_to(&a));
    Ok(())
}

#[test]
fn deletion_is_reserved_to_the_home_replica() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    replicate(&m1, &m2, &id);

    // the update lock alone confers no lifecycle authority
    m2.request_lock(&id)?;
    settle(&m2, &m1);
    assert!(m2.find(&id)?.unwrap().replica().holds_lock());

    let mut txn = m2.begin_transaction();
    let err = txn.delete(&id).unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));
    drop(txn);
    assert!(!m2.find(&id)?.unwrap().is_dead());

    // once home status moves too, deletion goes through and ripples back
    m2.request_home_replica(&id)?;
    settle(&m2, &m1);
    let mut txn = m2.begin_transaction();
    txn.delete(&id)?;
    txn.commit()?;
    settle(&m2, &m1);
    assert!(m1.find(&id)?.unwrap().is_dead());
    Ok(())
}

#[test]
fn home_transfer_is_symmetric() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    replicate(&m1, &m2, &id);

    m2.request_home_replica(&id)?;
    settle(&m2, &m1);

    assert!(!m1.find(&id)?.unwrap().replica().is_home());
    assert!(m2.find(&id)?.unwrap().replica().is_home());
    Ok(())
}

#[test]
fn lost_message_causes_drift_and_resynchronization_recovers() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let a: MeshObjectIdentifier = "a".into();
    let b: MeshObjectIdentifier = "b".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(a.clone())?;
    txn.create_mesh_object(b.clone())?;
    txn.commit()?;
    replicate(&m1, &m2, &a);

    // the relate message is lost in transit
    let mut txn = m1.begin_transaction();
    txn.relate(&a, &b)?;
    txn.commit()?;
    let lost = m1.take_outgoing(m2.identifier())?;
    assert!(!lost.is_empty());

    // the follow-up role blessing arrives and conflicts at m2
    let mut txn = m1.begin_transaction();
    txn.bless_roles(&a, &b, &["Knows".into()])?;
    txn.commit()?;
    deliver(&m1, &m2);

    let proxy = m2.proxy_towards(m1.identifier()).unwrap();
    assert!(proxy.has_drifted());
    let replica = m2.find(&a)?.unwrap();
    assert!(!replica.is_related_to(&b));

    // authoritative data from the home replica repairs the drift
    m2.request_resynchronize(&a)?;
    settle(&m2, &m1);

    let proxy = m2.proxy_towards(m1.identifier()).unwrap();
    assert!(!proxy.has_drifted());
    let replica = m2.find(&a)?.unwrap();
    assert!(replica.is_related_to(&b));
    assert!(replica.roles_towards(&b).unwrap().contains(&"Knows".into()));
    Ok(())
}

#[test]
fn deletion_ripples_and_store_forgets_the_object() -> Result<()> {
    setup_logging();
    let store1 = MemoryStore::new();
    let m1 = MeshBase::create(MeshBaseIdentifier::from("m1"), store1.clone()).unwrap();
    let m2 = base("m2");
    connect(&m1, &m2);

    let suffix: u64 = rand::random();
    let id: MeshObjectIdentifier = format!("obj-{suffix}").as_str().into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    replicate(&m1, &m2, &id);

    let mut txn = m1.begin_transaction();
    txn.delete(&id)?;
    txn.commit()?;
    settle(&m1, &m2);

    // both replicas observe the death; the store record is gone
    assert!(m1.find(&id)?.unwrap().is_dead());
    assert!(m2.find(&id)?.unwrap().is_dead());
    let mut cursor = store1.cursor().unwrap();
    while let Some((key, _)) = cursor.next() {
        assert!(!key.contains(&format!("obj-{suffix}")), "record survived: {key}");
    }
    Ok(())
}

#[test]
fn resend_last_supports_reconnect() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    connect(&m1, &m2);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    m1.export_replica(&id, m2.identifier())?;

    // sent but never delivered
    let lost = m1.take_outgoing(m2.identifier())?;
    assert_eq!(lost.len(), 1);

    // after reconnect the retained batch is redelivered with its original
    // tokens
    let proxy = m1.proxy_towards(m2.identifier()).unwrap();
    let resent = proxy.resend_last();
    assert_eq!(resent, lost);
    m2.receive_from(m1.identifier(), resent)?;
    assert!(m2.find(&id)?.is_some());
    Ok(())
}

#[test]
fn lock_request_forwards_along_a_chain_of_bases() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    let m3 = base("m3");
    connect(&m1, &m2);
    connect(&m2, &m3);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    replicate(&m1, &m2, &id);
    replicate(&m2, &m3, &id);

    // m3's lock direction points at m2, which does not hold the lock;
    // the request travels on to m1 and the grant comes back hop by hop
    m3.request_lock(&id)?;
    settle_all(&[&m1, &m2, &m3]);

    assert!(m3.find(&id)?.unwrap().replica().holds_lock());
    assert!(!m2.find(&id)?.unwrap().replica().holds_lock());
    assert!(!m1.find(&id)?.unwrap().replica().holds_lock());
    Ok(())
}

#[test]
fn home_request_forwards_along_a_chain_of_bases() -> Result<()> {
    setup_logging();
    let m1 = base("m1");
    let m2 = base("m2");
    let m3 = base("m3");
    connect(&m1, &m2);
    connect(&m2, &m3);

    let id: MeshObjectIdentifier = "obj-1".into();
    let mut txn = m1.begin_transaction();
    txn.create_mesh_object(id.clone())?;
    txn.commit()?;
    replicate(&m1, &m2, &id);
    replicate(&m2, &m3, &id);

    m3.request_home_replica(&id)?;
    settle_all(&[&m1, &m2, &m3]);

    assert!(m3.find(&id)?.unwrap().replica().is_home());
    assert!(!m2.find(&id)?.unwrap().replica().is_home());
    assert!(!m1.find(&id)?.unwrap().replica().is_home());
    Ok(())
}
