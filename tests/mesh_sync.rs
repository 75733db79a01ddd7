//! Two-node gossip convergence tests over in-memory links.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use hashmesh::config::Config;
use hashmesh::fingerprint::{Fingerprint, FingerprintKind};
use hashmesh::hashdb::{FingerprintSource, HashDb};
use hashmesh::mesh::{channel_pair, MeshLink, MeshService};
use hashmesh::wire::{self, MeshMessage};
use hashmesh::Metrics;

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn mesh_node(name: &str, entries: usize, seed: u8) -> (Arc<MeshService>, Arc<HashDb>) {
    let db = Arc::new(HashDb::open_in_memory().unwrap());
    for i in 0..entries {
        let mut bytes = vec![seed; 15];
        bytes.push(i as u8);
        let fp = Fingerprint::new(FingerprintKind::FlacStreamInfoMd5, bytes);
        db.store_fingerprint(
            &format!("{name}-key-{i:04}"),
            &fp,
            1000 + i as u64,
            0,
            FingerprintSource::LocalScan,
        )
        .unwrap();
    }

    let mut cfg = Config::default().mesh;
    cfg.max_entries_per_sync = 10;
    cfg.request_timeout_seconds = 2;
    cfg.linger_seconds = 1;
    let mesh = Arc::new(MeshService::new(
        Arc::clone(&db),
        Metrics::new(),
        cfg,
        name.to_string(),
    ));
    (mesh, db)
}

fn fingerprint_map(db: &HashDb) -> HashMap<String, Vec<u8>> {
    db.entries_since(0, usize::MAX / 2)
        .unwrap()
        .into_iter()
        .map(|e| (e.key, e.fingerprint.bytes))
        .collect()
}

#[tokio::test]
async fn test_two_nodes_converge() {
    init_tracing();

    let (mesh_a, db_a) = mesh_node("node-a", 25, 0xA0);
    let (mesh_b, db_b) = mesh_node("node-b", 10, 0xB0);
    let (mut link_a, mut link_b) = channel_pair();

    let cancel = CancellationToken::new();
    let a_cancel = cancel.clone();
    let b_cancel = cancel.clone();
    let a = {
        let mesh_a = Arc::clone(&mesh_a);
        tokio::spawn(async move { mesh_a.run_session("node-b", &mut link_a, &a_cancel).await })
    };
    let b = {
        let mesh_b = Arc::clone(&mesh_b);
        tokio::spawn(async move { mesh_b.run_session("node-a", &mut link_b, &b_cancel).await })
    };

    let outcome_a = a.await.unwrap().unwrap();
    let outcome_b = b.await.unwrap().unwrap();

    // A pulled B's 10 entries in one batch; B pulled A's 25 in three
    // max-10 batches. The third batch may also echo entries A merged from
    // B mid-session, so B's received count is a lower bound.
    assert_eq!(outcome_a.entries_received, 10);
    assert_eq!(outcome_b.batches, 3);
    assert!(outcome_b.entries_received >= 25);

    let map_a = fingerprint_map(&db_a);
    let map_b = fingerprint_map(&db_b);
    assert_eq!(map_a.len(), 35);
    assert_eq!(map_a, map_b);

    // Watermarks advanced at least to what each side advertised at HELLO
    assert_eq!(db_a.peer_last_seq_seen("node-b").unwrap(), 10);
    assert!(db_b.peer_last_seq_seen("node-a").unwrap() >= 25);
}

#[tokio::test]
async fn test_second_round_carries_new_entries() {
    init_tracing();

    let (mesh_a, db_a) = mesh_node("node-a", 5, 0xA0);
    let (mesh_b, db_b) = mesh_node("node-b", 0, 0xB0);

    for round in 0..2 {
        let (mut link_a, mut link_b) = channel_pair();
        let cancel = CancellationToken::new();
        let a_cancel = cancel.clone();
        let b_cancel = cancel.clone();
        let a = {
            let mesh_a = Arc::clone(&mesh_a);
            tokio::spawn(async move { mesh_a.run_session("node-b", &mut link_a, &a_cancel).await })
        };
        let b = {
            let mesh_b = Arc::clone(&mesh_b);
            tokio::spawn(async move { mesh_b.run_session("node-a", &mut link_b, &b_cancel).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        if round == 0 {
            assert_eq!(fingerprint_map(&db_b).len(), 5);
            // A writes a new entry between rounds; the next session carries it
            db_a.store_fingerprint(
                "late-arrival",
                &Fingerprint::new(FingerprintKind::Sha256Prefix, vec![0xCC; 32]),
                7777,
                0,
                FingerprintSource::Download,
            )
            .unwrap();
        }
    }

    let map_b = fingerprint_map(&db_b);
    assert_eq!(map_b.len(), 6);
    assert_eq!(map_b["late-arrival"], vec![0xCC; 32]);
}

#[tokio::test]
async fn test_conflicting_entries_keep_first_seen() {
    init_tracing();

    let (mesh_a, db_a) = mesh_node("node-a", 0, 0);
    let (mesh_b, db_b) = mesh_node("node-b", 0, 0);

    // Both nodes verified different bytes for the same key.
    db_a.store_fingerprint(
        "contested",
        &Fingerprint::new(FingerprintKind::Sha256Prefix, vec![0x01; 32]),
        500,
        0,
        FingerprintSource::Download,
    )
    .unwrap();
    db_b.store_fingerprint(
        "contested",
        &Fingerprint::new(FingerprintKind::Sha256Prefix, vec![0x02; 32]),
        500,
        0,
        FingerprintSource::Download,
    )
    .unwrap();

    let (mut link_a, mut link_b) = channel_pair();
    let cancel = CancellationToken::new();
    let a_cancel = cancel.clone();
    let b_cancel = cancel.clone();
    let a = {
        let mesh_a = Arc::clone(&mesh_a);
        tokio::spawn(async move { mesh_a.run_session("node-b", &mut link_a, &a_cancel).await })
    };
    let b = {
        let mesh_b = Arc::clone(&mesh_b);
        tokio::spawn(async move { mesh_b.run_session("node-a", &mut link_b, &b_cancel).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // Each side keeps its own first-seen value and counts the conflict.
    let entry_a = db_a.lookup_fingerprint("contested").unwrap().unwrap();
    let entry_b = db_b.lookup_fingerprint("contested").unwrap().unwrap();
    assert_eq!(entry_a.fingerprint.bytes, vec![0x01; 32]);
    assert_eq!(entry_b.fingerprint.bytes, vec![0x02; 32]);
    assert_eq!(entry_a.conflicts, 1);
    assert_eq!(entry_b.conflicts, 1);
}

#[tokio::test]
async fn test_protocol_violation_closes_session() {
    init_tracing();

    let (mesh_a, db_a) = mesh_node("node-a", 0, 0);
    let (mut link_a, mut link_b) = channel_pair();

    let cancel = CancellationToken::new();
    let session = {
        let mesh_a = Arc::clone(&mesh_a);
        tokio::spawn(async move { mesh_a.run_session("rogue", &mut link_a, &cancel).await })
    };

    // Speak a valid HELLO advertising entries, then answer the REQ_DELTA
    // with another HELLO instead of a PUSH_DELTA.
    let hello = wire::encode(&MeshMessage::Hello {
        client_id: "rogue".into(),
        protocol_version: wire::PROTOCOL_VERSION,
        latest_seq: 5,
    })
    .unwrap();
    link_b.send(hello.clone()).await.unwrap();
    let _their_hello = link_b.recv().await.unwrap().unwrap();
    let req = link_b.recv().await.unwrap().unwrap();
    assert!(matches!(
        wire::decode(&req).unwrap(),
        MeshMessage::ReqDelta { since_seq: 0, .. }
    ));
    link_b.send(hello).await.unwrap();

    let err = session.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("protocol violation"));

    // The offense is recorded against the peer
    let peers = db_a.mesh_peer_states().unwrap();
    let rogue = peers.iter().find(|p| p.peer_id == "rogue").unwrap();
    assert_eq!(rogue.violations, 1);
}

#[tokio::test]
async fn test_garbage_frame_is_a_violation() {
    init_tracing();

    let (mesh_a, _db_a) = mesh_node("node-a", 0, 0);
    let (mut link_a, mut link_b) = channel_pair();

    let cancel = CancellationToken::new();
    let session = {
        let mesh_a = Arc::clone(&mesh_a);
        tokio::spawn(async move { mesh_a.run_session("rogue", &mut link_a, &cancel).await })
    };

    link_b.send(vec![0xFF, 0x00, 0x01]).await.unwrap();
    let err = session.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("protocol violation"));
}
