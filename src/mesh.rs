//! Epidemic hash-mesh synchronization
//!
//! One session per neighbor connection. Both sides open with HELLO, then
//! pull deltas from each other's fingerprint sequence while serving the
//! peer's interleaved requests. REQ/PUSH pairs are strictly ordered per
//! connection; watermarks only move forward; a malformed frame closes the
//! connection and is recorded against the peer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::hashdb::{Capabilities, FingerprintEntry, HashDb, StoreError};
use crate::metrics::Metrics;
use crate::transfer::PeerId;
use crate::wire::{self, DeltaEntry, MeshMessage, PROTOCOL_VERSION};

/// A framed, secured, bidirectional channel to one mesh neighbor. The
/// rendezvous layer dials and authenticates; the core only exchanges
/// frames.
#[async_trait]
pub trait MeshLink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()>;

    /// Receive the next frame; `None` means the peer closed the link.
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>>;
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("link error: {0}")]
    Link(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one session accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOutcome {
    pub entries_received: u64,
    pub entries_sent: u64,
    pub batches: u32,
    /// Highest remote seq merged from this peer, after the session.
    pub watermark: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MeshStats {
    pub sessions: u64,
    pub entries_merged: u64,
    pub entries_sent: u64,
    pub violations: u64,
    pub peers: Vec<MeshPeerSummary>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MeshPeerSummary {
    pub peer_id: PeerId,
    pub last_sync_at: i64,
    pub last_seq_seen: u64,
    pub violations: u32,
}

struct RateState {
    last_session: HashMap<PeerId, Instant>,
    window_start: Instant,
    sessions_in_window: u32,
}

pub struct MeshService {
    db: Arc<HashDb>,
    metrics: Metrics,
    cfg: MeshConfig,
    client_id: String,
    rate: Mutex<RateState>,
}

impl MeshService {
    pub fn new(db: Arc<HashDb>, metrics: Metrics, cfg: MeshConfig, client_id: String) -> Self {
        Self {
            db,
            metrics,
            cfg,
            client_id,
            rate: Mutex::new(RateState {
                last_session: HashMap::new(),
                window_start: Instant::now(),
                sessions_in_window: 0,
            }),
        }
    }

    /// Admission control: per-neighbor interval plus a per-window session
    /// cap. Returns false when the session should be skipped.
    pub fn admit_session(&self, peer: &str) -> bool {
        let interval = Duration::from_secs(self.cfg.sync_interval_seconds);
        let mut rate = self.rate.lock().unwrap();
        if rate.window_start.elapsed() >= interval {
            rate.window_start = Instant::now();
            rate.sessions_in_window = 0;
        }
        if rate.sessions_in_window >= self.cfg.max_peers_per_cycle {
            return false;
        }
        if let Some(last) = rate.last_session.get(peer) {
            if last.elapsed() < interval {
                return false;
            }
        }
        rate.sessions_in_window += 1;
        rate.last_session.insert(peer.to_string(), Instant::now());
        true
    }

    /// Forget the per-neighbor cooldown so the next connection syncs
    /// immediately.
    pub fn mark_sync_due(&self, peer: &str) {
        self.rate.lock().unwrap().last_session.remove(peer);
    }

    pub fn stats(&self) -> Result<MeshStats, StoreError> {
        let peers = self
            .db
            .mesh_peer_states()?
            .into_iter()
            .map(|p| MeshPeerSummary {
                peer_id: p.peer_id,
                last_sync_at: p.last_sync_at,
                last_seq_seen: p.last_seq_seen,
                violations: p.violations,
            })
            .collect();
        Ok(MeshStats {
            sessions: self.metrics.mesh_sessions(),
            entries_merged: self.metrics.mesh_entries_merged_total(),
            entries_sent: self.metrics.mesh_entries_sent_total(),
            violations: self.metrics.mesh_violations(),
            peers,
        })
    }

    /// Run one full sync session over an established link.
    pub async fn run_session(
        &self,
        peer: &str,
        link: &mut dyn MeshLink,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, MeshError> {
        self.metrics.mesh_session();
        let result = self.session_inner(peer, link, cancel).await;
        if let Err(MeshError::ProtocolViolation(reason)) = &result {
            warn!(peer, reason, "mesh protocol violation, closing session");
            self.metrics.mesh_violation();
            self.db.record_mesh_violation(peer)?;
        }
        result
    }

    async fn session_inner(
        &self,
        peer: &str,
        link: &mut dyn MeshLink,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, MeshError> {
        let hello = MeshMessage::Hello {
            client_id: self.client_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            latest_seq: self.db.latest_seq_id()?,
        };
        link.send(encode(&hello)?).await?;

        let remote_latest = match self.await_frame(link).await? {
            Waited::Msg(MeshMessage::Hello {
                client_id,
                protocol_version,
                latest_seq,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(MeshError::ProtocolViolation(format!(
                        "unsupported protocol version {protocol_version}"
                    )));
                }
                debug!(peer, client = %client_id, latest_seq, "mesh hello received");
                latest_seq
            }
            Waited::Msg(_) => {
                return Err(MeshError::ProtocolViolation(
                    "first frame was not HELLO".into(),
                ))
            }
            Waited::Closed => return Ok(SyncOutcome::default()),
            Waited::TimedOut => return Ok(SyncOutcome::default()),
        };

        // A peer speaking the mesh protocol advertises a fingerprint
        // database by definition; backfill leaves it alone from here on.
        let caps = Capabilities::SUPPORTS_MESH
            .with(Capabilities::SUPPORTS_HASH_EXCHANGE)
            .with(Capabilities::HAS_FINGERPRINT_DB);
        let now = crate::hashdb::now_unix();
        self.db.touch_peer(peer, now)?;
        self.db.set_peer_capabilities(peer, caps, now)?;

        let mut outcome = SyncOutcome {
            watermark: self.db.peer_last_seq_seen(peer)?,
            ..SyncOutcome::default()
        };

        let mut retried = false;
        while outcome.watermark < remote_latest
            && outcome.batches < self.cfg.max_pair_batches
            && !cancel.is_cancelled()
        {
            let req = MeshMessage::ReqDelta {
                since_seq: outcome.watermark,
                max_entries: self.cfg.max_entries_per_sync,
            };
            link.send(encode(&req)?).await?;

            let entries = loop {
                match self.await_frame(link).await? {
                    Waited::Msg(MeshMessage::PushDelta { entries }) => break Some(entries),
                    // Serve the peer's own pull while we wait for ours;
                    // REQ/PUSH pairs stay ordered per direction.
                    Waited::Msg(MeshMessage::ReqDelta {
                        since_seq,
                        max_entries,
                    }) => {
                        outcome.entries_sent +=
                            self.serve_delta(link, since_seq, max_entries).await?;
                    }
                    Waited::Msg(MeshMessage::ReqKey { key }) => {
                        self.serve_key(link, &key).await?;
                    }
                    Waited::Msg(other) => {
                        return Err(MeshError::ProtocolViolation(format!(
                            "unexpected frame while awaiting PUSH_DELTA: {other:?}"
                        )))
                    }
                    Waited::Closed => return Ok(outcome),
                    Waited::TimedOut => break None,
                }
            };

            let Some(entries) = entries else {
                // Stalled REQ_DELTA: one retry per session, then give up
                // without poisoning the neighbor.
                if retried {
                    debug!(peer, "delta request stalled twice, ending session");
                    return Ok(outcome);
                }
                retried = true;
                continue;
            };

            if entries.is_empty() {
                break;
            }
            validate_batch(&entries, outcome.watermark)?;

            let batch_max = entries.last().map(|e| e.seq).unwrap_or(outcome.watermark);
            match self.db.merge_from_gossip(&entries) {
                Ok(stats) => {
                    self.metrics.mesh_entries_merged(stats.applied);
                    outcome.entries_received += entries.len() as u64;
                }
                Err(err) => {
                    // The merge transaction rolled back; keep the
                    // connection, drop the watermark advance.
                    warn!(peer, error = %err, "gossip merge failed");
                    break;
                }
            }
            self.db.set_peer_last_seq_seen(peer, batch_max)?;
            self.db.touch_mesh_sync(peer, crate::hashdb::now_unix(), caps)?;
            outcome.watermark = batch_max;
            outcome.batches += 1;
        }

        info!(
            peer,
            batches = outcome.batches,
            received = outcome.entries_received,
            watermark = outcome.watermark,
            "mesh pull complete"
        );

        // Keep serving the neighbor's pull until it goes quiet.
        self.linger(peer, link, cancel, &mut outcome).await?;
        Ok(outcome)
    }

    async fn linger(
        &self,
        peer: &str,
        link: &mut dyn MeshLink,
        cancel: &CancellationToken,
        outcome: &mut SyncOutcome,
    ) -> Result<(), MeshError> {
        let linger = Duration::from_secs(self.cfg.linger_seconds);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = tokio::time::timeout(linger, link.recv()) => frame,
            };
            match frame {
                Err(_) => return Ok(()), // idle
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(err)) => return Err(MeshError::Link(err)),
                Ok(Ok(Some(bytes))) => match decode(&bytes)? {
                    MeshMessage::ReqDelta {
                        since_seq,
                        max_entries,
                    } => {
                        outcome.entries_sent +=
                            self.serve_delta(link, since_seq, max_entries).await?;
                    }
                    MeshMessage::ReqKey { key } => self.serve_key(link, &key).await?,
                    other => {
                        return Err(MeshError::ProtocolViolation(format!(
                            "unexpected frame after sync: {other:?}"
                        )))
                    }
                },
            }
        }
    }

    async fn serve_delta(
        &self,
        link: &mut dyn MeshLink,
        since_seq: u64,
        max_entries: u32,
    ) -> Result<u64, MeshError> {
        let limit = max_entries.min(self.cfg.max_entries_per_sync) as usize;
        let entries: Vec<DeltaEntry> = self
            .db
            .entries_since(since_seq, limit)?
            .into_iter()
            .map(to_delta)
            .collect();
        // The 64 KiB message cap may force fewer entries than requested;
        // the requester just asks again from its new watermark.
        let fitting = wire::delta_entries_fitting(&entries);
        let batch = entries[..fitting].to_vec();
        let sent = batch.len() as u64;
        link.send(encode(&MeshMessage::PushDelta { entries: batch })?)
            .await?;
        self.metrics.mesh_entries_sent(sent);
        Ok(sent)
    }

    async fn serve_key(&self, link: &mut dyn MeshLink, key: &str) -> Result<(), MeshError> {
        let entry = self.db.lookup_fingerprint(key)?;
        let resp = MeshMessage::RespKey {
            key: key.to_string(),
            fingerprint: entry.as_ref().map(|e| e.fingerprint.bytes.clone()),
            size: entry.as_ref().map(|e| e.size),
        };
        link.send(encode(&resp)?).await?;
        Ok(())
    }

    /// Point lookup against a neighbor: the verification fast path.
    pub async fn lookup_remote_key(
        &self,
        link: &mut dyn MeshLink,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<u64>)>, MeshError> {
        link.send(encode(&MeshMessage::ReqKey {
            key: key.to_string(),
        })?)
        .await?;
        match self.await_frame(link).await? {
            Waited::Msg(MeshMessage::RespKey {
                key: resp_key,
                fingerprint,
                size,
            }) => {
                if resp_key != key {
                    return Err(MeshError::ProtocolViolation(
                        "RESP_KEY for a different key".into(),
                    ));
                }
                Ok(fingerprint.map(|fp| (fp, size)))
            }
            Waited::Msg(other) => Err(MeshError::ProtocolViolation(format!(
                "unexpected frame while awaiting RESP_KEY: {other:?}"
            ))),
            Waited::Closed | Waited::TimedOut => Ok(None),
        }
    }

    async fn await_frame(&self, link: &mut dyn MeshLink) -> Result<Waited, MeshError> {
        let timeout = Duration::from_secs(self.cfg.request_timeout_seconds);
        match tokio::time::timeout(timeout, link.recv()).await {
            Err(_) => Ok(Waited::TimedOut),
            Ok(Ok(None)) => Ok(Waited::Closed),
            Ok(Err(err)) => Err(MeshError::Link(err)),
            Ok(Ok(Some(bytes))) => Ok(Waited::Msg(decode(&bytes)?)),
        }
    }
}

enum Waited {
    Msg(MeshMessage),
    Closed,
    TimedOut,
}

fn encode(msg: &MeshMessage) -> Result<Vec<u8>, MeshError> {
    wire::encode(msg).map_err(|e| MeshError::ProtocolViolation(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<MeshMessage, MeshError> {
    wire::decode(bytes).map_err(|e| MeshError::ProtocolViolation(e.to_string()))
}

fn to_delta(entry: FingerprintEntry) -> DeltaEntry {
    DeltaEntry {
        seq: entry.seq_id,
        key: entry.key,
        fingerprint: entry.fingerprint.bytes,
        size: entry.size,
        meta_flags: entry.meta_flags,
    }
}

fn validate_batch(entries: &[DeltaEntry], since: u64) -> Result<(), MeshError> {
    let mut prev = since;
    for entry in entries {
        if entry.seq <= prev {
            return Err(MeshError::ProtocolViolation(format!(
                "delta seq {} not strictly ascending past {}",
                entry.seq, prev
            )));
        }
        prev = entry.seq;
    }
    Ok(())
}

/// In-process duplex link over channels; hosts use this in tests and local
/// loopback setups.
pub struct ChannelLink {
    tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
}

/// Two connected [`ChannelLink`] halves.
pub fn channel_pair() -> (ChannelLink, ChannelLink) {
    let (a_tx, a_rx) = tokio::sync::mpsc::channel(64);
    let (b_tx, b_rx) = tokio::sync::mpsc::channel(64);
    (
        ChannelLink { tx: a_tx, rx: b_rx },
        ChannelLink { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl MeshLink for ChannelLink {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))
    }

    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn service(db: Arc<HashDb>, id: &str) -> MeshService {
        let mut cfg = Config::default().mesh;
        cfg.request_timeout_seconds = 2;
        cfg.linger_seconds = 1;
        MeshService::new(db, Metrics::new(), cfg, id.to_string())
    }

    #[test]
    fn test_validate_batch_ordering() {
        let entry = |seq| DeltaEntry {
            seq,
            key: "k".into(),
            fingerprint: vec![0; 16],
            size: 1,
            meta_flags: 0,
        };
        assert!(validate_batch(&[entry(5), entry(6)], 4).is_ok());
        assert!(validate_batch(&[entry(4)], 4).is_err());
        assert!(validate_batch(&[entry(6), entry(5)], 4).is_err());
    }

    #[test]
    fn test_session_admission_limits() {
        let db = Arc::new(HashDb::open_in_memory().unwrap());
        let mut cfg = Config::default().mesh;
        cfg.max_peers_per_cycle = 2;
        let mesh = MeshService::new(db, Metrics::new(), cfg, "me".into());

        assert!(mesh.admit_session("a"));
        // Same peer again within the interval: refused
        assert!(!mesh.admit_session("a"));
        assert!(mesh.admit_session("b"));
        // Window cap reached
        assert!(!mesh.admit_session("c"));
    }

    #[test]
    fn test_mark_sync_due_resets_cooldown() {
        let db = Arc::new(HashDb::open_in_memory().unwrap());
        let mut cfg = Config::default().mesh;
        cfg.max_peers_per_cycle = 10;
        let mesh = MeshService::new(db, Metrics::new(), cfg, "me".into());

        assert!(mesh.admit_session("a"));
        assert!(!mesh.admit_session("a"));
        mesh.mark_sync_due("a");
        assert!(mesh.admit_session("a"));
    }

    #[tokio::test]
    async fn test_key_lookup_roundtrip() {
        use crate::fingerprint::{Fingerprint, FingerprintKind};
        use crate::hashdb::FingerprintSource;

        let db_a = Arc::new(HashDb::open_in_memory().unwrap());
        let db_b = Arc::new(HashDb::open_in_memory().unwrap());
        let fp = Fingerprint::new(FingerprintKind::Sha256Prefix, vec![9; 32]);
        db_b.store_fingerprint("somekey", &fp, 500, 0, FingerprintSource::LocalScan)
            .unwrap();

        let a = service(db_a, "a");
        let b = service(db_b, "b");
        let (mut link_a, mut link_b) = channel_pair();

        let server = tokio::spawn(async move {
            // Serve exactly one REQ_KEY
            let frame = link_b.recv().await.unwrap().unwrap();
            let MeshMessage::ReqKey { key } = decode(&frame).unwrap() else {
                panic!("expected REQ_KEY");
            };
            b.serve_key(&mut link_b, &key).await.unwrap();
        });

        let hit = a.lookup_remote_key(&mut link_a, "somekey").await.unwrap();
        server.await.unwrap();
        let (bytes, size) = hit.unwrap();
        assert_eq!(bytes, vec![9; 32]);
        assert_eq!(size, Some(500));
    }
}
