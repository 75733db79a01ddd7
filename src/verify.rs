//! Content verification via bounded-prefix probes
//!
//! Given a file name, size, and candidate peers, fetches just enough
//! leading bytes from each candidate to fingerprint its copy, then groups
//! candidates by fingerprint. Probes run concurrently and fail
//! independently; one bad peer never aborts the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::VerificationConfig;
use crate::fingerprint::{self, CodecMeta, Fingerprint, FingerprintError};
use crate::hashdb::{HashDb, InventoryStatus, StoreError};
use crate::key;
use crate::metrics::Metrics;
use crate::transfer::{
    BoundedWriter, DownloadOptions, PeerId, TransferClient, TransferError, VecSink,
};

/// A candidate copy: the peer and the path it shares the file under.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub peer: PeerId,
    pub path: String,
}

/// Why a single probe produced no fingerprint.
#[derive(Debug, Clone, Error)]
pub enum ProbeFailure {
    #[error("probe timed out")]
    Timeout,

    #[error("remote rejected the probe: {0}")]
    RemoteRejected(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("file of {size} bytes is below the {required}-byte verification prefix")]
    FileTooSmallForVerification { size: u64, required: u64 },

    #[error("verification cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One peer's successful probe.
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    pub peer: PeerId,
    pub path: String,
    pub latency: Duration,
    /// Satisfied from the local hash database instead of a live probe.
    pub cached: bool,
    pub meta: Option<CodecMeta>,
}

/// Candidates that produced the same fingerprint, fastest probe first.
#[derive(Debug, Clone)]
pub struct FingerprintGroup {
    pub fingerprint: Fingerprint,
    pub sources: Vec<ProbeRecord>,
}

impl FingerprintGroup {
    pub fn median_latency(&self) -> Duration {
        let mut latencies: Vec<Duration> = self.sources.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();
        latencies.get(latencies.len() / 2).copied().unwrap_or_default()
    }
}

/// Outcome of verifying one file across its candidates.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    /// Groups ordered best-first: most sources, ties broken by lowest
    /// median probe latency.
    pub groups: Vec<FingerprintGroup>,
    pub failures: Vec<(PeerId, ProbeFailure)>,
}

impl VerificationReport {
    pub fn best_group(&self) -> Option<&FingerprintGroup> {
        self.groups.first()
    }
}

pub struct Verifier {
    client: Arc<dyn TransferClient>,
    db: Arc<HashDb>,
    metrics: Metrics,
    cfg: VerificationConfig,
}

impl Verifier {
    pub fn new(
        client: Arc<dyn TransferClient>,
        db: Arc<HashDb>,
        metrics: Metrics,
        cfg: VerificationConfig,
    ) -> Self {
        Self {
            client,
            db,
            metrics,
            cfg,
        }
    }

    /// Probe all candidates and group them by fingerprint.
    ///
    /// Peers whose inventory rows already carry the stored fingerprint for
    /// this `(basename, size)` are short-circuited from the hash database;
    /// everyone else gets a live probe.
    pub async fn verify(
        &self,
        filename: &str,
        size: u64,
        candidates: &[Candidate],
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, VerifyError> {
        let prefix_len = fingerprint::minimum_prefix_bytes(filename, self.cfg.non_flac_prefix_bytes);
        if size < prefix_len {
            return Err(VerifyError::FileTooSmallForVerification {
                size,
                required: prefix_len,
            });
        }

        // Hash-database fast path for peers we already know hold the
        // canonical bytes.
        let stored = self.db.lookup_fingerprint(&key::fingerprint_key(filename, size))?;
        let mut cached: Vec<(Fingerprint, ProbeRecord)> = Vec::new();
        let mut to_probe: Vec<Candidate> = Vec::new();
        for candidate in candidates {
            match self.cached_record(candidate, size, stored.as_ref())? {
                Some(record) => cached.push(record),
                None => to_probe.push(candidate.clone()),
            }
        }

        let timeout = Duration::from_millis(self.cfg.probe_timeout_ms);
        let probes = to_probe
            .iter()
            .map(|candidate| self.probe(candidate, filename, size, prefix_len, timeout, cancel));
        let results = futures::future::join_all(probes).await;

        if cancel.is_cancelled() {
            return Err(VerifyError::Cancelled);
        }

        let mut by_fingerprint: HashMap<Fingerprint, Vec<ProbeRecord>> = HashMap::new();
        let mut failures = Vec::new();
        for (fp, record) in cached {
            by_fingerprint.entry(fp).or_default().push(record);
        }
        for (candidate, result) in to_probe.iter().zip(results) {
            match result {
                Ok((fp, record)) => {
                    self.metrics.probe_succeeded();
                    by_fingerprint.entry(fp).or_default().push(record);
                }
                Err(failure) => {
                    self.metrics.probe_failed();
                    debug!(peer = %candidate.peer, error = %failure, "probe failed");
                    failures.push((candidate.peer.clone(), failure));
                }
            }
        }

        let mut groups: Vec<FingerprintGroup> = by_fingerprint
            .into_iter()
            .map(|(fingerprint, mut sources)| {
                sources.sort_by_key(|s| s.latency);
                FingerprintGroup {
                    fingerprint,
                    sources,
                }
            })
            .collect();
        groups.sort_by(|a, b| {
            b.sources
                .len()
                .cmp(&a.sources.len())
                .then(a.median_latency().cmp(&b.median_latency()))
        });

        Ok(VerificationReport { groups, failures })
    }

    fn cached_record(
        &self,
        candidate: &Candidate,
        size: u64,
        stored: Option<&crate::hashdb::FingerprintEntry>,
    ) -> Result<Option<(Fingerprint, ProbeRecord)>, StoreError> {
        let Some(stored) = stored else {
            return Ok(None);
        };
        let file_id = key::file_id(&candidate.peer, &candidate.path, size);
        let Some(row) = self.db.get_inventory(&file_id)? else {
            return Ok(None);
        };
        if row.status != InventoryStatus::Known || row.fingerprint.as_ref() != Some(&stored.fingerprint)
        {
            return Ok(None);
        }
        Ok(Some((
            stored.fingerprint.clone(),
            ProbeRecord {
                peer: candidate.peer.clone(),
                path: candidate.path.clone(),
                latency: Duration::ZERO,
                cached: true,
                meta: CodecMeta::from_flags(stored.meta_flags),
            },
        )))
    }

    async fn probe(
        &self,
        candidate: &Candidate,
        filename: &str,
        size: u64,
        prefix_len: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(Fingerprint, ProbeRecord), ProbeFailure> {
        self.metrics.probe_started();
        let started = Instant::now();

        let probe_cancel = cancel.child_token();
        let mut sink = BoundedWriter::new(VecSink::new(), prefix_len, probe_cancel.clone());

        let outcome = tokio::time::timeout(
            timeout,
            self.client.download(
                &candidate.peer,
                &candidate.path,
                &mut sink,
                size,
                0,
                DownloadOptions::default(),
                probe_cancel.clone(),
            ),
        )
        .await;

        let latency = started.elapsed();
        let complete = sink.bound_reached();
        match outcome {
            Err(_) => return Err(ProbeFailure::Timeout),
            // The bounded writer cancels the transfer once the prefix is in;
            // that is success, not cancellation.
            Ok(Err(TransferError::Cancelled)) if complete => {}
            Ok(Err(TransferError::Cancelled)) => {
                return Err(ProbeFailure::TransportError("transfer cancelled".into()))
            }
            Ok(Err(TransferError::Timeout)) => return Err(ProbeFailure::Timeout),
            Ok(Err(TransferError::RemoteRejected(reason))) => {
                return Err(ProbeFailure::RemoteRejected(reason))
            }
            Ok(Err(TransferError::Transport(reason))) => {
                return Err(ProbeFailure::TransportError(reason))
            }
            Ok(Ok(_)) => {}
        }

        if !complete {
            warn!(
                peer = %candidate.peer,
                got = sink.bytes_written(),
                want = prefix_len,
                "probe delivered short prefix"
            );
            return Err(ProbeFailure::TransportError("short probe transfer".into()));
        }

        let prefix = sink.into_inner().into_inner();
        let (fp, meta) = fingerprint::fingerprint(&prefix, filename).map_err(|err| match err {
            FingerprintError::MalformedHeader(reason) => ProbeFailure::MalformedHeader(reason),
        })?;

        Ok((
            fp,
            ProbeRecord {
                peer: candidate.peer.clone(),
                path: candidate.path.clone(),
                latency,
                cached: false,
                meta,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hashdb::{FingerprintSource, InventoryEntry};
    use crate::transfer::{ChunkSink, PeerAttributes, SearchOptions, SearchResponse};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    /// 100 KiB FLAC-shaped file carrying the given audio MD5.
    fn flac_file(md5: [u8; 16]) -> Vec<u8> {
        let mut data = crate::fingerprint::tests::flac_prefix(md5, 0);
        data.resize(100 * 1024, 0);
        data
    }

    #[derive(Clone)]
    enum PeerBehavior {
        Serve { data: Vec<u8>, delay: Duration },
        Reject,
        Stall,
    }

    struct FakeClient {
        peers: Mutex<StdHashMap<String, PeerBehavior>>,
    }

    impl FakeClient {
        fn new() -> Self {
            Self {
                peers: Mutex::new(StdHashMap::new()),
            }
        }

        fn with_peer(self, peer: &str, behavior: PeerBehavior) -> Self {
            self.peers.lock().unwrap().insert(peer.to_string(), behavior);
            self
        }
    }

    #[async_trait]
    impl TransferClient for FakeClient {
        async fn search(
            &self,
            _query: &str,
            _options: SearchOptions,
        ) -> Result<Vec<SearchResponse>, TransferError> {
            Ok(Vec::new())
        }

        async fn download(
            &self,
            peer: &str,
            _remote_path: &str,
            sink: &mut dyn ChunkSink,
            _size: u64,
            start_offset: u64,
            _options: DownloadOptions,
            cancel: CancellationToken,
        ) -> Result<u64, TransferError> {
            let behavior = self
                .peers
                .lock()
                .unwrap()
                .get(peer)
                .cloned()
                .ok_or_else(|| TransferError::Transport("unknown peer".into()))?;
            match behavior {
                PeerBehavior::Reject => Err(TransferError::RemoteRejected("no slots".into())),
                PeerBehavior::Stall => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(TransferError::Timeout)
                }
                PeerBehavior::Serve { data, delay } => {
                    tokio::time::sleep(delay).await;
                    let mut written = 0u64;
                    for piece in data[start_offset as usize..].chunks(8 * 1024) {
                        if cancel.is_cancelled() {
                            return Err(TransferError::Cancelled);
                        }
                        sink.write(piece).await.map_err(|e| {
                            TransferError::Transport(e.to_string())
                        })?;
                        written += piece.len() as u64;
                    }
                    Ok(written)
                }
            }
        }

        async fn peer_attributes(&self, _peer: &str) -> Result<PeerAttributes, TransferError> {
            Ok(PeerAttributes::default())
        }
    }

    fn verifier(client: FakeClient, db: Arc<HashDb>) -> Verifier {
        let mut cfg = Config::default().verification;
        cfg.probe_timeout_ms = 500;
        Verifier::new(Arc::new(client), db, Metrics::new(), cfg)
    }

    fn candidates(peers: &[&str]) -> Vec<Candidate> {
        peers
            .iter()
            .map(|p| Candidate {
                peer: p.to_string(),
                path: "album/07 song.flac".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_groups_by_fingerprint_and_latency() {
        let common = flac_file([0x11; 16]);
        let client = FakeClient::new()
            .with_peer("p1", PeerBehavior::Serve { data: common.clone(), delay: Duration::from_millis(30) })
            .with_peer("p2", PeerBehavior::Serve { data: common.clone(), delay: Duration::from_millis(5) })
            .with_peer("p3", PeerBehavior::Serve { data: common, delay: Duration::from_millis(60) })
            .with_peer("p4", PeerBehavior::Serve { data: flac_file([0x22; 16]), delay: Duration::ZERO });

        let db = Arc::new(HashDb::open_in_memory().unwrap());
        let report = verifier(client, db)
            .verify(
                "07 song.flac",
                100 * 1024,
                &candidates(&["p1", "p2", "p3", "p4"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.groups.len(), 2);
        let best = report.best_group().unwrap();
        assert_eq!(best.fingerprint.bytes, vec![0x11; 16]);
        let order: Vec<&str> = best.sources.iter().map(|s| s.peer.as_str()).collect();
        assert_eq!(order, vec!["p2", "p1", "p3"]);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let common = flac_file([0x33; 16]);
        let client = FakeClient::new()
            .with_peer("good", PeerBehavior::Serve { data: common, delay: Duration::ZERO })
            .with_peer("slow", PeerBehavior::Stall)
            .with_peer("grump", PeerBehavior::Reject);

        let db = Arc::new(HashDb::open_in_memory().unwrap());
        let report = verifier(client, db)
            .verify(
                "07 song.flac",
                100 * 1024,
                &candidates(&["good", "slow", "grump"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.best_group().unwrap().sources.len(), 1);
        assert_eq!(report.failures.len(), 2);
        let kinds: StdHashMap<&str, &ProbeFailure> = report
            .failures
            .iter()
            .map(|(p, f)| (p.as_str(), f))
            .collect();
        assert!(matches!(kinds["slow"], ProbeFailure::Timeout));
        assert!(matches!(kinds["grump"], ProbeFailure::RemoteRejected(_)));
    }

    #[tokio::test]
    async fn test_malformed_header_reported() {
        let mut junk = vec![0u8; 100 * 1024];
        junk[..4].copy_from_slice(b"MPEG");
        let client = FakeClient::new()
            .with_peer("bad", PeerBehavior::Serve { data: junk, delay: Duration::ZERO });

        let db = Arc::new(HashDb::open_in_memory().unwrap());
        let report = verifier(client, db)
            .verify("x.flac", 100 * 1024, &candidates(&["bad"]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.groups.is_empty());
        assert!(matches!(report.failures[0].1, ProbeFailure::MalformedHeader(_)));
    }

    #[tokio::test]
    async fn test_too_small_file_refused() {
        let db = Arc::new(HashDb::open_in_memory().unwrap());
        let err = verifier(FakeClient::new(), db)
            .verify("x.flac", 1000, &candidates(&["p1"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::FileTooSmallForVerification { .. }));
    }

    #[tokio::test]
    async fn test_known_peers_short_circuit() {
        let db = Arc::new(HashDb::open_in_memory().unwrap());
        let fp = Fingerprint::new(crate::fingerprint::FingerprintKind::FlacStreamInfoMd5, vec![0x44; 16]);
        let size = 100 * 1024;
        let filename = "07 song.flac";
        let path = "album/07 song.flac";

        db.store_fingerprint(
            &key::fingerprint_key(filename, size),
            &fp,
            size,
            0,
            FingerprintSource::Download,
        )
        .unwrap();
        let mut row = InventoryEntry::sighted("cached-peer", path, size, 0);
        row.status = InventoryStatus::Known;
        row.fingerprint = Some(fp.clone());
        row.source = Some(FingerprintSource::Download);
        db.upsert_inventory(&row).unwrap();

        // No live behavior registered for cached-peer: a probe would fail.
        let client = FakeClient::new().with_peer(
            "fresh-peer",
            PeerBehavior::Serve { data: flac_file([0x44; 16]), delay: Duration::from_millis(10) },
        );

        let report = verifier(client, db)
            .verify(
                filename,
                size,
                &[
                    Candidate { peer: "cached-peer".into(), path: path.into() },
                    Candidate { peer: "fresh-peer".into(), path: path.into() },
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let best = report.best_group().unwrap();
        assert_eq!(best.sources.len(), 2);
        assert!(best.sources[0].cached);
        assert_eq!(best.sources[0].peer, "cached-peer");
        assert!(!best.sources[1].cached);
        assert!(report.failures.is_empty());
    }
}
