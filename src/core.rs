//! Core façade for the hosting application
//!
//! Owns the hash database, the transfer client handle, and the long-lived
//! mesh and backfill tasks. The host constructs one `Core`, starts it, and
//! drives everything through its methods; shutdown cancels and joins all
//! background work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backfill::{BackfillService, BackfillStats, CycleReport};
use crate::config::Config;
use crate::hashdb::{now_unix, FingerprintEntry, HashDb, InventoryEntry, StoreError};
use crate::key;
use crate::mesh::{MeshLink, MeshService, MeshStats};
use crate::metrics::Metrics;
use crate::swarm::{
    JobStatus, MultiSourceDownloadRequest, SourcePeer, SwarmDownloader, SwarmError, SwarmJob,
};
use crate::transfer::{SearchOptions, TransferClient, TransferError};
use crate::verify::{Candidate, VerificationReport, Verifier, VerifyError};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("unknown job {0}")]
    UnknownJob(u64),
}

#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    db: Arc<HashDb>,
    client: Arc<dyn TransferClient>,
    metrics: Metrics,
    verifier: Arc<Verifier>,
    downloader: SwarmDownloader,
    mesh: Arc<MeshService>,
    backfill: Arc<BackfillService>,
    jobs: Mutex<HashMap<u64, SwarmJob>>,
    next_job_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Wire up all services. `client_id` identifies this node in mesh
    /// HELLO frames.
    pub fn new(
        cfg: Config,
        db: Arc<HashDb>,
        client: Arc<dyn TransferClient>,
        client_id: String,
    ) -> Self {
        let metrics = Metrics::new();
        let verifier = Arc::new(Verifier::new(
            Arc::clone(&client),
            Arc::clone(&db),
            metrics.clone(),
            cfg.verification.clone(),
        ));
        let downloader = SwarmDownloader::new(
            Arc::clone(&client),
            Arc::clone(&db),
            metrics.clone(),
            cfg.swarm.clone(),
            cfg.verification.clone(),
        );
        let mesh = Arc::new(MeshService::new(
            Arc::clone(&db),
            metrics.clone(),
            cfg.mesh.clone(),
            client_id,
        ));
        let backfill = Arc::new(BackfillService::new(
            Arc::clone(&db),
            Arc::clone(&verifier),
            metrics.clone(),
            cfg.backfill.clone(),
        ));

        Self {
            inner: Arc::new(CoreInner {
                db,
                client,
                metrics,
                verifier,
                downloader,
                mesh,
                backfill,
                jobs: Mutex::new(HashMap::new()),
                next_job_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start background services. Idempotent-enough for a single host call.
    pub fn start(&self) {
        let backfill = Arc::clone(&self.inner.backfill);
        let cancel = self.inner.shutdown.child_token();
        let handle = tokio::spawn(backfill.run(cancel));
        self.inner.tasks.lock().unwrap().push(handle);
        info!("core services started");
    }

    /// Cancel all jobs and background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for job in self.inner.jobs.lock().unwrap().values() {
            job.cancel();
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        info!("core services stopped");
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn db(&self) -> &Arc<HashDb> {
        &self.inner.db
    }

    /// Search the network for copies of `(filename, size)` and group the
    /// responding peers by verified fingerprint.
    pub async fn find_verified_sources(
        &self,
        filename: &str,
        size: u64,
    ) -> Result<VerificationReport, CoreError> {
        let responses = self
            .inner
            .client
            .search(filename, SearchOptions::default())
            .await?;

        let now = now_unix();
        let wanted = key::normalize_basename(filename);
        let mut candidates = Vec::new();
        for response in &responses {
            self.inner.db.touch_peer(&response.peer, now)?;
            for file in &response.files {
                if file.size != size || key::normalize_basename(&file.path) != wanted {
                    continue;
                }
                self.inner
                    .db
                    .record_sighting(&InventoryEntry::sighted(
                        &response.peer,
                        &file.path,
                        file.size,
                        now,
                    ))?;
                candidates.push(Candidate {
                    peer: response.peer.clone(),
                    path: file.path.clone(),
                });
            }
        }

        let cancel = self.inner.shutdown.child_token();
        Ok(self
            .inner
            .verifier
            .verify(filename, size, &candidates, &cancel)
            .await?)
    }

    /// Start a swarm download. A request without sources triggers search
    /// plus verification first; the best fingerprint group becomes the
    /// source list.
    pub async fn start_swarm(
        &self,
        mut request: MultiSourceDownloadRequest,
    ) -> Result<JobStatus, CoreError> {
        if request.sources.is_empty() {
            let report = self
                .find_verified_sources(&request.filename, request.size)
                .await?;
            let best = report
                .best_group()
                .filter(|g| g.sources.len() >= 2)
                .ok_or(SwarmError::NoVerifiedSources)?;
            request.expected_fingerprint = Some(best.fingerprint.clone());
            request.sources = best
                .sources
                .iter()
                .map(|s| SourcePeer {
                    peer: s.peer.clone(),
                    path: s.path.clone(),
                })
                .collect();
        }

        // A user asked for this; backfill holds off for a while.
        self.note_transfer_activity();

        let id = self.inner.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        let job = self.inner.downloader.create_job(id, request);
        self.inner.jobs.lock().unwrap().insert(id, job.clone());

        let inner = Arc::clone(&self.inner);
        let task_job = job.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = inner.downloader.execute(&task_job).await {
                warn!(job = task_job.id(), error = %err, "swarm download failed");
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);

        Ok(job.status())
    }

    pub fn job_status(&self, id: u64) -> Result<JobStatus, CoreError> {
        self.inner
            .jobs
            .lock()
            .unwrap()
            .get(&id)
            .map(|job| job.status())
            .ok_or(CoreError::UnknownJob(id))
    }

    pub fn cancel_job(&self, id: u64) -> Result<(), CoreError> {
        let jobs = self.inner.jobs.lock().unwrap();
        let job = jobs.get(&id).ok_or(CoreError::UnknownJob(id))?;
        job.cancel();
        Ok(())
    }

    pub fn lookup_fingerprint(&self, key: &str) -> Result<Option<FingerprintEntry>, CoreError> {
        Ok(self.inner.db.lookup_fingerprint(key)?)
    }

    pub fn mesh_stats(&self) -> Result<MeshStats, CoreError> {
        Ok(self.inner.mesh.stats()?)
    }

    pub fn backfill_stats(&self) -> BackfillStats {
        self.inner.backfill.stats()
    }

    /// Drop the per-neighbor sync cooldown so the next connection to
    /// `peer` syncs immediately.
    pub fn trigger_mesh_sync(&self, peer: &str) {
        self.inner.mesh.mark_sync_due(peer);
    }

    /// Hand an established, authenticated link to the mesh. Returns false
    /// when rate limits refuse the session.
    pub fn connect_mesh_peer(&self, peer: &str, mut link: Box<dyn MeshLink>) -> bool {
        if !self.inner.mesh.admit_session(peer) {
            return false;
        }
        let inner = Arc::clone(&self.inner);
        let peer = peer.to_string();
        let cancel = self.inner.shutdown.child_token();
        let handle = tokio::spawn(async move {
            match inner.mesh.run_session(&peer, link.as_mut(), &cancel).await {
                Ok(outcome) => info!(
                    peer,
                    received = outcome.entries_received,
                    sent = outcome.entries_sent,
                    "mesh session finished"
                ),
                Err(err) => warn!(peer, error = %err, "mesh session failed"),
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
        true
    }

    /// Run one backfill pass immediately. Test hook.
    pub async fn trigger_backfill_cycle(&self) -> Result<CycleReport, CoreError> {
        Ok(self.inner.backfill.run_cycle().await?)
    }

    /// Host signal feeding the backfill idle gate.
    pub fn note_transfer_activity(&self) {
        self.inner.backfill.note_transfer_activity();
    }
}
