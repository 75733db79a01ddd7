//! Multi-source swarm download
//!
//! Pulls disjoint byte ranges of one file from several peers that verified
//! as holding identical content, then assembles and hash-checks the result.
//! One worker per source draws chunks from a shared queue; slow peers cycle
//! out, failing peers retire, and proven peers run bounded retry rounds for
//! whatever is left.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunks::{plan_chunks, ChunkQueue, ChunkSpec, Progress};
use crate::config::{SwarmConfig, VerificationConfig};
use crate::fingerprint::{self, Fingerprint};
use crate::hashdb::{FingerprintSource, HashDb, StoreError};
use crate::key;
use crate::metrics::Metrics;
use crate::transfer::{
    BoundedWriter, ChunkSink, DownloadOptions, FileSink, PeerId, TransferClient, TransferError,
};

/// A verified source: the peer and the path it shares the file under.
#[derive(Debug, Clone)]
pub struct SourcePeer {
    pub peer: PeerId,
    pub path: String,
}

/// A fully specified download request. Sources are expected to have been
/// verified as offering byte-identical content, ordered by preference.
#[derive(Debug, Clone)]
pub struct MultiSourceDownloadRequest {
    pub filename: String,
    pub size: u64,
    pub expected_fingerprint: Option<Fingerprint>,
    pub sources: Vec<SourcePeer>,
    pub chunk_size: Option<u64>,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Verifying,
    Downloading,
    Assembling,
    VerifyingFinal,
    Completed,
    Failed,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            JobState::Verifying => 0,
            JobState::Downloading => 1,
            JobState::Assembling => 2,
            JobState::VerifyingFinal => 3,
            JobState::Completed => 4,
            JobState::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("fewer than two verified sources")]
    NoVerifiedSources,

    #[error("final hash mismatch: expected {expected}, got {actual}")]
    FinalHashMismatch { expected: String, actual: String },

    #[error("retry rounds exhausted with {remaining} chunks unfinished")]
    ChunkExhaustion { remaining: usize },

    #[error("download cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a completed job.
#[derive(Debug, Clone)]
pub struct SwarmResult {
    pub output_path: PathBuf,
    /// SHA-256 of the assembled file, lowercase hex. Always recorded.
    pub sha256_hex: String,
    /// Fingerprint of the assembled content, when derivable.
    pub fingerprint: Option<Fingerprint>,
    pub bytes_downloaded: u64,
}

/// Point-in-time view of a job for status surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatus {
    pub id: u64,
    pub filename: String,
    pub size: u64,
    pub state: JobState,
    pub bytes_downloaded: u64,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub active_chunks: u32,
    pub active_workers: u32,
    pub error: Option<String>,
}

/// Shared handle to a running (or finished) job. Jobs are single-use; a
/// terminal state is final.
#[derive(Clone)]
pub struct SwarmJob {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: u64,
    request: MultiSourceDownloadRequest,
    chunks: Vec<ChunkSpec>,
    state: Mutex<JobState>,
    progress: Progress,
    cancel: CancellationToken,
    error: Mutex<Option<String>>,
}

impl SwarmJob {
    fn new(id: u64, request: MultiSourceDownloadRequest, chunks: Vec<ChunkSpec>) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id,
                request,
                chunks,
                state: Mutex::new(JobState::Verifying),
                progress: Progress::new(),
                cancel: CancellationToken::new(),
                error: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> JobState {
        *self.inner.state.lock().unwrap()
    }

    /// Abort the job. Workers return their in-flight chunks and exit; the
    /// scratch directory is removed.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn status(&self) -> JobStatus {
        let inner = &self.inner;
        JobStatus {
            id: inner.id,
            filename: inner.request.filename.clone(),
            size: inner.request.size,
            state: self.state(),
            bytes_downloaded: inner.progress.bytes_downloaded(),
            completed_chunks: inner.progress.completed_chunks(),
            total_chunks: inner.chunks.len() as u32,
            active_chunks: inner.progress.active_chunks(),
            active_workers: inner.progress.active_workers(),
            error: inner.error.lock().unwrap().clone(),
        }
    }

    /// Move forward in the one-way state machine; terminal states stick.
    fn advance(&self, next: JobState) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.is_terminal() && next.rank() > state.rank() {
            *state = next;
        }
    }

    fn fail(&self, error: &SwarmError) {
        *self.inner.error.lock().unwrap() = Some(error.to_string());
        self.advance(JobState::Failed);
    }
}

pub struct SwarmDownloader {
    client: Arc<dyn TransferClient>,
    db: Arc<HashDb>,
    metrics: Metrics,
    cfg: SwarmConfig,
    verify_cfg: VerificationConfig,
    /// Global bound on concurrent proven-source retry workers, shared by
    /// all jobs created from this downloader.
    retry_permits: Arc<Semaphore>,
}

impl SwarmDownloader {
    pub fn new(
        client: Arc<dyn TransferClient>,
        db: Arc<HashDb>,
        metrics: Metrics,
        cfg: SwarmConfig,
        verify_cfg: VerificationConfig,
    ) -> Self {
        let retry_permits = Arc::new(Semaphore::new(cfg.retry_semaphore));
        Self {
            client,
            db,
            metrics,
            cfg,
            verify_cfg,
            retry_permits,
        }
    }

    /// Plan chunks and wrap the request in a job handle.
    pub fn create_job(&self, id: u64, request: MultiSourceDownloadRequest) -> SwarmJob {
        let chunk_size = request.chunk_size.unwrap_or(self.cfg.default_chunk_size);
        let chunks = plan_chunks(request.size, chunk_size, request.sources.len().max(1));
        SwarmJob::new(id, request, chunks)
    }

    /// Drive a job to a terminal state.
    pub async fn execute(&self, job: &SwarmJob) -> Result<SwarmResult, SwarmError> {
        self.metrics.job_started();
        let result = self.run(job).await;
        match &result {
            Ok(_) => {
                job.advance(JobState::Completed);
                self.metrics.job_completed();
            }
            Err(err) => {
                job.fail(err);
                self.metrics.job_failed();
            }
        }
        result
    }

    async fn run(&self, job: &SwarmJob) -> Result<SwarmResult, SwarmError> {
        let request = &job.inner.request;
        if request.sources.len() < 2 {
            return Err(SwarmError::NoVerifiedSources);
        }

        let scratch = scratch_dir(&request.output_path, job.id());
        tokio::fs::create_dir_all(&scratch).await?;
        info!(
            job = job.id(),
            filename = %request.filename,
            size = request.size,
            chunks = job.inner.chunks.len(),
            sources = request.sources.len(),
            "starting swarm download"
        );

        let outcome = self.download_and_assemble(job, &scratch).await;

        // Scratch chunks are removed on every exit path; a failed or
        // cancelled job leaves nothing behind.
        if let Err(err) = tokio::fs::remove_dir_all(&scratch).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(job = job.id(), error = %err, "failed to remove scratch directory");
            }
        }
        outcome
    }

    async fn download_and_assemble(
        &self,
        job: &SwarmJob,
        scratch: &Path,
    ) -> Result<SwarmResult, SwarmError> {
        let request = &job.inner.request;
        let total = job.inner.chunks.len();
        let completed: Arc<Vec<AtomicBool>> =
            Arc::new((0..total).map(|_| AtomicBool::new(false)).collect());

        job.advance(JobState::Downloading);

        let shared = Arc::new(WorkerShared {
            client: Arc::clone(&self.client),
            metrics: self.metrics.clone(),
            cfg: self.cfg.clone(),
            job: job.clone(),
            completed: Arc::clone(&completed),
            queue: ChunkQueue::new(0..total as u32),
            proven: Mutex::new(HashSet::new()),
            unusable: Mutex::new(HashSet::new()),
            scratch: scratch.to_path_buf(),
        });

        // Initial pass: one worker per verified source.
        let mut handles = Vec::new();
        for source in &request.sources {
            let shared = Arc::clone(&shared);
            let source = source.clone();
            handles.push(tokio::spawn(run_worker(shared, source, None)));
        }
        for handle in handles {
            let _ = handle.await;
        }

        if job.inner.cancel.is_cancelled() {
            return Err(SwarmError::Cancelled);
        }

        // Proven-source retry rounds for whatever is left.
        for round in 1..=self.cfg.max_retry_rounds {
            let remaining = remaining_indices(&completed);
            if remaining.is_empty() {
                break;
            }
            let proven_sources: Vec<SourcePeer> = {
                let proven = shared.proven.lock().unwrap();
                let unusable = shared.unusable.lock().unwrap();
                request
                    .sources
                    .iter()
                    .filter(|s| proven.contains(&s.peer) && !unusable.contains(&s.peer))
                    .cloned()
                    .collect()
            };
            if proven_sources.is_empty() {
                break;
            }
            debug!(
                job = job.id(),
                round,
                remaining = remaining.len(),
                proven = proven_sources.len(),
                "starting retry round"
            );
            shared.queue.reset(remaining);

            let mut handles = Vec::new();
            for source in proven_sources {
                let shared = Arc::clone(&shared);
                let permit = Arc::clone(&self.retry_permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| SwarmError::Cancelled)?;
                handles.push(tokio::spawn(run_worker(shared, source, Some(permit))));
            }
            for handle in handles {
                let _ = handle.await;
            }
            if job.inner.cancel.is_cancelled() {
                return Err(SwarmError::Cancelled);
            }
        }

        let remaining = remaining_indices(&completed);
        if !remaining.is_empty() {
            return Err(SwarmError::ChunkExhaustion {
                remaining: remaining.len(),
            });
        }

        self.assemble_and_verify(job, scratch).await
    }

    async fn assemble_and_verify(
        &self,
        job: &SwarmJob,
        scratch: &Path,
    ) -> Result<SwarmResult, SwarmError> {
        let request = &job.inner.request;
        job.advance(JobState::Assembling);

        let part_path = part_path(&request.output_path);
        let prefix_len = fingerprint::minimum_prefix_bytes(
            &request.filename,
            self.verify_cfg.non_flac_prefix_bytes,
        )
        .min(request.size) as usize;

        let assembled = self
            .assemble(job, scratch, &part_path, prefix_len)
            .await
            .inspect_err(|_| {
                // Never leave a half-written target behind.
                let _ = std::fs::remove_file(&part_path);
            })?;

        job.advance(JobState::VerifyingFinal);
        let computed = fingerprint::fingerprint(&assembled.prefix, &request.filename).ok();
        if let Some(expected) = &request.expected_fingerprint {
            let matches = computed
                .as_ref()
                .is_some_and(|(fp, _)| fp == expected);
            if !matches {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(SwarmError::FinalHashMismatch {
                    expected: expected.to_hex(),
                    actual: computed
                        .as_ref()
                        .map(|(fp, _)| fp.to_hex())
                        .unwrap_or_else(|| "<unfingerprintable>".to_string()),
                });
            }
        }

        tokio::fs::rename(&part_path, &request.output_path).await?;

        // Publish what this download proved so gossip can carry it.
        if let Some((fp, meta)) = &computed {
            let meta_flags = meta.map(|m| m.to_flags()).unwrap_or(0);
            self.db.store_fingerprint(
                &key::fingerprint_key(&request.filename, request.size),
                fp,
                request.size,
                meta_flags,
                FingerprintSource::Download,
            )?;
        }

        info!(
            job = job.id(),
            output = %request.output_path.display(),
            sha256 = %assembled.sha256_hex,
            "swarm download completed"
        );
        Ok(SwarmResult {
            output_path: request.output_path.clone(),
            sha256_hex: assembled.sha256_hex,
            fingerprint: computed.map(|(fp, _)| fp),
            bytes_downloaded: job.inner.progress.bytes_downloaded(),
        })
    }

    /// Concatenate chunk files in index order into `part_path`, hashing as
    /// we go and retaining the verification prefix.
    async fn assemble(
        &self,
        job: &SwarmJob,
        scratch: &Path,
        part_path: &Path,
        prefix_len: usize,
    ) -> Result<Assembled, SwarmError> {
        let mut out = tokio::fs::File::create(part_path).await?;
        let mut hasher = Sha256::new();
        let mut prefix = Vec::with_capacity(prefix_len);
        let mut buf = vec![0u8; 64 * 1024];

        for chunk in &job.inner.chunks {
            let chunk_file = chunk_path(scratch, chunk.index);
            let mut file = tokio::fs::File::open(&chunk_file).await?;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let data = &buf[..n];
                out.write_all(data).await?;
                hasher.update(data);
                if prefix.len() < prefix_len {
                    let take = (prefix_len - prefix.len()).min(n);
                    prefix.extend_from_slice(&data[..take]);
                }
            }
        }
        out.flush().await?;
        out.sync_all().await?;

        Ok(Assembled {
            sha256_hex: hex::encode(hasher.finalize()),
            prefix,
        })
    }
}

struct Assembled {
    sha256_hex: String,
    prefix: Vec<u8>,
}

fn remaining_indices(completed: &[AtomicBool]) -> Vec<u32> {
    completed
        .iter()
        .enumerate()
        .filter(|(_, done)| !done.load(Ordering::SeqCst))
        .map(|(i, _)| i as u32)
        .collect()
}

fn scratch_dir(output_path: &Path, job_id: u64) -> PathBuf {
    let parent = output_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    parent.join(format!(".{stem}.chunks-{job_id}"))
}

fn part_path(output_path: &Path) -> PathBuf {
    let mut os = output_path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

fn chunk_path(scratch: &Path, index: u32) -> PathBuf {
    scratch.join(format!("{index:06}.chunk"))
}

struct WorkerShared {
    client: Arc<dyn TransferClient>,
    metrics: Metrics,
    cfg: SwarmConfig,
    job: SwarmJob,
    completed: Arc<Vec<AtomicBool>>,
    queue: ChunkQueue,
    proven: Mutex<HashSet<PeerId>>,
    unusable: Mutex<HashSet<PeerId>>,
    scratch: PathBuf,
}

enum ChunkError {
    /// Throughput stayed under the floor for the whole slow window.
    Slow,
    /// Peer refused the request (commonly a non-zero start offset).
    Rejected(String),
    /// Transient failure; counts against the worker's tolerance.
    Failed(String),
    Cancelled,
}

/// One logical worker bound to one peer. Pulls chunks until the queue runs
/// dry, the peer disqualifies itself, or the job is cancelled.
async fn run_worker(
    shared: Arc<WorkerShared>,
    source: SourcePeer,
    _retry_permit: Option<tokio::sync::OwnedSemaphorePermit>,
) {
    shared.job.inner.progress.worker_started();
    let mut consecutive_failures = 0u32;
    let mut slow_cycles = 0u32;

    loop {
        if shared.job.inner.cancel.is_cancelled() {
            break;
        }
        let Some(index) = shared.queue.pop() else {
            break;
        };
        let chunk = shared.job.inner.chunks[index as usize];
        shared.job.inner.progress.chunk_started();

        match fetch_chunk(&shared, &source, chunk).await {
            Ok(bytes) => {
                shared.completed[index as usize].store(true, Ordering::SeqCst);
                shared.job.inner.progress.chunk_finished(true, bytes);
                shared.metrics.chunk_completed(bytes);
                shared.proven.lock().unwrap().insert(source.peer.clone());
                consecutive_failures = 0;
            }
            Err(ChunkError::Slow) => {
                shared.job.inner.progress.chunk_finished(false, 0);
                shared.queue.requeue_front(index);
                shared.metrics.slow_peer_cycled();
                shared.metrics.chunk_requeued();
                warn!(peer = %source.peer, chunk = index, "peer too slow, cycling");
                // A worker that keeps tripping the watchdog must not spin
                // on the tail chunk after everyone else has drained the
                // queue and exited.
                slow_cycles += 1;
                if slow_cycles >= shared.cfg.max_consecutive_failures {
                    break;
                }
                // Cool the peer down before it takes more work.
                let cooldown = Duration::from_secs(shared.cfg.slow_window_seconds);
                tokio::select! {
                    _ = shared.job.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(cooldown) => {}
                }
            }
            Err(ChunkError::Cancelled) => {
                shared.job.inner.progress.chunk_finished(false, 0);
                shared.queue.requeue_front(index);
                break;
            }
            Err(ChunkError::Rejected(reason)) => {
                shared.job.inner.progress.chunk_finished(false, 0);
                shared.queue.requeue_back(index);
                shared.metrics.chunk_requeued();
                warn!(peer = %source.peer, chunk = index, reason, "peer rejected range request");
                shared.unusable.lock().unwrap().insert(source.peer.clone());
                break;
            }
            Err(ChunkError::Failed(reason)) => {
                shared.job.inner.progress.chunk_finished(false, 0);
                shared.queue.requeue_back(index);
                shared.metrics.chunk_requeued();
                consecutive_failures += 1;
                debug!(
                    peer = %source.peer,
                    chunk = index,
                    reason,
                    consecutive_failures,
                    "chunk failed"
                );
                if consecutive_failures >= shared.cfg.max_consecutive_failures {
                    warn!(peer = %source.peer, "worker exhausted failure tolerance");
                    shared.unusable.lock().unwrap().insert(source.peer.clone());
                    break;
                }
            }
        }
    }

    shared.job.inner.progress.worker_stopped();
}

/// Download one chunk into its scratch file via a bounded writer.
async fn fetch_chunk(
    shared: &WorkerShared,
    source: &SourcePeer,
    chunk: ChunkSpec,
) -> Result<u64, ChunkError> {
    let path = chunk_path(&shared.scratch, chunk.index);
    let file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| ChunkError::Failed(e.to_string()))?;

    let chunk_cancel = shared.job.inner.cancel.child_token();
    let mut sink = BoundedWriter::new(FileSink::new(file), chunk.len(), chunk_cancel.clone());
    let progress = sink.progress();

    let min_bps = shared.cfg.min_worker_bps;
    let slow_window = Duration::from_secs(shared.cfg.slow_window_seconds);
    let watchdog = async {
        let mut last_ok = Instant::now();
        let mut last_bytes = 0u64;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let bytes = progress.load(Ordering::Relaxed);
            if bytes - last_bytes >= min_bps {
                last_ok = Instant::now();
            }
            last_bytes = bytes;
            if last_ok.elapsed() >= slow_window {
                return;
            }
        }
    };

    let download = shared.client.download(
        &source.peer,
        &source.path,
        &mut sink,
        shared.job.inner.request.size,
        chunk.start,
        DownloadOptions::default(),
        chunk_cancel.clone(),
    );

    let result = tokio::select! {
        _ = watchdog => {
            chunk_cancel.cancel();
            let _ = tokio::fs::remove_file(&path).await;
            return Err(ChunkError::Slow);
        }
        result = download => result,
    };

    let complete = sink.bound_reached();
    let outcome = match result {
        // The bounded writer cancels the transfer once the range is in.
        Ok(_) | Err(TransferError::Cancelled) if complete => {
            sink.flush()
                .await
                .map_err(|e| ChunkError::Failed(e.to_string()))?;
            Ok(chunk.len())
        }
        Err(TransferError::Cancelled) if shared.job.inner.cancel.is_cancelled() => {
            Err(ChunkError::Cancelled)
        }
        Err(TransferError::Cancelled) => Err(ChunkError::Failed("transfer cancelled".into())),
        Err(TransferError::RemoteRejected(reason)) => Err(ChunkError::Rejected(reason)),
        Err(TransferError::Timeout) => Err(ChunkError::Failed("transfer timed out".into())),
        Err(TransferError::Transport(reason)) => Err(ChunkError::Failed(reason)),
        Ok(n) => Err(ChunkError::Failed(format!(
            "short chunk transfer: {n} of {} bytes",
            chunk.len()
        ))),
    };

    if outcome.is_err() {
        let _ = tokio::fs::remove_file(&path).await;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_sources(n: usize) -> SwarmJob {
        let request = MultiSourceDownloadRequest {
            filename: "x.bin".into(),
            size: 1000,
            expected_fingerprint: None,
            sources: (0..n)
                .map(|i| SourcePeer {
                    peer: format!("p{i}"),
                    path: "x.bin".into(),
                })
                .collect(),
            chunk_size: Some(100),
            output_path: PathBuf::from("/tmp/x.bin"),
        };
        SwarmJob::new(7, request, plan_chunks(1000, 100, n.max(1)))
    }

    #[test]
    fn test_state_machine_is_one_way() {
        let job = job_with_sources(2);
        assert_eq!(job.state(), JobState::Verifying);

        job.advance(JobState::Downloading);
        job.advance(JobState::Assembling);
        // Backwards transitions are ignored
        job.advance(JobState::Downloading);
        assert_eq!(job.state(), JobState::Assembling);

        job.advance(JobState::Completed);
        // Terminal states stick
        job.advance(JobState::Failed);
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn test_failed_state_sticks() {
        let job = job_with_sources(2);
        job.fail(&SwarmError::NoVerifiedSources);
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.status().error.unwrap().contains("verified sources"));

        job.advance(JobState::Downloading);
        assert_eq!(job.state(), JobState::Failed);
    }

    #[test]
    fn test_status_snapshot() {
        let job = job_with_sources(3);
        let status = job.status();
        assert_eq!(status.id, 7);
        assert_eq!(status.total_chunks, 10);
        assert_eq!(status.completed_chunks, 0);
        assert_eq!(status.state, JobState::Verifying);
    }

    #[test]
    fn test_scratch_and_part_paths() {
        let out = PathBuf::from("/downloads/album/song.flac");
        assert_eq!(
            scratch_dir(&out, 42),
            PathBuf::from("/downloads/album/.song.flac.chunks-42")
        );
        assert_eq!(part_path(&out), PathBuf::from("/downloads/album/song.flac.part"));
        assert_eq!(chunk_path(Path::new("/s"), 3), PathBuf::from("/s/000003.chunk"));
    }
}
