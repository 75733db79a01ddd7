//! Counters for probe, swarm, mesh, and backfill activity
//!
//! Thread-safe collection using atomic types; stats endpoints sample these.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Verification probes
    probes_started: AtomicU64,
    probes_succeeded: AtomicU64,
    probes_failed: AtomicU64,

    // Swarm chunk traffic
    chunks_completed: AtomicU64,
    chunks_requeued: AtomicU64,
    chunk_bytes: AtomicU64,
    slow_peer_cycles: AtomicU64,

    // Jobs
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,

    // Mesh gossip
    mesh_sessions: AtomicU64,
    mesh_entries_merged: AtomicU64,
    mesh_entries_sent: AtomicU64,
    mesh_violations: AtomicU64,

    // Backfill
    backfill_probes: AtomicU64,
    backfill_hits: AtomicU64,
    backfill_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn probe_started(&self) {
        self.inner.probes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_succeeded(&self) {
        self.inner.probes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_failed(&self) {
        self.inner.probes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probes_started(&self) -> u64 {
        self.inner.probes_started.load(Ordering::Relaxed)
    }

    pub fn probes_succeeded(&self) -> u64 {
        self.inner.probes_succeeded.load(Ordering::Relaxed)
    }

    pub fn probes_failed(&self) -> u64 {
        self.inner.probes_failed.load(Ordering::Relaxed)
    }

    pub fn chunk_completed(&self, bytes: u64) {
        self.inner.chunks_completed.fetch_add(1, Ordering::Relaxed);
        self.inner.chunk_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn chunk_requeued(&self) {
        self.inner.chunks_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slow_peer_cycled(&self) {
        self.inner.slow_peer_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_completed(&self) -> u64 {
        self.inner.chunks_completed.load(Ordering::Relaxed)
    }

    pub fn chunks_requeued(&self) -> u64 {
        self.inner.chunks_requeued.load(Ordering::Relaxed)
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.inner.chunk_bytes.load(Ordering::Relaxed)
    }

    pub fn slow_peer_cycles(&self) -> u64 {
        self.inner.slow_peer_cycles.load(Ordering::Relaxed)
    }

    pub fn job_started(&self) {
        self.inner.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.inner.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jobs_started(&self) -> u64 {
        self.inner.jobs_started.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.inner.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.inner.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn mesh_session(&self) {
        self.inner.mesh_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mesh_entries_merged(&self, n: u64) {
        self.inner.mesh_entries_merged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mesh_entries_sent(&self, n: u64) {
        self.inner.mesh_entries_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mesh_violation(&self) {
        self.inner.mesh_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mesh_sessions(&self) -> u64 {
        self.inner.mesh_sessions.load(Ordering::Relaxed)
    }

    pub fn mesh_entries_merged_total(&self) -> u64 {
        self.inner.mesh_entries_merged.load(Ordering::Relaxed)
    }

    pub fn mesh_entries_sent_total(&self) -> u64 {
        self.inner.mesh_entries_sent.load(Ordering::Relaxed)
    }

    pub fn mesh_violations(&self) -> u64 {
        self.inner.mesh_violations.load(Ordering::Relaxed)
    }

    pub fn backfill_probe(&self) {
        self.inner.backfill_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backfill_hit(&self) {
        self.inner.backfill_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backfill_failure(&self) {
        self.inner.backfill_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backfill_probes(&self) -> u64 {
        self.inner.backfill_probes.load(Ordering::Relaxed)
    }

    pub fn backfill_hits(&self) -> u64 {
        self.inner.backfill_hits.load(Ordering::Relaxed)
    }

    pub fn backfill_failures(&self) -> u64 {
        self.inner.backfill_failures.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
