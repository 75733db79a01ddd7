//! Opportunistic fingerprint backfill
//!
//! A periodic task that, while the client is otherwise idle, probes a few
//! inventory rows whose fingerprint is still unknown. Only peers without a
//! fingerprint database of their own are probed (gossip covers the rest),
//! and each peer has a strict daily probe budget.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackfillConfig;
use crate::hashdb::{utc_day, now_unix, FingerprintSource, HashDb, InventoryEntry, InventoryStatus, StoreError};
use crate::key;
use crate::metrics::Metrics;
use crate::verify::{Candidate, Verifier};

/// What one scheduler cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Cycle was skipped because user transfers were recently active.
    pub skipped_idle: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BackfillStats {
    pub probes: u64,
    pub hits: u64,
    pub failures: u64,
    pub last_cycle_at: i64,
}

pub struct BackfillService {
    db: Arc<HashDb>,
    verifier: Arc<Verifier>,
    metrics: Metrics,
    cfg: BackfillConfig,
    /// Unix time of the last user-initiated transfer the host reported.
    last_activity: AtomicI64,
    last_cycle_at: AtomicI64,
}

impl BackfillService {
    pub fn new(
        db: Arc<HashDb>,
        verifier: Arc<Verifier>,
        metrics: Metrics,
        cfg: BackfillConfig,
    ) -> Self {
        Self {
            db,
            verifier,
            metrics,
            cfg,
            last_activity: AtomicI64::new(0),
            last_cycle_at: AtomicI64::new(0),
        }
    }

    /// Host signal: a user transfer just happened; hold off probing.
    pub fn note_transfer_activity(&self) {
        self.last_activity.store(now_unix(), Ordering::Relaxed);
    }

    pub fn stats(&self) -> BackfillStats {
        BackfillStats {
            probes: self.metrics.backfill_probes(),
            hits: self.metrics.backfill_hits(),
            failures: self.metrics.backfill_failures(),
            last_cycle_at: self.last_cycle_at.load(Ordering::Relaxed),
        }
    }

    /// Scheduler loop; runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // Spread starts so a fleet of clients does not probe in lockstep.
        let jitter = {
            use rand::Rng;
            rand::thread_rng().gen_range(0..=self.cfg.interval_seconds / 10 + 1)
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(jitter)) => {}
        }

        let mut interval = tokio::time::interval(Duration::from_secs(self.cfg.interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.attempted > 0 => {
                            info!(
                                attempted = report.attempted,
                                succeeded = report.succeeded,
                                failed = report.failed,
                                "backfill cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "backfill cycle failed"),
                    }
                }
            }
        }
    }

    /// One scheduler pass. Public so hosts and tests can trigger it
    /// directly.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let now = now_unix();
        self.last_cycle_at.store(now, Ordering::Relaxed);

        let idle_for = now - self.last_activity.load(Ordering::Relaxed);
        if idle_for < self.cfg.min_idle_seconds as i64 {
            debug!(idle_for, "skipping backfill cycle, transfers recently active");
            return Ok(CycleReport {
                skipped_idle: true,
                ..CycleReport::default()
            });
        }

        let today = utc_day(now);
        let candidates = self.db.backfill_candidates(
            self.cfg.candidates_per_cycle,
            today,
            self.cfg.max_per_peer_per_day,
        )?;
        if candidates.is_empty() {
            return Ok(CycleReport::default());
        }

        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrent.max(1)));
        let probes = candidates.into_iter().map(|row| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                self.probe_candidate(row, today).await
            }
        });
        let results = futures::future::join_all(probes).await;

        let mut report = CycleReport {
            attempted: results.len(),
            ..CycleReport::default()
        };
        for result in results {
            match result? {
                true => report.succeeded += 1,
                false => report.failed += 1,
            }
        }
        Ok(report)
    }

    async fn probe_candidate(&self, row: InventoryEntry, today: i64) -> Result<bool, StoreError> {
        self.db
            .set_inventory_status(&row.file_id, InventoryStatus::Pending, today)?;
        self.metrics.backfill_probe();

        let candidate = Candidate {
            peer: row.peer_id.clone(),
            path: row.path.clone(),
        };
        let cancel = CancellationToken::new();
        let verified = self
            .verifier
            .verify(&row.path, row.size, &[candidate], &cancel)
            .await;

        let group = match verified {
            Ok(report) => report
                .groups
                .into_iter()
                .next()
                .filter(|g| !g.sources.is_empty()),
            Err(err) => {
                debug!(peer = %row.peer_id, path = %row.path, error = %err, "backfill probe refused");
                None
            }
        };

        match group {
            Some(group) => {
                let meta = group.sources[0].meta;
                let meta_flags = meta.map(|m| m.to_flags()).unwrap_or(0);
                self.db.store_fingerprint(
                    &key::fingerprint_key(&row.path, row.size),
                    &group.fingerprint,
                    row.size,
                    meta_flags,
                    FingerprintSource::BackfillProbe,
                )?;
                self.db.record_inventory_fingerprint(
                    &row.file_id,
                    &group.fingerprint,
                    FingerprintSource::BackfillProbe,
                    meta,
                )?;
                self.db.increment_backfill_count(&row.peer_id, today)?;
                self.metrics.backfill_hit();
                Ok(true)
            }
            None => {
                // Not retried again today.
                self.db
                    .set_inventory_status(&row.file_id, InventoryStatus::Failed, today)?;
                self.metrics.backfill_failure();
                Ok(false)
            }
        }
    }
}
