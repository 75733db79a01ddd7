//! Durable fingerprint store
//!
//! One SQLite database holds the peer table, the per-peer file inventory,
//! the content-addressed fingerprint table, and the per-neighbor gossip
//! watermarks. Every fingerprint insert or change is stamped with a fresh
//! value from a monotonic sequence counter; delta gossip is driven off that
//! sequence.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::transfer::PeerId;
use crate::wire::DeltaEntry;

const SEQ_COUNTER: &str = "fingerprint_seq";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Peer capability bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const SUPPORTS_MESH: Capabilities = Capabilities(1);
    pub const SUPPORTS_HASH_EXCHANGE: Capabilities = Capabilities(1 << 1);
    pub const SUPPORTS_PARTIAL_RANGE: Capabilities = Capabilities(1 << 2);
    pub const SUPPORTS_BACKFILL_PROBE: Capabilities = Capabilities(1 << 3);
    pub const HAS_FINGERPRINT_DB: Capabilities = Capabilities(1 << 4);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub capabilities: Capabilities,
    pub client_version: Option<String>,
    pub last_seen: i64,
    pub last_capability_check: i64,
    pub backfill_today: u32,
    pub backfill_reset_day: i64,
}

impl PeerRecord {
    pub fn new(id: impl Into<PeerId>, now: i64) -> Self {
        Self {
            id: id.into(),
            capabilities: Capabilities::default(),
            client_version: None,
            last_seen: now,
            last_capability_check: 0,
            backfill_today: 0,
            backfill_reset_day: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryStatus {
    None,
    Known,
    Pending,
    Failed,
}

impl InventoryStatus {
    fn as_str(self) -> &'static str {
        match self {
            InventoryStatus::None => "none",
            InventoryStatus::Known => "known",
            InventoryStatus::Pending => "pending",
            InventoryStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(InventoryStatus::None),
            "known" => Some(InventoryStatus::Known),
            "pending" => Some(InventoryStatus::Pending),
            "failed" => Some(InventoryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintSource {
    LocalScan,
    PeerGossip,
    BackfillProbe,
    Download,
}

impl FingerprintSource {
    fn as_str(self) -> &'static str {
        match self {
            FingerprintSource::LocalScan => "local-scan",
            FingerprintSource::PeerGossip => "peer-gossip",
            FingerprintSource::BackfillProbe => "backfill-probe",
            FingerprintSource::Download => "download",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "local-scan" => Some(FingerprintSource::LocalScan),
            "peer-gossip" => Some(FingerprintSource::PeerGossip),
            "backfill-probe" => Some(FingerprintSource::BackfillProbe),
            "download" => Some(FingerprintSource::Download),
            _ => None,
        }
    }

    /// Whether this node computed the fingerprint itself (as opposed to
    /// having heard it over gossip).
    pub fn is_verified(self) -> bool {
        !matches!(self, FingerprintSource::PeerGossip)
    }
}

#[derive(Debug, Clone)]
pub struct InventoryEntry {
    pub file_id: String,
    pub peer_id: PeerId,
    pub path: String,
    pub size: u64,
    pub discovered_at: i64,
    pub status: InventoryStatus,
    pub fingerprint: Option<Fingerprint>,
    pub source: Option<FingerprintSource>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bit_depth: Option<u8>,
    pub total_samples: Option<u64>,
    /// UTC day of the last backfill attempt; suppresses same-day retries.
    pub last_attempt_day: i64,
}

impl InventoryEntry {
    pub fn sighted(peer: &str, path: &str, size: u64, now: i64) -> Self {
        Self {
            file_id: crate::key::file_id(peer, path, size),
            peer_id: peer.to_string(),
            path: path.to_string(),
            size,
            discovered_at: now,
            status: InventoryStatus::None,
            fingerprint: None,
            source: None,
            sample_rate: None,
            channels: None,
            bit_depth: None,
            total_samples: None,
            last_attempt_day: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintEntry {
    pub key: String,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub meta_flags: u32,
    pub first_seen_at: i64,
    pub last_updated_at: i64,
    pub seq_id: u64,
    pub verified: bool,
    pub conflicts: u32,
}

#[derive(Debug, Clone)]
pub struct MeshPeerState {
    pub peer_id: PeerId,
    pub last_sync_at: i64,
    pub last_seq_seen: u64,
    pub capabilities: Capabilities,
    pub violations: u32,
}

/// Outcome of a fingerprint store attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// New row; carries the assigned seq id.
    Inserted(u64),
    /// Existing unverified row replaced by a verified value; fresh seq id.
    Replaced(u64),
    /// Fingerprint identical to the stored one; seq untouched.
    Unchanged,
    /// Differing fingerprint lost to the earlier row; conflict counted.
    ConflictKeptLocal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: u64,
    pub unchanged: u64,
    pub conflicts: u64,
    pub skipped: u64,
}

/// Current UTC calendar day as days since the unix epoch.
pub fn utc_day(now_secs: i64) -> i64 {
    now_secs.div_euclid(86_400)
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The store. All access serializes through one connection; callers treat
/// each method as a short critical section.
pub struct HashDb {
    conn: Mutex<Connection>,
}

impl HashDb {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                id                    TEXT PRIMARY KEY,
                capabilities          INTEGER NOT NULL DEFAULT 0,
                client_version        TEXT,
                last_seen             INTEGER NOT NULL DEFAULT 0,
                last_capability_check INTEGER NOT NULL DEFAULT 0,
                backfill_today        INTEGER NOT NULL DEFAULT 0,
                backfill_reset_day    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS inventory (
                file_id          TEXT PRIMARY KEY,
                peer_id          TEXT NOT NULL,
                path             TEXT NOT NULL,
                size             INTEGER NOT NULL,
                discovered_at    INTEGER NOT NULL,
                status           TEXT NOT NULL DEFAULT 'none',
                fingerprint      BLOB,
                source           TEXT,
                sample_rate      INTEGER,
                channels         INTEGER,
                bit_depth        INTEGER,
                total_samples    INTEGER,
                last_attempt_day INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_inventory_status ON inventory(status);
            CREATE INDEX IF NOT EXISTS idx_inventory_peer ON inventory(peer_id);

            CREATE TABLE IF NOT EXISTS fingerprints (
                key             TEXT PRIMARY KEY,
                fingerprint     BLOB NOT NULL,
                size            INTEGER NOT NULL,
                meta_flags      INTEGER NOT NULL DEFAULT 0,
                first_seen_at   INTEGER NOT NULL,
                last_updated_at INTEGER NOT NULL,
                seq_id          INTEGER NOT NULL UNIQUE,
                verified        INTEGER NOT NULL DEFAULT 1,
                conflicts       INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_fingerprints_seq ON fingerprints(seq_id);

            CREATE TABLE IF NOT EXISTS mesh_peer_state (
                peer_id       TEXT PRIMARY KEY,
                last_sync_at  INTEGER NOT NULL DEFAULT 0,
                last_seq_seen INTEGER NOT NULL DEFAULT 0,
                capabilities  INTEGER NOT NULL DEFAULT 0,
                violations    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS counters (
                name  TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO counters (name, value) VALUES ('fingerprint_seq', 0);
            "#,
        )?;
        Ok(())
    }

    // ---- peers -----------------------------------------------------------

    pub fn upsert_peer(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO peers (id, capabilities, client_version, last_seen,
                               last_capability_check, backfill_today, backfill_reset_day)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                capabilities = excluded.capabilities,
                client_version = excluded.client_version,
                last_seen = MAX(peers.last_seen, excluded.last_seen),
                last_capability_check = excluded.last_capability_check
            "#,
            params![
                peer.id,
                peer.capabilities.bits(),
                peer.client_version,
                peer.last_seen,
                peer.last_capability_check,
                peer.backfill_today,
                peer.backfill_reset_day,
            ],
        )?;
        Ok(())
    }

    pub fn get_peer(&self, id: &str) -> Result<Option<PeerRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"SELECT id, capabilities, client_version, last_seen,
                          last_capability_check, backfill_today, backfill_reset_day
                   FROM peers WHERE id = ?1"#,
                params![id],
                |row| {
                    Ok(PeerRecord {
                        id: row.get(0)?,
                        capabilities: Capabilities(row.get(1)?),
                        client_version: row.get(2)?,
                        last_seen: row.get(3)?,
                        last_capability_check: row.get(4)?,
                        backfill_today: row.get(5)?,
                        backfill_reset_day: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Create the peer row if it is new and advance `last_seen`.
    pub fn touch_peer(&self, id: &str, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO peers (id, last_seen) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET last_seen = MAX(peers.last_seen, excluded.last_seen)
            "#,
            params![id, now],
        )?;
        Ok(())
    }

    pub fn set_peer_capabilities(
        &self,
        id: &str,
        capabilities: Capabilities,
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO peers (id, capabilities, last_seen, last_capability_check)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET
                capabilities = excluded.capabilities,
                last_capability_check = excluded.last_capability_check,
                last_seen = MAX(peers.last_seen, excluded.last_seen)
            "#,
            params![id, capabilities.bits(), now],
        )?;
        Ok(())
    }

    /// Drop peer rows unseen since `cutoff`, along with their inventory.
    pub fn prune_peers_unseen_since(&self, cutoff: i64) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM inventory WHERE peer_id IN (SELECT id FROM peers WHERE last_seen < ?1)",
            params![cutoff],
        )?;
        let n = tx.execute("DELETE FROM peers WHERE last_seen < ?1", params![cutoff])?;
        tx.commit()?;
        Ok(n)
    }

    // ---- inventory -------------------------------------------------------

    pub fn upsert_inventory(&self, entry: &InventoryEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO inventory (file_id, peer_id, path, size, discovered_at, status,
                                   fingerprint, source, sample_rate, channels, bit_depth,
                                   total_samples, last_attempt_day)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(file_id) DO UPDATE SET
                status = excluded.status,
                fingerprint = excluded.fingerprint,
                source = excluded.source,
                sample_rate = excluded.sample_rate,
                channels = excluded.channels,
                bit_depth = excluded.bit_depth,
                total_samples = excluded.total_samples,
                last_attempt_day = excluded.last_attempt_day
            "#,
            params![
                entry.file_id,
                entry.peer_id,
                entry.path,
                entry.size,
                entry.discovered_at,
                entry.status.as_str(),
                entry.fingerprint.as_ref().map(|f| f.bytes.clone()),
                entry.source.map(|s| s.as_str()),
                entry.sample_rate,
                entry.channels,
                entry.bit_depth,
                entry.total_samples,
                entry.last_attempt_day,
            ],
        )?;
        Ok(())
    }

    /// Record a sighting without clobbering an already-known row.
    pub fn record_sighting(&self, entry: &InventoryEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO inventory (file_id, peer_id, path, size, discovered_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, 'none')
            ON CONFLICT(file_id) DO NOTHING
            "#,
            params![
                entry.file_id,
                entry.peer_id,
                entry.path,
                entry.size,
                entry.discovered_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_inventory(&self, file_id: &str) -> Result<Option<InventoryEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("{INVENTORY_SELECT} WHERE file_id = ?1"),
                params![file_id],
                inventory_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_unhashed_inventory(&self, limit: usize) -> Result<Vec<InventoryEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{INVENTORY_SELECT} WHERE status = 'none' ORDER BY discovered_at LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], inventory_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_inventory_status(
        &self,
        file_id: &str,
        status: InventoryStatus,
        attempt_day: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE inventory SET status = ?2, last_attempt_day = ?3 WHERE file_id = ?1",
            params![file_id, status.as_str(), attempt_day],
        )?;
        Ok(())
    }

    /// Mark an inventory row as hashed with the given fingerprint.
    pub fn record_inventory_fingerprint(
        &self,
        file_id: &str,
        fingerprint: &Fingerprint,
        source: FingerprintSource,
        meta: Option<crate::fingerprint::CodecMeta>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE inventory SET
                status = 'known',
                fingerprint = ?2,
                source = ?3,
                sample_rate = ?4,
                channels = ?5,
                bit_depth = ?6,
                total_samples = ?7
            WHERE file_id = ?1
            "#,
            params![
                file_id,
                fingerprint.bytes,
                source.as_str(),
                meta.map(|m| m.sample_rate),
                meta.map(|m| m.channels),
                meta.map(|m| m.bits_per_sample),
                meta.map(|m| m.total_samples),
            ],
        )?;
        Ok(())
    }

    // ---- fingerprints ----------------------------------------------------

    pub fn lookup_fingerprint(&self, key: &str) -> Result<Option<FingerprintEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        lookup_fingerprint_conn(&conn, key)
    }

    /// Store or update a fingerprint. A fresh seq id is assigned if and only
    /// if the row is newly inserted or its fingerprint bytes changed.
    pub fn store_fingerprint(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        size: u64,
        meta_flags: u32,
        source: FingerprintSource,
    ) -> Result<StoreOutcome, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let outcome = store_fingerprint_tx(&tx, key, fingerprint, size, meta_flags, source, now_unix())?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Entries with seq id strictly greater than `since`, ascending.
    pub fn entries_since(&self, since: u64, limit: usize) -> Result<Vec<FingerprintEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT key, fingerprint, size, meta_flags, first_seen_at, last_updated_at,
                      seq_id, verified, conflicts
               FROM fingerprints WHERE seq_id > ?1 ORDER BY seq_id ASC LIMIT ?2"#,
        )?;
        let rows = stmt.query_map(params![since as i64, limit as i64], fingerprint_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply a gossip batch transactionally under the first-seen-wins
    /// policy. Remote seq ids are never stored; applied entries get fresh
    /// local ones.
    pub fn merge_from_gossip(&self, entries: &[DeltaEntry]) -> Result<MergeStats, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_unix();
        let mut stats = MergeStats::default();
        for entry in entries {
            let Some(fp) = Fingerprint::from_raw(&entry.fingerprint) else {
                stats.skipped += 1;
                continue;
            };
            match store_fingerprint_tx(
                &tx,
                &entry.key,
                &fp,
                entry.size,
                entry.meta_flags,
                FingerprintSource::PeerGossip,
                now,
            )? {
                StoreOutcome::Inserted(_) | StoreOutcome::Replaced(_) => stats.applied += 1,
                StoreOutcome::Unchanged => stats.unchanged += 1,
                StoreOutcome::ConflictKeptLocal => stats.conflicts += 1,
            }
        }
        tx.commit()?;
        Ok(stats)
    }

    pub fn latest_seq_id(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let value: i64 = conn.query_row(
            "SELECT value FROM counters WHERE name = ?1",
            params![SEQ_COUNTER],
            |row| row.get(0),
        )?;
        Ok(value as u64)
    }

    pub fn fingerprint_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    // ---- mesh peer state -------------------------------------------------

    pub fn peer_last_seq_seen(&self, peer: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let seq: Option<i64> = conn
            .query_row(
                "SELECT last_seq_seen FROM mesh_peer_state WHERE peer_id = ?1",
                params![peer],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }

    /// Advance the watermark for `peer`; never moves backwards.
    pub fn set_peer_last_seq_seen(&self, peer: &str, seq: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO mesh_peer_state (peer_id, last_seq_seen) VALUES (?1, ?2)
            ON CONFLICT(peer_id) DO UPDATE SET
                last_seq_seen = MAX(mesh_peer_state.last_seq_seen, excluded.last_seq_seen)
            "#,
            params![peer, seq as i64],
        )?;
        Ok(())
    }

    pub fn touch_mesh_sync(
        &self,
        peer: &str,
        now: i64,
        capabilities: Capabilities,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO mesh_peer_state (peer_id, last_sync_at, capabilities) VALUES (?1, ?2, ?3)
            ON CONFLICT(peer_id) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                capabilities = excluded.capabilities
            "#,
            params![peer, now, capabilities.bits()],
        )?;
        Ok(())
    }

    pub fn record_mesh_violation(&self, peer: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO mesh_peer_state (peer_id, violations) VALUES (?1, 1)
            ON CONFLICT(peer_id) DO UPDATE SET violations = mesh_peer_state.violations + 1
            "#,
            params![peer],
        )?;
        Ok(())
    }

    pub fn mesh_peer_states(&self) -> Result<Vec<MeshPeerState>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT peer_id, last_sync_at, last_seq_seen, capabilities, violations
               FROM mesh_peer_state ORDER BY peer_id"#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MeshPeerState {
                peer_id: row.get(0)?,
                last_sync_at: row.get(1)?,
                last_seq_seen: row.get::<_, i64>(2)? as u64,
                capabilities: Capabilities(row.get(3)?),
                violations: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- backfill accounting ---------------------------------------------

    /// Inventory rows eligible for a backfill probe: no fingerprint yet (or
    /// a failure from an earlier day), owner without a fingerprint DB of its
    /// own, owner under its daily probe budget.
    pub fn backfill_candidates(
        &self,
        limit: usize,
        today: i64,
        max_per_peer_per_day: u32,
    ) -> Result<Vec<InventoryEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            r#"
            {INVENTORY_SELECT}
            JOIN peers p ON p.id = inventory.peer_id
            WHERE (inventory.status = 'none'
                   OR (inventory.status = 'failed' AND inventory.last_attempt_day <> ?1))
              AND (p.capabilities & ?2) = 0
              AND (p.backfill_reset_day <> ?1 OR p.backfill_today < ?3)
            ORDER BY inventory.discovered_at
            LIMIT ?4
            "#
        ))?;
        let rows = stmt.query_map(
            params![
                today,
                Capabilities::HAS_FINGERPRINT_DB.bits(),
                max_per_peer_per_day,
                limit as i64
            ],
            inventory_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count one probe against the peer's daily budget, resetting the
    /// counter when the UTC day has rolled over.
    pub fn increment_backfill_count(&self, peer: &str, today: i64) -> Result<u32, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO peers (id, backfill_today, backfill_reset_day) VALUES (?1, 0, ?2)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![peer, today],
        )?;
        tx.execute(
            r#"
            UPDATE peers SET
                backfill_today = CASE WHEN backfill_reset_day = ?2 THEN backfill_today + 1 ELSE 1 END,
                backfill_reset_day = ?2
            WHERE id = ?1
            "#,
            params![peer, today],
        )?;
        let count: u32 = tx.query_row(
            "SELECT backfill_today FROM peers WHERE id = ?1",
            params![peer],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(count)
    }
}

const INVENTORY_SELECT: &str = r#"SELECT inventory.file_id, inventory.peer_id, inventory.path,
    inventory.size, inventory.discovered_at, inventory.status, inventory.fingerprint,
    inventory.source, inventory.sample_rate, inventory.channels, inventory.bit_depth,
    inventory.total_samples, inventory.last_attempt_day
    FROM inventory"#;

fn corrupt(idx: usize, what: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized {what}").into(),
    )
}

fn inventory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryEntry> {
    let status: String = row.get(5)?;
    let status = InventoryStatus::parse(&status).ok_or_else(|| corrupt(5, "inventory status"))?;
    let fingerprint: Option<Vec<u8>> = row.get(6)?;
    let fingerprint = match fingerprint {
        Some(bytes) => {
            Some(Fingerprint::from_raw(&bytes).ok_or_else(|| corrupt(6, "fingerprint length"))?)
        }
        None => None,
    };
    let source: Option<String> = row.get(7)?;
    let source = match source {
        Some(s) => Some(FingerprintSource::parse(&s).ok_or_else(|| corrupt(7, "source"))?),
        None => None,
    };
    Ok(InventoryEntry {
        file_id: row.get(0)?,
        peer_id: row.get(1)?,
        path: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        discovered_at: row.get(4)?,
        status,
        fingerprint,
        source,
        sample_rate: row.get(8)?,
        channels: row.get(9)?,
        bit_depth: row.get(10)?,
        total_samples: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        last_attempt_day: row.get(12)?,
    })
}

fn fingerprint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FingerprintEntry> {
    let bytes: Vec<u8> = row.get(1)?;
    let fingerprint =
        Fingerprint::from_raw(&bytes).ok_or_else(|| corrupt(1, "fingerprint length"))?;
    Ok(FingerprintEntry {
        key: row.get(0)?,
        fingerprint,
        size: row.get::<_, i64>(2)? as u64,
        meta_flags: row.get::<_, i64>(3)? as u32,
        first_seen_at: row.get(4)?,
        last_updated_at: row.get(5)?,
        seq_id: row.get::<_, i64>(6)? as u64,
        verified: row.get(7)?,
        conflicts: row.get(8)?,
    })
}

fn lookup_fingerprint_conn(
    conn: &Connection,
    key: &str,
) -> Result<Option<FingerprintEntry>, StoreError> {
    let row = conn
        .query_row(
            r#"SELECT key, fingerprint, size, meta_flags, first_seen_at, last_updated_at,
                      seq_id, verified, conflicts
               FROM fingerprints WHERE key = ?1"#,
            params![key],
            fingerprint_from_row,
        )
        .optional()?;
    Ok(row)
}

fn next_seq(tx: &Transaction<'_>) -> Result<u64, StoreError> {
    tx.execute(
        "UPDATE counters SET value = value + 1 WHERE name = ?1",
        params![SEQ_COUNTER],
    )?;
    let value: i64 = tx.query_row(
        "SELECT value FROM counters WHERE name = ?1",
        params![SEQ_COUNTER],
        |row| row.get(0),
    )?;
    Ok(value as u64)
}

fn store_fingerprint_tx(
    tx: &Transaction<'_>,
    key: &str,
    fingerprint: &Fingerprint,
    size: u64,
    meta_flags: u32,
    source: FingerprintSource,
    now: i64,
) -> Result<StoreOutcome, StoreError> {
    let verified = source.is_verified();
    let existing = tx
        .query_row(
            "SELECT fingerprint, verified FROM fingerprints WHERE key = ?1",
            params![key],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, bool>(1)?)),
        )
        .optional()?;

    match existing {
        None => {
            let seq = next_seq(tx)?;
            tx.execute(
                r#"
                INSERT INTO fingerprints (key, fingerprint, size, meta_flags, first_seen_at,
                                          last_updated_at, seq_id, verified)
                VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)
                "#,
                params![key, fingerprint.bytes, size as i64, meta_flags, now, seq as i64, verified],
            )?;
            Ok(StoreOutcome::Inserted(seq))
        }
        Some((local_bytes, _)) if local_bytes == fingerprint.bytes => {
            // Idempotent; a verified sighting upgrades an unverified row.
            tx.execute(
                "UPDATE fingerprints SET last_updated_at = ?2, verified = MAX(verified, ?3) WHERE key = ?1",
                params![key, now, verified],
            )?;
            Ok(StoreOutcome::Unchanged)
        }
        Some((_, local_verified)) => {
            if !local_verified && verified {
                // The unverified hearsay row loses to a value this node
                // actually computed.
                let seq = next_seq(tx)?;
                tx.execute(
                    r#"
                    UPDATE fingerprints SET fingerprint = ?2, size = ?3, meta_flags = ?4,
                        last_updated_at = ?5, seq_id = ?6, verified = 1
                    WHERE key = ?1
                    "#,
                    params![key, fingerprint.bytes, size as i64, meta_flags, now, seq as i64],
                )?;
                Ok(StoreOutcome::Replaced(seq))
            } else {
                // First seen wins; remember that someone disagreed.
                tx.execute(
                    "UPDATE fingerprints SET conflicts = conflicts + 1 WHERE key = ?1",
                    params![key],
                )?;
                Ok(StoreOutcome::ConflictKeptLocal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintKind;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::new(FingerprintKind::FlacStreamInfoMd5, vec![byte; 16])
    }

    fn delta(seq: u64, key: &str, byte: u8) -> DeltaEntry {
        DeltaEntry {
            seq,
            key: key.to_string(),
            fingerprint: vec![byte; 16],
            size: 1000,
            meta_flags: 0,
        }
    }

    #[test]
    fn test_seq_ids_strictly_increase() {
        let db = HashDb::open_in_memory().unwrap();
        assert_eq!(db.latest_seq_id().unwrap(), 0);

        let mut last = 0;
        for i in 0..10u8 {
            let outcome = db
                .store_fingerprint(&format!("key{i}"), &fp(i), 100, 0, FingerprintSource::LocalScan)
                .unwrap();
            let StoreOutcome::Inserted(seq) = outcome else {
                panic!("expected insert");
            };
            assert!(seq > last);
            last = seq;
        }
        assert_eq!(db.latest_seq_id().unwrap(), last);
    }

    #[test]
    fn test_unchanged_fingerprint_keeps_seq() {
        let db = HashDb::open_in_memory().unwrap();
        db.store_fingerprint("k", &fp(1), 100, 0, FingerprintSource::Download)
            .unwrap();
        let seq_before = db.lookup_fingerprint("k").unwrap().unwrap().seq_id;

        let outcome = db
            .store_fingerprint("k", &fp(1), 100, 0, FingerprintSource::Download)
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Unchanged);
        assert_eq!(db.lookup_fingerprint("k").unwrap().unwrap().seq_id, seq_before);
        assert_eq!(db.latest_seq_id().unwrap(), seq_before);
    }

    #[test]
    fn test_first_seen_wins_between_verified_values() {
        let db = HashDb::open_in_memory().unwrap();
        db.store_fingerprint("k", &fp(1), 100, 0, FingerprintSource::Download)
            .unwrap();
        let outcome = db
            .store_fingerprint("k", &fp(2), 100, 0, FingerprintSource::BackfillProbe)
            .unwrap();
        assert_eq!(outcome, StoreOutcome::ConflictKeptLocal);

        let entry = db.lookup_fingerprint("k").unwrap().unwrap();
        assert_eq!(entry.fingerprint, fp(1));
        assert_eq!(entry.conflicts, 1);
    }

    #[test]
    fn test_verified_replaces_unverified() {
        let db = HashDb::open_in_memory().unwrap();
        db.merge_from_gossip(&[delta(5, "k", 1)]).unwrap();
        let before = db.lookup_fingerprint("k").unwrap().unwrap();
        assert!(!before.verified);

        let outcome = db
            .store_fingerprint("k", &fp(2), 1000, 0, FingerprintSource::BackfillProbe)
            .unwrap();
        let StoreOutcome::Replaced(seq) = outcome else {
            panic!("expected replace");
        };
        let after = db.lookup_fingerprint("k").unwrap().unwrap();
        assert!(after.verified);
        assert_eq!(after.fingerprint, fp(2));
        assert!(seq > before.seq_id);
    }

    #[test]
    fn test_gossip_merge_assigns_local_seqs() {
        let db = HashDb::open_in_memory().unwrap();
        // Remote seqs start high; local ones must not adopt them.
        let stats = db
            .merge_from_gossip(&[delta(900, "a", 1), delta(901, "b", 2)])
            .unwrap();
        assert_eq!(stats.applied, 2);

        let a = db.lookup_fingerprint("a").unwrap().unwrap();
        let b = db.lookup_fingerprint("b").unwrap().unwrap();
        assert_eq!(a.seq_id, 1);
        assert_eq!(b.seq_id, 2);
        assert_eq!(db.latest_seq_id().unwrap(), 2);
    }

    #[test]
    fn test_gossip_merge_idempotent_and_conflicting() {
        let db = HashDb::open_in_memory().unwrap();
        db.merge_from_gossip(&[delta(1, "a", 1)]).unwrap();

        let stats = db
            .merge_from_gossip(&[delta(2, "a", 1), delta(3, "a", 9)])
            .unwrap();
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.conflicts, 1);

        // Gossip never overwrites gossip with a differing value
        assert_eq!(db.lookup_fingerprint("a").unwrap().unwrap().fingerprint, fp(1));
    }

    #[test]
    fn test_gossip_merge_skips_bad_fingerprint_lengths() {
        let db = HashDb::open_in_memory().unwrap();
        let bad = DeltaEntry {
            seq: 1,
            key: "x".into(),
            fingerprint: vec![0; 7],
            size: 1,
            meta_flags: 0,
        };
        let stats = db.merge_from_gossip(&[bad]).unwrap();
        assert_eq!(stats.skipped, 1);
        assert!(db.lookup_fingerprint("x").unwrap().is_none());
    }

    #[test]
    fn test_entries_since_ordered_and_bounded() {
        let db = HashDb::open_in_memory().unwrap();
        for i in 0..20u8 {
            db.store_fingerprint(&format!("k{i}"), &fp(i), 10, 0, FingerprintSource::LocalScan)
                .unwrap();
        }
        let batch = db.entries_since(5, 7).unwrap();
        assert_eq!(batch.len(), 7);
        let seqs: Vec<u64> = batch.iter().map(|e| e.seq_id).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let db = HashDb::open_in_memory().unwrap();
        assert_eq!(db.peer_last_seq_seen("p").unwrap(), 0);
        db.set_peer_last_seq_seen("p", 9000).unwrap();
        db.set_peer_last_seq_seen("p", 8000).unwrap();
        assert_eq!(db.peer_last_seq_seen("p").unwrap(), 9000);
        db.set_peer_last_seq_seen("p", 10_000).unwrap();
        assert_eq!(db.peer_last_seq_seen("p").unwrap(), 10_000);
    }

    #[test]
    fn test_backfill_counter_resets_across_days() {
        let db = HashDb::open_in_memory().unwrap();
        for _ in 0..3 {
            db.increment_backfill_count("p", 100).unwrap();
        }
        assert_eq!(db.get_peer("p").unwrap().unwrap().backfill_today, 3);

        // New day: counter restarts
        let count = db.increment_backfill_count("p", 101).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_backfill_candidates_filtering() {
        let db = HashDb::open_in_memory().unwrap();
        let today = 200;

        // Peer over budget
        let mut over = PeerRecord::new("over", 0);
        over.backfill_today = 10;
        over.backfill_reset_day = today;
        db.upsert_peer(&over).unwrap();
        // Peer with its own fingerprint DB: gossip handles it
        let mut meshy = PeerRecord::new("meshy", 0);
        meshy.capabilities = Capabilities::HAS_FINGERPRINT_DB;
        db.upsert_peer(&meshy).unwrap();
        // Eligible peer
        db.upsert_peer(&PeerRecord::new("ok", 0)).unwrap();
        // Budget spent yesterday: eligible again today
        let mut stale = PeerRecord::new("stale", 0);
        stale.backfill_today = 10;
        stale.backfill_reset_day = today - 1;
        db.upsert_peer(&stale).unwrap();

        for peer in ["over", "meshy", "ok", "stale"] {
            db.record_sighting(&InventoryEntry::sighted(peer, "a.flac", 10, 0))
                .unwrap();
        }

        let candidates = db.backfill_candidates(10, today, 10).unwrap();
        let mut owners: Vec<&str> = candidates.iter().map(|c| c.peer_id.as_str()).collect();
        owners.sort_unstable();
        assert_eq!(owners, vec!["ok", "stale"]);
    }

    #[test]
    fn test_failed_rows_suppressed_same_day() {
        let db = HashDb::open_in_memory().unwrap();
        let today = 300;
        db.upsert_peer(&PeerRecord::new("p", 0)).unwrap();
        let entry = InventoryEntry::sighted("p", "a.flac", 10, 0);
        db.record_sighting(&entry).unwrap();

        db.set_inventory_status(&entry.file_id, InventoryStatus::Failed, today)
            .unwrap();
        assert!(db.backfill_candidates(10, today, 10).unwrap().is_empty());

        // Next day the row is retryable
        assert_eq!(db.backfill_candidates(10, today + 1, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_inventory_roundtrip_with_fingerprint() {
        let db = HashDb::open_in_memory().unwrap();
        db.touch_peer("p", 5).unwrap();
        let entry = InventoryEntry::sighted("p", "music/07 song.flac", 12345, 5);
        db.record_sighting(&entry).unwrap();

        db.record_inventory_fingerprint(
            &entry.file_id,
            &fp(7),
            FingerprintSource::BackfillProbe,
            Some(crate::fingerprint::CodecMeta {
                sample_rate: 44_100,
                channels: 2,
                bits_per_sample: 16,
                total_samples: 999,
            }),
        )
        .unwrap();

        let loaded = db.get_inventory(&entry.file_id).unwrap().unwrap();
        assert_eq!(loaded.status, InventoryStatus::Known);
        assert_eq!(loaded.fingerprint, Some(fp(7)));
        assert_eq!(loaded.source, Some(FingerprintSource::BackfillProbe));
        assert_eq!(loaded.sample_rate, Some(44_100));
        assert_eq!(loaded.total_samples, Some(999));
    }

    #[test]
    fn test_prune_unseen_peers() {
        let db = HashDb::open_in_memory().unwrap();
        db.touch_peer("old", 10).unwrap();
        db.touch_peer("fresh", 1000).unwrap();
        db.record_sighting(&InventoryEntry::sighted("old", "a.mp3", 1, 10))
            .unwrap();

        let pruned = db.prune_peers_unseen_since(500).unwrap();
        assert_eq!(pruned, 1);
        assert!(db.get_peer("old").unwrap().is_none());
        assert!(db.get_peer("fresh").unwrap().is_some());
        assert!(db.list_unhashed_inventory(10).unwrap().is_empty());
    }

    #[test]
    fn test_utc_day() {
        assert_eq!(utc_day(0), 0);
        assert_eq!(utc_day(86_399), 0);
        assert_eq!(utc_day(86_400), 1);
    }
}
