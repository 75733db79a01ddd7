//! Configuration for the swarm downloader, mesh sync, and backfill services
//!
//! All keys are optional in the TOML file; defaults match the documented
//! operating values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub swarm: SwarmConfig,
    pub mesh: MeshConfig,
    pub backfill: BackfillConfig,
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Requested chunk size in bytes; the planner may raise the effective
    /// size so chunks stay comfortably more numerous than workers.
    pub default_chunk_size: u64,
    /// Below this many bytes per second a worker counts as slow.
    pub min_worker_bps: u64,
    /// Contiguous seconds of slowness before a worker cycles its peer.
    pub slow_window_seconds: u64,
    /// Consecutive chunk failures tolerated before a worker exits.
    pub max_consecutive_failures: u32,
    /// Additional proven-source rounds after the initial pass.
    pub max_retry_rounds: u32,
    /// Global bound on concurrent proven-source retry workers.
    pub retry_semaphore: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 1024 * 1024,
            min_worker_bps: 5 * 1024,
            slow_window_seconds: 15,
            max_consecutive_failures: 3,
            max_retry_rounds: 3,
            retry_semaphore: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Minimum seconds between full syncs with the same neighbor.
    pub sync_interval_seconds: u64,
    /// Entry cap per PUSH_DELTA batch.
    pub max_entries_per_sync: u32,
    /// New sync sessions allowed per interval window.
    pub max_peers_per_cycle: u32,
    /// REQ_DELTA/PUSH_DELTA exchanges allowed within one session.
    pub max_pair_batches: u32,
    /// Seconds to wait for a response frame before the single retry.
    pub request_timeout_seconds: u64,
    /// Seconds a session lingers serving requests after its own pull.
    pub linger_seconds: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            sync_interval_seconds: 30 * 60,
            max_entries_per_sync: 1000,
            max_peers_per_cycle: 5,
            max_pair_batches: 10,
            request_timeout_seconds: 30,
            linger_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Seconds between scheduler cycles.
    pub interval_seconds: u64,
    /// Global cap on concurrently running backfill probes.
    pub max_concurrent: usize,
    /// Probes allowed against one peer per UTC day.
    pub max_per_peer_per_day: u32,
    /// Required seconds of user-transfer idleness before probing.
    pub min_idle_seconds: u64,
    /// Inventory candidates considered per cycle.
    pub candidates_per_cycle: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10 * 60,
            max_concurrent: 2,
            max_per_peer_per_day: 10,
            min_idle_seconds: 300,
            candidates_per_cycle: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Per-probe timeout in milliseconds.
    pub probe_timeout_ms: u64,
    /// Prefix length hashed for non-FLAC files.
    pub non_flac_prefix_bytes: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 10_000,
            non_flac_prefix_bytes: 32 * 1024,
        }
    }
}

impl Config {
    /// Load config from a TOML file; missing keys fall back to defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.swarm.default_chunk_size == 0 {
            return Err(ConfigError::Invalid("swarm.default_chunk_size must be > 0".into()));
        }
        if self.swarm.retry_semaphore == 0 {
            return Err(ConfigError::Invalid("swarm.retry_semaphore must be > 0".into()));
        }
        if self.mesh.max_entries_per_sync == 0 {
            return Err(ConfigError::Invalid("mesh.max_entries_per_sync must be > 0".into()));
        }
        if self.verification.non_flac_prefix_bytes == 0 {
            return Err(ConfigError::Invalid(
                "verification.non_flac_prefix_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}
