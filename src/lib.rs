//! hashmesh
//!
//! Multi-source swarm downloads and an epidemic content-hash mesh for a
//! peer-to-peer file-sharing client. The crate is pure library: the host
//! supplies the transport ([`transfer::TransferClient`]) and the framed
//! secure links between mesh neighbors ([`mesh::MeshLink`]); the core
//! verifies candidate copies, pulls disjoint byte ranges in parallel, and
//! gossips compact fingerprints so nodes can answer "is peer P's copy of
//! file F canonical?" without probe downloads.
//!
//! ## Host responsibilities
//!
//! - **Transport**: searches, full-file transfers with a start offset, and
//!   peer attributes come from the injected `TransferClient`. The core
//!   never opens sockets.
//! - **Mesh links**: the rendezvous/bootstrap layer discovers neighbors,
//!   dials, authenticates, and hands each framed connection to
//!   [`core::Core::connect_mesh_peer`].
//! - **Activity signal**: call [`core::Core::note_transfer_activity`] when
//!   the user starts transfers so backfill probing stays out of the way.

pub mod api;
pub mod backfill;
pub mod chunks;
pub mod config;
pub mod core;
pub mod fingerprint;
pub mod hashdb;
pub mod key;
pub mod mesh;
pub mod metrics;
pub mod swarm;
pub mod transfer;
pub mod verify;
pub mod wire;

pub use crate::core::{Core, CoreError};
pub use config::Config;
pub use fingerprint::{Fingerprint, FingerprintKind};
pub use hashdb::HashDb;
pub use mesh::{MeshLink, MeshService};
pub use metrics::Metrics;
pub use swarm::{JobState, JobStatus, MultiSourceDownloadRequest, SourcePeer, SwarmError};
pub use transfer::{TransferClient, TransferError};
pub use verify::{Candidate, VerificationReport};
