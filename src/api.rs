//! REST façade over the core
//!
//! A thin JSON adapter the host can mount under its own server. No auth,
//! no policy: 200 on success, 400 on validation problems, 500 otherwise.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tower_http::trace::TraceLayer;

use crate::core::{Core, CoreError};
use crate::fingerprint::Fingerprint;
use crate::swarm::{JobStatus, MultiSourceDownloadRequest, SourcePeer, SwarmError};
use crate::verify::{VerificationReport, VerifyError};

/// API state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    core: Core,
}

/// Build the router for the core's REST surface.
pub fn router(core: Core) -> Router {
    Router::new()
        .route("/multisource/downloads", post(start_download))
        .route("/multisource/downloads/:id", get(download_status))
        .route("/multisource/downloads/:id/cancel", post(cancel_download))
        .route("/multisource/sources", get(find_sources))
        .route("/hashdb/fingerprints/:key", get(lookup_fingerprint))
        .route("/mesh/stats", get(mesh_stats))
        .route("/mesh/sync/:peer", post(trigger_mesh_sync))
        .route("/backfill/stats", get(backfill_stats))
        .route("/backfill/run", post(run_backfill))
        .with_state(ApiState { core })
        .layer(TraceLayer::new_for_http())
}

#[derive(Deserialize)]
pub struct StartDownloadBody {
    pub filename: String,
    pub size: u64,
    pub output_path: PathBuf,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    /// Hex fingerprint the assembled file must match.
    #[serde(default)]
    pub expected_fingerprint: Option<String>,
    /// Pre-verified sources; empty means search-and-verify first.
    #[serde(default)]
    pub sources: Vec<SourceBody>,
}

#[derive(Deserialize)]
pub struct SourceBody {
    pub peer: String,
    pub path: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SourcesResponse {
    pub groups: Vec<GroupDto>,
    pub failures: Vec<FailureDto>,
}

#[derive(Serialize)]
pub struct GroupDto {
    pub fingerprint: String,
    pub sources: Vec<SourceDto>,
}

#[derive(Serialize)]
pub struct SourceDto {
    pub peer: String,
    pub path: String,
    pub latency_ms: u64,
    pub cached: bool,
}

#[derive(Serialize)]
pub struct FailureDto {
    pub peer: String,
    pub reason: String,
}

#[derive(Serialize)]
pub struct FingerprintDto {
    pub key: String,
    pub fingerprint: String,
    pub size: u64,
    pub meta_flags: u32,
    pub seq_id: u64,
    pub verified: bool,
    pub conflicts: u32,
    pub first_seen_at: i64,
    pub last_updated_at: i64,
}

#[derive(Serialize)]
pub struct LookupResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<FingerprintDto>,
}

#[derive(Deserialize)]
pub struct SourcesQuery {
    pub filename: String,
    pub size: u64,
}

async fn start_download(
    State(state): State<ApiState>,
    Json(body): Json<StartDownloadBody>,
) -> Result<Json<JobStatus>, ApiError> {
    if body.filename.is_empty() {
        return Err(ApiError::BadRequest("filename must not be empty".into()));
    }
    if body.size == 0 {
        return Err(ApiError::BadRequest("size must be positive".into()));
    }
    let expected_fingerprint = body
        .expected_fingerprint
        .as_deref()
        .map(parse_fingerprint)
        .transpose()?;

    let request = MultiSourceDownloadRequest {
        filename: body.filename,
        size: body.size,
        expected_fingerprint,
        sources: body
            .sources
            .into_iter()
            .map(|s| SourcePeer {
                peer: s.peer,
                path: s.path,
            })
            .collect(),
        chunk_size: body.chunk_size,
        output_path: body.output_path,
    };
    Ok(Json(state.core.start_swarm(request).await?))
}

async fn download_status(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<Json<JobStatus>, ApiError> {
    Ok(Json(state.core.job_status(id)?))
}

async fn cancel_download(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    state.core.cancel_job(id)?;
    Ok(StatusCode::OK)
}

async fn find_sources(
    State(state): State<ApiState>,
    Query(query): Query<SourcesQuery>,
) -> Result<Json<SourcesResponse>, ApiError> {
    if query.filename.is_empty() {
        return Err(ApiError::BadRequest("filename must not be empty".into()));
    }
    let report = state
        .core
        .find_verified_sources(&query.filename, query.size)
        .await?;
    Ok(Json(report_to_dto(&report)))
}

async fn lookup_fingerprint(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<Json<LookupResponse>, ApiError> {
    let entry = state.core.lookup_fingerprint(&key)?;
    Ok(Json(LookupResponse {
        found: entry.is_some(),
        entry: entry.map(|e| FingerprintDto {
            key: e.key,
            fingerprint: e.fingerprint.to_hex(),
            size: e.size,
            meta_flags: e.meta_flags,
            seq_id: e.seq_id,
            verified: e.verified,
            conflicts: e.conflicts,
            first_seen_at: e.first_seen_at,
            last_updated_at: e.last_updated_at,
        }),
    }))
}

async fn mesh_stats(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let stats = state.core.mesh_stats()?;
    Ok(Json(stats).into_response())
}

async fn trigger_mesh_sync(
    State(state): State<ApiState>,
    Path(peer): Path<String>,
) -> Result<StatusCode, ApiError> {
    if peer.is_empty() {
        return Err(ApiError::BadRequest("peer must not be empty".into()));
    }
    state.core.trigger_mesh_sync(&peer);
    Ok(StatusCode::OK)
}

async fn backfill_stats(State(state): State<ApiState>) -> Response {
    Json(state.core.backfill_stats()).into_response()
}

async fn run_backfill(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let report = state.core.trigger_backfill_cycle().await?;
    Ok(Json(report).into_response())
}

fn parse_fingerprint(hex_str: &str) -> Result<Fingerprint, ApiError> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| ApiError::BadRequest("expected_fingerprint is not valid hex".into()))?;
    Fingerprint::from_raw(&bytes).ok_or_else(|| {
        ApiError::BadRequest("expected_fingerprint must be 16 or 32 bytes".into())
    })
}

fn report_to_dto(report: &VerificationReport) -> SourcesResponse {
    SourcesResponse {
        groups: report
            .groups
            .iter()
            .map(|g| GroupDto {
                fingerprint: g.fingerprint.to_hex(),
                sources: g
                    .sources
                    .iter()
                    .map(|s| SourceDto {
                        peer: s.peer.clone(),
                        path: s.path.clone(),
                        latency_ms: s.latency.as_millis() as u64,
                        cached: s.cached,
                    })
                    .collect(),
            })
            .collect(),
        failures: report
            .failures
            .iter()
            .map(|(peer, reason)| FailureDto {
                peer: peer.clone(),
                reason: reason.to_string(),
            })
            .collect(),
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownJob(_)
            | CoreError::Swarm(SwarmError::NoVerifiedSources)
            | CoreError::Verify(VerifyError::FileTooSmallForVerification { .. }) => {
                ApiError::BadRequest(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(error) => (StatusCode::BAD_REQUEST, error),
            ApiError::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, error),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}
