//! Request orchestration
//!
//! The orchestrator is the entry point behind the HTTP surface. One call to
//! [`Orchestrator::evaluate`] runs the whole pipeline:
//!
//! 1. split the `cid` field into the ordered CID list and the optional
//!    addendum value;
//! 2. acquire a scratch directory; per CID: fetch → extract → resolve;
//! 3. compose the deliberation job and normalize attachments;
//! 4. deliberate; upload the justification artifact;
//! 5. answer either with the revealed result or, in commit mode, with only
//!    the 16-byte commitment hash.
//!
//! The overall deadline wraps ingestion, deliberation, synthesis, and the
//! upload; expiry returns `REQUEST_TIMEOUT` with an empty score array and no
//! commitment. The scratch directory is a `TempDir` owned by the pipeline
//! future, so every exit path (success, error, deadline, panic) removes it.
//!
//! This module also owns the closed error taxonomy shared with the HTTP
//! surface; module errors convert into it with their kind and detail intact.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::archive::{self, ArchiveError};
use crate::attach::{self, AttachError};
use crate::caps::CapabilityMatrix;
use crate::commit::{commit_hash, CommitError, CommitStore, DEFAULT_COMMIT_TTL};
use crate::compose::{self, ComposeError};
use crate::jury::{JuryEngine, JuryError, JuryResult};
use crate::manifest::{ManifestError, ManifestResolver, ResolvedManifest};
use crate::store::{StoreClient, StoreError};

/// Default overall request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(240);

// ============================================================================
// Error taxonomy
// ============================================================================

/// The closed set of externally visible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed request envelope or CID list.
    InvalidRequest,
    /// Multi-CID count mismatch against the primary's `bCIDs`.
    CompositionMismatch,
    /// Manifest missing, unparseable, or structurally invalid.
    InvalidManifest,
    /// Primary query missing or empty.
    InvalidQuery,
    /// All content-store gateways exhausted (or pinning failed).
    ContentStoreUnavailable,
    /// Attachment exceeds its size limit.
    AttachmentTooLarge,
    /// Attachment content could not be interpreted.
    AttachmentUnreadable,
    /// Provider rejected credentials.
    ProviderAuth,
    /// Provider rejected the request as malformed.
    ProviderInvalidInput,
    /// Jury quorum not reached.
    InsufficientModels,
    /// Overall request deadline exceeded.
    RequestTimeout,
    /// Reveal for an absent or purged commitment.
    CommitNotFound,
    /// Anything else; logged with the correlation id.
    Internal,
}

impl ErrorKind {
    /// HTTP status carried by responses of this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidRequest
            | ErrorKind::CompositionMismatch
            | ErrorKind::InsufficientModels => 400,
            ErrorKind::CommitNotFound => 404,
            ErrorKind::RequestTimeout => 408,
            ErrorKind::AttachmentTooLarge => 413,
            ErrorKind::InvalidManifest
            | ErrorKind::InvalidQuery
            | ErrorKind::AttachmentUnreadable
            | ErrorKind::ProviderInvalidInput => 422,
            ErrorKind::ContentStoreUnavailable | ErrorKind::ProviderAuth => 502,
            ErrorKind::Internal => 500,
        }
    }
}

/// A kind-tagged error as surfaced to callers.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ArbiterError {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Short human-readable message.
    pub message: String,
    /// Optional structured detail (e.g. per-slot failures).
    pub detail: Option<serde_json::Value>,
}

impl ArbiterError {
    /// Build an error with no structured detail.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach structured detail.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl From<StoreError> for ArbiterError {
    fn from(e: StoreError) -> Self {
        ArbiterError::new(ErrorKind::ContentStoreUnavailable, e.to_string())
    }
}

impl From<ArchiveError> for ArbiterError {
    fn from(e: ArchiveError) -> Self {
        ArbiterError::new(ErrorKind::InvalidManifest, format!("archive: {e}"))
    }
}

impl From<ManifestError> for ArbiterError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Invalid(_) => ArbiterError::new(ErrorKind::InvalidManifest, e.to_string()),
            ManifestError::Query(_) => ArbiterError::new(ErrorKind::InvalidQuery, e.to_string()),
            ManifestError::Store(inner) => inner.into(),
            ManifestError::Archive(inner) => inner.into(),
            ManifestError::Io(_) => ArbiterError::new(ErrorKind::Internal, e.to_string()),
        }
    }
}

impl From<ComposeError> for ArbiterError {
    fn from(e: ComposeError) -> Self {
        match e {
            ComposeError::NoInputs => ArbiterError::new(ErrorKind::InvalidRequest, e.to_string()),
            ComposeError::Mismatch { .. } => {
                ArbiterError::new(ErrorKind::CompositionMismatch, e.to_string())
            }
        }
    }
}

impl From<AttachError> for ArbiterError {
    fn from(e: AttachError) -> Self {
        match e {
            AttachError::TooLarge { .. } => {
                ArbiterError::new(ErrorKind::AttachmentTooLarge, e.to_string())
            }
            AttachError::Unreadable { .. } => {
                ArbiterError::new(ErrorKind::AttachmentUnreadable, e.to_string())
            }
            AttachError::Io(_) => ArbiterError::new(ErrorKind::Internal, e.to_string()),
        }
    }
}

impl From<JuryError> for ArbiterError {
    fn from(e: JuryError) -> Self {
        match &e {
            JuryError::InsufficientModels { failures, .. } => {
                let detail = json!({
                    "failures": failures
                        .iter()
                        .map(|f| json!({ "slot": f.slot, "reason": f.reason }))
                        .collect::<Vec<_>>()
                });
                ArbiterError::new(ErrorKind::InsufficientModels, e.to_string()).with_detail(detail)
            }
            JuryError::EmptyJury => ArbiterError::new(ErrorKind::Internal, e.to_string()),
        }
    }
}

impl From<CommitError> for ArbiterError {
    fn from(e: CommitError) -> Self {
        ArbiterError::new(ErrorKind::Internal, e.to_string())
    }
}

// ============================================================================
// Request / response envelope
// ============================================================================

/// Commit/reveal selector on the request envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Mode {
    /// Bare `"commit"` string.
    Named(NamedMode),
    /// `{"reveal": "<hex16>"}` object.
    Reveal {
        /// Commitment hash to disclose.
        reveal: String,
    },
}

/// The string-named modes.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedMode {
    /// Commit: return only the hash, stage the payload for reveal.
    Commit,
}

/// Inner `data` object of a request.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestData {
    /// `"cid1[,cid2…][:addendum]"`.
    pub cid: String,
}

/// An `/evaluate` request.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateRequest {
    /// Opaque correlation id (the aggregation identifier).
    pub id: String,
    /// Request data.
    pub data: RequestData,
    /// Optional commit/reveal mode.
    #[serde(default)]
    pub mode: Option<Mode>,
}

/// Inner `data` object of a response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    /// Aggregate score vector (empty on errors).
    #[serde(rename = "aggregatedScore")]
    pub aggregated_score: Vec<u64>,
    /// CID of the uploaded justification artifact.
    #[serde(rename = "justificationCID", skip_serializing_if = "Option::is_none")]
    pub justification_cid: Option<String>,
    /// Commitment hash (commit mode only).
    #[serde(rename = "commitHash", skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

/// Error body of a response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Short message.
    pub message: String,
    /// Structured detail where available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// An `/evaluate` response, success or error.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluateResponse {
    /// Correlation id echoed back.
    #[serde(rename = "jobRunID")]
    pub job_run_id: String,
    /// HTTP-style status code, duplicated in the body for the oracle node.
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// `success`, `committed`, or `errored`.
    pub status: String,
    /// Result data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    /// Error body when `status == "errored"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl EvaluateResponse {
    fn success(id: &str, scores: Vec<u64>, justification_cid: String) -> Self {
        Self {
            job_run_id: id.to_string(),
            status_code: 200,
            status: "success".into(),
            data: Some(ResponseData {
                aggregated_score: scores,
                justification_cid: Some(justification_cid),
                commit_hash: None,
            }),
            error: None,
        }
    }

    fn committed(id: &str, hash: String) -> Self {
        Self {
            job_run_id: id.to_string(),
            status_code: 200,
            status: "committed".into(),
            data: Some(ResponseData {
                aggregated_score: Vec::new(),
                justification_cid: None,
                commit_hash: Some(hash),
            }),
            error: None,
        }
    }

    /// Error envelope for a failed request; used by the HTTP surface for
    /// envelope-level rejections as well.
    pub fn errored(id: &str, e: ArbiterError) -> Self {
        Self {
            job_run_id: id.to_string(),
            status_code: e.kind.http_status(),
            status: "errored".into(),
            data: Some(ResponseData::default()),
            error: Some(ErrorBody {
                kind: e.kind,
                message: e.message,
                detail: e.detail,
            }),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Orchestrator configuration; read-only after startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Overall per-request deadline.
    pub request_timeout: Duration,
    /// Root under which per-request scratch directories are created;
    /// `None` uses the system temp directory.
    pub scratch_root: Option<PathBuf>,
    /// Commitment lifetime used by the purge schedule.
    pub commit_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            scratch_root: None,
            commit_ttl: DEFAULT_COMMIT_TTL,
        }
    }
}

/// The request pipeline: ingestion, deliberation, publication, commit
/// routing. Cheap to clone and share across handlers.
#[derive(Clone)]
pub struct Orchestrator {
    store: StoreClient,
    engine: JuryEngine,
    matrix: Arc<CapabilityMatrix>,
    commits: Arc<CommitStore>,
    cfg: OrchestratorConfig,
}

impl Orchestrator {
    /// Assemble the pipeline from its collaborators.
    pub fn new(
        store: StoreClient,
        engine: JuryEngine,
        matrix: Arc<CapabilityMatrix>,
        commits: Arc<CommitStore>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            engine,
            matrix,
            commits,
            cfg,
        }
    }

    /// Handle one request end to end. Never panics outward; every failure
    /// becomes an `errored` response with its taxonomy kind.
    pub async fn evaluate(&self, req: EvaluateRequest) -> EvaluateResponse {
        let id = req.id.clone();
        match self.run(req).await {
            Ok(resp) => resp,
            Err(e) => {
                if e.kind == ErrorKind::Internal {
                    error!(job_run_id = %id, error = %e, "request failed internally");
                } else {
                    warn!(job_run_id = %id, kind = ?e.kind, error = %e, "request failed");
                }
                EvaluateResponse::errored(&id, e)
            }
        }
    }

    async fn run(&self, req: EvaluateRequest) -> Result<EvaluateResponse, ArbiterError> {
        if let Some(Mode::Reveal { reveal }) = &req.mode {
            return self.reveal(&req.id, reveal);
        }

        let commit_requested = matches!(req.mode, Some(Mode::Named(NamedMode::Commit)));
        let (result, justification_cid) = tokio::time::timeout(
            self.cfg.request_timeout,
            self.pipeline(&req.id, &req.data.cid),
        )
        .await
        .map_err(|_| {
            ArbiterError::new(
                ErrorKind::RequestTimeout,
                format!("request exceeded {:?}", self.cfg.request_timeout),
            )
        })??;

        let scores: Vec<u64> = result.scores.iter().map(|s| s.score).collect();
        if commit_requested {
            let payload = serde_json::to_value(ResponseData {
                aggregated_score: scores,
                justification_cid: Some(justification_cid),
                commit_hash: None,
            })
            .map_err(|e| ArbiterError::new(ErrorKind::Internal, e.to_string()))?;
            let hash = commit_hash(&payload);
            self.commits.save(&hash, payload)?;
            info!(job_run_id = %req.id, hash = %hash, "committed verdict");
            return Ok(EvaluateResponse::committed(&req.id, hash));
        }

        Ok(EvaluateResponse::success(&req.id, scores, justification_cid))
    }

    /// Reveal path: disclose and consume a prior commitment.
    fn reveal(&self, id: &str, hash: &str) -> Result<EvaluateResponse, ArbiterError> {
        let entry = self
            .commits
            .get(hash)?
            .ok_or_else(|| ArbiterError::new(ErrorKind::CommitNotFound, format!("no commitment {hash}")))?;
        let data: ResponseData = serde_json::from_value(entry.payload)
            .map_err(|e| ArbiterError::new(ErrorKind::Internal, e.to_string()))?;
        self.commits.delete(hash)?;
        info!(job_run_id = %id, hash = %hash, "revealed verdict");
        Ok(EvaluateResponse {
            job_run_id: id.to_string(),
            status_code: 200,
            status: "success".into(),
            data: Some(data),
            error: None,
        })
    }

    /// Ingestion + deliberation + publication. The scratch `TempDir` lives
    /// on this future's stack: dropping the future (deadline, cancellation)
    /// or leaving by any path removes the tree.
    async fn pipeline(
        &self,
        id: &str,
        cid_field: &str,
    ) -> Result<(JuryResult, String), ArbiterError> {
        let (cids, addendum) = split_cid_field(cid_field)?;
        info!(job_run_id = %id, cids = cids.len(), addendum = addendum.is_some(), "starting deliberation");

        let scratch = match &self.cfg.scratch_root {
            Some(root) => tempfile::Builder::new().prefix("verdikta_").tempdir_in(root),
            None => tempfile::Builder::new().prefix("verdikta_").tempdir(),
        }
        .map_err(|e| ArbiterError::new(ErrorKind::Internal, format!("scratch: {e}")))?;

        let resolver = ManifestResolver::new(&self.store, scratch.path());
        let mut resolved: Vec<ResolvedManifest> = Vec::with_capacity(cids.len());
        for cid in &cids {
            let bytes = self.store.fetch(cid).await?;
            let root = archive::extract(bytes, scratch.path(), cid).await?;
            resolved.push(resolver.resolve(&root).await?);
        }

        let mut job = compose::compose(&resolved, addendum.as_deref())?;
        let processed = attach::process(&resolved, &job.jury[0], &self.matrix).await?;
        for skip in &processed.skipped {
            warn!(job_run_id = %id, attachment = %skip.name, reason = %skip.reason, "attachment skipped");
        }
        job.attachments = processed.attachments;

        let result = self.engine.deliberate(&job).await?;

        let artifact = json!({
            "justification": result.justification,
            "scores": result.scores,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let justification_cid = self
            .store
            .upload(
                serde_json::to_vec_pretty(&artifact)
                    .map_err(|e| ArbiterError::new(ErrorKind::Internal, e.to_string()))?,
                "justification.json",
            )
            .await?;
        info!(job_run_id = %id, justification_cid = %justification_cid, "published justification");

        Ok((result, justification_cid))
    }

    /// Drop commitments past their TTL; called from the service's schedule.
    pub fn purge_commits(&self) -> usize {
        match self.commits.purge_stale(self.cfg.commit_ttl) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "commit purge failed");
                0
            }
        }
    }

    /// Readiness: are the content-store gateways reachable?
    pub async fn ready(&self) -> bool {
        self.store.probe().await
    }
}

/// Split `"cid1[,cid2…][:addendum]"` into trimmed CIDs and the addendum.
fn split_cid_field(field: &str) -> Result<(Vec<String>, Option<String>), ArbiterError> {
    let (cid_list, addendum) = match field.split_once(':') {
        Some((cids, add)) => (cids, Some(add.to_string())),
        None => (field, None),
    };
    let cids: Vec<String> = cid_list
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if cids.is_empty() {
        return Err(ArbiterError::new(
            ErrorKind::InvalidRequest,
            "cid field contains no CIDs",
        ));
    }
    Ok((cids, addendum))
}
