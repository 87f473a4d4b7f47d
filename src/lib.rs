//! Crate root: public surface, core aliases, and service-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users of
//! the library. It centralizes the fixed-point score denominator, the shared
//! error taxonomy, and re-exports the main submodules that implement the
//! arbitration pipeline.
//!
//! ## Invariants (protocol-aligned)
//!
//! - **Score denominator.** Every score vector that crosses an external
//!   boundary is an integer vector of length K (the outcome count) summing to
//!   **exactly** [`SCORE_DENOM`] = 1,000,000. Clients interpret the entries as
//!   fixed-point fractions; no rounding slack is tolerated anywhere.
//!
//! - **Quorum.** A deliberation succeeds only when at least
//!   `⌈N · min_success_percent⌉` of its N jury slots produce a parseable
//!   verdict. Below quorum the request fails whole; a partial score is never
//!   emitted.
//!
//! - **Scratch isolation.** Each request owns a private scratch directory for
//!   archive extraction. It is created on entry and removed on every exit
//!   path, success or failure.
//!
//! - **Commit store.** The commit/reveal map is the only process-wide mutable
//!   state. All access is serialized through a single mutex; the file backend
//!   writes atomically (temp file + rename).
//!
//! These invariants are enforced by design across the submodules. If one is
//! violated at runtime, the failure mode is a **precise error** (never UB).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Content-store client: gateway fallback fetch, pinning-service upload.
pub mod store;
/// Archive extraction into per-request scratch space (traversal-safe).
pub mod archive;
/// Manifest schema, parsing, and CID materialization.
pub mod manifest;
/// Multi-CID composition of manifests into one deliberation job.
pub mod compose;
/// Plain-text extraction from document formats (HTML, RTF, PDF, DOCX, …).
pub mod text;
/// Attachment normalization for model consumption.
pub mod attach;
/// Provider/model capability matrix (read at startup, never hard-wired).
pub mod caps;
/// Model provider adapters (OpenAI-compatible and Anthropic wire formats).
pub mod provider;
/// Model-response parsing: five strategies, strictest first.
pub mod parse;
/// Jury engine: concurrent fan-out, weighted aggregation, justification.
pub mod jury;
/// Commit/reveal store with memory and file backends.
pub mod commit;
/// Request orchestration: ingestion, deliberation, upload, commit routing.
pub mod orchestrator;

// ============================================================================
// Canonical constants and root-level re-exports (centralization)
// ============================================================================

/// Fixed-point denominator for score vectors. Every externally visible score
/// vector sums to exactly this value.
pub const SCORE_DENOM: u64 = 1_000_000;

/// Length of a commit key in bytes (rendered as 32 hex characters).
pub const COMMIT_HASH_BYTES: usize = 16;

pub use crate::attach::{Attachment, AttachmentKind};
pub use crate::caps::{Capability, CapabilityMatrix};
pub use crate::commit::{CommitEntry, CommitMode, CommitStore};
pub use crate::compose::DeliberationJob;
pub use crate::jury::{JuryConfig, JuryEngine, JuryResult, JurySlot, SlotIdx, SlotState};
pub use crate::manifest::{Manifest, ResolvedManifest};
pub use crate::orchestrator::{ArbiterError, ErrorKind, Orchestrator, OrchestratorConfig};
pub use crate::parse::Verdict;
pub use crate::provider::{GenOptions, ModelProvider, ProviderRegistry};
pub use crate::store::{StoreClient, StoreConfig};
