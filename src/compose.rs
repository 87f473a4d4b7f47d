//! Multi-CID composition of resolved manifests into one deliberation job
//!
//! The first CID of a request is the **primary**; every further CID is a
//! **bound secondary** whose role is declared by the primary's `bCIDs` map.
//! Composition concatenates the primary query with each secondary's query
//! under its declared role, merges references, and applies the caller's
//! addendum value.
//!
//! The textual contract is exact and whitespace-significant; downstream
//! clients diff prompts byte-for-byte, so no segment below may be reordered
//! or re-spaced. Single-CID composition is the degenerate case and produces
//! the primary query unchanged (modulo the addendum segment).

use serde::Serialize;
use tracing::warn;

use crate::attach::Attachment;
use crate::jury::JurySlot;
use crate::manifest::ResolvedManifest;

/// Errors surfaced by composition.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    /// No manifests were supplied.
    #[error("composition requires at least one manifest")]
    NoInputs,
    /// Secondary count does not match the primary's `bCIDs` declaration.
    #[error("bound-CID mismatch: primary declares {declared} roles, request carries {got} secondaries")]
    Mismatch {
        /// Entries in the primary's `bCIDs` map.
        declared: usize,
        /// Secondaries actually supplied.
        got: usize,
    },
}

/// The unit of work consumed by the jury engine.
#[derive(Debug, Clone, Serialize)]
pub struct DeliberationJob {
    /// Composed textual prompt.
    pub prompt: String,
    /// Ordered outcome labels; length defines K.
    pub outcomes: Vec<String>,
    /// Ordered jury slots.
    pub jury: Vec<JurySlot>,
    /// Deliberation rounds.
    pub iterations: u32,
    /// Normalized attachments; populated by the attachment processor.
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
    /// Merged reference names (primary then secondaries), informational.
    pub references: Vec<String>,
}

/// Strip the four marker characters used for prompt-section delimiting.
/// Applied to the caller-supplied addendum value only; everything else in the
/// prompt comes from content-addressed archives.
pub fn sanitize_addendum(value: &str) -> String {
    value.replace(['<', '>', '{', '}'], "")
}

/// Compose one primary and zero or more bound secondaries into a job.
///
/// `addendum_value` is the optional inline datum supplied alongside the CID
/// list; it is appended only when the primary manifest declares an `addendum`
/// meaning for it.
pub fn compose(
    resolved: &[ResolvedManifest],
    addendum_value: Option<&str>,
) -> Result<DeliberationJob, ComposeError> {
    let (primary, secondaries) = resolved.split_first().ok_or(ComposeError::NoInputs)?;

    let roles = primary.manifest.bound_roles();
    if !secondaries.is_empty() && roles.len() != secondaries.len() {
        return Err(ComposeError::Mismatch {
            declared: roles.len(),
            got: secondaries.len(),
        });
    }

    let mut prompt = primary.query.clone();

    for (secondary, (expected_name, role)) in secondaries.iter().zip(&roles) {
        if let Some(name) = &secondary.manifest.name {
            if name != expected_name {
                warn!(
                    expected = %expected_name,
                    declared = %name,
                    "bound secondary name differs from bCIDs key; continuing"
                );
            }
        }
        prompt.push_str("\n\n**\n");
        prompt.push_str(role);
        prompt.push_str(":\nName: ");
        prompt.push_str(expected_name);
        prompt.push('\n');
        prompt.push_str(&secondary.query);
    }

    if secondaries.iter().any(|s| !s.references.is_empty()) {
        prompt.push_str("\n\nReferences:\n");
        for (secondary, (expected_name, _)) in secondaries.iter().zip(&roles) {
            if secondary.references.is_empty() {
                continue;
            }
            let label = secondary
                .manifest
                .name
                .as_deref()
                .unwrap_or(expected_name.as_str());
            prompt.push_str(label);
            prompt.push_str(": \n");
            for r in &secondary.references {
                prompt.push_str(r);
                prompt.push('\n');
            }
            prompt.push('\n');
        }
    }

    if let (Some(meaning), Some(value)) = (&primary.manifest.addendum, addendum_value) {
        prompt.push_str("\n\nAddendum: \n");
        prompt.push_str(meaning);
        prompt.push_str(": ");
        prompt.push_str(&sanitize_addendum(value));
    }

    let mut references = primary.references.clone();
    for s in secondaries {
        references.extend(s.references.iter().cloned());
    }

    Ok(DeliberationJob {
        prompt,
        outcomes: primary.effective_outcomes(),
        jury: primary
            .effective_jury()
            .into_iter()
            .map(|n| JurySlot {
                provider: n.provider,
                model: n.model,
                weight: n.weight,
                count: n.count,
            })
            .collect(),
        iterations: primary.effective_iterations(),
        attachments: Vec::new(),
        references,
    })
}
