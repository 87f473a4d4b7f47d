//! Manifest schema, parsing, and CID materialization
//!
//! Every archive carries a top-level `manifest.json` describing one
//! deliberation input: the primary query, optional jury composition,
//! supplementary attachments (in-archive or CID-referenced), auxiliary
//! support blobs, and (on a primary manifest) the `bCIDs` mapping that
//! switches a request into multi-CID composition.
//!
//! Parsing is two-phase:
//! 1. **Schema** ([`Manifest`]): a faithful serde image of the wire format.
//!    Field names are part of the external contract and are preserved
//!    verbatim (`juryParameters`, `AI_NODES`, `bCIDs`, …).
//! 2. **Resolution** ([`ManifestResolver`]): every CID-referenced blob is
//!    fetched and materialized under the extraction root with a
//!    deterministic name (`additional_<cid>`, `support_<cid>`), the primary
//!    query text is loaded, and defaults are applied. The result is a
//!    [`ResolvedManifest`] in which every referenced file has a concrete
//!    local path.
//!
//! `bCIDs` ordering note: secondary pairing is positional against the key
//! order of this map, which is why the crate enables `serde_json`'s
//! order-preserving map representation.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::{self, ArchiveError};
use crate::store::{StoreClient, StoreError};

/// Name of the manifest file inside every archive.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Errors surfaced by manifest parsing and resolution.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// `manifest.json` missing, unparseable, or structurally invalid.
    #[error("invalid manifest: {0}")]
    Invalid(String),
    /// The primary query file is missing or carries no query text.
    #[error("invalid primary query: {0}")]
    Query(String),
    /// A referenced CID could not be retrieved.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A CID-referenced primary archive could not be unpacked.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// Local file I/O under the extraction root failed.
    #[error("manifest I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Reference to the primary query: exactly one of `filename` (in-archive)
/// or `hash` (fetched separately by CID).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrimaryRef {
    /// Query file inside this archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// CID of an externally stored query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// One jury slot as declared on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiNode {
    /// Provider name, e.g. `OpenAI`.
    #[serde(rename = "AI_PROVIDER")]
    pub provider: String,
    /// Model identifier within the provider.
    #[serde(rename = "AI_MODEL")]
    pub model: String,
    /// Relative weight in `(0, 1]`.
    #[serde(rename = "WEIGHT")]
    pub weight: f64,
    /// Serial repetitions of the call whose vectors are averaged.
    #[serde(rename = "NO_COUNTS", default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

/// Jury composition; only meaningful on a primary manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JuryParameters {
    /// Number of outcome labels (≥ 2).
    #[serde(rename = "NUMBER_OF_OUTCOMES", default, skip_serializing_if = "Option::is_none")]
    pub number_of_outcomes: Option<u32>,
    /// Ordered jury slots.
    #[serde(rename = "AI_NODES", default, skip_serializing_if = "Vec::is_empty")]
    pub ai_nodes: Vec<AiNode>,
    /// Deliberation rounds (≥ 1).
    #[serde(rename = "ITERATIONS", default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

/// One supplementary input: in-archive file or CID, plus a capability hint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdditionalRef {
    /// Display name passed through to the attachment set.
    pub name: String,
    /// Capability hint: `UTF8`, a binary MIME type, or `ipfs/cid`.
    #[serde(rename = "type")]
    pub kind: String,
    /// File inside this archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// CID of an externally stored blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Wire-format manifest. Immutable after parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Schema version tag; required but not interpreted.
    pub version: String,
    /// Identity when this archive is a bound secondary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Reference to the primary query (filename XOR hash).
    pub primary: PrimaryRef,
    /// Jury composition (primary manifests only).
    #[serde(rename = "juryParameters", default, skip_serializing_if = "Option::is_none")]
    pub jury_parameters: Option<JuryParameters>,
    /// Ordered supplementary inputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<AdditionalRef>,
    /// Ordered auxiliary blobs by CID.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub support: Vec<String>,
    /// Secondary-name → role-description map; presence switches the request
    /// into multi-CID composition. Key order is significant.
    #[serde(rename = "bCIDs", default, skip_serializing_if = "Option::is_none")]
    pub bcids: Option<serde_json::Map<String, serde_json::Value>>,
    /// Meaning of a caller-supplied inline datum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addendum: Option<String>,
}

impl Manifest {
    /// Parse and structurally validate a manifest document.
    pub fn from_json(raw: &str) -> Result<Self, ManifestError> {
        let m: Manifest = serde_json::from_str(raw)
            .map_err(|e| ManifestError::Invalid(e.to_string()))?;
        m.validate()?;
        Ok(m)
    }

    /// Structural invariants that serde alone cannot express.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version.trim().is_empty() {
            return Err(ManifestError::Invalid("missing version".into()));
        }
        match (&self.primary.filename, &self.primary.hash) {
            (Some(_), Some(_)) => {
                return Err(ManifestError::Invalid(
                    "primary declares both filename and hash".into(),
                ))
            }
            (None, None) => {
                return Err(ManifestError::Invalid(
                    "primary declares neither filename nor hash".into(),
                ))
            }
            _ => {}
        }
        if let Some(jp) = &self.jury_parameters {
            if let Some(k) = jp.number_of_outcomes {
                if k < 2 {
                    return Err(ManifestError::Invalid(format!(
                        "NUMBER_OF_OUTCOMES must be ≥ 2 (got {k})"
                    )));
                }
            }
            if let Some(t) = jp.iterations {
                if t < 1 {
                    return Err(ManifestError::Invalid("ITERATIONS must be ≥ 1".into()));
                }
            }
            if !jp.ai_nodes.is_empty() {
                let sum: f64 = jp.ai_nodes.iter().map(|n| n.weight).sum();
                if sum <= 0.0 || sum > jp.ai_nodes.len() as f64 {
                    return Err(ManifestError::Invalid(format!(
                        "AI_NODES weights must sum to (0, {}] (got {sum})",
                        jp.ai_nodes.len()
                    )));
                }
                if jp.ai_nodes.iter().any(|n| n.count < 1) {
                    return Err(ManifestError::Invalid("NO_COUNTS must be ≥ 1".into()));
                }
            }
        }
        for a in &self.additional {
            if a.filename.is_none() && a.hash.is_none() {
                return Err(ManifestError::Invalid(format!(
                    "additional entry '{}' has neither filename nor hash",
                    a.name
                )));
            }
        }
        Ok(())
    }

    /// `bCIDs` as an ordered `(name, role)` list. Non-string role values are
    /// rendered through their JSON form.
    pub fn bound_roles(&self) -> Vec<(String, String)> {
        self.bcids
            .as_ref()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| {
                        let role = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                        (k.clone(), role)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The primary query document referenced by `primary`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrimaryQuery {
    /// The question put to the jury.
    pub query: String,
    /// Informational reference names.
    #[serde(default)]
    pub references: Vec<String>,
    /// Outcome labels; synthesized from `NUMBER_OF_OUTCOMES` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<Vec<String>>,
}

/// A manifest attachment resolved to a concrete local file.
#[derive(Debug, Clone)]
pub struct LocalAttachment {
    /// Display name.
    pub name: String,
    /// Capability hint from the manifest (`UTF8`, MIME type, `ipfs/cid`).
    pub kind: String,
    /// Materialized path under the extraction root.
    pub path: PathBuf,
}

/// A fully resolved manifest: every referenced blob has a local path, the
/// query text is loaded, and defaults are applied.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// The parsed wire manifest.
    pub manifest: Manifest,
    /// Extraction root this manifest was resolved from.
    pub root: PathBuf,
    /// Primary query text.
    pub query: String,
    /// Reference names from the query document.
    pub references: Vec<String>,
    /// Outcome labels (present only when the query declared them).
    pub outcomes: Option<Vec<String>>,
    /// Ordered, materialized attachments (`additional` then `support`).
    pub attachments: Vec<LocalAttachment>,
}

impl ResolvedManifest {
    /// Outcome labels with defaulting applied: the query's own labels, else
    /// `outcome1 … outcomeN` from `NUMBER_OF_OUTCOMES` (default 2).
    pub fn effective_outcomes(&self) -> Vec<String> {
        if let Some(o) = &self.outcomes {
            if !o.is_empty() {
                return o.clone();
            }
        }
        let n = self
            .manifest
            .jury_parameters
            .as_ref()
            .and_then(|jp| jp.number_of_outcomes)
            .unwrap_or(2);
        (1..=n).map(|i| format!("outcome{i}")).collect()
    }

    /// Jury slots with defaulting applied: a single OpenAI/gpt-4 slot when
    /// the manifest declares none.
    pub fn effective_jury(&self) -> Vec<AiNode> {
        let declared = self
            .manifest
            .jury_parameters
            .as_ref()
            .map(|jp| jp.ai_nodes.clone())
            .unwrap_or_default();
        if declared.is_empty() {
            vec![AiNode {
                provider: "OpenAI".into(),
                model: "gpt-4".into(),
                weight: 1.0,
                count: 1,
            }]
        } else {
            declared
        }
    }

    /// Iteration count with defaulting applied.
    pub fn effective_iterations(&self) -> u32 {
        self.manifest
            .jury_parameters
            .as_ref()
            .and_then(|jp| jp.iterations)
            .unwrap_or(1)
    }
}

/// Resolves manifests against the content store and the local scratch tree.
pub struct ManifestResolver<'a> {
    store: &'a StoreClient,
    scratch: &'a Path,
}

impl<'a> ManifestResolver<'a> {
    /// Build a resolver over the request's store client and scratch root.
    pub fn new(store: &'a StoreClient, scratch: &'a Path) -> Self {
        Self { store, scratch }
    }

    /// Parse `manifest.json` under `extracted` and materialize every
    /// referenced blob.
    pub async fn resolve(&self, extracted: &Path) -> Result<ResolvedManifest, ManifestError> {
        let manifest_path = extracted.join(MANIFEST_FILE);
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| ManifestError::Invalid(format!("{MANIFEST_FILE}: {e}")))?;
        let manifest = Manifest::from_json(&raw)?;

        let query_doc = self.load_primary_query(&manifest, extracted).await?;
        if query_doc.query.trim().is_empty() {
            return Err(ManifestError::Query("query text is empty".into()));
        }

        let mut attachments = Vec::new();
        for entry in &manifest.additional {
            let path = match (&entry.filename, &entry.hash) {
                (Some(filename), _) => {
                    let p = extracted.join(filename);
                    if !p.is_file() {
                        return Err(ManifestError::Invalid(format!(
                            "additional file '{filename}' not present in archive"
                        )));
                    }
                    p
                }
                (None, Some(hash)) => {
                    let bytes = self.store.fetch(hash).await?;
                    let p = extracted.join(format!("additional_{hash}"));
                    tokio::fs::write(&p, &bytes).await?;
                    debug!(cid = %hash, path = %p.display(), "materialized additional blob");
                    p
                }
                (None, None) => unreachable!("validated in Manifest::validate"),
            };
            attachments.push(LocalAttachment {
                name: entry.name.clone(),
                kind: entry.kind.clone(),
                path,
            });
        }
        for cid in &manifest.support {
            let bytes = self.store.fetch(cid).await?;
            let p = extracted.join(format!("support_{cid}"));
            tokio::fs::write(&p, &bytes).await?;
            debug!(cid = %cid, path = %p.display(), "materialized support blob");
            attachments.push(LocalAttachment {
                name: format!("support_{cid}"),
                kind: "support".into(),
                path: p,
            });
        }

        Ok(ResolvedManifest {
            manifest,
            root: extracted.to_path_buf(),
            query: query_doc.query,
            references: query_doc.references,
            outcomes: query_doc.outcomes,
            attachments,
        })
    }

    /// Load the primary query document, locally or by CID.
    ///
    /// CID-referenced bytes that begin with the zip magic are treated as an
    /// archive containing the query file; anything else is the query JSON
    /// document itself.
    async fn load_primary_query(
        &self,
        manifest: &Manifest,
        extracted: &Path,
    ) -> Result<PrimaryQuery, ManifestError> {
        let raw = match (&manifest.primary.filename, &manifest.primary.hash) {
            (Some(filename), None) => tokio::fs::read_to_string(extracted.join(filename))
                .await
                .map_err(|e| ManifestError::Query(format!("primary file '{filename}': {e}")))?,
            (None, Some(hash)) => {
                let bytes = self.store.fetch(hash).await?;
                if bytes.starts_with(b"PK\x03\x04") {
                    let root = archive::extract(bytes, self.scratch, hash).await?;
                    self.read_query_file(&root).await?
                } else {
                    String::from_utf8(bytes)
                        .map_err(|_| ManifestError::Query("primary query is not UTF-8".into()))?
                }
            }
            _ => unreachable!("validated in Manifest::validate"),
        };
        serde_json::from_str(&raw).map_err(|e| ManifestError::Query(e.to_string()))
    }

    /// Locate the query document inside a CID-referenced primary archive:
    /// `primary_query.json` if present, else the single top-level `.json`.
    async fn read_query_file(&self, root: &Path) -> Result<String, ManifestError> {
        let preferred = root.join("primary_query.json");
        if preferred.is_file() {
            return Ok(tokio::fs::read_to_string(preferred).await?);
        }
        let mut jsons = Vec::new();
        let mut dir = tokio::fs::read_dir(root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let p = entry.path();
            if p.extension().is_some_and(|e| e == "json") {
                jsons.push(p);
            }
        }
        match jsons.as_slice() {
            [only] => Ok(tokio::fs::read_to_string(only).await?),
            [] => Err(ManifestError::Query(
                "primary archive contains no query document".into(),
            )),
            _ => Err(ManifestError::Query(
                "primary archive contains multiple candidate query documents".into(),
            )),
        }
    }
}
