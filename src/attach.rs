//! Attachment normalization for model consumption
//!
//! Manifest attachments arrive as local files with a loose capability hint.
//! This module turns them into the uniform shape the adapters send on the
//! wire: images as base64 data URIs, documents either as native binaries
//! (when the deciding model accepts them) or as extracted plain text.
//!
//! The processing mode is decided **once per request** from the first jury
//! slot's capabilities; the pipeline uses one mode for all attachments, a
//! conservative approximation for mixed juries.
//!
//! Size limits: 20 MB per image, 50 MB per document input. Text extraction
//! runs on the blocking pool under a 60 s per-file budget; a binary-format
//! extraction failure skips the attachment (with the reason recorded) rather
//! than feeding error text to the jury.

use std::time::Duration;

use base64::Engine as _;
use tracing::warn;

use crate::caps::CapabilityMatrix;
use crate::jury::JurySlot;
use crate::manifest::{LocalAttachment, ResolvedManifest};
use crate::text::{self, TextError};

/// Maximum size of an image attachment.
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;
/// Maximum input size of a document attachment.
pub const MAX_DOCUMENT_BYTES: usize = 50 * 1024 * 1024;
/// Per-file text-extraction budget.
pub const EXTRACT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced by attachment processing.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// Attachment exceeds its size limit.
    #[error("attachment '{name}' too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Attachment display name.
        name: String,
        /// Observed size.
        size: usize,
        /// Applicable limit.
        limit: usize,
    },
    /// Attachment content could not be interpreted at all.
    #[error("attachment '{name}' unreadable: {reason}")]
    Unreadable {
        /// Attachment display name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Reading the materialized file failed.
    #[error("attachment I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of a normalized attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Raster image, passed through as-is.
    Image,
    /// Document binary, passed natively.
    Document,
    /// Plain text (native text or extracted from a document).
    Text,
}

/// Payload of a normalized attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentContent {
    /// `data:<media>;base64,<payload>` byte sequence.
    DataUri(String),
    /// Plain text.
    Text(String),
}

/// An attachment in the shape the provider adapters consume.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Display name, carried for logging and justification context.
    pub name: String,
    /// Normalized kind.
    pub kind: AttachmentKind,
    /// Media type of the payload.
    pub media_type: String,
    /// Payload.
    pub content: AttachmentContent,
}

/// Processing mode for document attachments, fixed per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// The deciding model accepts document binaries natively.
    NativeBinaryDocument,
    /// Reduce documents to plain text before sending.
    ExtractText,
}

/// A skipped attachment and why; reported alongside the surviving set.
#[derive(Debug, Clone)]
pub struct SkippedAttachment {
    /// Attachment display name.
    pub name: String,
    /// Skip reason.
    pub reason: String,
}

/// Result of normalizing a request's attachments.
#[derive(Debug, Default)]
pub struct ProcessedAttachments {
    /// Normalized attachments, in manifest order.
    pub attachments: Vec<Attachment>,
    /// Attachments dropped during extraction, with reasons.
    pub skipped: Vec<SkippedAttachment>,
}

/// Decide the document mode from the first jury slot (see module docs).
pub fn mode_for(first_slot: &JurySlot, matrix: &CapabilityMatrix) -> ProcessingMode {
    if matrix
        .lookup(&first_slot.provider, &first_slot.model)
        .native_document
    {
        ProcessingMode::NativeBinaryDocument
    } else {
        ProcessingMode::ExtractText
    }
}

const IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Map a manifest hint plus content magic to a concrete media type.
fn detect_media_type(hint: &str, filename: &str, bytes: &[u8]) -> String {
    let hint_lc = hint.to_ascii_lowercase();
    if hint_lc.contains('/') && hint_lc != "ipfs/cid" {
        return hint_lc;
    }
    if hint_lc == "utf8" {
        return "text/plain".into();
    }
    // Hint is opaque (`ipfs/cid`, `support`, …): sniff magic then extension.
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg".into();
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return "image/png".into();
    }
    if bytes.starts_with(b"GIF8") {
        return "image/gif".into();
    }
    if bytes.len() > 12 && &bytes[8..12] == b"WEBP" {
        return "image/webp".into();
    }
    if bytes.starts_with(b"%PDF") {
        return "application/pdf".into();
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return "application/vnd.openxmlformats-officedocument.wordprocessingml.document".into();
    }
    if bytes.starts_with(b"{\\rtf") {
        return "application/rtf".into();
    }
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "md" => "text/markdown".into(),
        "html" | "htm" => "text/html".into(),
        "txt" | "json" => "text/plain".into(),
        _ => "application/octet-stream".into(),
    }
}

fn data_uri(media_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{media_type};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Normalize every attachment of every manifest, in order, under one mode.
pub async fn process(
    manifests: &[ResolvedManifest],
    first_slot: &JurySlot,
    matrix: &CapabilityMatrix,
) -> Result<ProcessedAttachments, AttachError> {
    let mode = mode_for(first_slot, matrix);
    let mut out = ProcessedAttachments::default();
    for m in manifests {
        for att in &m.attachments {
            match normalize_one(att, mode).await? {
                Ok(a) => out.attachments.push(a),
                Err(reason) => {
                    warn!(name = %att.name, %reason, "skipping attachment");
                    out.skipped.push(SkippedAttachment {
                        name: att.name.clone(),
                        reason,
                    });
                }
            }
        }
    }
    Ok(out)
}

/// Normalize a single attachment.
///
/// Outer `Result` is fatal (size violation, unreadable unknown type, I/O);
/// inner `Err(reason)` is a recorded skip.
async fn normalize_one(
    att: &LocalAttachment,
    mode: ProcessingMode,
) -> Result<Result<Attachment, String>, AttachError> {
    let bytes = tokio::fs::read(&att.path).await?;
    let filename = att
        .path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();
    let media_type = detect_media_type(&att.kind, &filename, &bytes);

    if IMAGE_TYPES.contains(&media_type.as_str()) {
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(AttachError::TooLarge {
                name: att.name.clone(),
                size: bytes.len(),
                limit: MAX_IMAGE_BYTES,
            });
        }
        return Ok(Ok(Attachment {
            name: att.name.clone(),
            kind: AttachmentKind::Image,
            media_type: media_type.clone(),
            content: AttachmentContent::DataUri(data_uri(&media_type, &bytes)),
        }));
    }

    if media_type.starts_with("text/") {
        let text = text::extract_text(&bytes, &media_type).map_err(|e| AttachError::Unreadable {
            name: att.name.clone(),
            reason: e.to_string(),
        })?;
        return Ok(Ok(Attachment {
            name: att.name.clone(),
            kind: AttachmentKind::Text,
            media_type: "text/plain".into(),
            content: AttachmentContent::Text(text),
        }));
    }

    if media_type == "application/octet-stream" {
        // Unknown type: the UTF-8 sniff decides; binary garbage is fatal.
        return match text::sniff_utf8(&bytes) {
            Ok(text) => Ok(Ok(Attachment {
                name: att.name.clone(),
                kind: AttachmentKind::Text,
                media_type: "text/plain".into(),
                content: AttachmentContent::Text(text),
            })),
            Err(e) => Err(AttachError::Unreadable {
                name: att.name.clone(),
                reason: e.to_string(),
            }),
        };
    }

    // Document formats.
    if bytes.len() > MAX_DOCUMENT_BYTES {
        return Err(AttachError::TooLarge {
            name: att.name.clone(),
            size: bytes.len(),
            limit: MAX_DOCUMENT_BYTES,
        });
    }

    if mode == ProcessingMode::NativeBinaryDocument {
        return Ok(Ok(Attachment {
            name: att.name.clone(),
            kind: AttachmentKind::Document,
            media_type: media_type.clone(),
            content: AttachmentContent::DataUri(data_uri(&media_type, &bytes)),
        }));
    }

    // Extract-text mode: blocking pool plus per-file budget. Failures on
    // binary-only formats skip the attachment rather than failing the job.
    let mt = media_type.clone();
    let extraction = tokio::time::timeout(
        EXTRACT_TIMEOUT,
        tokio::task::spawn_blocking(move || text::extract_text(&bytes, &mt)),
    )
    .await;
    let outcome: Result<String, String> = match extraction {
        Err(_) => Err(format!("extraction exceeded {EXTRACT_TIMEOUT:?}")),
        Ok(Err(join)) => Err(format!("extraction task failed: {join}")),
        Ok(Ok(Err(e @ TextError::Unreadable { .. }))) => Err(e.to_string()),
        Ok(Ok(Err(e @ TextError::Binary { .. }))) => Err(e.to_string()),
        Ok(Ok(Ok(text))) => Ok(text),
    };
    Ok(match outcome {
        Ok(text) => Ok(Attachment {
            name: att.name.clone(),
            kind: AttachmentKind::Text,
            media_type: "text/plain".into(),
            content: AttachmentContent::Text(text),
        }),
        Err(reason) => Err(reason),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use std::path::{Path, PathBuf};

    fn slot(provider: &str, model: &str) -> JurySlot {
        JurySlot {
            provider: provider.into(),
            model: model.into(),
            weight: 1.0,
            count: 1,
        }
    }

    fn resolved_with(dir: &Path, files: &[(&str, &str, Vec<u8>)]) -> ResolvedManifest {
        let mut attachments = Vec::new();
        for (name, kind, data) in files {
            let p = dir.join(name);
            std::fs::write(&p, data).unwrap();
            attachments.push(LocalAttachment {
                name: name.to_string(),
                kind: kind.to_string(),
                path: p,
            });
        }
        ResolvedManifest {
            manifest: Manifest::from_json(r#"{"version":"1","primary":{"filename":"q.json"}}"#)
                .unwrap(),
            root: PathBuf::from(dir),
            query: "q".into(),
            references: Vec::new(),
            outcomes: None,
            attachments,
        }
    }

    #[test]
    fn media_type_detection_prefers_hint_then_magic_then_extension() {
        // Explicit MIME hints win outright.
        assert_eq!(detect_media_type("image/jpeg", "x.bin", b""), "image/jpeg");
        assert_eq!(detect_media_type("UTF8", "notes", b"hello"), "text/plain");
        // Opaque hints fall back to content magic.
        assert_eq!(
            detect_media_type("ipfs/cid", "blob", b"%PDF-1.4 body"),
            "application/pdf"
        );
        assert_eq!(
            detect_media_type("ipfs/cid", "blob", &[0x89, b'P', b'N', b'G']),
            "image/png"
        );
        assert_eq!(
            detect_media_type("support", "doc", b"{\\rtf1 body}"),
            "application/rtf"
        );
        // No magic: the extension decides, otherwise octet-stream.
        assert_eq!(detect_media_type("support", "readme.md", b"# t"), "text/markdown");
        assert_eq!(
            detect_media_type("support", "mystery", b"????"),
            "application/octet-stream"
        );
    }

    #[test]
    fn mode_follows_first_slot_capabilities() {
        let m = CapabilityMatrix::builtin();
        assert_eq!(
            mode_for(&slot("OpenAI", "gpt-4o"), m),
            ProcessingMode::NativeBinaryDocument
        );
        assert_eq!(
            mode_for(&slot("xAI", "grok-4"), m),
            ProcessingMode::ExtractText
        );
    }

    #[tokio::test]
    async fn image_passes_through_as_data_uri() {
        let dir = tempfile::tempdir().unwrap();
        let png = [0x89, b'P', b'N', b'G', 0, 0, 0, 0].to_vec();
        let m = resolved_with(dir.path(), &[("photo.png", "ipfs/cid", png.clone())]);
        let out = process(&[m], &slot("OpenAI", "gpt-4o"), CapabilityMatrix::builtin())
            .await
            .unwrap();
        assert_eq!(out.attachments.len(), 1);
        let a = &out.attachments[0];
        assert_eq!(a.kind, AttachmentKind::Image);
        assert_eq!(a.media_type, "image/png");
        match &a.content {
            AttachmentContent::DataUri(uri) => assert!(uri.starts_with("data:image/png;base64,")),
            other => panic!("expected data URI, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_image_fails_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut huge = vec![0xFF, 0xD8, 0xFF];
        huge.resize(MAX_IMAGE_BYTES + 1, 0xAA);
        let m = resolved_with(dir.path(), &[("big.jpg", "image/jpeg", huge)]);
        let err = process(&[m], &slot("OpenAI", "gpt-4o"), CapabilityMatrix::builtin())
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn document_goes_native_for_capable_model() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = b"%PDF-1.4\nBT (hi) Tj ET".to_vec();
        let m = resolved_with(dir.path(), &[("brief.pdf", "application/pdf", pdf)]);
        let out = process(&[m], &slot("Anthropic", "claude-sonnet-4"), CapabilityMatrix::builtin())
            .await
            .unwrap();
        let a = &out.attachments[0];
        assert_eq!(a.kind, AttachmentKind::Document);
        assert!(matches!(a.content, AttachmentContent::DataUri(_)));
    }

    #[tokio::test]
    async fn document_extracts_text_for_text_only_model() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = b"%PDF-1.4\nBT (extracted body) Tj ET".to_vec();
        let m = resolved_with(dir.path(), &[("brief.pdf", "application/pdf", pdf)]);
        let out = process(&[m], &slot("xAI", "grok-4"), CapabilityMatrix::builtin())
            .await
            .unwrap();
        let a = &out.attachments[0];
        assert_eq!(a.kind, AttachmentKind::Text);
        match &a.content {
            AttachmentContent::Text(t) => assert!(t.contains("extracted body")),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unextractable_binary_is_skipped_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let bad_pdf = b"%PDF-1.4\nnothing here".to_vec();
        let m = resolved_with(dir.path(), &[("scan.pdf", "application/pdf", bad_pdf)]);
        let out = process(&[m], &slot("xAI", "grok-4"), CapabilityMatrix::builtin())
            .await
            .unwrap();
        assert!(out.attachments.is_empty());
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].name, "scan.pdf");
    }

    #[tokio::test]
    async fn unknown_binary_garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut blob = vec![0u8; 64];
        blob.extend_from_slice(b"x");
        let m = resolved_with(dir.path(), &[("mystery.bin", "ipfs/cid", blob)]);
        let err = process(&[m], &slot("OpenAI", "gpt-4o"), CapabilityMatrix::builtin())
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::Unreadable { .. }));
    }

    #[tokio::test]
    async fn utf8_hint_becomes_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let m = resolved_with(dir.path(), &[("notes.txt", "UTF8", b"plain notes".to_vec())]);
        let out = process(&[m], &slot("OpenAI", "gpt-4"), CapabilityMatrix::builtin())
            .await
            .unwrap();
        let a = &out.attachments[0];
        assert_eq!(a.kind, AttachmentKind::Text);
        assert_eq!(a.content, AttachmentContent::Text("plain notes".into()));
    }
}
