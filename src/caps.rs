//! Provider/model capability matrix
//!
//! The attachment processor and the adapters consult this table to decide
//! whether a model accepts images, accepts document binaries natively, and
//! whether it belongs to a reasoning family (which changes token budgeting
//! and option pass-through).
//!
//! The matrix is **data, not code**: a built-in table ships with the binary
//! and an operator can replace it wholesale with a JSON file at startup. The
//! engine never matches on provider names directly.
//!
//! Lookup is by provider (case-insensitive equality) and model **family
//! substring**; when several families match a model identifier the longest
//! one wins, so `gpt-4o` resolves to the `gpt-4o` row rather than `gpt-4`.

use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Capability flags for one provider/model pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Accepts image attachments.
    #[serde(default)]
    pub image: bool,
    /// Accepts document binaries natively (no text extraction needed).
    #[serde(default)]
    pub native_document: bool,
    /// Reasoning-class model: higher token default, reasoning options honored.
    #[serde(default)]
    pub reasoning: bool,
}

/// One row of the matrix: a provider plus a model-family substring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixRow {
    /// Provider name, matched case-insensitively.
    pub provider: String,
    /// Model-family substring, matched case-insensitively.
    pub family: String,
    /// Flags for the family.
    #[serde(flatten)]
    pub caps: Capability,
}

/// Errors loading an operator-supplied matrix.
#[derive(Debug, thiserror::Error)]
pub enum CapsError {
    /// File could not be read.
    #[error("capability matrix unreadable: {0}")]
    Io(#[from] std::io::Error),
    /// File content is not a valid matrix document.
    #[error("capability matrix invalid: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The runtime capability table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMatrix {
    rows: Vec<MatrixRow>,
}

fn row(provider: &str, family: &str, image: bool, native_document: bool, reasoning: bool) -> MatrixRow {
    MatrixRow {
        provider: provider.into(),
        family: family.into(),
        caps: Capability {
            image,
            native_document,
            reasoning,
        },
    }
}

static BUILTIN: Lazy<CapabilityMatrix> = Lazy::new(|| CapabilityMatrix {
    rows: vec![
        // OpenAI: vision and native documents from 4o on; o-series and gpt-5
        // are reasoning-class.
        row("OpenAI", "gpt-4o", true, true, false),
        row("OpenAI", "gpt-4.1", true, true, false),
        row("OpenAI", "gpt-4", false, false, false),
        row("OpenAI", "gpt-5", true, true, true),
        row("OpenAI", "o1", true, true, true),
        row("OpenAI", "o3", true, true, true),
        row("OpenAI", "nano", false, false, true),
        row("OpenAI", "reasoning", false, false, true),
        // Anthropic: multimodal with native document blocks.
        row("Anthropic", "claude", true, true, false),
        // xAI: vision but text-only documents; grok-3/4 reason.
        row("xAI", "grok-4", true, false, true),
        row("xAI", "grok-3", false, false, true),
        row("xAI", "grok-code-fast", true, false, false),
        // Open-source/local via an OpenAI-compatible endpoint.
        row("Ollama", "llava", true, false, false),
        row("Ollama", "llama3.1", false, false, false),
        row("Ollama", "qwen3", false, false, false),
        row("Ollama", "deepseek-r1", false, false, true),
        row("Ollama", "gemma3n", false, false, false),
    ],
});

impl CapabilityMatrix {
    /// The embedded default table.
    pub fn builtin() -> &'static CapabilityMatrix {
        &BUILTIN
    }

    /// Parse a matrix document: `{"rows": [{provider, family, image?, …}]}`.
    pub fn from_json(raw: &str) -> Result<Self, CapsError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load an operator-supplied matrix file.
    pub fn from_file(path: &Path) -> Result<Self, CapsError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Resolve capabilities for a provider/model pair. Unknown pairs get the
    /// all-false default, which degrades to text-only treatment downstream.
    pub fn lookup(&self, provider: &str, model: &str) -> Capability {
        let model_lc = model.to_ascii_lowercase();
        self.rows
            .iter()
            .filter(|r| r.provider.eq_ignore_ascii_case(provider))
            .filter(|r| model_lc.contains(&r.family.to_ascii_lowercase()))
            .max_by_key(|r| r.family.len())
            .map(|r| r.caps)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_family_substring_wins() {
        let m = CapabilityMatrix::builtin();
        // gpt-4o matches both "gpt-4" and "gpt-4o"; the longer row decides.
        let c = m.lookup("OpenAI", "gpt-4o-2024-08-06");
        assert!(c.image && c.native_document && !c.reasoning);
        let plain = m.lookup("openai", "gpt-4-0613");
        assert!(!plain.image && !plain.native_document);
    }

    #[test]
    fn reasoning_families_are_flagged() {
        let m = CapabilityMatrix::builtin();
        assert!(m.lookup("OpenAI", "o1-preview").reasoning);
        assert!(m.lookup("OpenAI", "gpt-5-mini").reasoning);
        assert!(m.lookup("Ollama", "deepseek-r1:70b").reasoning);
        assert!(!m.lookup("Anthropic", "claude-sonnet-4").reasoning);
    }

    #[test]
    fn unknown_pairs_default_to_text_only() {
        let m = CapabilityMatrix::builtin();
        assert_eq!(m.lookup("NoSuch", "model-x"), Capability::default());
    }

    #[test]
    fn operator_override_parses() {
        let m = CapabilityMatrix::from_json(
            r#"{"rows":[{"provider":"Acme","family":"arb","image":true,"reasoning":true}]}"#,
        )
        .unwrap();
        let c = m.lookup("acme", "arb-large");
        assert!(c.image && c.reasoning && !c.native_document);
    }
}
