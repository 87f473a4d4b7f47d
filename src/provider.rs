//! Model provider adapters
//!
//! An adapter is a capability-declaring handle to one LLM provider. The jury
//! engine only sees the [`ModelProvider`] trait; the wire formats live here.
//! Two families cover the fleet:
//!
//! - [`OpenAiCompatible`]: the chat-completions shape spoken by OpenAI, xAI,
//!   and local servers (Ollama and friends).
//! - [`Anthropic`]: the messages API with typed content blocks.
//!
//! ## Reasoning-model policy
//! If the capability matrix flags the model as reasoning-class, the adapter
//! defaults `max_tokens` to 16,000 and forwards `reasoning_effort` /
//! `verbosity`; otherwise the default is 1,000 and reasoning options are
//! suppressed (non-reasoning endpoints reject unknown fields or worse,
//! silently misbehave).
//!
//! ## Thinking blocks
//! Reasoning-family models interleave `<think>…</think>` segments into their
//! output. Adapters strip them (case-insensitive, across lines) before
//! returning; the justifier path goes through the same adapters, so it is
//! never skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::attach::{Attachment, AttachmentContent, AttachmentKind};
use crate::caps::CapabilityMatrix;

/// Default token budget for reasoning-class models.
pub const REASONING_MAX_TOKENS: u32 = 16_000;
/// Default token budget for everything else.
pub const DEFAULT_MAX_TOKENS: u32 = 1_000;

/// Errors surfaced by provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transient provider failure (connect error, 429, 5xx); retryable.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// Credential rejection.
    #[error("provider rejected credentials (status {status})")]
    Auth {
        /// HTTP status returned.
        status: u16,
    },
    /// The request itself is malformed for this provider; not retryable.
    #[error("provider rejected input: {0}")]
    InvalidInput(String),
    /// The provider call timed out.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    /// The response arrived but carried no usable text.
    #[error("provider returned an empty completion")]
    EmptyCompletion,
}

/// Advisory effort levels for reasoning-class models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    /// Minimal reasoning budget.
    Low,
    /// Balanced budget.
    Medium,
    /// Maximal budget.
    High,
}

impl Effort {
    fn as_str(self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
        }
    }
}

/// Generation options; all advisory except `max_tokens`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenOptions {
    /// Reasoning budget hint; ignored by non-reasoning models.
    pub reasoning_effort: Option<Effort>,
    /// Output length/verbosity hint.
    pub verbosity: Option<Effort>,
    /// Explicit token cap; defaults per reasoning policy when absent.
    pub max_tokens: Option<u32>,
}

/// Options after the reasoning policy is applied.
struct EffectiveOptions {
    max_tokens: u32,
    reasoning_effort: Option<&'static str>,
    verbosity: Option<&'static str>,
}

fn apply_policy(reasoning: bool, opts: &GenOptions) -> EffectiveOptions {
    if reasoning {
        EffectiveOptions {
            max_tokens: opts.max_tokens.unwrap_or(REASONING_MAX_TOKENS),
            reasoning_effort: opts.reasoning_effort.map(Effort::as_str),
            verbosity: opts.verbosity.map(Effort::as_str),
        }
    } else {
        EffectiveOptions {
            max_tokens: opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            reasoning_effort: None,
            verbosity: None,
        }
    }
}

/// Remove `<think>…</think>` segments, case-insensitively, across lines.
/// An unterminated block is dropped through end-of-text.
pub fn strip_think(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    let mut out = String::with_capacity(raw.len());
    let mut pos = 0;
    while let Some(open_rel) = lower[pos..].find("<think>") {
        let open = pos + open_rel;
        out.push_str(&raw[pos..open]);
        match lower[open..].find("</think>") {
            Some(close_rel) => pos = open + close_rel + "</think>".len(),
            None => return out.trim().to_string(),
        }
    }
    out.push_str(&raw[pos..]);
    out.trim().to_string()
}

/// Split a `data:<media>;base64,<payload>` URI into its parts.
fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("data:")?;
    let (media, payload) = rest.split_once(";base64,")?;
    Some((media, payload))
}

/// A capability-declaring handle to one LLM provider.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name as referenced by jury slots (e.g. `OpenAI`).
    fn name(&self) -> &str;

    /// Declared capabilities of `model` under this provider. The default is
    /// the all-false degradation for adapters without a matrix.
    fn capabilities(&self, model: &str) -> crate::caps::Capability {
        let _ = model;
        crate::caps::Capability::default()
    }

    /// Text-only generation.
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        opts: GenOptions,
    ) -> Result<String, ProviderError>;

    /// Generation with normalized attachments.
    async fn generate_with_attachments(
        &self,
        prompt: &str,
        model: &str,
        attachments: &[Attachment],
        opts: GenOptions,
    ) -> Result<String, ProviderError>;
}

fn classify_status(status: u16, body: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Auth { status },
        400 | 404 | 413 | 422 => ProviderError::InvalidInput(truncate(body, 300)),
        _ => ProviderError::Unavailable(format!("status {status}: {}", truncate(body, 300))),
    }
}

fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(Duration::from_secs(0))
    } else {
        ProviderError::Unavailable(e.to_string())
    }
}

fn truncate(s: &str, n: usize) -> String {
    if s.len() <= n {
        s.to_string()
    } else {
        let mut end = n;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

// ============================================================================
// OpenAI-compatible chat completions (OpenAI, xAI, local servers)
// ============================================================================

/// Adapter for any endpoint speaking the chat-completions wire format.
pub struct OpenAiCompatible {
    provider_name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    matrix: Arc<CapabilityMatrix>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbosity: Option<&'static str>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl OpenAiCompatible {
    /// Build an adapter for a chat-completions endpoint.
    pub fn new(
        provider_name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        matrix: Arc<CapabilityMatrix>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
            matrix,
        }
    }

    fn content_parts(prompt: &str, attachments: &[Attachment]) -> serde_json::Value {
        let mut parts = vec![json!({ "type": "text", "text": prompt })];
        for att in attachments {
            match (&att.kind, &att.content) {
                (AttachmentKind::Image, AttachmentContent::DataUri(uri)) => {
                    parts.push(json!({ "type": "image_url", "image_url": { "url": uri } }));
                }
                (AttachmentKind::Document, AttachmentContent::DataUri(uri)) => {
                    parts.push(json!({
                        "type": "file",
                        "file": { "filename": att.name, "file_data": uri }
                    }));
                }
                (_, AttachmentContent::Text(text)) => {
                    parts.push(json!({
                        "type": "text",
                        "text": format!("Attachment {}:\n{}", att.name, text)
                    }));
                }
                // A data URI on a text attachment cannot be produced by the
                // normalizer; ignore rather than guess.
                (AttachmentKind::Text, AttachmentContent::DataUri(_)) => {}
            }
        }
        serde_json::Value::Array(parts)
    }

    async fn call(
        &self,
        model: &str,
        content: serde_json::Value,
        opts: GenOptions,
    ) -> Result<String, ProviderError> {
        let caps = self.matrix.lookup(&self.provider_name, model);
        let eff = apply_policy(caps.reasoning, &opts);
        let req = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
            max_tokens: eff.max_tokens,
            reasoning_effort: eff.reasoning_effort,
            verbosity: eff.verbosity,
        };
        debug!(provider = %self.provider_name, model, "chat-completions call");
        let res = self
            .http
            .post(format!(
                "{}/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = res.status();
        let body = res.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }
        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Unavailable(format!("malformed completion: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(ProviderError::EmptyCompletion)?;
        Ok(strip_think(&text))
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn capabilities(&self, model: &str) -> crate::caps::Capability {
        self.matrix.lookup(&self.provider_name, model)
    }

    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        opts: GenOptions,
    ) -> Result<String, ProviderError> {
        self.call(model, serde_json::Value::String(prompt.to_string()), opts)
            .await
    }

    async fn generate_with_attachments(
        &self,
        prompt: &str,
        model: &str,
        attachments: &[Attachment],
        opts: GenOptions,
    ) -> Result<String, ProviderError> {
        self.call(model, Self::content_parts(prompt, attachments), opts)
            .await
    }
}

// ============================================================================
// Anthropic messages API
// ============================================================================

/// Adapter for the Anthropic messages API.
pub struct Anthropic {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    matrix: Arc<CapabilityMatrix>,
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<MessagesBlock>,
}

#[derive(Deserialize)]
struct MessagesBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl Anthropic {
    /// Build an adapter for an Anthropic-style endpoint.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        matrix: Arc<CapabilityMatrix>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
            matrix,
        }
    }

    fn blocks(prompt: &str, attachments: &[Attachment]) -> Vec<serde_json::Value> {
        let mut blocks = Vec::with_capacity(attachments.len() + 1);
        for att in attachments {
            match (&att.kind, &att.content) {
                (AttachmentKind::Image, AttachmentContent::DataUri(uri)) => {
                    if let Some((media, data)) = split_data_uri(uri) {
                        blocks.push(json!({
                            "type": "image",
                            "source": { "type": "base64", "media_type": media, "data": data }
                        }));
                    }
                }
                (AttachmentKind::Document, AttachmentContent::DataUri(uri)) => {
                    if let Some((media, data)) = split_data_uri(uri) {
                        blocks.push(json!({
                            "type": "document",
                            "source": { "type": "base64", "media_type": media, "data": data }
                        }));
                    }
                }
                (_, AttachmentContent::Text(text)) => {
                    blocks.push(json!({
                        "type": "text",
                        "text": format!("Attachment {}:\n{}", att.name, text)
                    }));
                }
                (AttachmentKind::Text, AttachmentContent::DataUri(_)) => {}
            }
        }
        blocks.push(json!({ "type": "text", "text": prompt }));
        blocks
    }

    async fn call(
        &self,
        model: &str,
        blocks: Vec<serde_json::Value>,
        opts: GenOptions,
    ) -> Result<String, ProviderError> {
        let caps = self.matrix.lookup("Anthropic", model);
        let eff = apply_policy(caps.reasoning, &opts);
        let body = json!({
            "model": model,
            "max_tokens": eff.max_tokens,
            "messages": [{ "role": "user", "content": blocks }],
        });
        debug!(model, "anthropic messages call");
        let res = self
            .http
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = res.status();
        let text = res.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }
        let parsed: MessagesResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Unavailable(format!("malformed completion: {e}")))?;
        let out: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if out.is_empty() {
            return Err(ProviderError::EmptyCompletion);
        }
        Ok(strip_think(&out))
    }
}

#[async_trait]
impl ModelProvider for Anthropic {
    fn name(&self) -> &str {
        "Anthropic"
    }

    fn capabilities(&self, model: &str) -> crate::caps::Capability {
        self.matrix.lookup("Anthropic", model)
    }

    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        opts: GenOptions,
    ) -> Result<String, ProviderError> {
        self.call(model, vec![json!({ "type": "text", "text": prompt })], opts)
            .await
    }

    async fn generate_with_attachments(
        &self,
        prompt: &str,
        model: &str,
        attachments: &[Attachment],
        opts: GenOptions,
    ) -> Result<String, ProviderError> {
        self.call(model, Self::blocks(prompt, attachments), opts).await
    }
}

// ============================================================================
// Concurrency cap
// ============================================================================

/// Decorator bounding outstanding calls to one provider.
///
/// Juries fan out N slots at once and several requests may be in flight;
/// without a cap a busy arbiter tramples provider rate limits. Waiting for a
/// permit counts against the caller's slot deadline, which is the correct
/// accounting: a saturated provider is indistinguishable from a slow one.
pub struct RateLimited<P> {
    inner: P,
    permits: tokio::sync::Semaphore,
}

impl<P: ModelProvider> RateLimited<P> {
    /// Wrap `inner`, allowing at most `max_in_flight` concurrent calls.
    pub fn new(inner: P, max_in_flight: usize) -> Self {
        Self {
            inner,
            permits: tokio::sync::Semaphore::new(max_in_flight.max(1)),
        }
    }
}

#[async_trait]
impl<P: ModelProvider> ModelProvider for RateLimited<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self, model: &str) -> crate::caps::Capability {
        self.inner.capabilities(model)
    }

    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        opts: GenOptions,
    ) -> Result<String, ProviderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("provider shut down".into()))?;
        self.inner.generate(prompt, model, opts).await
    }

    async fn generate_with_attachments(
        &self,
        prompt: &str,
        model: &str,
        attachments: &[Attachment],
        opts: GenOptions,
    ) -> Result<String, ProviderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("provider shut down".into()))?;
        self.inner
            .generate_with_attachments(prompt, model, attachments, opts)
            .await
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Name-keyed set of configured adapters, shared across requests.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its declared name (case-insensitive key).
    pub fn insert(&mut self, provider: Arc<dyn ModelProvider>) {
        self.providers
            .insert(provider.name().to_ascii_lowercase(), provider);
    }

    /// Resolve an adapter by jury-slot provider name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Registered provider names (diagnostics).
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
