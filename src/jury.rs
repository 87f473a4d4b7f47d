//! Jury engine: concurrent fan-out, weighted aggregation, justification
//!
//! ## Overview
//! A deliberation runs T iterations over N jury slots. Within an iteration
//! all slots are dispatched **concurrently** with independent deadlines and
//! settle-all semantics: a slot failure or timeout never cancels its peers.
//! Results are folded in the slot's *declared* order, so weight assignment is
//! deterministic regardless of completion order. Iterations are strictly
//! serial; from the second round on, every juror sees the previous round's
//! answers and may reconsider.
//!
//! ## Per-slot state machine
//! `running → timed_out` on deadline, or `running → parsing → success /
//! fallback`. Terminal states: `success`, `timed_out`, `fallback`. Only
//! `success` contributes a vector to the aggregate; all three contribute
//! their justification to synthesis metadata.
//!
//! ## Quorum
//! With `required = ⌈N · min_success_percent⌉`, fewer than `required`
//! successful slots abort the request with the per-slot failure reasons. No
//! partial score is ever returned.
//!
//! ## Aggregation
//! The iteration vector is the one-step weight-normalized average
//! `Σᵢ(vᵢ·wᵢ)/Σᵢwᵢ` over successful slots (failed slots drop out of both
//! numerator and denominator, which renormalizes surviving weights). The
//! floored result is topped back up to the exact denominator by
//! largest-remainder distribution, keeping the sum invariant trivial.
//!
//! ## Justifier
//! One distinguished provider/model pair is invoked once after the final
//! iteration with the aggregate and every slot's justification. Its own
//! deadline is independent; on expiry the engine degrades to a concatenated
//! fallback justification rather than failing the request.

use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::compose::DeliberationJob;
use crate::parse::{self, ParseError};
use crate::provider::{GenOptions, ProviderRegistry};
use crate::SCORE_DENOM;

/// Default per-slot deadline.
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);
/// Default justifier deadline.
pub const DEFAULT_JUSTIFIER_TIMEOUT: Duration = Duration::from_secs(45);
/// Default minimum fraction of slots that must succeed.
pub const DEFAULT_MIN_SUCCESS_PERCENT: f64 = 0.5;

/// One `(provider, model, weight, count)` jury entry.
#[derive(Debug, Clone, Serialize)]
pub struct JurySlot {
    /// Provider name resolved through the registry.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Relative weight in the aggregate.
    pub weight: f64,
    /// Serial call repetitions whose vectors are floor-averaged.
    pub count: u32,
}

impl JurySlot {
    /// Diagnostic label.
    pub fn label(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

/// Index of a slot in the declared jury order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotIdx(pub usize);

impl SlotIdx {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Terminal state of one slot in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Parsed verdict obtained; vector contributes to the aggregate.
    Success,
    /// Deadline expired before a response settled.
    TimedOut,
    /// Response obtained but no verdict parsed; uniform vector substituted.
    Fallback,
}

/// Outcome of one slot for one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct SlotOutcome {
    /// Declared position in the jury.
    pub index: SlotIdx,
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Declared weight.
    pub weight: f64,
    /// Terminal state.
    pub state: SlotState,
    /// Score vector (fallback-uniform when failed).
    pub vector: Vec<u64>,
    /// Justification text (or the error message naming the model).
    pub justification: String,
    /// True for `timed_out` and `fallback`.
    pub failed: bool,
    /// Failure reason, truncated from the raw response where applicable.
    pub failure_reason: Option<String>,
}

/// One labeled score in the final result.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeScore {
    /// Outcome label.
    pub outcome: String,
    /// Aggregated fixed-point score.
    pub score: u64,
}

/// Final result of a deliberation.
#[derive(Debug, Clone, Serialize)]
pub struct JuryResult {
    /// Weighted aggregate, labeled by outcome, summing to the denominator.
    pub scores: Vec<OutcomeScore>,
    /// Synthesized (or fallback) justification.
    pub justification: String,
    /// Last iteration's per-slot outcomes, in declared order.
    pub slots: Vec<SlotOutcome>,
}

/// A failed slot as reported in `INSUFFICIENT_MODELS` detail.
#[derive(Debug, Clone, Serialize)]
pub struct SlotFailure {
    /// `provider:model` label.
    pub slot: String,
    /// Failure reason.
    pub reason: String,
}

/// Errors surfaced by deliberation.
#[derive(Debug, thiserror::Error)]
pub enum JuryError {
    /// Quorum not reached; carries every failed slot's reason.
    #[error("only {succeeded} of {total} jurors succeeded ({required} required)")]
    InsufficientModels {
        /// Slots that produced a parsed verdict.
        succeeded: usize,
        /// Quorum threshold.
        required: usize,
        /// Total slots.
        total: usize,
        /// Failure reasons in slot order.
        failures: Vec<SlotFailure>,
    },
    /// The job carries no jury slots at all.
    #[error("deliberation job has an empty jury")]
    EmptyJury,
}

/// Engine configuration; read-only once the service is up.
#[derive(Debug, Clone)]
pub struct JuryConfig {
    /// Per-slot deadline.
    pub model_timeout: Duration,
    /// Justifier deadline.
    pub justifier_timeout: Duration,
    /// Minimum fraction of slots that must succeed.
    pub min_success_percent: f64,
    /// Justifier provider name.
    pub justifier_provider: String,
    /// Justifier model identifier.
    pub justifier_model: String,
}

impl Default for JuryConfig {
    fn default() -> Self {
        Self {
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            justifier_timeout: DEFAULT_JUSTIFIER_TIMEOUT,
            min_success_percent: DEFAULT_MIN_SUCCESS_PERCENT,
            justifier_provider: "OpenAI".into(),
            justifier_model: "gpt-4o".into(),
        }
    }
}

impl JuryConfig {
    /// Apply a `provider:model` justifier designation.
    pub fn with_justifier(mut self, designation: &str) -> Self {
        if let Some((provider, model)) = designation.split_once(':') {
            self.justifier_provider = provider.trim().to_string();
            self.justifier_model = model.trim().to_string();
        } else {
            warn!(designation, "justifier designation is not provider:model; keeping default");
        }
        self
    }
}

/// Uniform fallback vector: `⌊denom/K⌋` everywhere, remainder on index 0.
pub fn fallback_vector(k: usize) -> Vec<u64> {
    let base = SCORE_DENOM / k as u64;
    let mut v = vec![base; k];
    v[0] += SCORE_DENOM - base * k as u64;
    v
}

/// Scale fractional shares to integers summing exactly to the denominator.
///
/// Floors every share, then hands the leftover units to the largest
/// fractional parts (ties resolved toward lower indices). This is the only
/// place the external sum invariant is established, so aggregation stays a
/// single-step weighted average.
pub fn normalize_to_denom(shares: &[f64]) -> Vec<u64> {
    let mut floored: Vec<u64> = shares.iter().map(|&s| s.max(0.0) as u64).collect();
    let assigned: u64 = floored.iter().sum();
    let mut leftover = SCORE_DENOM.saturating_sub(assigned) as usize;
    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = shares[a] - shares[a].floor();
        let fb = shares[b] - shares[b].floor();
        fb.partial_cmp(&fa).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b))
    });
    for idx in order {
        if leftover == 0 {
            break;
        }
        floored[idx] += 1;
        leftover -= 1;
    }
    floored
}

/// The deliberation engine. Cheap to clone; shares the provider registry.
#[derive(Clone)]
pub struct JuryEngine {
    registry: ProviderRegistry,
    cfg: JuryConfig,
}

impl JuryEngine {
    /// Build an engine over a registry and configuration.
    pub fn new(registry: ProviderRegistry, cfg: JuryConfig) -> Self {
        Self { registry, cfg }
    }

    /// Run a full deliberation: T iterations, quorum check, aggregation,
    /// justifier synthesis.
    pub async fn deliberate(&self, job: &DeliberationJob) -> Result<JuryResult, JuryError> {
        let n = job.jury.len();
        if n == 0 {
            return Err(JuryError::EmptyJury);
        }
        let k = job.outcomes.len();
        let required = (n as f64 * self.cfg.min_success_percent).ceil() as usize;

        let mut aggregate: Vec<u64> = Vec::new();
        let mut slots: Vec<SlotOutcome> = Vec::new();

        for iteration in 1..=job.iterations {
            let prompt = build_iteration_prompt(job, iteration, &slots);
            slots = self.fan_out(job, &prompt).await;

            let succeeded = slots.iter().filter(|s| !s.failed).count();
            if succeeded < required {
                let failures = slots
                    .iter()
                    .filter(|s| s.failed)
                    .map(|s| SlotFailure {
                        slot: format!("{}:{}", s.provider, s.model),
                        reason: s
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "unknown failure".into()),
                    })
                    .collect();
                return Err(JuryError::InsufficientModels {
                    succeeded,
                    required,
                    total: n,
                    failures,
                });
            }

            aggregate = aggregate_iteration(&slots, k);
            debug!(iteration, ?aggregate, "iteration aggregate");
        }

        let justification = self.synthesize(job, &aggregate, &slots).await;

        Ok(JuryResult {
            scores: job
                .outcomes
                .iter()
                .cloned()
                .zip(aggregate.iter().copied())
                .map(|(outcome, score)| OutcomeScore { outcome, score })
                .collect(),
            justification,
            slots,
        })
    }

    /// Dispatch every slot concurrently and settle them all. Results come
    /// back in declared order because `join_all` preserves input order.
    async fn fan_out(&self, job: &DeliberationJob, prompt: &str) -> Vec<SlotOutcome> {
        let tasks = job.jury.iter().enumerate().map(|(i, slot)| {
            let idx = SlotIdx(i);
            async move {
                match tokio::time::timeout(
                    self.cfg.model_timeout,
                    self.run_slot(idx, slot, prompt, job),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(slot = %slot.label(), timeout = ?self.cfg.model_timeout, "slot deadline expired");
                        SlotOutcome {
                            index: idx,
                            provider: slot.provider.clone(),
                            model: slot.model.clone(),
                            weight: slot.weight,
                            state: SlotState::TimedOut,
                            vector: fallback_vector(job.outcomes.len()),
                            justification: format!(
                                "Model {} did not respond within {:?}.",
                                slot.label(),
                                self.cfg.model_timeout
                            ),
                            failed: true,
                            failure_reason: Some(format!(
                                "timed out after {:?}",
                                self.cfg.model_timeout
                            )),
                        }
                    }
                }
            }
        });
        join_all(tasks).await
    }

    /// One slot: `count` strictly serial calls, verdicts floor-averaged.
    /// Unparseable or failed calls drop out of the average; the slot enters
    /// the fallback state only when no call yields a verdict.
    async fn run_slot(
        &self,
        idx: SlotIdx,
        slot: &JurySlot,
        prompt: &str,
        job: &DeliberationJob,
    ) -> SlotOutcome {
        let k = job.outcomes.len();
        let Some(adapter) = self.registry.get(&slot.provider) else {
            return SlotOutcome {
                index: idx,
                provider: slot.provider.clone(),
                model: slot.model.clone(),
                weight: slot.weight,
                state: SlotState::Fallback,
                vector: fallback_vector(k),
                justification: format!(
                    "Model {} could not be consulted: provider not configured.",
                    slot.label()
                ),
                failed: true,
                failure_reason: Some(format!("provider '{}' not configured", slot.provider)),
            };
        };

        let mut verdicts = Vec::with_capacity(slot.count as usize);
        let mut last_failure = String::new();
        for call in 0..slot.count {
            let result = if job.attachments.is_empty() {
                adapter
                    .generate(prompt, &slot.model, GenOptions::default())
                    .await
            } else {
                adapter
                    .generate_with_attachments(
                        prompt,
                        &slot.model,
                        &job.attachments,
                        GenOptions::default(),
                    )
                    .await
            };
            match result {
                Ok(raw) => match parse::parse_verdict(&raw, k) {
                    Ok(v) => verdicts.push(v),
                    Err(e) => {
                        last_failure = parse_failure_reason(&e, &raw);
                        warn!(slot = %slot.label(), call, error = %e, "verdict parse failed");
                    }
                },
                Err(e) => {
                    last_failure = e.to_string();
                    warn!(slot = %slot.label(), call, error = %e, "provider call failed");
                }
            }
        }

        if verdicts.is_empty() {
            return SlotOutcome {
                index: idx,
                provider: slot.provider.clone(),
                model: slot.model.clone(),
                weight: slot.weight,
                state: SlotState::Fallback,
                vector: fallback_vector(k),
                justification: format!(
                    "Model {} failed to return a parseable verdict.",
                    slot.label()
                ),
                failed: true,
                failure_reason: Some(last_failure),
            };
        }

        let vector = floor_average(&verdicts.iter().map(|v| v.score.clone()).collect::<Vec<_>>(), k);
        let justification = verdicts
            .iter()
            .map(|v| v.justification.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        SlotOutcome {
            index: idx,
            provider: slot.provider.clone(),
            model: slot.model.clone(),
            weight: slot.weight,
            state: SlotState::Success,
            vector,
            justification,
            failed: false,
            failure_reason: None,
        }
    }

    /// Invoke the justifier once over the aggregate and every slot's
    /// justification. Timeout and every other failure degrade to the
    /// concatenated fallback; synthesis is never fatal.
    async fn synthesize(
        &self,
        job: &DeliberationJob,
        aggregate: &[u64],
        slots: &[SlotOutcome],
    ) -> String {
        let prompt = justifier_prompt(job, aggregate, slots);
        let fallback = || fallback_justification(slots);

        let Some(adapter) = self.registry.get(&self.cfg.justifier_provider) else {
            warn!(provider = %self.cfg.justifier_provider, "justifier provider not configured; using fallback justification");
            return fallback();
        };
        match tokio::time::timeout(
            self.cfg.justifier_timeout,
            adapter.generate(&prompt, &self.cfg.justifier_model, GenOptions::default()),
        )
        .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                warn!("justifier returned empty text; using fallback justification");
                fallback()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "justifier failed; using fallback justification");
                fallback()
            }
            Err(_) => {
                warn!(timeout = ?self.cfg.justifier_timeout, "justifier deadline expired; using fallback justification");
                fallback()
            }
        }
    }
}

fn parse_failure_reason(e: &ParseError, raw: &str) -> String {
    let mut snippet: String = raw.chars().take(200).collect();
    if snippet.len() < raw.len() {
        snippet.push('…');
    }
    format!("{e}; raw response: {snippet}")
}

/// Component-wise floor average of parsed vectors, in call order.
fn floor_average(vectors: &[Vec<u64>], k: usize) -> Vec<u64> {
    let n = vectors.len() as u64;
    (0..k)
        .map(|i| vectors.iter().map(|v| v[i]).sum::<u64>() / n)
        .collect()
}

/// Weight-normalized average over successful slots, topped up to the
/// denominator by largest remainder.
fn aggregate_iteration(slots: &[SlotOutcome], k: usize) -> Vec<u64> {
    let successful: Vec<&SlotOutcome> = slots.iter().filter(|s| !s.failed).collect();
    let total_weight: f64 = successful.iter().map(|s| s.weight).sum();
    if successful.is_empty() || total_weight <= 0.0 {
        return fallback_vector(k);
    }
    let shares: Vec<f64> = (0..k)
        .map(|i| {
            successful
                .iter()
                .map(|s| s.vector[i] as f64 * s.weight)
                .sum::<f64>()
                / total_weight
        })
        .collect();
    normalize_to_denom(&shares)
}

/// Preamble instructing a juror how to answer, then the composed prompt;
/// from the second iteration on, the previous round's answers.
fn build_iteration_prompt(job: &DeliberationJob, iteration: u32, previous: &[SlotOutcome]) -> String {
    let mut p = String::new();
    p.push_str("You are one juror on a panel deciding between the following outcomes:\n");
    for (i, o) in job.outcomes.iter().enumerate() {
        p.push_str(&format!("{}. {}\n", i + 1, o));
    }
    p.push_str(&format!(
        "Respond with a single JSON object {{\"score\": [...], \"justification\": \"...\"}} \
         where score has exactly {} non-negative integer entries, ordered as above, \
         summing to exactly {}.\n\n",
        job.outcomes.len(),
        SCORE_DENOM
    ));
    p.push_str(&job.prompt);
    if iteration > 1 && !previous.is_empty() {
        p.push_str("\n\nPrevious deliberation round:\n");
        for s in previous {
            p.push_str(&format!(
                "{}:{} scored {:?}: {}\n",
                s.provider, s.model, s.vector, s.justification
            ));
        }
        p.push_str("Reconsider your verdict in light of the other jurors' answers.\n");
    }
    p
}

fn justifier_prompt(job: &DeliberationJob, aggregate: &[u64], slots: &[SlotOutcome]) -> String {
    let mut p = String::new();
    p.push_str(
        "Write a single consolidated justification for the jury verdict below. \
         Do not mention individual models by name; synthesize their reasoning.\n\nOutcomes and aggregated scores:\n",
    );
    for (o, s) in job.outcomes.iter().zip(aggregate) {
        p.push_str(&format!("- {o}: {s}\n"));
    }
    p.push_str("\nIndividual juror rationales:\n");
    for s in slots {
        p.push_str(&format!("---\n{}\n", s.justification));
    }
    p
}

fn fallback_justification(slots: &[SlotOutcome]) -> String {
    let mut out = String::from(
        "Aggregated verdict from the jury. Individual juror rationales follow.\n",
    );
    for s in slots {
        out.push_str(&format!("\n[{}:{}] {}", s.provider, s.model, s.justification));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ModelProvider, ProviderError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted provider: per-model reply sequences plus a call log.
    struct MockProvider {
        name: String,
        replies: Mutex<HashMap<String, Vec<Reply>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    #[derive(Clone)]
    enum Reply {
        Text(String),
        Sleep(Duration),
        Fail,
    }

    impl MockProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.into(),
                replies: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn script(self, model: &str, replies: Vec<Reply>) -> Self {
            self.replies.lock().unwrap().insert(model.into(), replies);
            self
        }

        fn calls_for(&self, model: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == model)
                .count()
        }

        fn prompts_for(&self, model: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == model)
                .map(|(_, p)| p.clone())
                .collect()
        }

        fn next_reply(&self, model: &str) -> Reply {
            let mut replies = self.replies.lock().unwrap();
            let seq = replies.get_mut(model).expect("unscripted model");
            if seq.len() > 1 {
                seq.remove(0)
            } else {
                seq[0].clone()
            }
        }
    }

    #[async_trait]
    impl ModelProvider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(
            &self,
            prompt: &str,
            model: &str,
            _opts: GenOptions,
        ) -> Result<String, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), prompt.to_string()));
            match self.next_reply(model) {
                Reply::Text(t) => Ok(t),
                Reply::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(verdict_json(&[500_000, 500_000], "late"))
                }
                Reply::Fail => Err(ProviderError::Unavailable("scripted failure".into())),
            }
        }

        async fn generate_with_attachments(
            &self,
            prompt: &str,
            model: &str,
            _attachments: &[crate::attach::Attachment],
            opts: GenOptions,
        ) -> Result<String, ProviderError> {
            self.generate(prompt, model, opts).await
        }
    }

    fn verdict_json(score: &[u64], justification: &str) -> String {
        serde_json::json!({ "score": score, "justification": justification }).to_string()
    }

    fn job(slots: Vec<JurySlot>, iterations: u32) -> DeliberationJob {
        DeliberationJob {
            prompt: "Decide the case.".into(),
            outcomes: vec!["outcome1".into(), "outcome2".into()],
            jury: slots,
            iterations,
            attachments: Vec::new(),
            references: Vec::new(),
        }
    }

    fn slot(model: &str, weight: f64, count: u32) -> JurySlot {
        JurySlot {
            provider: "Mock".into(),
            model: model.into(),
            weight,
            count,
        }
    }

    fn engine_with(mock: MockProvider, cfg: JuryConfig) -> (JuryEngine, std::sync::Arc<MockProvider>) {
        let mock = std::sync::Arc::new(mock);
        let mut registry = ProviderRegistry::new();
        registry.insert(mock.clone());
        (JuryEngine::new(registry, cfg), mock)
    }

    fn fast_cfg() -> JuryConfig {
        JuryConfig {
            model_timeout: Duration::from_millis(200),
            justifier_timeout: Duration::from_millis(200),
            justifier_provider: "Mock".into(),
            justifier_model: "judge".into(),
            ..JuryConfig::default()
        }
    }

    #[tokio::test]
    async fn weighted_two_model_aggregate() {
        // Weights 0.6/0.4; A → [700000,300000], B → [200000,800000];
        // expected [500000, 500000].
        let mock = MockProvider::new("Mock")
            .script("a", vec![Reply::Text(verdict_json(&[700_000, 300_000], "A says 1"))])
            .script("b", vec![Reply::Text(verdict_json(&[200_000, 800_000], "B says 2"))])
            .script("judge", vec![Reply::Text("The panel weighed both accounts.".into())]);
        let (engine, _) = engine_with(mock, fast_cfg());
        let result = engine
            .deliberate(&job(vec![slot("a", 0.6, 1), slot("b", 0.4, 1)], 1))
            .await
            .unwrap();
        let scores: Vec<u64> = result.scores.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![500_000, 500_000]);
        assert_eq!(scores.iter().sum::<u64>(), SCORE_DENOM);
        assert_eq!(result.justification, "The panel weighed both accounts.");
        assert!(result.slots.iter().all(|s| s.state == SlotState::Success));
    }

    #[tokio::test]
    async fn timed_out_slot_renormalizes_survivors() {
        // Weights 0.5/0.3/0.2; B times out. Survivors renormalize to
        // 5/7 and 2/7; largest-remainder lands on [685714, 314286].
        let mock = MockProvider::new("Mock")
            .script("a", vec![Reply::Text(verdict_json(&[800_000, 200_000], "A"))])
            .script("b", vec![Reply::Sleep(Duration::from_secs(5))])
            .script("c", vec![Reply::Text(verdict_json(&[400_000, 600_000], "C"))])
            .script("judge", vec![Reply::Text("Synthesized.".into())]);
        let (engine, _) = engine_with(mock, fast_cfg());
        let result = engine
            .deliberate(&job(
                vec![slot("a", 0.5, 1), slot("b", 0.3, 1), slot("c", 0.2, 1)],
                1,
            ))
            .await
            .unwrap();
        let scores: Vec<u64> = result.scores.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![685_714, 314_286]);
        assert_eq!(scores.iter().sum::<u64>(), SCORE_DENOM);
        assert_eq!(result.slots[1].state, SlotState::TimedOut);
        assert!(result.slots[1].failed);
    }

    #[tokio::test]
    async fn quorum_failure_lists_failed_slots() {
        let mock = MockProvider::new("Mock")
            .script("a", vec![Reply::Text(verdict_json(&[800_000, 200_000], "A"))])
            .script("b", vec![Reply::Sleep(Duration::from_secs(5))])
            .script("c", vec![Reply::Sleep(Duration::from_secs(5))])
            .script("judge", vec![Reply::Text("unused".into())]);
        let (engine, _) = engine_with(mock, fast_cfg());
        let err = engine
            .deliberate(&job(
                vec![slot("a", 0.5, 1), slot("b", 0.3, 1), slot("c", 0.2, 1)],
                1,
            ))
            .await
            .unwrap_err();
        match err {
            JuryError::InsufficientModels {
                succeeded,
                required,
                total,
                failures,
            } => {
                assert_eq!((succeeded, required, total), (1, 2, 3));
                let labels: Vec<&str> = failures.iter().map(|f| f.slot.as_str()).collect();
                assert_eq!(labels, vec!["Mock:b", "Mock:c"]);
            }
            other => panic!("expected InsufficientModels, got {other}"),
        }
    }

    #[tokio::test]
    async fn count_loop_issues_serial_calls_and_floor_averages() {
        let mock = MockProvider::new("Mock")
            .script(
                "a",
                vec![
                    Reply::Text(verdict_json(&[600_000, 400_000], "first")),
                    Reply::Text(verdict_json(&[500_000, 500_000], "second")),
                    Reply::Text(verdict_json(&[400_000, 600_000], "third")),
                ],
            )
            .script("judge", vec![Reply::Text("done".into())]);
        let (engine, mock) = engine_with(mock, fast_cfg());
        let result = engine.deliberate(&job(vec![slot("a", 1.0, 3)], 1)).await.unwrap();
        assert_eq!(mock.calls_for("a"), 3);
        let scores: Vec<u64> = result.scores.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![500_000, 500_000]);
        // All three justifications fold into the slot.
        assert!(result.slots[0].justification.contains("first"));
        assert!(result.slots[0].justification.contains("third"));
    }

    #[tokio::test]
    async fn wrong_length_vector_triggers_fallback() {
        let mock = MockProvider::new("Mock")
            .script(
                "a",
                vec![Reply::Text(verdict_json(&[500_000, 300_000, 200_000], "3-way"))],
            )
            .script("b", vec![Reply::Text(verdict_json(&[600_000, 400_000], "B"))])
            .script("judge", vec![Reply::Text("done".into())]);
        let (engine, _) = engine_with(mock, fast_cfg());
        let result = engine
            .deliberate(&job(vec![slot("a", 0.5, 1), slot("b", 0.5, 1)], 1))
            .await
            .unwrap();
        let a = &result.slots[0];
        assert_eq!(a.state, SlotState::Fallback);
        assert!(a.failed);
        assert_eq!(a.vector, fallback_vector(2));
        assert!(a.justification.contains("Mock:a"));
        assert!(a.failure_reason.as_deref().unwrap().contains("raw response"));
        // Only B's vector aggregates.
        let scores: Vec<u64> = result.scores.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![600_000, 400_000]);
    }

    #[tokio::test]
    async fn justifier_timeout_degrades_to_fallback() {
        let mock = MockProvider::new("Mock")
            .script("a", vec![Reply::Text(verdict_json(&[900_000, 100_000], "open and shut"))])
            .script("judge", vec![Reply::Sleep(Duration::from_secs(5))]);
        let (engine, _) = engine_with(mock, fast_cfg());
        let result = engine.deliberate(&job(vec![slot("a", 1.0, 1)], 1)).await.unwrap();
        let scores: Vec<u64> = result.scores.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![900_000, 100_000]);
        assert!(result.justification.contains("open and shut"));
        assert!(result.justification.contains("Mock:a"));
    }

    #[tokio::test]
    async fn provider_error_then_success_within_count() {
        let mock = MockProvider::new("Mock")
            .script(
                "a",
                vec![
                    Reply::Fail,
                    Reply::Text(verdict_json(&[700_000, 300_000], "recovered")),
                ],
            )
            .script("judge", vec![Reply::Text("done".into())]);
        let (engine, _) = engine_with(mock, fast_cfg());
        let result = engine.deliberate(&job(vec![slot("a", 1.0, 2)], 1)).await.unwrap();
        assert_eq!(result.slots[0].state, SlotState::Success);
        let scores: Vec<u64> = result.scores.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![700_000, 300_000]);
    }

    #[tokio::test]
    async fn second_iteration_sees_first_round_outputs() {
        let mock = MockProvider::new("Mock")
            .script(
                "a",
                vec![
                    Reply::Text(verdict_json(&[1_000_000, 0], "round one reasoning")),
                    Reply::Text(verdict_json(&[800_000, 200_000], "round two reasoning")),
                ],
            )
            .script("judge", vec![Reply::Text("done".into())]);
        let (engine, mock) = engine_with(mock, fast_cfg());
        let result = engine.deliberate(&job(vec![slot("a", 1.0, 1)], 2)).await.unwrap();
        let prompts = mock.prompts_for("a");
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("Previous deliberation round"));
        assert!(prompts[1].contains("Previous deliberation round"));
        assert!(prompts[1].contains("round one reasoning"));
        // Final aggregate comes from the last iteration.
        let scores: Vec<u64> = result.scores.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![800_000, 200_000]);
    }

    #[test]
    fn fallback_vector_distributes_remainder_to_index_zero() {
        assert_eq!(fallback_vector(2), vec![500_000, 500_000]);
        assert_eq!(fallback_vector(3), vec![333_334, 333_333, 333_333]);
        assert_eq!(fallback_vector(3).iter().sum::<u64>(), SCORE_DENOM);
    }

    #[test]
    fn normalization_hits_denominator_exactly() {
        // 1/3 splits floor to 999,999; one unit tops up the largest
        // fractional part (ties toward lower index).
        let v = normalize_to_denom(&[333_333.33, 333_333.33, 333_333.33]);
        assert_eq!(v.iter().sum::<u64>(), SCORE_DENOM);
        assert_eq!(v, vec![333_334, 333_333, 333_333]);
        // Exact shares pass through untouched.
        assert_eq!(
            normalize_to_denom(&[500_000.0, 500_000.0]),
            vec![500_000, 500_000]
        );
    }
}
