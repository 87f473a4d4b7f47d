//! Model-response parsing
//!
//! A raw model response must yield `{score, justification}`. Models are
//! instructed to answer with a JSON object, but real-world outputs wander:
//! code fences, prose around the object, a legacy line format, and
//! justification strings containing unescaped quotes. The parser tries five
//! strategies, strictest first:
//!
//! 1. the whole response is the JSON object;
//! 2. the object sits inside a fenced code block;
//! 3. any embedded balanced-brace object of the right shape;
//! 4. the legacy `SCORE: a,b,c` / `JUSTIFICATION: …` line format;
//! 5. a last-resort regex extractor that tolerates unescaped quotes inside
//!    the justification value.
//!
//! Whatever strategy produces the candidate, the score vector must be an
//! integer array of length K, all entries non-negative, summing to exactly
//! 1,000,000. Any violation is a parse failure; the jury engine substitutes
//! its fallback vector and marks the slot failed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::SCORE_DENOM;

/// A parsed and validated model verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Score vector of length K summing to [`SCORE_DENOM`].
    pub score: Vec<u64>,
    /// Free-text justification.
    pub justification: String,
}

/// Errors surfaced by verdict parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// No strategy produced a structurally valid candidate.
    #[error("no parseable verdict in model response")]
    Unparseable,
    /// A candidate was found but its score vector violates the contract.
    #[error("score vector invalid: {0}")]
    BadScore(String),
}

#[derive(Deserialize)]
struct RawVerdict {
    score: Vec<i64>,
    justification: String,
}

static FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex"));
static LEGACY_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^\s*SCORE\s*:\s*([0-9,\s]+)$").expect("static regex"));
static LEGACY_JUST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)JUSTIFICATION\s*:\s*(.+)\z").expect("static regex"));
static LENIENT_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""score"\s*:\s*\[([^\]]*)\]"#).expect("static regex"));
static LENIENT_JUST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)"justification"\s*:\s*"(.*)""#).expect("static regex"));

/// Parse a raw model response into a verdict for K outcomes.
pub fn parse_verdict(raw: &str, k: usize) -> Result<Verdict, ParseError> {
    // 1. Whole-response JSON.
    if let Ok(v) = serde_json::from_str::<RawVerdict>(raw.trim()) {
        return validate(v, k);
    }
    // 2. Fenced code block.
    for cap in FENCED.captures_iter(raw) {
        if let Ok(v) = serde_json::from_str::<RawVerdict>(&cap[1]) {
            return validate(v, k);
        }
    }
    // 3. Embedded balanced object.
    for candidate in embedded_objects(raw) {
        if let Ok(v) = serde_json::from_str::<RawVerdict>(candidate) {
            return validate(v, k);
        }
    }
    // 4. Legacy line format.
    if let (Some(score), Some(just)) = (LEGACY_SCORE.captures(raw), LEGACY_JUST.captures(raw)) {
        let nums: Result<Vec<i64>, _> = score[1]
            .split(',')
            .map(|s| s.trim().parse::<i64>())
            .collect();
        if let Ok(nums) = nums {
            return validate(
                RawVerdict {
                    score: nums,
                    justification: just[1].trim().to_string(),
                },
                k,
            );
        }
    }
    // 5. Lenient extraction: survives unescaped quotes in the justification.
    if let (Some(score), Some(just)) = (LENIENT_SCORE.captures(raw), LENIENT_JUST.captures(raw)) {
        let nums: Result<Vec<i64>, _> = score[1]
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().parse::<i64>())
            .collect();
        if let Ok(nums) = nums {
            return validate(
                RawVerdict {
                    score: nums,
                    justification: just[1].trim().to_string(),
                },
                k,
            );
        }
    }
    Err(ParseError::Unparseable)
}

/// Balanced-brace substrings that mention `"score"`, left to right.
/// String literals and escapes are honored so braces inside justification
/// text do not derail the scan. Candidate count is capped; a response that
/// buries the object deeper than that is treated as unparseable.
fn embedded_objects(raw: &str) -> Vec<&str> {
    const MAX_CANDIDATES: usize = 32;
    let bytes = raw.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() && found.len() < MAX_CANDIDATES {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let mut depth = 0usize;
        let mut in_str = false;
        let mut escaped = false;
        let mut end = None;
        for (j, &b) in bytes[i..].iter().enumerate() {
            if in_str {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_str = false;
                }
                continue;
            }
            match b {
                b'"' => in_str = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i + j + 1);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                let candidate = &raw[i..end];
                if candidate.contains("\"score\"") {
                    found.push(candidate);
                }
                i += 1;
            }
            None => break,
        }
    }
    found
}

fn validate(v: RawVerdict, k: usize) -> Result<Verdict, ParseError> {
    if v.score.len() != k {
        return Err(ParseError::BadScore(format!(
            "expected {k} entries, got {}",
            v.score.len()
        )));
    }
    if v.score.iter().any(|&s| s < 0) {
        return Err(ParseError::BadScore("negative entry".into()));
    }
    let sum: i64 = v.score.iter().sum();
    if sum != SCORE_DENOM as i64 {
        return Err(ParseError::BadScore(format!(
            "sum {sum} != {SCORE_DENOM}"
        )));
    }
    Ok(Verdict {
        score: v.score.into_iter().map(|s| s as u64).collect(),
        justification: v.justification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_response_json() {
        let v = parse_verdict(
            r#"{"score":[700000,300000],"justification":"clear breach"}"#,
            2,
        )
        .unwrap();
        assert_eq!(v.score, vec![700_000, 300_000]);
        assert_eq!(v.justification, "clear breach");
    }

    #[test]
    fn fenced_code_block() {
        let raw = "Here is my analysis.\n```json\n{\"score\":[500000,500000],\"justification\":\"even\"}\n```\nThanks.";
        let v = parse_verdict(raw, 2).unwrap();
        assert_eq!(v.score, vec![500_000, 500_000]);
    }

    #[test]
    fn embedded_object_in_prose() {
        let raw = "After weighing the evidence I conclude {\"score\":[1000000,0],\"justification\":\"one-sided {fully}\"} as shown.";
        let v = parse_verdict(raw, 2).unwrap();
        assert_eq!(v.score, vec![1_000_000, 0]);
        assert_eq!(v.justification, "one-sided {fully}");
    }

    #[test]
    fn legacy_line_format() {
        let raw = "SCORE: 250000, 750000\nJUSTIFICATION: the defendant's account held up";
        let v = parse_verdict(raw, 2).unwrap();
        assert_eq!(v.score, vec![250_000, 750_000]);
        assert_eq!(v.justification, "the defendant's account held up");
    }

    #[test]
    fn lenient_survives_unescaped_quotes() {
        let raw = r#"{"score":[600000,400000],"justification":"He said "no" and left"}"#;
        let v = parse_verdict(raw, 2).unwrap();
        assert_eq!(v.score, vec![600_000, 400_000]);
        assert_eq!(v.justification, r#"He said "no" and left"#);
    }

    #[test]
    fn wrong_length_vector_is_a_parse_failure() {
        let err = parse_verdict(
            r#"{"score":[500000,300000,200000],"justification":"three-way"}"#,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::BadScore(_)));
    }

    #[test]
    fn wrong_sum_is_a_parse_failure() {
        let err = parse_verdict(r#"{"score":[500000,400000],"justification":"short"}"#, 2)
            .unwrap_err();
        assert!(matches!(err, ParseError::BadScore(_)));
    }

    #[test]
    fn negative_entry_is_a_parse_failure() {
        let err = parse_verdict(r#"{"score":[1100000,-100000],"justification":"x"}"#, 2)
            .unwrap_err();
        assert!(matches!(err, ParseError::BadScore(_)));
    }

    #[test]
    fn prose_without_verdict_is_unparseable() {
        let err = parse_verdict("I cannot decide this case.", 2).unwrap_err();
        assert!(matches!(err, ParseError::Unparseable));
    }
}
