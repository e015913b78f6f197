//! Agent Module
//!
//! Agent profiles, LLM providers, the self-correction loop, and the
//! refinement terminator that wraps iterative generation.

mod correction;
mod provider;
mod refinement;
mod types;

pub use correction::{
    CorrectionAttempt, CorrectionOutcome, CorrectionStats, Executor, ExecutorOn, QaEvaluator,
    QAFeedback, SelfCorrectingExecutor, ValidationCategory, ValidationIssue,
};
pub use provider::{LLMProvider, OpenAICompatibleProvider, ScriptedProvider};
pub use refinement::{
    RefinementConfig, RefinementRound, RefinementSavings, RefinementTerminator,
    TerminationDecision,
};
pub use types::{AgentProfile, AgentRegistry};

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FENCED_JSON: Regex =
        Regex::new(r"(?is)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex");
}

/// Parse JSON from raw LLM output.
///
/// Two-step fallback: direct parse, then the first markdown-fenced object.
/// Returns None when neither yields valid JSON; callers fall back to
/// heuristics from there.
pub fn parse_json_output(raw: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str(raw.trim()) {
        return Some(value);
    }
    if let Some(caps) = FENCED_JSON.captures(raw) {
        if let Ok(value) = serde_json::from_str(caps.get(1)?.as_str()) {
            return Some(value);
        }
    }
    // Bare object embedded in prose
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        serde_json::from_str(&raw[start..=end]).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_direct_json() {
        let value = parse_json_output(r#"{"valid": true}"#).unwrap();
        assert_eq!(value["valid"], true);
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "Here you go:\n```json\n{\"valid\": false, \"confidence\": 0.4}\n```\nDone.";
        let value = parse_json_output(raw).unwrap();
        assert_eq!(value["confidence"], 0.4);
    }

    #[test]
    fn test_parse_embedded_object() {
        let raw = "The verdict is {\"valid\": true} as requested.";
        let value = parse_json_output(raw).unwrap();
        assert_eq!(value["valid"], true);
    }

    #[test]
    fn test_parse_garbage_returns_none() {
        assert!(parse_json_output("no json here").is_none());
        assert!(parse_json_output("{broken").is_none());
    }
}
