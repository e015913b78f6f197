//! Rubric Gate
//!
//! Multi-criterion verification of evolved code variants: correctness,
//! quality, robustness, and generalization under configured weights,
//! plus a shortcut detector for variants that game the benchmark
//! instead of solving the task.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AgencyError, AgencyResult};

/// Verification weights; must sum to 1.0 within 1%.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    pub correctness_weight: f64,
    pub quality_weight: f64,
    pub robustness_weight: f64,
    pub generalization_weight: f64,
    pub num_edge_cases: usize,
    pub shortcut_detection_enabled: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            correctness_weight: 0.4,
            quality_weight: 0.3,
            robustness_weight: 0.2,
            generalization_weight: 0.1,
            num_edge_cases: 5,
            shortcut_detection_enabled: true,
        }
    }
}

impl VerifierConfig {
    pub fn validate(&self) -> AgencyResult<()> {
        let total = self.correctness_weight
            + self.quality_weight
            + self.robustness_weight
            + self.generalization_weight;
        if (total - 1.0).abs() > 0.01 {
            return Err(AgencyError::Configuration(format!(
                "verifier weights must sum to 1.0, got {:.3}",
                total
            )));
        }
        if self.num_edge_cases < 1 {
            return Err(AgencyError::Configuration(format!(
                "num_edge_cases must be >= 1, got {}",
                self.num_edge_cases
            )));
        }
        Ok(())
    }
}

/// One structured feedback item for the variant generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierFeedback {
    pub area: String,
    pub confidence: f64,
    /// "high" | "medium" | "low"
    pub severity: String,
    pub message: String,
}

/// Full result of one verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verification_score: f64,
    pub correctness_score: f64,
    pub quality_score: f64,
    pub robustness_score: f64,
    pub generalization_score: f64,
    pub feedback: Vec<VerifierFeedback>,
    pub shortcuts_detected: Vec<String>,
    pub verdict: String,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.verdict != "fail"
    }

    /// Reward multiplier applied to the raw benchmark delta.
    /// Shortcuts zero the reward; otherwise it tracks the rubric score.
    pub fn reward(&self) -> f64 {
        if !self.shortcuts_detected.is_empty() {
            return 0.0;
        }
        self.verification_score.clamp(0.0, 1.0)
    }
}

/// Candidate handed to the verifier.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub code: &'a str,
    pub task_description: &'a str,
    /// Benchmark score already measured for this candidate
    pub benchmark_score: f64,
    /// Free-text strategy description, used for overfitting signals
    pub strategy: &'a str,
}

lazy_static! {
    static ref EARLY_RETURN: Regex =
        Regex::new(r"def \w+\([^)]*\):\s*return").expect("static regex");
    static ref SINGLE_LETTER_ASSIGN: Regex = Regex::new(r"\b[a-z]\s*=").expect("static regex");
    static ref ANY_ASSIGN: Regex = Regex::new(r"\b\w+\s*=").expect("static regex");
}

/// Rubric-gate verifier for evolved variants.
pub struct RubricVerifier {
    config: VerifierConfig,
}

impl RubricVerifier {
    pub fn new(config: VerifierConfig) -> AgencyResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: VerifierConfig::default(),
        }
    }

    /// Evaluate a candidate across all four criteria.
    pub fn verify(&self, candidate: &Candidate<'_>) -> VerificationResult {
        let correctness = candidate.benchmark_score.clamp(0.0, 1.0);
        let quality = self.evaluate_quality(candidate.code);
        let robustness = self.evaluate_robustness(candidate.code);
        let generalization = self.evaluate_generalization(candidate);

        let shortcuts = if self.config.shortcut_detection_enabled {
            self.detect_shortcuts(candidate)
        } else {
            Vec::new()
        };

        let verification_score = self.config.correctness_weight * correctness
            + self.config.quality_weight * quality
            + self.config.robustness_weight * robustness
            + self.config.generalization_weight * generalization;

        let feedback = self.generate_feedback(correctness, quality, robustness, generalization, &shortcuts);

        // Shortcuts or a very low rubric score fail the gate outright
        let verdict = if !shortcuts.is_empty() || verification_score < 0.3 {
            "fail"
        } else if verification_score < 0.6 {
            "borderline"
        } else {
            "pass"
        };

        debug!(
            "verification: score={:.3} correctness={:.3} quality={:.3} robustness={:.3} \
             generalization={:.3} shortcuts={}",
            verification_score,
            correctness,
            quality,
            robustness,
            generalization,
            shortcuts.len()
        );

        VerificationResult {
            verification_score,
            correctness_score: correctness,
            quality_score: quality,
            robustness_score: robustness,
            generalization_score: generalization,
            feedback,
            shortcuts_detected: shortcuts,
            verdict: verdict.to_string(),
        }
    }

    /// Deduction-based quality score: structure, documentation, naming,
    /// error handling.
    fn evaluate_quality(&self, code: &str) -> f64 {
        let mut score: f64 = 1.0;

        if code.len() < 10 {
            score -= 0.3;
        } else if code.len() > 10_000 {
            score -= 0.2;
        }

        let has_comments = code.contains('#') || code.contains("\"\"\"") || code.contains("'''");
        if !has_comments {
            score -= 0.1;
        }

        let has_structure = code.contains("def ") || code.contains("class ");
        if !has_structure {
            score -= 0.2;
        }

        let single = SINGLE_LETTER_ASSIGN.find_iter(code).count();
        let total = ANY_ASSIGN.find_iter(code).count();
        if total > 0 && (single as f64 / total as f64) > 0.5 {
            score -= 0.1;
        }

        let has_error_handling = code.contains("try:") || code.contains("except");
        if !has_error_handling && code.len() > 100 {
            score -= 0.1;
        }

        score.clamp(0.0, 1.0)
    }

    /// Robustness proxy: boundary checks and defensive constructs.
    fn evaluate_robustness(&self, code: &str) -> f64 {
        let mut score: f64 = 0.5;
        if code.contains("if ") {
            score += 0.1;
        }
        if code.contains("try:") || code.contains("except") {
            score += 0.2;
        }
        if code.contains("is None") || code.contains("not ") {
            score += 0.1;
        }
        if code.contains("raise ") {
            score += 0.1;
        }
        score.clamp(0.0, 1.0)
    }

    /// Overfitting signals in strategy text and code.
    fn evaluate_generalization(&self, candidate: &Candidate<'_>) -> f64 {
        let mut score: f64 = 0.8;
        let strategy = candidate.strategy.to_lowercase();

        if ["specific", "hardcoded", "fixed", "constant"]
            .iter()
            .any(|k| strategy.contains(k))
        {
            score -= 0.3;
        }
        if ["general", "generic", "flexible", "abstract"]
            .iter()
            .any(|k| strategy.contains(k))
        {
            score += 0.1;
        }

        // Task description copied into code is an overfitting tell
        let task_words: Vec<&str> = candidate.task_description.split_whitespace().take(5).collect();
        if task_words.len() >= 3 {
            let probe = task_words.join(" ").to_lowercase();
            if candidate.code.to_lowercase().contains(&probe) {
                score -= 0.2;
            }
        }

        if candidate.code.contains("def ") && candidate.code.contains('(') {
            score += 0.1;
        }

        score.clamp(0.0, 1.0)
    }

    /// Patterns where the variant games the benchmark instead of
    /// solving the task.
    fn detect_shortcuts(&self, candidate: &Candidate<'_>) -> Vec<String> {
        let code = candidate.code;
        let mut shortcuts = Vec::new();

        let suspicious_literals = ["return 42", "return \"result\"", "return 'result'", "return \"output\""];
        if suspicious_literals.iter().any(|l| code.contains(l)) {
            shortcuts.push("hardcoded_values".to_string());
        }

        let test_detection = [
            "if test_mode",
            "if benchmark",
            "if __test__",
            "if testing",
            "if is_test",
        ];
        if test_detection.iter().any(|p| code.contains(p)) {
            shortcuts.push("test_mode_detection".to_string());
        }

        let code_lines = code
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim().starts_with('#'))
            .count();
        if code_lines < 3 {
            shortcuts.push("trivial_implementation".to_string());
        }

        if candidate.task_description.len() > 20 {
            let probe = candidate.task_description[..20].to_lowercase();
            if code.to_lowercase().contains(&probe) {
                shortcuts.push("task_specific_overfitting".to_string());
            }
        }

        if code.contains("expected_output") || code.contains("test_result") || code.contains("known_answer")
        {
            shortcuts.push("test_data_access".to_string());
        }

        if EARLY_RETURN.is_match(code) {
            shortcuts.push("early_return_without_computation".to_string());
        }

        if !shortcuts.is_empty() {
            warn!("shortcuts detected: {:?}", shortcuts);
        }
        shortcuts
    }

    fn generate_feedback(
        &self,
        correctness: f64,
        quality: f64,
        robustness: f64,
        generalization: f64,
        shortcuts: &[String],
    ) -> Vec<VerifierFeedback> {
        let mut feedback = Vec::new();

        if correctness < 0.8 {
            feedback.push(VerifierFeedback {
                area: "correctness".to_string(),
                confidence: 1.0 - correctness,
                severity: "high".to_string(),
                message: format!(
                    "Test pass rate low: {:.1}%. Review failing tests and fix logic errors.",
                    correctness * 100.0
                ),
            });
        }
        if quality < 0.7 {
            feedback.push(VerifierFeedback {
                area: "quality".to_string(),
                confidence: 1.0 - quality,
                severity: "medium".to_string(),
                message: format!(
                    "Code quality issues: {:.1}%. Improve structure, documentation, and naming.",
                    quality * 100.0
                ),
            });
        }
        if robustness < 0.6 {
            feedback.push(VerifierFeedback {
                area: "robustness".to_string(),
                confidence: 1.0 - robustness,
                severity: "medium".to_string(),
                message: format!(
                    "Edge case handling weak: {:.1}%. Add boundary checks and error handling.",
                    robustness * 100.0
                ),
            });
        }
        if generalization < 0.5 {
            feedback.push(VerifierFeedback {
                area: "generalization".to_string(),
                confidence: 1.0 - generalization,
                severity: "low".to_string(),
                message: format!(
                    "Overfitting detected: {:.1}%. Make the solution more generic.",
                    generalization * 100.0
                ),
            });
        }
        for shortcut in shortcuts {
            feedback.push(VerifierFeedback {
                area: "shortcuts".to_string(),
                confidence: 1.0,
                severity: "high".to_string(),
                message: format!(
                    "Shortcut detected: {}. Implement a proper solution without workarounds.",
                    shortcut
                ),
            });
        }

        feedback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HONEST_CODE: &str = r#"
def normalize(values):
    """Scale values into [0, 1]."""
    if not values:
        return []
    low = min(values)
    high = max(values)
    if high == low:
        return [0.0 for _ in values]
    try:
        return [(v - low) / (high - low) for v in values]
    except TypeError:
        raise ValueError("values must be numeric")
"#;

    fn candidate(code: &str, score: f64) -> Candidate<'_> {
        Candidate {
            code,
            task_description: "Normalize a list of numeric values into the unit interval",
            benchmark_score: score,
            strategy: "generic scaling approach",
        }
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let bad = VerifierConfig {
            correctness_weight: 0.9,
            ..VerifierConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(VerifierConfig::default().validate().is_ok());
    }

    #[test]
    fn test_honest_code_passes() {
        let verifier = RubricVerifier::with_defaults();
        let result = verifier.verify(&candidate(HONEST_CODE, 0.9));
        assert!(result.shortcuts_detected.is_empty());
        assert!(result.passed());
        assert!(result.reward() > 0.5);
    }

    #[test]
    fn test_hardcoded_output_is_a_shortcut() {
        let verifier = RubricVerifier::with_defaults();
        let code = "def solve(x):\n    return 42\n";
        let result = verifier.verify(&candidate(code, 1.0));
        assert!(result
            .shortcuts_detected
            .contains(&"hardcoded_values".to_string()));
        assert_eq!(result.verdict, "fail");
        assert_eq!(result.reward(), 0.0);
    }

    #[test]
    fn test_test_mode_branch_is_a_shortcut() {
        let verifier = RubricVerifier::with_defaults();
        let code = "def solve(x):\n    if test_mode:\n        return expected\n    return compute(x)\n";
        let result = verifier.verify(&candidate(code, 1.0));
        assert!(result
            .shortcuts_detected
            .contains(&"test_mode_detection".to_string()));
    }

    #[test]
    fn test_trivial_implementation_is_a_shortcut() {
        let verifier = RubricVerifier::with_defaults();
        let result = verifier.verify(&candidate("pass", 0.5));
        assert!(result
            .shortcuts_detected
            .contains(&"trivial_implementation".to_string()));
    }

    #[test]
    fn test_test_data_access_is_a_shortcut() {
        let verifier = RubricVerifier::with_defaults();
        let code =
            "def solve(x):\n    value = expected_output[x]\n    print(value)\n    return value\n";
        let result = verifier.verify(&candidate(code, 1.0));
        assert!(result
            .shortcuts_detected
            .contains(&"test_data_access".to_string()));
    }

    #[test]
    fn test_low_correctness_generates_feedback() {
        let verifier = RubricVerifier::with_defaults();
        let result = verifier.verify(&candidate(HONEST_CODE, 0.4));
        assert!(result
            .feedback
            .iter()
            .any(|f| f.area == "correctness" && f.severity == "high"));
    }

    #[test]
    fn test_weighted_score_formula() {
        let verifier = RubricVerifier::with_defaults();
        let result = verifier.verify(&candidate(HONEST_CODE, 1.0));
        let expected = 0.4 * result.correctness_score
            + 0.3 * result.quality_score
            + 0.2 * result.robustness_score
            + 0.1 * result.generalization_score;
        assert!((result.verification_score - expected).abs() < 1e-9);
    }
}
