//! Self-Correction Loop
//!
//! QA-gated regeneration around any executor: generate a solution,
//! validate it before publish, regenerate from the structured feedback,
//! bounded by a maximum attempt count.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::parse_json_output;

/// Anything that can produce a solution for a task prompt.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &str) -> Result<String>;
}

/// Anything that can judge a solution and answer with QA feedback text.
#[async_trait]
pub trait QaEvaluator: Send + Sync {
    async fn validate(&self, prompt: &str) -> Result<String>;
}

/// Adapter running an [`crate::agent::LLMProvider`] as an executor.
pub struct ExecutorOn<P: ?Sized> {
    pub provider: Arc<P>,
    pub model: String,
    pub system: Option<String>,
}

#[async_trait]
impl<P: crate::agent::LLMProvider + ?Sized> Executor for ExecutorOn<P> {
    async fn execute(&self, task: &str) -> Result<String> {
        self.provider
            .generate(&self.model, task.to_string(), self.system.clone())
            .await
    }
}

/// Categories of validation checks the QA agent evaluates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationCategory {
    Correctness,
    Completeness,
    Quality,
    Safety,
}

impl ValidationCategory {
    pub const ALL: [ValidationCategory; 4] = [
        ValidationCategory::Correctness,
        ValidationCategory::Completeness,
        ValidationCategory::Quality,
        ValidationCategory::Safety,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCategory::Correctness => "correctness",
            ValidationCategory::Completeness => "completeness",
            ValidationCategory::Quality => "quality",
            ValidationCategory::Safety => "safety",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "correctness" => Some(ValidationCategory::Correctness),
            "completeness" => Some(ValidationCategory::Completeness),
            "quality" => Some(ValidationCategory::Quality),
            "safety" => Some(ValidationCategory::Safety),
            _ => None,
        }
    }
}

/// A single issue found by the QA evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub category: ValidationCategory,
    /// "low" | "medium" | "high" | "critical"
    pub severity: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Structured QA verdict on a solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QAFeedback {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub suggestions: Vec<String>,
    pub confidence: f64,
    pub categories_checked: Vec<ValidationCategory>,
}

impl QAFeedback {
    fn from_value(value: &serde_json::Value, fallback_categories: &[ValidationCategory]) -> Self {
        let issues = value["issues"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(ValidationIssue {
                            category: ValidationCategory::from_str(item["category"].as_str()?)?,
                            severity: item["severity"].as_str().unwrap_or("medium").to_string(),
                            description: item["description"].as_str().unwrap_or("").to_string(),
                            line: item["line"].as_u64().map(|l| l as u32),
                            suggestion: item["suggestion"].as_str().map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let suggestions = value["suggestions"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let categories_checked = value["categories_checked"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| c.as_str().and_then(ValidationCategory::from_str))
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback_categories.to_vec());

        QAFeedback {
            valid: value["valid"].as_bool().unwrap_or(false),
            issues,
            suggestions,
            confidence: value["confidence"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0),
            categories_checked,
        }
    }
}

/// One generate → validate round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionAttempt {
    pub attempt_number: usize,
    pub solution: String,
    pub qa_feedback: QAFeedback,
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: f64,
}

/// Aggregate self-correction performance counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionStats {
    pub first_attempt_valid: u64,
    pub corrected_valid: u64,
    pub max_attempts_failed: u64,
    pub total_executions: u64,
    pub avg_attempts_to_success: f64,
    pub avg_correction_time_ms: f64,
}

impl CorrectionStats {
    pub fn first_attempt_success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.first_attempt_valid as f64 / self.total_executions as f64
    }

    pub fn correction_success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.corrected_valid as f64 / self.total_executions as f64
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.max_attempts_failed as f64 / self.total_executions as f64
    }

    fn record_time(&mut self, total_ms: f64) {
        let n = self.total_executions as f64;
        self.avg_correction_time_ms = (self.avg_correction_time_ms * (n - 1.0) + total_ms) / n;
    }

    fn update_avg_attempts(&mut self, attempts_to_success: &[u64]) {
        let successes = self.first_attempt_valid + self.corrected_valid;
        if successes > 0 {
            let total: u64 = attempts_to_success.iter().sum();
            self.avg_attempts_to_success = total as f64 / successes as f64;
        }
    }
}

/// Final result of a validated execution.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionOutcome {
    pub solution: String,
    pub valid: bool,
    pub attempts: usize,
    pub qa_feedback: QAFeedback,
    pub correction_history: Vec<CorrectionAttempt>,
    pub stats: CorrectionStats,
}

/// Wraps an executor with an internal QA validation loop.
pub struct SelfCorrectingExecutor {
    executor: Arc<dyn Executor>,
    qa: Arc<dyn QaEvaluator>,
    max_attempts: usize,
    categories: Vec<ValidationCategory>,
    stats: tokio::sync::Mutex<CorrectionStats>,
    attempts_to_success: tokio::sync::Mutex<Vec<u64>>,
}

impl SelfCorrectingExecutor {
    pub fn new(executor: Arc<dyn Executor>, qa: Arc<dyn QaEvaluator>) -> Self {
        Self {
            executor,
            qa,
            max_attempts: 3,
            categories: ValidationCategory::ALL.to_vec(),
            stats: tokio::sync::Mutex::new(CorrectionStats::default()),
            attempts_to_success: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_categories(mut self, categories: Vec<ValidationCategory>) -> Self {
        if !categories.is_empty() {
            self.categories = categories;
        }
        self
    }

    pub async fn stats(&self) -> CorrectionStats {
        self.stats.lock().await.clone()
    }

    /// Execute a task under the validation loop.
    ///
    /// Returns the first valid solution, or the last attempt with
    /// `valid=false` once `max_attempts` is exhausted. A QA failure is
    /// treated as an invalid attempt, never an error.
    pub async fn execute_with_validation(
        &self,
        task: &str,
        expectations: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<CorrectionOutcome> {
        let started = std::time::Instant::now();
        let mut prompt = task.to_string();
        let mut history: Vec<CorrectionAttempt> = Vec::new();

        for attempt in 1..=self.max_attempts {
            info!("self-correction attempt {}/{}", attempt, self.max_attempts);
            let attempt_started = std::time::Instant::now();

            let solution = self.executor.execute(&prompt).await?;
            let feedback = self
                .validate_solution(task, &solution, expectations, context)
                .await;

            history.push(CorrectionAttempt {
                attempt_number: attempt,
                solution: solution.clone(),
                qa_feedback: feedback.clone(),
                timestamp: Utc::now(),
                execution_time_ms: attempt_started.elapsed().as_secs_f64() * 1000.0,
            });

            if feedback.valid {
                let stats = self
                    .record_success(attempt, started.elapsed().as_secs_f64() * 1000.0)
                    .await;
                return Ok(CorrectionOutcome {
                    solution,
                    valid: true,
                    attempts: attempt,
                    qa_feedback: feedback,
                    correction_history: history,
                    stats,
                });
            }

            if attempt == self.max_attempts {
                warn!(
                    "max attempts ({}) reached, solution still invalid",
                    self.max_attempts
                );
                let stats = self
                    .record_failure(started.elapsed().as_secs_f64() * 1000.0)
                    .await;
                return Ok(CorrectionOutcome {
                    solution,
                    valid: false,
                    attempts: attempt,
                    qa_feedback: feedback,
                    correction_history: history,
                    stats,
                });
            }

            info!(
                "attempt {} failed validation, regenerating ({} issues)",
                attempt,
                feedback.issues.len()
            );
            prompt = build_fix_prompt(task, &solution, &feedback);
        }

        unreachable!("correction loop always returns within max_attempts");
    }

    async fn validate_solution(
        &self,
        task: &str,
        solution: &str,
        expectations: &serde_json::Value,
        context: &serde_json::Value,
    ) -> QAFeedback {
        let prompt = build_validation_prompt(task, solution, expectations, context, &self.categories);

        match self.qa.validate(&prompt).await {
            Ok(response) => self.parse_qa_response(&response),
            Err(e) => {
                warn!("QA validation failed: {}", e);
                QAFeedback {
                    valid: false,
                    issues: vec![ValidationIssue {
                        category: ValidationCategory::Quality,
                        severity: "high".to_string(),
                        description: format!("QA validation failed: {}", e),
                        line: None,
                        suggestion: None,
                    }],
                    suggestions: vec!["Fix QA evaluator execution error".to_string()],
                    confidence: 0.0,
                    categories_checked: self.categories.clone(),
                }
            }
        }
    }

    /// Parse the QA response: JSON first, fenced JSON second, heuristics last.
    fn parse_qa_response(&self, response: &str) -> QAFeedback {
        if let Some(value) = parse_json_output(response) {
            return QAFeedback::from_value(&value, &self.categories);
        }

        warn!("failed to parse QA JSON, using heuristic validation");
        let lower = response.to_lowercase();
        let valid = lower.contains("valid")
            && !lower.contains("invalid")
            && !lower.contains("error")
            && !lower.contains("fail");

        QAFeedback {
            valid,
            issues: Vec::new(),
            suggestions: vec!["Parse QA response properly".to_string()],
            confidence: 0.5,
            categories_checked: self.categories.clone(),
        }
    }

    async fn record_success(&self, attempts: usize, total_ms: f64) -> CorrectionStats {
        let mut stats = self.stats.lock().await;
        stats.total_executions += 1;
        if attempts == 1 {
            stats.first_attempt_valid += 1;
        } else {
            stats.corrected_valid += 1;
        }
        let mut successes = self.attempts_to_success.lock().await;
        successes.push(attempts as u64);
        stats.update_avg_attempts(&successes);
        stats.record_time(total_ms);
        stats.clone()
    }

    async fn record_failure(&self, total_ms: f64) -> CorrectionStats {
        let mut stats = self.stats.lock().await;
        stats.total_executions += 1;
        stats.max_attempts_failed += 1;
        let successes = self.attempts_to_success.lock().await;
        stats.update_avg_attempts(&successes);
        stats.record_time(total_ms);
        stats.clone()
    }
}

fn build_validation_prompt(
    task: &str,
    solution: &str,
    expectations: &serde_json::Value,
    context: &serde_json::Value,
    categories: &[ValidationCategory],
) -> String {
    let categories_str = categories
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You are a QA agent performing solution validation. Evaluate the solution below.

TASK:
{task}

SOLUTION:
{solution}

EXPECTATIONS:
{expectations}

CONTEXT:
{context}

VALIDATION CATEGORIES:
{categories_str}

Return JSON with this EXACT structure:
{{
  "valid": true,
  "issues": [
    {{
      "category": "correctness|completeness|quality|safety",
      "severity": "low|medium|high|critical",
      "description": "Detailed description of issue",
      "line": 42,
      "suggestion": "How to fix this issue"
    }}
  ],
  "suggestions": ["General improvement suggestion"],
  "confidence": 0.9,
  "categories_checked": ["correctness", "completeness", "quality", "safety"]
}}

IMPORTANT: Return ONLY valid JSON, no markdown formatting.
"#
    )
}

fn build_fix_prompt(original_task: &str, failed_solution: &str, feedback: &QAFeedback) -> String {
    let issues = feedback
        .issues
        .iter()
        .map(|issue| {
            let mut line = format!(
                "- [{}] {}: {}",
                issue.severity.to_uppercase(),
                issue.category.as_str(),
                issue.description
            );
            if let Some(n) = issue.line {
                line.push_str(&format!(" (Line {})", n));
            }
            if let Some(s) = &issue.suggestion {
                line.push_str(&format!("\n  Suggestion: {}", s));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n");

    let suggestions = feedback
        .suggestions
        .iter()
        .map(|s| format!("- {}", s))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"ORIGINAL TASK:
{original_task}

YOUR PREVIOUS SOLUTION (FAILED VALIDATION):
{failed_solution}

QA VALIDATION FOUND {} ISSUES:
{issues}

GENERAL SUGGESTIONS:
{suggestions}

QA CONFIDENCE: {:.2}

Fix all issues above and generate an IMPROVED solution:
"#,
        feedback.issues.len(),
        feedback.confidence
    )
}
