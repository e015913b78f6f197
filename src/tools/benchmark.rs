//! Benchmark capability
//!
//! Scores an agent variant against its benchmark suite. The evolution
//! engine only reads the aggregate result; suites live outside the
//! control plane.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::AgencyResult;

/// Aggregate result of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub overall_score: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub quality: f64,
    pub test_cases_passed: u32,
    pub test_cases_total: u32,
    pub detailed_scores: HashMap<String, f64>,
}

impl BenchmarkResult {
    pub fn flat(score: f64) -> Self {
        Self {
            overall_score: score,
            accuracy: score,
            speed: score,
            quality: score,
            test_cases_passed: (score * 10.0).round() as u32,
            test_cases_total: 10,
            detailed_scores: HashMap::new(),
        }
    }

    /// Metric map consumed by the evolution engine's delta computation.
    pub fn metrics(&self) -> HashMap<String, f64> {
        let mut metrics = HashMap::new();
        metrics.insert("overall_score".to_string(), self.overall_score);
        metrics.insert("correctness".to_string(), self.accuracy);
        metrics.insert("efficiency".to_string(), self.speed);
        metrics.insert("robustness".to_string(), self.quality);
        metrics
    }
}

/// Benchmark suite resolution and execution.
#[async_trait]
pub trait BenchmarkCapability: Send + Sync {
    /// Run the suite registered for `agent_name` against `agent_code`.
    async fn run(&self, agent_name: &str, agent_code: &str) -> AgencyResult<BenchmarkResult>;
}

/// Fixed-score benchmark used for tests and offline development.
///
/// Scores are keyed by a substring probe into the candidate code, so a
/// test can steer the outcome per variant.
pub struct StaticBenchmark {
    default_score: f64,
    overrides: Vec<(String, f64)>,
}

impl StaticBenchmark {
    pub fn new(default_score: f64) -> Self {
        Self {
            default_score,
            overrides: Vec::new(),
        }
    }

    /// Candidates containing `marker` score `score` instead.
    pub fn with_override(mut self, marker: impl Into<String>, score: f64) -> Self {
        self.overrides.push((marker.into(), score));
        self
    }
}

#[async_trait]
impl BenchmarkCapability for StaticBenchmark {
    async fn run(&self, _agent_name: &str, agent_code: &str) -> AgencyResult<BenchmarkResult> {
        for (marker, score) in &self.overrides {
            if agent_code.contains(marker.as_str()) {
                return Ok(BenchmarkResult::flat(*score));
            }
        }
        Ok(BenchmarkResult::flat(self.default_score))
    }
}
