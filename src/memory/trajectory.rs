//! Trajectory Store
//!
//! Append-only record of task executions plus the anti-pattern index
//! derived from failures. Stored trajectories are never mutated;
//! amendments are additional entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AgencyError, AgencyResult};

/// Terminal outcome of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
}

/// A single tool call inside a trajectory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStep {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub tool_result: serde_json::Value,
    pub agent_reasoning: String,
}

impl ActionStep {
    pub fn new(
        tool_name: impl Into<String>,
        tool_args: serde_json::Value,
        tool_result: serde_json::Value,
        agent_reasoning: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            tool_name: tool_name.into(),
            tool_args,
            tool_result,
            agent_reasoning: agent_reasoning.into(),
        }
    }
}

/// Immutable record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trajectory {
    pub trajectory_id: String,
    pub agent_id: String,
    pub task_description: String,
    pub initial_state: String,
    pub steps: Vec<ActionStep>,
    pub final_outcome: Outcome,
    pub reward: f64,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_applied: Option<String>,
}

impl Trajectory {
    pub fn new(agent_id: impl Into<String>, task_description: impl Into<String>) -> Self {
        Self {
            trajectory_id: format!("traj_{}", Uuid::new_v4().simple()),
            agent_id: agent_id.into(),
            task_description: task_description.into(),
            initial_state: String::new(),
            steps: Vec::new(),
            final_outcome: Outcome::Partial,
            reward: 0.0,
            duration_seconds: 0.0,
            created_at: Utc::now(),
            task_type: None,
            failure_rationale: None,
            error_category: None,
            fix_applied: None,
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome, reward: f64) -> Self {
        self.final_outcome = outcome;
        self.reward = reward.clamp(0.0, 1.0);
        self
    }

    pub fn with_failure(
        mut self,
        rationale: impl Into<String>,
        category: impl Into<String>,
        fix: Option<String>,
    ) -> Self {
        self.final_outcome = Outcome::Failure;
        self.failure_rationale = Some(rationale.into());
        self.error_category = Some(category.into());
        self.fix_applied = fix;
        self
    }
}

/// One indexed failure mode for a task type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AntiPattern {
    pub failure_rationale: String,
    pub fix_applied: Option<String>,
    pub frequency: u64,
}

/// Append-only trajectory store with a derived anti-pattern index.
pub struct TrajectoryStore {
    trajectories: RwLock<Vec<Trajectory>>,
    /// task_type -> failure_rationale -> record
    anti_patterns: RwLock<HashMap<String, HashMap<String, AntiPattern>>>,
    jsonl_path: Option<PathBuf>,
}

impl TrajectoryStore {
    pub fn new() -> Self {
        Self {
            trajectories: RwLock::new(Vec::new()),
            anti_patterns: RwLock::new(HashMap::new()),
            jsonl_path: None,
        }
    }

    /// Also append each stored trajectory as a JSON line at `path`.
    pub fn with_jsonl(mut self, path: impl Into<PathBuf>) -> Self {
        self.jsonl_path = Some(path.into());
        self
    }

    /// Persist a trajectory. Failures with a rationale are indexed as
    /// anti-patterns under their task type.
    pub async fn store_trajectory(&self, trajectory: Trajectory) -> AgencyResult<String> {
        let trajectory_id = trajectory.trajectory_id.clone();

        if trajectory.final_outcome == Outcome::Failure {
            if let Some(rationale) = &trajectory.failure_rationale {
                let task_type = trajectory
                    .task_type
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                let mut index = self.anti_patterns.write().await;
                let by_rationale = index.entry(task_type).or_default();
                by_rationale
                    .entry(rationale.clone())
                    .and_modify(|p| {
                        p.frequency += 1;
                        if p.fix_applied.is_none() {
                            p.fix_applied = trajectory.fix_applied.clone();
                        }
                    })
                    .or_insert_with(|| AntiPattern {
                        failure_rationale: rationale.clone(),
                        fix_applied: trajectory.fix_applied.clone(),
                        frequency: 1,
                    });
            }
        }

        if let Some(path) = &self.jsonl_path {
            if let Err(e) = append_jsonl(path, &trajectory) {
                warn!("trajectory jsonl append failed: {}", e);
            }
        }

        self.trajectories.write().await.push(trajectory);
        debug!("stored trajectory {}", trajectory_id);
        Ok(trajectory_id)
    }

    /// Recent trajectories matching the outcome, newest first.
    pub async fn query_by_outcome(
        &self,
        outcome: Outcome,
        agent_filter: Option<&str>,
        limit: usize,
    ) -> Vec<Trajectory> {
        let trajectories = self.trajectories.read().await;
        trajectories
            .iter()
            .rev()
            .filter(|t| t.final_outcome == outcome)
            .filter(|t| agent_filter.map(|a| t.agent_id == a).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Most frequent failure rationales for a task type, with their fixes.
    pub async fn query_anti_patterns(&self, task_type: &str, top_n: usize) -> Vec<AntiPattern> {
        let index = self.anti_patterns.read().await;
        let mut patterns: Vec<AntiPattern> = index
            .get(task_type)
            .map(|by_rationale| by_rationale.values().cloned().collect())
            .unwrap_or_default();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        patterns.truncate(top_n);
        patterns
    }

    pub async fn len(&self) -> usize {
        self.trajectories.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.trajectories.read().await.is_empty()
    }
}

impl Default for TrajectoryStore {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_TRAJECTORIES: std::sync::Arc<TrajectoryStore> =
        std::sync::Arc::new(TrajectoryStore::new());
}

/// Process-wide trajectory store.
pub fn get_trajectory_store() -> std::sync::Arc<TrajectoryStore> {
    GLOBAL_TRAJECTORIES.clone()
}

fn append_jsonl(path: &PathBuf, trajectory: &Trajectory) -> AgencyResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
    let line = serde_json::to_string(trajectory)
        .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
    writeln!(file, "{}", line).map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(agent: &str, task_type: &str, rationale: &str, fix: Option<&str>) -> Trajectory {
        Trajectory::new(agent, "task")
            .with_task_type(task_type)
            .with_failure(rationale, "execution_error", fix.map(String::from))
    }

    #[tokio::test]
    async fn test_store_and_query_by_outcome() {
        let store = TrajectoryStore::new();
        store
            .store_trajectory(Trajectory::new("builder", "build api").with_outcome(Outcome::Success, 0.9))
            .await
            .unwrap();
        store
            .store_trajectory(failure("builder", "build", "missing dependency", None))
            .await
            .unwrap();
        store
            .store_trajectory(failure("qa", "validate", "flaky check", None))
            .await
            .unwrap();

        let failures = store.query_by_outcome(Outcome::Failure, None, 10).await;
        assert_eq!(failures.len(), 2);

        let builder_failures = store
            .query_by_outcome(Outcome::Failure, Some("builder"), 10)
            .await;
        assert_eq!(builder_failures.len(), 1);
        assert_eq!(builder_failures[0].agent_id, "builder");
    }

    #[tokio::test]
    async fn test_anti_pattern_frequency_ranking() {
        let store = TrajectoryStore::new();
        for _ in 0..3 {
            store
                .store_trajectory(failure("builder", "build", "timeout waiting for sandbox", Some("raise timeout")))
                .await
                .unwrap();
        }
        store
            .store_trajectory(failure("builder", "build", "missing dependency", None))
            .await
            .unwrap();

        let patterns = store.query_anti_patterns("build", 2).await;
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].failure_rationale, "timeout waiting for sandbox");
        assert_eq!(patterns[0].frequency, 3);
        assert_eq!(patterns[0].fix_applied.as_deref(), Some("raise timeout"));
    }

    #[tokio::test]
    async fn test_success_without_rationale_not_indexed() {
        let store = TrajectoryStore::new();
        store
            .store_trajectory(
                Trajectory::new("qa", "check")
                    .with_task_type("validate")
                    .with_outcome(Outcome::Success, 1.0),
            )
            .await
            .unwrap();
        assert!(store.query_anti_patterns("validate", 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_stored_trajectories_are_not_mutated() {
        let store = TrajectoryStore::new();
        let original = Trajectory::new("qa", "check").with_outcome(Outcome::Success, 0.8);
        let id = store.store_trajectory(original.clone()).await.unwrap();

        // Mutating a queried copy must not affect the stored record
        let mut copy = store.query_by_outcome(Outcome::Success, None, 1).await[0].clone();
        copy.reward = 0.0;
        copy.steps.push(ActionStep::new(
            "tamper",
            serde_json::json!({}),
            serde_json::json!({}),
            "",
        ));

        let stored = store.query_by_outcome(Outcome::Success, None, 1).await;
        assert_eq!(stored[0].trajectory_id, id);
        assert_eq!(stored[0].reward, 0.8);
        assert!(stored[0].steps.is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories.jsonl");
        let store = TrajectoryStore::new().with_jsonl(&path);

        store
            .store_trajectory(Trajectory::new("qa", "one").with_outcome(Outcome::Success, 1.0))
            .await
            .unwrap();
        store
            .store_trajectory(failure("qa", "validate", "oops", None))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let first: Trajectory = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first.agent_id, "qa");
    }
}
