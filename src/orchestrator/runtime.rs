//! Agent Runtime
//!
//! Per-agent executor composing the router, spend governor, payment
//! ledger, memory substrate, trajectory store, self-correction loop,
//! refinement terminator, and observability into one task pipeline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::budget::SpendGovernor;
use super::payments::{ChargeResult, PaymentLedger};
use super::router::{DifficultyRouter, RoutingDecision, Task};
use crate::agent::{
    AgentProfile, CorrectionOutcome, Executor, QaEvaluator, RefinementRound,
    RefinementTerminator, SelfCorrectingExecutor, TerminationDecision,
};
use crate::error::AgencyError;
use crate::memory::{
    ActionStep, MemoryEntry, MemorySubstrate, Outcome, StoreKind, Trajectory, TrajectoryStore,
};
use crate::observability::{DashboardFeed, ObservabilityManager, SpanType};
use crate::tools::{ToolCall, ToolOutput, ToolRegistry};

/// One incoming request for an agent.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub user_id: String,
    pub task: Task,
    pub expectations: serde_json::Value,
    /// Route for quality instead of cost
    pub quality_focused: bool,
}

impl TaskRequest {
    pub fn new(user_id: impl Into<String>, task: Task) -> Self {
        Self {
            user_id: user_id.into(),
            task,
            expectations: serde_json::json!({}),
            quality_focused: false,
        }
    }

    pub fn with_expectations(mut self, expectations: serde_json::Value) -> Self {
        self.expectations = expectations;
        self
    }

    pub fn quality_focused(mut self) -> Self {
        self.quality_focused = true;
        self
    }
}

/// Lifecycle of one refinement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initial,
    Refining,
    TerminatedOk,
    TerminatedPlateau,
    TerminatedMax,
    Failed,
}

/// Successful run payload.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSuccess {
    pub artifact: String,
    pub valid: bool,
    pub attempts: usize,
    pub qa_feedback: crate::agent::QAFeedback,
    pub stats: crate::agent::CorrectionStats,
    pub routing: RoutingDecision,
    pub session_state: SessionState,
    pub correlation_id: String,
}

/// Failed run envelope.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub ok: bool,
    pub error_kind: String,
    pub message: String,
    pub correlation_id: String,
    pub attempts: usize,
}

/// What a request resolves to.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TaskEnvelope {
    Success(Box<TaskSuccess>),
    Failure(TaskFailure),
}

impl TaskEnvelope {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskEnvelope::Success(_))
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            TaskEnvelope::Failure(f) => Some(f),
            TaskEnvelope::Success(_) => None,
        }
    }

    pub fn success(&self) -> Option<&TaskSuccess> {
        match self {
            TaskEnvelope::Success(s) => Some(s),
            TaskEnvelope::Failure(_) => None,
        }
    }
}

/// Runtime tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Rewards at or above this promote the strategy into agent memory
    pub reflection_threshold: f64,
    /// Rewards at or above this also promote into the consensus namespace
    pub consensus_threshold: f64,
    pub max_attempts: usize,
    pub top_k_patterns: usize,
    pub top_n_anti_patterns: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reflection_threshold: 0.7,
            consensus_threshold: 0.9,
            max_attempts: 3,
            top_k_patterns: 3,
            top_n_anti_patterns: 3,
        }
    }
}

/// The per-agent pipeline.
pub struct AgentRuntime {
    profile: AgentProfile,
    router: Arc<DifficultyRouter>,
    governor: Arc<SpendGovernor>,
    payments: Arc<PaymentLedger>,
    memory: Arc<MemorySubstrate>,
    trajectories: Arc<TrajectoryStore>,
    observability: Arc<ObservabilityManager>,
    dashboard: Arc<DashboardFeed>,
    tools: Arc<ToolRegistry>,
    corrector: SelfCorrectingExecutor,
    terminator: RefinementTerminator,
    config: RuntimeConfig,
    /// Completed sessions, failed ones included, for cost accounting
    refinement_history: Mutex<Vec<Vec<RefinementRound>>>,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: AgentProfile,
        router: Arc<DifficultyRouter>,
        governor: Arc<SpendGovernor>,
        payments: Arc<PaymentLedger>,
        memory: Arc<MemorySubstrate>,
        trajectories: Arc<TrajectoryStore>,
        observability: Arc<ObservabilityManager>,
        dashboard: Arc<DashboardFeed>,
        executor: Arc<dyn Executor>,
        qa: Arc<dyn QaEvaluator>,
    ) -> Self {
        let config = RuntimeConfig::default();
        Self {
            corrector: SelfCorrectingExecutor::new(executor, qa)
                .with_max_attempts(config.max_attempts),
            profile,
            router,
            governor,
            payments,
            memory,
            trajectories,
            observability,
            dashboard,
            tools: Arc::new(ToolRegistry::new()),
            terminator: RefinementTerminator::default(),
            config,
            refinement_history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_terminator(mut self, terminator: RefinementTerminator) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Handle one request end to end.
    pub async fn handle(&self, request: TaskRequest) -> TaskEnvelope {
        let started = std::time::Instant::now();
        let ctx = self
            .observability
            .create_correlation_context(&request.task.description);

        // Safety gate before any model is selected
        let (is_safe, blocked, safety_metrics) = self
            .router
            .safety_filter_task(&request.task, &self.profile.name)
            .await;
        self.dashboard
            .emit("policy_audit", Some(&ctx.correlation_id), safety_metrics)
            .await;
        if !is_safe {
            let message = blocked.unwrap_or_else(|| "task blocked by safety gate".to_string());
            return self.fail(AgencyError::SafetyBlocked(message), &ctx.correlation_id, 0);
        }

        let routing = self.observability
            .timed("route_task", SpanType::Halo, Some(&ctx), async {
                self.router.route_with_adapter(
                    &request.task,
                    Some(&self.profile.name),
                    !request.quality_focused,
                )
            })
            .await;

        // Budget reservation for the projected LLM spend aborts the
        // request on rejection; free-tier runs reserve nothing.
        if routing.estimated_cost > 0.0 {
            let approval = match self
                .governor
                .ensure_budget(
                    &self.profile.name,
                    &routing.model,
                    routing.estimated_cost.max(0.01),
                    serde_json::json!({
                        "correlation_id": ctx.correlation_id,
                        "task_id": request.task.id,
                    }),
                    None,
                )
                .await
            {
                Ok(approval) => approval,
                Err(e) => return self.fail(e, &ctx.correlation_id, 0),
            };
            self.dashboard
                .emit(
                    "ap2_approval",
                    Some(&ctx.correlation_id),
                    serde_json::json!({
                        "agent": self.profile.name,
                        "service": routing.model,
                        "amount": routing.estimated_cost,
                        "auto_approval": approval.auto_approval,
                        "manual_review": approval.manual_review,
                    }),
                )
                .await;
            if approval.alert {
                self.dashboard
                    .alert(serde_json::json!({
                        "agent": self.profile.name,
                        "amount": routing.estimated_cost,
                        "service": routing.model,
                        "correlation_id": ctx.correlation_id,
                    }))
                    .await;
            }
            self.observability
                .record_metric("model.estimated_cost", routing.estimated_cost, "usd", None)
                .await;

            match self
                .payments
                .charge(
                    &self.profile.name,
                    &format!("llm-{}", routing.model),
                    routing.estimated_cost,
                    serde_json::json!({"correlation_id": ctx.correlation_id}),
                )
                .await
            {
                Ok(ChargeResult::Paid { receipt }) => {
                    self.dashboard
                        .record_x402(serde_json::json!({
                            "tx_hash": receipt.tx_hash,
                            "amount": receipt.amount,
                            "agent": self.profile.name,
                            "correlation_id": ctx.correlation_id,
                        }))
                        .await;
                }
                Ok(ChargeResult::Reused { .. }) => {}
                Err(e) => return self.fail(e, &ctx.correlation_id, 0),
            }
        }

        // Prior patterns and known failure modes; store errors are
        // logged and skipped, never fatal to the request.
        let patterns = self.recall_patterns(&request).await;
        let anti_patterns = self
            .trajectories
            .query_anti_patterns(
                request.task.task_type.as_deref().unwrap_or("general"),
                self.config.top_n_anti_patterns,
            )
            .await;

        let prompt = self.build_prompt(&request, &patterns, &anti_patterns);

        let mut steps: Vec<ActionStep> = Vec::new();
        let outcome = self
            .observability
            .timed("execute_with_validation", SpanType::Execution, Some(&ctx), async {
                self.corrector
                    .execute_with_validation(&prompt, &request.expectations, &serde_json::json!({}))
                    .await
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Provider failure: finalize a failure trajectory, then
                // return the error envelope.
                let trajectory = Trajectory::new(&self.profile.name, &request.task.description)
                    .with_task_type(request.task.task_type.clone().unwrap_or_else(|| "general".to_string()))
                    .with_failure(e.to_string(), "provider_error", None);
                if let Err(store_err) = self.trajectories.store_trajectory(trajectory).await {
                    warn!("failure trajectory not stored: {}", store_err);
                }
                return self.fail(
                    AgencyError::provider("llm", e.to_string()),
                    &ctx.correlation_id,
                    0,
                );
            }
        };

        for attempt in &outcome.correction_history {
            steps.push(ActionStep::new(
                "llm_generate",
                serde_json::json!({"attempt": attempt.attempt_number}),
                serde_json::json!({
                    "valid": attempt.qa_feedback.valid,
                    "confidence": attempt.qa_feedback.confidence,
                    "issues": attempt.qa_feedback.issues.len(),
                }),
                format!("self-correction attempt {}", attempt.attempt_number),
            ));
        }

        let session_state = self.classify_session(&outcome).await;

        // Post-process the artifact through the collaborative filter
        let filtered = self
            .router
            .safety_improve_response(&request.task.description, &outcome.solution, &self.profile.name)
            .await;
        if !filtered.issues.is_empty() {
            self.dashboard
                .emit(
                    "hallucination_check_failed",
                    Some(&ctx.correlation_id),
                    serde_json::json!({"issues": filtered.issues.len()}),
                )
                .await;
        }

        let reward = if outcome.valid {
            outcome.qa_feedback.confidence
        } else {
            0.0
        };

        // Trajectory persistence happens after the last step, and a
        // store failure never aborts the request.
        let mut trajectory = Trajectory::new(&self.profile.name, &request.task.description)
            .with_task_type(request.task.task_type.clone().unwrap_or_else(|| "general".to_string()))
            .with_outcome(
                if outcome.valid {
                    Outcome::Success
                } else {
                    Outcome::Failure
                },
                reward,
            );
        trajectory.steps = steps;
        trajectory.duration_seconds = started.elapsed().as_secs_f64();
        if !outcome.valid {
            trajectory.failure_rationale =
                Some("validation failed after max correction attempts".to_string());
            trajectory.error_category = Some("qa_rejection".to_string());
        }
        if let Err(e) = self.trajectories.store_trajectory(trajectory).await {
            warn!("trajectory not stored: {}", e);
        }

        if outcome.valid {
            self.promote_strategy(&request, &outcome, reward).await;
        }

        self.dashboard
            .emit(
                "task_completed",
                Some(&ctx.correlation_id),
                serde_json::json!({
                    "agent": self.profile.name,
                    "valid": outcome.valid,
                    "attempts": outcome.attempts,
                    "model": routing.model,
                    "estimated_cost": routing.estimated_cost,
                }),
            )
            .await;
        self.dashboard
            .record_rubric_report(serde_json::json!({
                "agent": self.profile.name,
                "score": outcome.qa_feedback.confidence,
                "valid": outcome.valid,
            }))
            .await;
        self.observability
            .record_metric("agent.task.reward", reward, "ratio", None)
            .await;

        info!(
            correlation_id = %ctx.correlation_id,
            agent = %self.profile.name,
            valid = outcome.valid,
            attempts = outcome.attempts,
            "request finished"
        );

        TaskEnvelope::Success(Box::new(TaskSuccess {
            artifact: filtered.final_response,
            valid: outcome.valid,
            attempts: outcome.attempts,
            qa_feedback: outcome.qa_feedback,
            stats: outcome.stats,
            routing,
            session_state,
            correlation_id: ctx.correlation_id,
        }))
    }

    /// Execute a tool call, recording the step on the caller's list.
    pub async fn run_tool(&self, call: &ToolCall, steps: &mut Vec<ActionStep>) -> ToolOutput {
        let output = self.tools.invoke(call).await;
        steps.push(ActionStep::new(
            call.name.clone(),
            call.parameters.clone(),
            serde_json::to_value(&output).unwrap_or(serde_json::Value::Null),
            String::new(),
        ));
        output
    }

    /// Sessions recorded so far, for terminator cost accounting.
    pub async fn refinement_history(&self) -> Vec<Vec<RefinementRound>> {
        self.refinement_history.lock().await.clone()
    }

    pub fn terminator(&self) -> &RefinementTerminator {
        &self.terminator
    }

    async fn recall_patterns(&self, request: &TaskRequest) -> Vec<MemoryEntry> {
        match self
            .memory
            .retrieve(
                &self.profile.name,
                &request.user_id,
                &request.task.description,
                None,
                self.config.top_k_patterns,
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!("memory recall skipped: {}", e);
                Vec::new()
            }
        }
    }

    fn build_prompt(
        &self,
        request: &TaskRequest,
        patterns: &[MemoryEntry],
        anti_patterns: &[crate::memory::AntiPattern],
    ) -> String {
        let mut prompt = format!(
            "{}\n\nTASK:\n{}\n",
            self.profile.instructions, request.task.description
        );
        if !patterns.is_empty() {
            prompt.push_str("\nRELEVANT PAST PATTERNS:\n");
            for entry in patterns {
                prompt.push_str(&format!("- {}\n", entry.content_blob()));
            }
        }
        if !anti_patterns.is_empty() {
            prompt.push_str("\nKNOWN FAILURE MODES TO AVOID:\n");
            for anti in anti_patterns {
                prompt.push_str(&format!(
                    "- {} (seen {}x{})\n",
                    anti.failure_rationale,
                    anti.frequency,
                    anti.fix_applied
                        .as_deref()
                        .map(|f| format!(", fix: {}", f))
                        .unwrap_or_default()
                ));
            }
        }
        prompt
    }

    /// Map the correction history onto the refinement state machine and
    /// record the session rounds.
    async fn classify_session(&self, outcome: &CorrectionOutcome) -> SessionState {
        let rounds: Vec<RefinementRound> = outcome
            .correction_history
            .iter()
            .map(|attempt| RefinementRound {
                round: attempt.attempt_number,
                score: if attempt.qa_feedback.valid {
                    attempt.qa_feedback.confidence
                } else {
                    attempt.qa_feedback.confidence * 0.5
                },
            })
            .collect();

        let state = if outcome.valid {
            SessionState::TerminatedOk
        } else {
            match self.terminator.decide(&rounds) {
                TerminationDecision::StopPlateau => SessionState::TerminatedPlateau,
                _ => SessionState::TerminatedMax,
            }
        };

        self.refinement_history.lock().await.push(rounds);
        state
    }

    async fn promote_strategy(
        &self,
        request: &TaskRequest,
        outcome: &CorrectionOutcome,
        reward: f64,
    ) {
        if reward < self.config.reflection_threshold {
            return;
        }
        let content = serde_json::json!({
            "user_input": request.task.description,
            "agent_response": outcome.solution,
            "reward": reward,
            "attempts": outcome.attempts,
        });

        if let Err(e) = self
            .memory
            .store(
                &self.profile.name,
                &request.user_id,
                content.clone(),
                StoreKind::Whiteboard,
            )
            .await
        {
            warn!("strategy promotion skipped: {}", e);
        }

        if reward >= self.config.consensus_threshold {
            if let Err(e) = self
                .memory
                .store("consensus", &self.profile.name, content, StoreKind::Consensus)
                .await
            {
                warn!("consensus promotion skipped: {}", e);
            }
        }
    }

    fn fail(&self, error: AgencyError, correlation_id: &str, attempts: usize) -> TaskEnvelope {
        warn!(
            correlation_id = correlation_id,
            agent = %self.profile.name,
            "request failed: {}",
            error
        );
        TaskEnvelope::Failure(TaskFailure {
            ok: false,
            error_kind: error.kind().to_string(),
            message: error.to_string(),
            correlation_id: correlation_id.to_string(),
            attempts,
        })
    }
}
