//! Control plane entry point
//!
//! `agency_core` routes a few sample tasks through the pipeline and
//! writes a dashboard snapshot; `agency_core serve` also exposes the
//! metrics endpoints.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use agency_core::agent::{AgentProfile, ExecutorOn, QaEvaluator, ScriptedProvider};
use agency_core::config::AgencyConfig;
use agency_core::memory::{InProcessBackend, MemorySubstrate, TrajectoryStore};
use agency_core::observability::server::{run_metrics_server, MetricsServerState};
use agency_core::observability::{DashboardFeed, ObservabilityConfig, ObservabilityManager};
use agency_core::orchestrator::{
    AgentRuntime, AutoApprover, DifficultyRouter, PaymentLedger, SpendGovernor, Task, TaskRequest,
};
use agency_core::safety::PatternShield;
use agency_core::tools::StaticVendorCache;

struct EchoQa;

#[async_trait::async_trait]
impl QaEvaluator for EchoQa {
    async fn validate(&self, _prompt: &str) -> Result<String> {
        Ok(r#"{"valid": true, "confidence": 0.9}"#.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let config = AgencyConfig::load()?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "agency_core.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agency_core=info")),
        )
        .with_target(false)
        .with_writer(file_writer.and(std::io::stdout))
        .init();

    info!("config loaded (monthly limit ${:.2})", config.monthly_limit);

    let observability = Arc::new(ObservabilityManager::new(ObservabilityConfig::record_all()));
    let dashboard = Arc::new(DashboardFeed::new(config.log_dir.clone()));
    let router = Arc::new(DifficultyRouter::new().with_safety(Arc::new(PatternShield::new())));
    let governor = Arc::new(
        SpendGovernor::new(config.ap2_secret.clone(), Arc::new(AutoApprover)).with_config(
            agency_core::orchestrator::BudgetConfig {
                monthly_limit: config.monthly_limit,
                per_transaction_alert: config.per_transaction_alert,
                require_manual_above: config.require_manual_above,
                auto_approval_limit: config.auto_approval_limit,
            },
        ),
    );
    let payments = Arc::new(PaymentLedger::new(
        Arc::new(AutoApprover),
        Arc::new(StaticVendorCache::new()),
    ));
    let memory = Arc::new(MemorySubstrate::new(Arc::new(InProcessBackend::new())));
    let trajectories = Arc::new(TrajectoryStore::new());

    // Stand-in executor until a provider endpoint is configured
    let provider = Arc::new(ScriptedProvider::new([
        "Routing demo response: the task was handled by the local pipeline.",
    ]));
    let runtime = AgentRuntime::new(
        AgentProfile::new("content", "You write concise, accurate content.")
            .with_capabilities(["writing", "summarization"]),
        router.clone(),
        governor,
        payments,
        memory,
        trajectories,
        observability.clone(),
        dashboard.clone(),
        Arc::new(ExecutorOn {
            provider,
            model: "local-llm".to_string(),
            system: None,
        }),
        Arc::new(EchoQa),
    );

    let samples = [
        Task::new("demo-1", "Fix typo in README.md").with_priority(0.1),
        Task::new(
            "demo-2",
            "Design and implement a scalable microservices architecture with authentication, \
             database integration, and deployment pipeline",
        )
        .with_priority(0.9)
        .with_tools(["docker", "kubernetes", "database", "auth", "ci/cd"]),
    ];
    for task in &samples {
        let (decision, _) = router.route_task(task, true, None);
        info!(
            "{} -> {} ({}, est ${:.6})",
            task.id,
            decision.model,
            decision.difficulty.as_str(),
            decision.estimated_cost
        );
    }

    let envelope = runtime
        .handle(TaskRequest::new(
            "demo-user",
            Task::new("demo-3", "Summarize this week's release notes").with_task_type("content"),
        ))
        .await;
    info!("demo request ok: {}", envelope.is_ok());

    dashboard.flush_snapshot().await?;

    if std::env::args().nth(1).as_deref() == Some("serve") {
        run_metrics_server(
            MetricsServerState {
                observability,
                dashboard,
            },
            config.metrics_port,
        )
        .await?;
    }

    Ok(())
}
