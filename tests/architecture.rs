//! Cross-module invariants: signed audit trails, tier TTLs and caps,
//! trajectory immutability, deterministic routing, and path hygiene.

use std::sync::Arc;

use agency_core::agent::AgentProfile;
use agency_core::memory::{
    ActionStep, InProcessBackend, MemorySubstrate, MemoryTier, Outcome, Trajectory,
    TrajectoryStore,
};
use agency_core::orchestrator::evolution::sanitize_path_component;
use agency_core::orchestrator::{
    AutoApprover, BudgetConfig, DifficultyRouter, SpendGovernor, Task,
};

// Invariant 1 + 2: per-window audit totals stay under the limit and
// every entry's HMAC verifies.
#[tokio::test]
async fn audit_log_is_bounded_and_signed() {
    let governor = SpendGovernor::new("arch-secret", Arc::new(AutoApprover)).with_config(
        BudgetConfig {
            monthly_limit: 100.0,
            ..BudgetConfig::default()
        },
    );

    for _ in 0..25 {
        let _ = governor
            .ensure_budget("spec", "svc", 9.0, serde_json::json!({}), None)
            .await;
    }

    let entries = governor.audit_log("spec").await;
    let total: f64 = entries.iter().map(|e| e.amount).sum();
    assert!(total <= 100.0 + 1e-9);
    assert!(governor.verify_audit_log("spec").await.unwrap());

    // Timestamps are totally ordered within the window
    for pair in entries.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

// Invariant 3: tier TTLs are stamped by the substrate, not callers.
#[tokio::test]
async fn tier_ttls_are_enforced_by_the_substrate() {
    let memory = MemorySubstrate::new(Arc::new(InProcessBackend::new()));
    memory
        .store_conversation("qa", "u", "question", "answer")
        .await
        .unwrap();

    let entries = memory.retrieve("qa", "u", "question", None, 1).await.unwrap();
    let entry = &entries[0];
    assert_eq!(entry.tier, MemoryTier::Short);
    let ttl = entry.expires_at.unwrap() - entry.created_at;
    assert_eq!(ttl, chrono::Duration::hours(24));
}

// Invariant 4: caps hold after any sequence of operations.
#[tokio::test]
async fn tier_caps_hold_after_heavy_traffic() {
    let memory = MemorySubstrate::new(Arc::new(InProcessBackend::new()));
    for i in 0..40 {
        memory
            .store_conversation("qa", "u", &format!("q{}", i), "a")
            .await
            .unwrap();
        if i % 7 == 0 {
            memory.consolidate("qa", "u").await.unwrap();
        }
    }
    memory.consolidate("qa", "u").await.unwrap();

    let stats = memory.stats("qa", "u").await.unwrap();
    assert!(stats.counts["short_term_memory"] <= 10);
    assert!(stats.counts["mid_term_memory"] <= 2000);
}

// Invariant 5: stored trajectories are immutable.
#[tokio::test]
async fn trajectories_never_mutate_after_store() {
    let store = TrajectoryStore::new();
    let mut original = Trajectory::new("qa", "check the build").with_outcome(Outcome::Success, 0.9);
    original.steps.push(ActionStep::new(
        "web_search",
        serde_json::json!({"q": "build status"}),
        serde_json::json!({"ok": true}),
        "look up the pipeline",
    ));
    store.store_trajectory(original.clone()).await.unwrap();

    let mut fetched = store.query_by_outcome(Outcome::Success, None, 1).await.remove(0);
    fetched.reward = 0.0;
    fetched.steps.clear();

    let fresh = store.query_by_outcome(Outcome::Success, None, 1).await.remove(0);
    assert_eq!(fresh.reward, 0.9);
    assert_eq!(fresh.steps.len(), 1);
    assert_eq!(fresh.steps[0].tool_name, "web_search");
}

// Invariant 6: routing is a pure function of the task.
#[test]
fn routing_replays_identically() {
    let router = DifficultyRouter::new();
    let task = Task::new("r", "Optimize database queries and implement caching for performance")
        .with_priority(0.7)
        .with_tools(["database", "redis", "profiler"]);

    let (a, _) = router.route_task(&task, true, None);
    let (b, _) = router.route_task(&task, true, None);
    assert_eq!(a.difficulty, b.difficulty);
    assert_eq!(a.tier, b.tier);
    assert_eq!(a.estimated_tokens, b.estimated_tokens);
    assert_eq!(a.confidence, b.confidence);
}

// Invariant 9: evolved artifact paths contain no traversal characters.
#[test]
fn artifact_paths_are_sanitized() {
    for hostile in ["../../etc", "a/b", "x\\y", "gen0..attempt"] {
        let cleaned = sanitize_path_component(hostile).unwrap();
        assert!(!cleaned.contains(".."));
        assert!(!cleaned.contains('/'));
        assert!(!cleaned.contains('\\'));
        assert!(cleaned
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }
}

// Capability overlap is symmetric and bounded, which the evolution
// engine's cross-agent gate relies on.
#[test]
fn capability_overlap_is_symmetric() {
    let a = AgentProfile::new("qa", "").with_capabilities(["validation", "testing", "analysis"]);
    let b = AgentProfile::new("legal", "").with_capabilities(["validation", "compliance"]);

    let ab = a.capability_overlap(&b);
    let ba = b.capability_overlap(&a);
    assert!((ab - ba).abs() < 1e-12);
    assert!((0.0..=1.0).contains(&ab));
}
