//! Dashboard feed
//!
//! Append-only event log, periodic JSON snapshot, payment alerts, and
//! per-business summaries. A dashboard consumes these files; the core
//! only writes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{AgencyError, AgencyResult};

/// One line in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Current dashboard view, rewritten on every flush.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub global_stats: HashMap<String, serde_json::Value>,
    pub component_counters: HashMap<String, u64>,
    pub active_tasks: Vec<String>,
    pub recent_completions: Vec<serde_json::Value>,
    pub rubric_reports: Vec<serde_json::Value>,
    pub hallucination_events: u64,
    pub policy_events: u64,
    pub ap2_events: u64,
    pub x402_transactions: Vec<serde_json::Value>,
    pub budget_configs: HashMap<String, serde_json::Value>,
}

/// Writes the persisted dashboard state under the configured log dir.
pub struct DashboardFeed {
    log_dir: PathBuf,
    snapshot: Mutex<DashboardSnapshot>,
}

impl DashboardFeed {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            snapshot: Mutex::new(DashboardSnapshot::default()),
        }
    }

    fn events_path(&self) -> PathBuf {
        self.log_dir.join("events.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.log_dir.join("dashboard_snapshot.json")
    }

    fn alerts_path(&self) -> PathBuf {
        self.log_dir.join("x402_alerts.jsonl")
    }

    /// Append an event to the log and bump its component counter.
    pub async fn emit(
        &self,
        event_type: &str,
        correlation_id: Option<&str>,
        payload: serde_json::Value,
    ) {
        let event = DashboardEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            correlation_id: correlation_id.map(String::from),
            payload,
        };
        if let Err(e) = self.append_line(&self.events_path(), &event) {
            warn!("event log append failed: {}", e);
        }
        let mut snapshot = self.snapshot.lock().await;
        *snapshot
            .component_counters
            .entry(event_type.to_string())
            .or_insert(0) += 1;
        match event_type {
            "hallucination_check_failed" => snapshot.hallucination_events += 1,
            "policy_audit" => snapshot.policy_events += 1,
            "ap2_approval" => snapshot.ap2_events += 1,
            _ => {}
        }
    }

    /// Append a payment alert.
    pub async fn alert(&self, payload: serde_json::Value) {
        let event = DashboardEvent {
            timestamp: Utc::now(),
            event_type: "x402_alert".to_string(),
            correlation_id: None,
            payload,
        };
        if let Err(e) = self.append_line(&self.alerts_path(), &event) {
            warn!("alert log append failed: {}", e);
        }
    }

    /// Record a completed x402 transaction in the snapshot.
    pub async fn record_x402(&self, transaction: serde_json::Value) {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.x402_transactions.push(transaction);
        // Bounded; the snapshot is a view, not a ledger
        let overflow = snapshot.x402_transactions.len().saturating_sub(100);
        if overflow > 0 {
            snapshot.x402_transactions.drain(..overflow);
        }
    }

    /// Merge global stats and budget configs into the snapshot.
    pub async fn update_stats(
        &self,
        global_stats: HashMap<String, serde_json::Value>,
        budget_configs: HashMap<String, serde_json::Value>,
    ) {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.global_stats.extend(global_stats);
        snapshot.budget_configs.extend(budget_configs);
    }

    pub async fn record_completion(&self, completion: serde_json::Value) {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.recent_completions.push(completion);
        let overflow = snapshot.recent_completions.len().saturating_sub(50);
        if overflow > 0 {
            snapshot.recent_completions.drain(..overflow);
        }
    }

    pub async fn record_rubric_report(&self, report: serde_json::Value) {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.rubric_reports.push(report);
        let overflow = snapshot.rubric_reports.len().saturating_sub(50);
        if overflow > 0 {
            snapshot.rubric_reports.drain(..overflow);
        }
    }

    /// Write the current snapshot to disk and return it.
    pub async fn flush_snapshot(&self) -> AgencyResult<DashboardSnapshot> {
        let snapshot = {
            let mut snapshot = self.snapshot.lock().await;
            snapshot.generated_at = Some(Utc::now());
            snapshot.clone()
        };
        std::fs::create_dir_all(&self.log_dir)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        let body = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        std::fs::write(self.snapshot_path(), body)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        Ok(snapshot)
    }

    /// Write a per-business summary on completion.
    pub async fn write_business_summary(
        &self,
        business_id: &str,
        summary: serde_json::Value,
    ) -> AgencyResult<()> {
        let sanitized: String = business_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if sanitized.is_empty() {
            return Err(AgencyError::Validation(format!(
                "invalid business id: {}",
                business_id
            )));
        }
        std::fs::create_dir_all(&self.log_dir)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        let path = self.log_dir.join(format!("{}_summary.json", sanitized));
        let body = serde_json::to_string_pretty(&summary)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        std::fs::write(path, body).map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn snapshot(&self) -> DashboardSnapshot {
        self.snapshot.lock().await.clone()
    }

    fn append_line(&self, path: &PathBuf, event: &DashboardEvent) -> AgencyResult<()> {
        std::fs::create_dir_all(&self.log_dir)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        let line = serde_json::to_string(event)
            .map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        writeln!(file, "{}", line).map_err(|e| AgencyError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}
