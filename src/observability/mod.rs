//! Observability Module
//!
//! Correlation contexts, typed spans with sampling, and point-in-time
//! metric snapshots. Every log, span, receipt, and trajectory produced
//! for a request carries the same correlation id.

pub mod dashboard;
pub mod server;

pub use dashboard::{DashboardFeed, DashboardSnapshot};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::safety::redact_credentials;

/// Span classification for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanType {
    /// Top-level orchestration flow
    Orchestration,
    /// Task decomposition
    Htdag,
    /// Agent routing
    Halo,
    /// Validation
    Aop,
    /// Agent execution
    Execution,
    /// Shared services (stores, caches, IO)
    Infrastructure,
}

impl SpanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanType::Orchestration => "orchestration",
            SpanType::Htdag => "htdag",
            SpanType::Halo => "halo",
            SpanType::Aop => "aop",
            SpanType::Execution => "execution",
            SpanType::Infrastructure => "infrastructure",
        }
    }
}

/// Sampling and labelling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// 1.0 records everything, 0.0 nothing
    pub sampling_ratio: f64,
    /// When set, only these span types are recorded
    pub allowed_span_types: Option<HashSet<SpanType>>,
    /// Merged into every metric's labels
    pub default_metric_labels: HashMap<String, String>,
}

impl ObservabilityConfig {
    pub fn record_all() -> Self {
        Self {
            sampling_ratio: 1.0,
            allowed_span_types: None,
            default_metric_labels: HashMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.default_metric_labels = labels;
        self
    }

    /// Whether a span of this type should be recorded.
    pub fn should_trace(&self, span_type: SpanType) -> bool {
        if let Some(allowed) = &self.allowed_span_types {
            if !allowed.contains(&span_type) {
                return false;
            }
        }
        if self.sampling_ratio >= 1.0 {
            return true;
        }
        if self.sampling_ratio <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.sampling_ratio
    }

    pub fn merge_metric_labels(
        &self,
        labels: Option<&HashMap<String, String>>,
    ) -> HashMap<String, String> {
        let mut merged = self.default_metric_labels.clone();
        if let Some(labels) = labels {
            for (k, v) in labels {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

/// Correlation context for end-to-end request tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub user_request: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl CorrelationContext {
    pub fn new(user_request: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            user_request: user_request.into(),
            timestamp: Utc::now(),
            parent_span_id: None,
        }
    }

    pub fn child(&self, span_id: impl Into<String>) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            user_request: self.user_request.clone(),
            timestamp: Utc::now(),
            parent_span_id: Some(span_id.into()),
        }
    }
}

/// Point-in-time metric snapshot for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// An open span; filtered spans become no-ops.
pub struct SpanHandle {
    span_id: String,
    name: String,
    span_type: SpanType,
    correlation_id: Option<String>,
    attributes: HashMap<String, serde_json::Value>,
    started: std::time::Instant,
    recorded: bool,
}

impl SpanHandle {
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        if self.recorded {
            self.attributes.insert(key.into(), value);
        }
    }

    /// Close the span with a terminal status.
    pub fn finish(self, status: SpanStatus) -> f64 {
        let duration = self.started.elapsed().as_secs_f64();
        if self.recorded {
            match status {
                SpanStatus::Ok => debug!(
                    span_id = %self.span_id,
                    span_type = self.span_type.as_str(),
                    correlation_id = self.correlation_id.as_deref().unwrap_or(""),
                    duration,
                    attributes = %serde_json::to_string(&self.attributes).unwrap_or_default(),
                    "span completed: {}",
                    self.name
                ),
                SpanStatus::Error => error!(
                    span_id = %self.span_id,
                    span_type = self.span_type.as_str(),
                    correlation_id = self.correlation_id.as_deref().unwrap_or(""),
                    duration,
                    "span failed: {}",
                    self.name
                ),
            }
        }
        duration
    }
}

/// Central observability manager.
pub struct ObservabilityManager {
    config: ObservabilityConfig,
    metrics: Mutex<Vec<MetricSnapshot>>,
}

impl ObservabilityManager {
    pub fn new(config: ObservabilityConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ObservabilityConfig {
        &self.config
    }

    /// Create a correlation context for a new request.
    /// Credentials are redacted before the request text is logged.
    pub fn create_correlation_context(&self, user_request: &str) -> CorrelationContext {
        let ctx = CorrelationContext::new(user_request);
        info!(
            correlation_id = %ctx.correlation_id,
            "created correlation context: {}",
            redact_credentials(user_request)
        );
        ctx
    }

    /// Open a span; sampled-out spans are no-ops.
    pub fn span(
        &self,
        name: impl Into<String>,
        span_type: SpanType,
        context: Option<&CorrelationContext>,
    ) -> SpanHandle {
        let recorded = self.config.should_trace(span_type);
        let name = name.into();
        let span_id = format!("{:016x}", rand::thread_rng().gen::<u64>());
        if recorded {
            debug!(
                span_id = %span_id,
                span_type = span_type.as_str(),
                correlation_id = context.map(|c| c.correlation_id.as_str()).unwrap_or(""),
                "span started: {}",
                name
            );
        }
        SpanHandle {
            span_id,
            name,
            span_type,
            correlation_id: context.map(|c| c.correlation_id.clone()),
            attributes: HashMap::new(),
            started: std::time::Instant::now(),
            recorded,
        }
    }

    /// Record a metric snapshot with default labels merged in.
    pub async fn record_metric(
        &self,
        metric_name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        labels: Option<&HashMap<String, String>>,
    ) {
        let snapshot = MetricSnapshot {
            metric_name: metric_name.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
            labels: self.config.merge_metric_labels(labels),
        };
        debug!(
            "metric recorded: {}={}{}",
            snapshot.metric_name, snapshot.value, snapshot.unit
        );
        self.metrics.lock().await.push(snapshot);
    }

    /// Run an operation inside a span, recording `<name>.duration`.
    pub async fn timed<F, T>(
        &self,
        operation_name: &str,
        span_type: SpanType,
        context: Option<&CorrelationContext>,
        operation: F,
    ) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let span = self.span(operation_name, span_type, context);
        let result = operation.await;
        let duration = span.finish(SpanStatus::Ok);

        let mut labels = HashMap::new();
        labels.insert("operation".to_string(), operation_name.to_string());
        self.record_metric(
            format!("{}.duration", operation_name),
            duration,
            "seconds",
            Some(&labels),
        )
        .await;
        result
    }

    /// All recorded snapshots, oldest first.
    pub async fn metrics(&self) -> Vec<MetricSnapshot> {
        self.metrics.lock().await.clone()
    }

    /// Count/min/max/avg/sum per metric name.
    pub async fn metrics_summary(&self) -> serde_json::Value {
        let metrics = self.metrics.lock().await;
        if metrics.is_empty() {
            return serde_json::json!({"total_metrics": 0});
        }

        let mut by_name: HashMap<String, Vec<f64>> = HashMap::new();
        for metric in metrics.iter() {
            by_name
                .entry(metric.metric_name.clone())
                .or_default()
                .push(metric.value);
        }

        let mut per_metric = serde_json::Map::new();
        for (name, values) in &by_name {
            let sum: f64 = values.iter().sum();
            per_metric.insert(
                name.clone(),
                serde_json::json!({
                    "count": values.len(),
                    "min": values.iter().cloned().fold(f64::MAX, f64::min),
                    "max": values.iter().cloned().fold(f64::MIN, f64::max),
                    "avg": sum / values.len() as f64,
                    "sum": sum,
                }),
            );
        }

        serde_json::json!({
            "total_metrics": metrics.len(),
            "unique_metrics": by_name.len(),
            "by_metric": per_metric,
        })
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_OBSERVABILITY: Arc<ObservabilityManager> = Arc::new(
        ObservabilityManager::new(ObservabilityConfig::record_all())
    );
}

/// Process-wide observability manager.
pub fn get_observability_manager() -> Arc<ObservabilityManager> {
    GLOBAL_OBSERVABILITY.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_type_filter() {
        let config = ObservabilityConfig {
            sampling_ratio: 1.0,
            allowed_span_types: Some([SpanType::Execution].into_iter().collect()),
            default_metric_labels: HashMap::new(),
        };
        assert!(config.should_trace(SpanType::Execution));
        assert!(!config.should_trace(SpanType::Htdag));
    }

    #[test]
    fn test_sampling_extremes() {
        let all = ObservabilityConfig {
            sampling_ratio: 1.0,
            ..Default::default()
        };
        let none = ObservabilityConfig {
            sampling_ratio: 0.0,
            ..Default::default()
        };
        for _ in 0..20 {
            assert!(all.should_trace(SpanType::Orchestration));
            assert!(!none.should_trace(SpanType::Orchestration));
        }
    }

    #[test]
    fn test_label_merging() {
        let mut defaults = HashMap::new();
        defaults.insert("service".to_string(), "agency".to_string());
        defaults.insert("environment".to_string(), "test".to_string());
        let config = ObservabilityConfig::record_all().with_labels(defaults);

        let mut extra = HashMap::new();
        extra.insert("agent".to_string(), "qa".to_string());
        extra.insert("environment".to_string(), "staging".to_string());

        let merged = config.merge_metric_labels(Some(&extra));
        assert_eq!(merged["service"], "agency");
        assert_eq!(merged["agent"], "qa");
        // Request labels win over defaults
        assert_eq!(merged["environment"], "staging");
    }

    #[test]
    fn test_correlation_propagation() {
        let ctx = CorrelationContext::new("build me a landing page");
        let child = ctx.child("span-1");
        assert_eq!(child.correlation_id, ctx.correlation_id);
        assert_eq!(child.parent_span_id.as_deref(), Some("span-1"));
    }

    #[tokio::test]
    async fn test_timed_records_duration_metric() {
        let manager = ObservabilityManager::new(ObservabilityConfig::record_all());
        let ctx = manager.create_correlation_context("request");

        let result = manager
            .timed("route_task", SpanType::Halo, Some(&ctx), async { 42 })
            .await;
        assert_eq!(result, 42);

        let metrics = manager.metrics().await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].metric_name, "route_task.duration");
        assert_eq!(metrics[0].unit, "seconds");
        assert_eq!(metrics[0].labels["operation"], "route_task");
    }

    #[tokio::test]
    async fn test_metrics_summary_statistics() {
        let manager = ObservabilityManager::new(ObservabilityConfig::record_all());
        for value in [1.0, 2.0, 3.0] {
            manager
                .record_metric("agent.calls", value, "count", None)
                .await;
        }
        let summary = manager.metrics_summary().await;
        assert_eq!(summary["total_metrics"], 3);
        assert_eq!(summary["by_metric"]["agent.calls"]["avg"], 2.0);
        assert_eq!(summary["by_metric"]["agent.calls"]["sum"], 6.0);
    }
}
