//! Safety Module
//!
//! The safety gate the router consults before model selection, plus the
//! collaborative response filter applied after generation.

mod content_filter;

pub use content_filter::{redact_credentials, ContentFilter, PatternShield};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Verdict from the pre-routing query gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub confidence: f64,
    pub explanation: String,
}

/// One issue the collaborative filter found in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyIssue {
    pub description: String,
    /// 0-10, higher is worse
    pub severity: u8,
}

/// Result of filtering a generated response against its query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredResponse {
    pub final_response: String,
    pub safety_score: f64,
    pub helpfulness_score: f64,
    pub blocked: bool,
    pub issues: Vec<SafetyIssue>,
    pub processing_time_ms: f64,
}

/// Safety capability consulted by the router and the runtime.
#[async_trait]
pub trait SafetyShield: Send + Sync {
    /// Gate a raw task/query before any model is selected.
    async fn filter_unsafe_query(&self, text: &str) -> SafetyVerdict;

    /// Post-process a generated response; may redact or block it.
    async fn collaborative_filter(
        &self,
        query: &str,
        response: &str,
        agent: &str,
    ) -> FilteredResponse;
}
