//! Spend Governor
//!
//! Monthly per-agent budget enforcement with an HMAC-signed audit log.
//! One logical writer per agent ledger: the whole validate → approve →
//! sign → append → increment sequence runs under the agent's lock, so
//! the `monthly_spend + amount <= monthly_limit` invariant holds across
//! concurrent requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{AgencyError, AgencyResult};
use crate::safety::redact_credentials;

type HmacSha256 = Hmac<Sha256>;

/// Per-agent budget policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub monthly_limit: f64,
    /// Transactions at or above this raise an alert
    pub per_transaction_alert: f64,
    /// Transactions at or above this require manual review
    pub require_manual_above: f64,
    /// Transactions at or below this are auto-approved
    pub auto_approval_limit: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_limit: 200.0,
            per_transaction_alert: 50.0,
            require_manual_above: 100.0,
            auto_approval_limit: 50.0,
        }
    }
}

/// Approval decision from the external capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Denied,
    PendingApproval,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::PendingApproval => "pending_approval",
        }
    }
}

/// What the approval capability returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cart: Option<serde_json::Value>,
    /// Populated only by batch-capable approval backends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_approval: Option<serde_json::Value>,
}

impl ApprovalOutcome {
    pub fn approved() -> Self {
        Self {
            status: ApprovalStatus::Approved,
            intent: None,
            cart: None,
            batch_approval: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            status: ApprovalStatus::Denied,
            intent: None,
            cart: None,
            batch_approval: None,
        }
    }
}

/// Micro-payment receipt from the payment capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub tx_hash: String,
    pub amount: f64,
    pub token: String,
    pub chain: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// External approval/payment capability.
#[async_trait]
pub trait ApprovalCapability: Send + Sync {
    async fn request_purchase(
        &self,
        agent: &str,
        user_id: &str,
        service: &str,
        price: f64,
        categories: &[String],
        metadata: &serde_json::Value,
    ) -> AgencyResult<ApprovalOutcome>;

    async fn record_manual_payment(
        &self,
        agent: &str,
        vendor: &str,
        amount: f64,
        metadata: &serde_json::Value,
    ) -> AgencyResult<PaymentReceipt>;
}

/// Approval backend that approves everything; local development default.
pub struct AutoApprover;

#[async_trait]
impl ApprovalCapability for AutoApprover {
    async fn request_purchase(
        &self,
        _agent: &str,
        _user_id: &str,
        _service: &str,
        _price: f64,
        _categories: &[String],
        _metadata: &serde_json::Value,
    ) -> AgencyResult<ApprovalOutcome> {
        Ok(ApprovalOutcome::approved())
    }

    async fn record_manual_payment(
        &self,
        _agent: &str,
        vendor: &str,
        amount: f64,
        metadata: &serde_json::Value,
    ) -> AgencyResult<PaymentReceipt> {
        Ok(PaymentReceipt {
            tx_hash: format!("0x{}", hex::encode(uuid::Uuid::new_v4().as_bytes())),
            amount,
            token: "USDC".to_string(),
            chain: "base".to_string(),
            metadata: metadata.clone(),
            timestamp: Utc::now(),
        })
    }
}

/// Signed record of one approved spend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub service: String,
    pub amount: f64,
    pub status: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
}

impl AuditEntry {
    /// Canonical JSON of the entry without its signature field.
    /// serde_json maps are key-sorted, which makes this deterministic.
    fn canonical_payload(&self) -> AgencyResult<String> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| AgencyError::Validation(e.to_string()))?;
        if let Some(map) = value.as_object_mut() {
            map.remove("signature");
        }
        serde_json::to_string(&value).map_err(|e| AgencyError::Validation(e.to_string()))
    }
}

/// Sign the canonical form of an entry with HMAC-SHA256.
pub fn sign_entry(secret: &str, entry: &AuditEntry) -> AgencyResult<String> {
    let payload = entry.canonical_payload()?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AgencyError::Configuration(format!("invalid AP2 secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify an entry's signature against the canonical form.
pub fn verify_entry(secret: &str, entry: &AuditEntry) -> AgencyResult<bool> {
    let expected = sign_entry(secret, entry)?;
    let payload = entry.canonical_payload()?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AgencyError::Configuration(format!("invalid AP2 secret: {}", e)))?;
    mac.update(payload.as_bytes());
    let provided = hex::decode(&entry.signature)
        .map_err(|_| AgencyError::Signature {
            context: format!("audit entry for {}", entry.service),
        })?;
    Ok(mac.verify_slice(&provided).is_ok() && expected == entry.signature)
}

/// Outcome handed back to the call site after a successful spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendApproval {
    pub status: ApprovalStatus,
    pub auto_approval: bool,
    pub manual_review: bool,
    pub alert: bool,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cart: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_approval: Option<serde_json::Value>,
}

#[derive(Debug)]
struct AgentLedger {
    monthly_spend: f64,
    window: String,
    audit_log: Vec<AuditEntry>,
}

impl AgentLedger {
    fn new(window: String) -> Self {
        Self {
            monthly_spend: 0.0,
            window,
            audit_log: Vec::new(),
        }
    }
}

/// Snapshot of an agent's budget state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub monthly_limit: f64,
    pub monthly_spend: f64,
    pub remaining_budget: f64,
    pub window: String,
    pub audit_entries: usize,
}

/// Process-wide spend governor; single writer per agent ledger.
pub struct SpendGovernor {
    secret: String,
    config: BudgetConfig,
    ledgers: Mutex<HashMap<String, Arc<Mutex<AgentLedger>>>>,
    approver: Arc<dyn ApprovalCapability>,
}

impl SpendGovernor {
    pub fn new(secret: impl Into<String>, approver: Arc<dyn ApprovalCapability>) -> Self {
        Self {
            secret: secret.into(),
            config: BudgetConfig::default(),
            ledgers: Mutex::new(HashMap::new()),
            approver,
        }
    }

    pub fn with_config(mut self, config: BudgetConfig) -> Self {
        self.config = config;
        self
    }

    /// Authorize a spend against the agent's monthly budget.
    ///
    /// Rejections charge nothing and append nothing; every approved
    /// spend appends exactly one signed, verified audit entry.
    pub async fn ensure_budget(
        &self,
        agent: &str,
        service: &str,
        amount: f64,
        metadata: serde_json::Value,
        expected_range: Option<(f64, f64)>,
    ) -> AgencyResult<SpendApproval> {
        self.ensure_budget_at(agent, service, amount, metadata, expected_range, Utc::now())
            .await
    }

    pub(crate) async fn ensure_budget_at(
        &self,
        agent: &str,
        service: &str,
        amount: f64,
        metadata: serde_json::Value,
        expected_range: Option<(f64, f64)>,
        now: DateTime<Utc>,
    ) -> AgencyResult<SpendApproval> {
        if amount <= 0.0 {
            return Err(AgencyError::Validation(format!(
                "spend amount must be positive, got {}",
                amount
            )));
        }
        if let Some((min, max)) = expected_range {
            if amount < min || amount > max {
                return Err(AgencyError::Validation(format!(
                    "{} cost ${:.2} outside documented range ${:.2}-${:.2}",
                    service, amount, min, max
                )));
            }
        }

        let ledger = self.ledger_for(agent).await;
        let mut ledger = ledger.lock().await;

        // Calendar month rollover resets the spend counter
        let window = now.format("%Y-%m").to_string();
        if ledger.window != window {
            ledger.monthly_spend = 0.0;
            ledger.window = window;
        }

        if ledger.monthly_spend + amount > self.config.monthly_limit {
            return Err(AgencyError::BudgetExceeded {
                agent: agent.to_string(),
                requested: amount,
                spent: ledger.monthly_spend,
                limit: self.config.monthly_limit,
            });
        }

        let auto_approval = amount <= self.config.auto_approval_limit;
        let manual_review = amount >= self.config.require_manual_above;
        let alert = amount >= self.config.per_transaction_alert;
        if alert {
            warn!(
                "spend alert: {} requesting ${:.2} for {} (threshold ${:.2})",
                agent, amount, service, self.config.per_transaction_alert
            );
        }

        let redacted_metadata = redact_metadata(&metadata);
        let outcome = self
            .approver
            .request_purchase(agent, "system", service, amount, &[], &redacted_metadata)
            .await?;

        if outcome.status != ApprovalStatus::Approved {
            return Err(AgencyError::ApprovalDenied {
                service: service.to_string(),
                status: outcome.status.as_str().to_string(),
            });
        }

        let mut entry = AuditEntry {
            service: service.to_string(),
            amount,
            status: outcome.status.as_str().to_string(),
            metadata: redacted_metadata,
            timestamp: now,
            signature: String::new(),
        };
        entry.signature = sign_entry(&self.secret, &entry)?;
        if !verify_entry(&self.secret, &entry)? {
            return Err(AgencyError::Signature {
                context: format!("audit entry for {}", service),
            });
        }

        let signature = entry.signature.clone();
        ledger.audit_log.push(entry);
        ledger.monthly_spend += amount;

        info!(
            "approved ${:.2} for {} via {} (spend ${:.2}/{:.2})",
            amount, agent, service, ledger.monthly_spend, self.config.monthly_limit
        );

        Ok(SpendApproval {
            status: outcome.status,
            auto_approval,
            manual_review,
            alert,
            signature,
            intent: outcome.intent,
            cart: outcome.cart,
            batch_approval: outcome.batch_approval,
        })
    }

    /// Current budget snapshot for an agent.
    pub async fn status(&self, agent: &str) -> BudgetStatus {
        let ledger = self.ledger_for(agent).await;
        let ledger = ledger.lock().await;
        BudgetStatus {
            monthly_limit: self.config.monthly_limit,
            monthly_spend: ledger.monthly_spend,
            remaining_budget: (self.config.monthly_limit - ledger.monthly_spend).max(0.0),
            window: ledger.window.clone(),
            audit_entries: ledger.audit_log.len(),
        }
    }

    /// Copy of an agent's audit log, ordered by append time.
    pub async fn audit_log(&self, agent: &str) -> Vec<AuditEntry> {
        let ledger = self.ledger_for(agent).await;
        let ledger = ledger.lock().await;
        ledger.audit_log.clone()
    }

    /// Re-verify every signature in an agent's audit log.
    pub async fn verify_audit_log(&self, agent: &str) -> AgencyResult<bool> {
        let entries = self.audit_log(agent).await;
        for entry in &entries {
            if !verify_entry(&self.secret, entry)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn approver(&self) -> Arc<dyn ApprovalCapability> {
        self.approver.clone()
    }

    async fn ledger_for(&self, agent: &str) -> Arc<Mutex<AgentLedger>> {
        let mut ledgers = self.ledgers.lock().await;
        ledgers
            .entry(agent.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AgentLedger::new(
                    Utc::now().format("%Y-%m").to_string(),
                )))
            })
            .clone()
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_GOVERNOR: Arc<SpendGovernor> = {
        let config = crate::config::get_config();
        Arc::new(
            SpendGovernor::new(config.ap2_secret.clone(), Arc::new(AutoApprover)).with_config(
                BudgetConfig {
                    monthly_limit: config.monthly_limit,
                    per_transaction_alert: config.per_transaction_alert,
                    require_manual_above: config.require_manual_above,
                    auto_approval_limit: config.auto_approval_limit,
                },
            ),
        )
    };
}

/// Process-wide spend governor configured from the environment.
pub fn get_spend_governor() -> Arc<SpendGovernor> {
    GLOBAL_GOVERNOR.clone()
}

fn redact_metadata(metadata: &serde_json::Value) -> serde_json::Value {
    match metadata {
        serde_json::Value::String(s) => serde_json::Value::String(redact_credentials(s)),
        serde_json::Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                let lower = key.to_lowercase();
                if ["key", "token", "password", "secret", "credential"]
                    .iter()
                    .any(|s| lower.contains(s))
                {
                    redacted.insert(key.clone(), serde_json::json!("***REDACTED***"));
                } else {
                    redacted.insert(key.clone(), redact_metadata(value));
                }
            }
            serde_json::Value::Object(redacted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_metadata).collect())
        }
        other => other.clone(),
    }
}
