//! Micro-payment ledger
//!
//! Per-request x402 debits for every external vendor call an agent
//! makes. Vendor payment hints come from the capability cache, cacheable
//! creative assets are reused within their TTL instead of re-bought, and
//! a per-agent debit cap fails the enclosing operation when breached.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::budget::{ApprovalCapability, PaymentReceipt};
use crate::error::{AgencyError, AgencyResult};
use crate::tools::VendorCache;

/// Minimum billable amount per debit.
const MIN_CHARGE: f64 = 0.01;

/// Ledger tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Per-agent debit ceiling per window
    pub debit_cap: f64,
    /// Default reuse TTL for cacheable assets
    pub asset_ttl_hours: i64,
    /// Wallet recorded on receipts
    pub wallet_address: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            debit_cap: 25.0,
            asset_ttl_hours: 168,
            wallet_address: String::new(),
        }
    }
}

/// A previously purchased creative asset eligible for reuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAsset {
    pub signature: String,
    pub vendor: String,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of one charge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChargeResult {
    /// A cached asset satisfied the request; nothing was charged.
    Reused {
        signature: String,
        vendor: String,
        cached_at: DateTime<Utc>,
    },
    /// A payment was recorded.
    Paid { receipt: PaymentReceipt },
}

impl ChargeResult {
    pub fn was_charged(&self) -> bool {
        matches!(self, ChargeResult::Paid { .. })
    }
}

/// Per-request debit ledger shared by all agents.
pub struct PaymentLedger {
    config: PaymentConfig,
    approver: Arc<dyn ApprovalCapability>,
    vendor_cache: Arc<dyn VendorCache>,
    assets: Mutex<HashMap<String, CachedAsset>>,
    /// agent -> total debits this window
    agent_spend: Mutex<HashMap<String, f64>>,
    /// vendor -> total debits, for the dashboard
    vendor_spend: Mutex<HashMap<String, f64>>,
}

impl PaymentLedger {
    pub fn new(approver: Arc<dyn ApprovalCapability>, vendor_cache: Arc<dyn VendorCache>) -> Self {
        Self {
            config: PaymentConfig::default(),
            approver,
            vendor_cache,
            assets: Mutex::new(HashMap::new()),
            agent_spend: Mutex::new(HashMap::new()),
            vendor_spend: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: PaymentConfig) -> Self {
        self.config = config;
        self
    }

    /// Charge a vendor call for an agent.
    ///
    /// Cacheable assets with a fresh cached copy return `Reused` with no
    /// new charge. Exceeding the per-agent debit cap fails the call.
    pub async fn charge(
        &self,
        agent: &str,
        vendor: &str,
        amount: f64,
        metadata: serde_json::Value,
    ) -> AgencyResult<ChargeResult> {
        let metadata = self.prepare_metadata(agent, vendor, metadata);

        let cacheable = metadata["cacheable_asset"].as_bool().unwrap_or(false);
        let ttl_hours = metadata["asset_ttl_hours"]
            .as_i64()
            .unwrap_or(self.config.asset_ttl_hours);
        let signature = if cacheable {
            Some(self.asset_signature(vendor, &metadata))
        } else {
            None
        };

        if let Some(sig) = &signature {
            if let Some(cached) = self.reusable_asset(sig, ttl_hours).await {
                info!("reusing creative asset {} (vendor={})", sig, cached.vendor);
                return Ok(ChargeResult::Reused {
                    signature: sig.clone(),
                    vendor: cached.vendor,
                    cached_at: cached.timestamp,
                });
            }
        }

        let amount = amount.max(MIN_CHARGE);
        {
            let spend = self.agent_spend.lock().await;
            let current = spend.get(agent).copied().unwrap_or(0.0);
            if current + amount > self.config.debit_cap {
                warn!(
                    "x402 debit cap reached for {}: ${:.2} + ${:.2} > ${:.2}",
                    agent, current, amount, self.config.debit_cap
                );
                return Err(AgencyError::BudgetExceeded {
                    agent: agent.to_string(),
                    requested: amount,
                    spent: current,
                    limit: self.config.debit_cap,
                });
            }
        }

        let receipt = self
            .approver
            .record_manual_payment(agent, vendor, amount, &metadata)
            .await?;

        if let Some(sig) = signature {
            self.assets.lock().await.insert(
                sig.clone(),
                CachedAsset {
                    signature: sig,
                    vendor: vendor.to_string(),
                    amount,
                    timestamp: Utc::now(),
                },
            );
        }

        *self
            .agent_spend
            .lock()
            .await
            .entry(agent.to_string())
            .or_insert(0.0) += amount;
        *self
            .vendor_spend
            .lock()
            .await
            .entry(vendor.to_string())
            .or_insert(0.0) += amount;

        info!("x402 debit ${:.4} {} -> {}", amount, agent, vendor);
        Ok(ChargeResult::Paid { receipt })
    }

    /// Total debits recorded for an agent this window.
    pub async fn agent_spend(&self, agent: &str) -> f64 {
        self.agent_spend
            .lock()
            .await
            .get(agent)
            .copied()
            .unwrap_or(0.0)
    }

    /// Per-vendor totals for the dashboard feed.
    pub async fn vendor_totals(&self) -> HashMap<String, f64> {
        self.vendor_spend.lock().await.clone()
    }

    fn prepare_metadata(
        &self,
        agent: &str,
        vendor: &str,
        metadata: serde_json::Value,
    ) -> serde_json::Value {
        let mut map = match metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("note".to_string(), other);
                map
            }
        };
        map.entry("agent_name".to_string())
            .or_insert_with(|| serde_json::json!(agent));
        if !self.config.wallet_address.is_empty() {
            map.entry("wallet".to_string())
                .or_insert_with(|| serde_json::json!(self.config.wallet_address));
        }
        if let Some(capabilities) = self.vendor_cache.lookup(vendor) {
            map.entry("accepted_tokens".to_string())
                .or_insert_with(|| serde_json::json!(capabilities.accepted_tokens));
            map.entry("preferred_chain".to_string())
                .or_insert_with(|| serde_json::json!(capabilities.preferred_chain));
        }
        serde_json::Value::Object(map)
    }

    fn asset_signature(&self, vendor: &str, metadata: &serde_json::Value) -> String {
        if let Some(sig) = metadata["asset_signature"].as_str() {
            return sig.to_string();
        }
        let title = metadata["title"]
            .as_str()
            .or_else(|| metadata["project"].as_str())
            .or_else(|| metadata["keywords"].as_str())
            .unwrap_or("generic");
        format!("{}:{}", vendor, title)
    }

    async fn reusable_asset(&self, signature: &str, ttl_hours: i64) -> Option<CachedAsset> {
        let assets = self.assets.lock().await;
        let asset = assets.get(signature)?;
        let age = Utc::now() - asset.timestamp;
        if age < Duration::hours(ttl_hours) {
            Some(asset.clone())
        } else {
            None
        }
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LEDGER: Arc<PaymentLedger> = {
        let config = crate::config::get_config();
        Arc::new(
            PaymentLedger::new(
                Arc::new(super::budget::AutoApprover),
                Arc::new(crate::tools::StaticVendorCache::new()),
            )
            .with_config(PaymentConfig {
                debit_cap: config.x402_debit_cap,
                asset_ttl_hours: config.asset_ttl_hours,
                wallet_address: config.wallet_address.clone(),
            }),
        )
    };
}

/// Process-wide payment ledger configured from the environment.
pub fn get_payment_ledger() -> Arc<PaymentLedger> {
    GLOBAL_LEDGER.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::budget::AutoApprover;
    use crate::tools::{StaticVendorCache, VendorCapabilities};

    fn ledger() -> PaymentLedger {
        let cache = StaticVendorCache::new();
        cache.insert(
            "email-delivery-api",
            VendorCapabilities {
                accepted_tokens: vec!["USDC".to_string()],
                preferred_chain: "base".to_string(),
            },
        );
        PaymentLedger::new(Arc::new(AutoApprover), Arc::new(cache))
    }

    #[tokio::test]
    async fn test_charge_records_receipt_with_vendor_hints() {
        let ledger = ledger();
        let result = ledger
            .charge(
                "email",
                "email-delivery-api",
                0.05,
                serde_json::json!({"campaign_id": "CAMP-1"}),
            )
            .await
            .unwrap();

        match result {
            ChargeResult::Paid { receipt } => {
                assert!((receipt.amount - 0.05).abs() < 1e-9);
                assert_eq!(receipt.metadata["preferred_chain"], "base");
                assert_eq!(receipt.metadata["agent_name"], "email");
            }
            other => panic!("expected Paid, got {:?}", other),
        }
        assert!((ledger.agent_spend("email").await - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_minimum_charge_floor() {
        let ledger = ledger();
        let result = ledger
            .charge("email", "vendor", 0.0001, serde_json::json!({}))
            .await
            .unwrap();
        match result {
            ChargeResult::Paid { receipt } => assert!((receipt.amount - MIN_CHARGE).abs() < 1e-9),
            other => panic!("expected Paid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cacheable_asset_is_reused_within_ttl() {
        let ledger = ledger();
        let metadata = serde_json::json!({
            "cacheable_asset": true,
            "title": "launch-video",
            "asset_ttl_hours": 168,
        });

        let first = ledger
            .charge("content", "video-gen", 2.0, metadata.clone())
            .await
            .unwrap();
        assert!(first.was_charged());

        let second = ledger
            .charge("content", "video-gen", 2.0, metadata)
            .await
            .unwrap();
        assert!(!second.was_charged());
        match second {
            ChargeResult::Reused { signature, .. } => {
                assert_eq!(signature, "video-gen:launch-video")
            }
            other => panic!("expected Reused, got {:?}", other),
        }

        // The reuse charged nothing extra
        assert!((ledger.agent_spend("content").await - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_explicit_asset_signature_wins() {
        let ledger = ledger();
        let metadata = serde_json::json!({
            "cacheable_asset": true,
            "asset_signature": "acme:hosting:video",
        });
        ledger
            .charge("content", "video-gen", 1.0, metadata.clone())
            .await
            .unwrap();
        let second = ledger
            .charge("content", "video-gen", 1.0, metadata)
            .await
            .unwrap();
        match second {
            ChargeResult::Reused { signature, .. } => assert_eq!(signature, "acme:hosting:video"),
            other => panic!("expected Reused, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_debit_cap_fails_the_call() {
        let ledger = ledger().with_config(PaymentConfig {
            debit_cap: 1.0,
            ..PaymentConfig::default()
        });

        ledger
            .charge("email", "vendor", 0.9, serde_json::json!({}))
            .await
            .unwrap();
        let err = ledger
            .charge("email", "vendor", 0.5, serde_json::json!({}))
            .await
            .err()
            .expect("cap breach");
        assert!(matches!(err, AgencyError::BudgetExceeded { .. }));
        // The failed call charged nothing
        assert!((ledger.agent_spend("email").await - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_vendor_totals_accumulate() {
        let ledger = ledger();
        ledger
            .charge("email", "analytics", 0.02, serde_json::json!({}))
            .await
            .unwrap();
        ledger
            .charge("support", "analytics", 0.03, serde_json::json!({}))
            .await
            .unwrap();
        let totals = ledger.vendor_totals().await;
        assert!((totals["analytics"] - 0.05).abs() < 1e-9);
    }
}
