//! Configuration
//!
//! Central config for the control plane. Resolution order is explicit
//! constructor values, then `AGENCY_*` environment variables, then an
//! optional YAML file pointed at by `AGENCY_CONFIG_FILE`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sandbox resource caps applied to every variant validation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxLimits {
    /// Hard wall-clock timeout in seconds
    pub timeout_secs: u64,
    /// Memory ceiling in megabytes
    pub memory_mb: u64,
    /// Fraction of one CPU core (0.5 = 50%)
    pub cpu_quota: f64,
    /// Networking must stay disabled for untrusted variants
    pub network_disabled: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            memory_mb: 512,
            cpu_quota: 0.5,
            network_disabled: true,
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgencyConfig {
    /// Monthly per-agent budget ceiling in USD
    pub monthly_limit: f64,
    /// Per-transaction amount that triggers an alert
    pub per_transaction_alert: f64,
    /// Amounts at or above this require manual review
    pub require_manual_above: f64,
    /// Amounts at or below this are auto-approved
    pub auto_approval_limit: f64,
    /// Per-agent cap for x402 micro-payment debits per window
    pub x402_debit_cap: f64,
    /// Secret for HMAC-SHA256 audit signatures
    pub ap2_secret: String,
    /// Wallet address recorded on micro-payment receipts
    pub wallet_address: String,
    /// Cached creative assets younger than this are reused instead of re-bought
    pub asset_ttl_hours: i64,
    /// Benchmark suite directory for the evolution engine
    pub benchmark_path: PathBuf,
    /// Optional observability YAML (sampling ratio, allowed span types, labels)
    pub observability_config: Option<PathBuf>,
    /// Memory persistence service URL (the external capability)
    pub memory_url: Option<String>,
    /// When true, a persistence failure surfaces instead of falling back in-process
    pub strict_memory: bool,
    /// Port for the metrics/dashboard HTTP endpoints
    pub metrics_port: u16,
    /// Sandbox resource caps
    pub sandbox: SandboxLimits,
    /// Root for the append-only event log, snapshots, and alerts
    pub log_dir: PathBuf,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            monthly_limit: 200.0,
            per_transaction_alert: 50.0,
            require_manual_above: 100.0,
            auto_approval_limit: 50.0,
            x402_debit_cap: 25.0,
            ap2_secret: String::new(),
            wallet_address: String::new(),
            asset_ttl_hours: 168,
            benchmark_path: PathBuf::from("benchmarks"),
            observability_config: None,
            memory_url: None,
            strict_memory: false,
            metrics_port: 9901,
            sandbox: SandboxLimits::default(),
            log_dir: PathBuf::from("logs/business_generation"),
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
}

impl AgencyConfig {
    /// Load config from the environment, layered over the optional YAML file.
    ///
    /// `.env` files are honoured when present; missing keys keep defaults.
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let mut cfg = match std::env::var("AGENCY_CONFIG_FILE") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Parse a YAML config file. Unknown keys are ignored.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: AgencyConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Environment variables override file values.
    fn apply_env(&mut self) {
        if let Some(v) = env_f64("AGENCY_MONTHLY_LIMIT") {
            self.monthly_limit = v;
        }
        if let Some(v) = env_f64("AGENCY_ALERT_THRESHOLD") {
            self.per_transaction_alert = v;
        }
        if let Some(v) = env_f64("AGENCY_MANUAL_REVIEW_ABOVE") {
            self.require_manual_above = v;
        }
        if let Some(v) = env_f64("AGENCY_AUTO_APPROVAL_LIMIT") {
            self.auto_approval_limit = v;
        }
        if let Some(v) = env_f64("AGENCY_X402_CAP") {
            self.x402_debit_cap = v;
        }
        if let Ok(v) = std::env::var("AGENCY_AP2_SECRET") {
            self.ap2_secret = v;
        }
        if let Ok(v) = std::env::var("AGENCY_WALLET_ADDRESS") {
            self.wallet_address = v;
        }
        if let Some(v) = env_u64("AGENCY_ASSET_TTL_HOURS") {
            self.asset_ttl_hours = v as i64;
        }
        if let Ok(v) = std::env::var("AGENCY_BENCHMARK_PATH") {
            self.benchmark_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AGENCY_OBSERVABILITY_CONFIG") {
            self.observability_config = Some(PathBuf::from(v));
        }
        // MONGODB_URI kept for parity with existing deployments
        if let Ok(v) = std::env::var("AGENCY_MEMORY_URL").or_else(|_| std::env::var("AGENCY_MONGODB_URI")) {
            self.memory_url = Some(v);
        }
        if let Some(v) = env_bool("AGENCY_MEMORY_STRICT") {
            self.strict_memory = v;
        }
        if let Some(v) = env_u64("AGENCY_METRICS_PORT") {
            self.metrics_port = v as u16;
        }
        if let Some(v) = env_u64("AGENCY_SANDBOX_TIMEOUT_SECS") {
            self.sandbox.timeout_secs = v;
        }
        if let Some(v) = env_u64("AGENCY_SANDBOX_MEMORY_MB") {
            self.sandbox.memory_mb = v;
        }
        if let Some(v) = env_f64("AGENCY_SANDBOX_CPU_QUOTA") {
            self.sandbox.cpu_quota = v;
        }
        if let Ok(v) = std::env::var("AGENCY_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
    }

    pub fn with_monthly_limit(mut self, limit: f64) -> Self {
        self.monthly_limit = limit;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.ap2_secret = secret.into();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_CONFIG: Arc<AgencyConfig> = Arc::new(
        AgencyConfig::load().unwrap_or_default()
    );
}

/// Lazily constructed process-wide configuration.
pub fn get_config() -> Arc<AgencyConfig> {
    GLOBAL_CONFIG.clone()
}
