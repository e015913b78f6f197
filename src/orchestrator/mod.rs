//! Orchestrator Module
//!
//! The control-plane core: difficulty-aware routing, spend governance,
//! micro-payments, the per-agent runtime pipeline, and the offline
//! evolution engine with its rubric gate.

pub mod budget;
pub mod evolution;
pub mod payments;
pub mod router;
pub mod runtime;
pub mod verifier;

pub use budget::{
    get_spend_governor, ApprovalCapability, ApprovalOutcome, ApprovalStatus, AuditEntry,
    AutoApprover, BudgetConfig, BudgetStatus, PaymentReceipt, SpendGovernor,
};
pub use evolution::{
    EvolutionArchive, EvolutionAttempt, EvolutionConfig, EvolutionEngine, EvolutionPattern,
    EvolutionRunResult, ImprovementType,
};
pub use payments::{get_payment_ledger, ChargeResult, PaymentConfig, PaymentLedger};
pub use router::{
    get_router, ContextLinter, ContextMessage, ContextMetrics, CostSavings, DifficultyRouter,
    LintedContext, ModelTier, RoutingDecision, Task, TaskDifficulty,
};
pub use runtime::{
    AgentRuntime, RuntimeConfig, SessionState, TaskEnvelope, TaskFailure, TaskRequest, TaskSuccess,
};
pub use verifier::{RubricVerifier, VerificationResult, VerifierConfig, VerifierFeedback};
