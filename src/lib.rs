//! Multi-agent orchestration control plane
//!
//! A population of specialist agents shares one runtime: tasks flow
//! through difficulty-aware model routing, budget governance with
//! signed audit trails, QA-gated self-correction, tiered memory with
//! heat-based promotion, and an offline evolution engine that turns
//! failure trajectories into benchmark-proven agent variants.

pub mod agent;
pub mod config;
pub mod error;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod safety;
pub mod tools;

// Re-exports for convenience
pub use agent::{AgentProfile, LLMProvider};
pub use config::{get_config, AgencyConfig};
pub use error::{AgencyError, AgencyResult};
pub use memory::{MemorySubstrate, TrajectoryStore};
pub use observability::get_observability_manager;
pub use orchestrator::{get_router, AgentRuntime, SpendGovernor, Task};
