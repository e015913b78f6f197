//! Memory System Module
//!
//! Tiered agent/user memory with heat-based promotion, the persistence
//! capability behind it, and the append-only trajectory store.

pub mod backend;
pub mod entry;
pub mod substrate;
pub mod trajectory;

pub use backend::{
    connect_backend, HttpMemoryBackend, InProcessBackend, MemoryBackend, MemoryCollection,
    MemoryQuery, SortKey,
};
pub use entry::{MemoryEntry, MemoryTier};
pub use substrate::{MemoryConfig, MemoryStats, MemorySubstrate, StoreKind};
pub use trajectory::{
    get_trajectory_store, ActionStep, AntiPattern, Outcome, Trajectory, TrajectoryStore,
};
