//! Memory Entry types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Tier a memory entry lives in. An entry is in exactly one tier at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Short,
    Mid,
    Long,
    Consensus,
    Persona,
    Whiteboard,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Short => "short_term",
            MemoryTier::Mid => "mid_term",
            MemoryTier::Long => "long_term",
            MemoryTier::Consensus => "consensus",
            MemoryTier::Persona => "persona",
            MemoryTier::Whiteboard => "whiteboard",
        }
    }

    /// TTL the substrate stamps on entries of this tier.
    /// Long-family entries are permanent.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            MemoryTier::Short => Some(Duration::hours(24)),
            MemoryTier::Mid => Some(Duration::days(7)),
            _ => None,
        }
    }

    /// Long-family tiers share the long collection and the +0.2 retrieval bonus.
    pub fn is_long_family(&self) -> bool {
        !matches!(self, MemoryTier::Short | MemoryTier::Mid)
    }
}

/// A single memory entry, identified by `(agent_id, user_id, memory_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub memory_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub tier: MemoryTier,
    pub content: serde_json::Value,
    pub heat_score: f64,
    pub visit_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    /// New entry in the given tier with the tier's TTL applied.
    pub fn new(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        tier: MemoryTier,
        content: serde_json::Value,
    ) -> Self {
        let agent_id = agent_id.into();
        let user_id = user_id.into();
        let now = Utc::now();
        Self {
            memory_id: generate_memory_id(&agent_id, &user_id, &content),
            agent_id,
            user_id,
            tier,
            content,
            heat_score: 1.0,
            visit_count: 1,
            created_at: now,
            updated_at: now,
            expires_at: tier.ttl().map(|ttl| now + ttl),
        }
    }

    /// Conversation entry: short tier, 24 h TTL.
    pub fn conversation(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        user_input: impl Into<String>,
        agent_response: impl Into<String>,
    ) -> Self {
        Self::new(
            agent_id,
            user_id,
            MemoryTier::Short,
            serde_json::json!({
                "user_input": user_input.into(),
                "agent_response": agent_response.into(),
            }),
        )
    }

    /// Move this entry into a new tier, re-stamping the TTL and update time.
    /// Heat and visit counts carry forward.
    pub fn promoted_to(mut self, tier: MemoryTier) -> Self {
        let now = Utc::now();
        self.tier = tier;
        self.updated_at = now;
        self.expires_at = tier.ttl().map(|ttl| now + ttl);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Flattened lowercase text of the content values, used for overlap scoring.
    pub fn content_blob(&self) -> String {
        match &self.content {
            serde_json::Value::Object(map) => map
                .values()
                .map(value_text)
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase(),
            other => value_text(other).to_lowercase(),
        }
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn generate_memory_id(agent_id: &str, user_id: &str, content: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    hasher.update(user_id.as_bytes());
    hasher.update(content.to_string().as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("mem_{}_{}", agent_id, &digest[..16])
}
