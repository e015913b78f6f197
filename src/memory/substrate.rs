//! Memory Substrate
//!
//! Tiered agent/user memory: short-term conversation pairs, mid-term
//! consolidated segments ranked by heat, and permanent long-term
//! knowledge. Promotion is heat-driven; TTLs and capacity caps are
//! enforced here, never by callers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::backend::{MemoryBackend, MemoryCollection, MemoryQuery, SortKey};
use super::entry::{MemoryEntry, MemoryTier};
use crate::error::AgencyResult;

/// Capacity and promotion tuning per `(agent_id, user_id)` scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub short_term_capacity: usize,
    pub mid_term_capacity: usize,
    pub long_term_knowledge_capacity: usize,
    /// Mid entries at or above this heat promote to long on consolidation
    pub mid_term_heat_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: 10,
            mid_term_capacity: 2000,
            long_term_knowledge_capacity: 100,
            mid_term_heat_threshold: 5.0,
        }
    }
}

/// What to store: a conversation pair lands in the short tier, anything
/// else goes straight to its long-family tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Conversation,
    Consensus,
    Persona,
    Whiteboard,
}

impl StoreKind {
    fn tier(&self) -> MemoryTier {
        match self {
            StoreKind::Conversation => MemoryTier::Short,
            StoreKind::Consensus => MemoryTier::Consensus,
            StoreKind::Persona => MemoryTier::Persona,
            StoreKind::Whiteboard => MemoryTier::Whiteboard,
        }
    }
}

/// Per-collection statistics for the dashboard feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub counts: HashMap<String, usize>,
    pub avg_heat: HashMap<String, f64>,
}

/// Tiered memory substrate shared by all agents.
pub struct MemorySubstrate {
    backend: Arc<dyn MemoryBackend>,
    config: MemoryConfig,
    /// Serializes consolidation per (agent_id, user_id)
    consolidation_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl MemorySubstrate {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self::with_config(backend, MemoryConfig::default())
    }

    pub fn with_config(backend: Arc<dyn MemoryBackend>, config: MemoryConfig) -> Self {
        Self {
            backend,
            config,
            consolidation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Build a substrate against the configured persistence capability,
    /// honouring strict mode on connection failure.
    pub async fn connect(config: &crate::config::AgencyConfig) -> AgencyResult<Self> {
        let backend =
            super::backend::connect_backend(config.memory_url.as_deref(), config.strict_memory)
                .await?;
        Ok(Self::new(backend))
    }

    /// Store a memory for an agent/user pair, evicting within caps.
    ///
    /// Conversation entries enter the short tier FIFO; at capacity the
    /// oldest short entry is evicted first. Non-conversation kinds land
    /// in the long collection under their own tier.
    pub async fn store(
        &self,
        agent_id: &str,
        user_id: &str,
        content: serde_json::Value,
        kind: StoreKind,
    ) -> AgencyResult<String> {
        let entry = MemoryEntry::new(agent_id, user_id, kind.tier(), content);
        let memory_id = entry.memory_id.clone();

        match kind {
            StoreKind::Conversation => {
                let scope = MemoryQuery::scope(agent_id, user_id);
                let count = self.backend.count(MemoryCollection::Short, &scope).await?;
                if count >= self.config.short_term_capacity {
                    let oldest = self
                        .backend
                        .list(MemoryCollection::Short, &scope, SortKey::CreatedAsc, 1)
                        .await?;
                    if let Some(victim) = oldest.first() {
                        self.backend
                            .delete(MemoryCollection::Short, &victim.memory_id)
                            .await?;
                        debug!("evicted oldest short-term memory {}", victim.memory_id);
                    }
                }
                self.backend.insert(MemoryCollection::Short, entry).await?;
            }
            _ => {
                self.backend.insert(MemoryCollection::Long, entry).await?;
                self.enforce_long_knowledge_cap(agent_id, user_id).await?;
            }
        }

        debug!(
            "stored {} memory for agent={} user={}: {}",
            kind.tier().as_str(),
            agent_id,
            user_id,
            memory_id
        );
        Ok(memory_id)
    }

    /// Convenience wrapper for a user/agent exchange.
    pub async fn store_conversation(
        &self,
        agent_id: &str,
        user_id: &str,
        user_input: &str,
        agent_response: &str,
    ) -> AgencyResult<String> {
        self.store(
            agent_id,
            user_id,
            serde_json::json!({
                "user_input": user_input,
                "agent_response": agent_response,
            }),
            StoreKind::Conversation,
        )
        .await
    }

    /// Hierarchical retrieval: recent short entries, hottest mid entries,
    /// long entries (optionally filtered by tier), scored by token overlap
    /// with tier bonuses. Every returned entry gains a visit and +0.1 heat.
    pub async fn retrieve(
        &self,
        agent_id: &str,
        user_id: &str,
        query: &str,
        tier_filter: Option<MemoryTier>,
        top_k: usize,
    ) -> AgencyResult<Vec<MemoryEntry>> {
        self.purge_expired(agent_id, user_id).await?;

        let scope = MemoryQuery::scope(agent_id, user_id);
        let fetch_limit = (top_k * 3).max(10);

        let short = self
            .backend
            .list(MemoryCollection::Short, &scope, SortKey::CreatedDesc, fetch_limit)
            .await?;
        let mid = self
            .backend
            .list(MemoryCollection::Mid, &scope, SortKey::HeatDesc, fetch_limit)
            .await?;

        let long_query = match tier_filter {
            Some(tier) => scope.clone().with_tier(tier),
            None => scope.clone(),
        };
        let long = self
            .backend
            .list(MemoryCollection::Long, &long_query, SortKey::Unsorted, fetch_limit)
            .await?;

        let mut candidates: Vec<MemoryEntry> = Vec::new();
        candidates.extend(short);
        candidates.extend(mid);
        candidates.extend(long);

        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut scored: Vec<(f64, MemoryEntry)> = candidates
            .into_iter()
            .map(|entry| {
                let score = if tokens.is_empty() {
                    0.0
                } else {
                    let blob = entry.content_blob();
                    let mut s: f64 = tokens.iter().filter(|t| blob.contains(t.as_str())).count() as f64;
                    if entry.tier == MemoryTier::Mid {
                        s += 0.1;
                    } else if entry.tier.is_long_family() {
                        s += 0.2;
                    }
                    s
                };
                (score, entry)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.1.heat_score
                        .partial_cmp(&a.1.heat_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        });

        // Prefer entries whose stored user input actually mentions a token
        if !tokens.is_empty() {
            let matching: Vec<(f64, MemoryEntry)> = scored
                .iter()
                .filter(|(_, e)| {
                    let input = e.content["user_input"]
                        .as_str()
                        .unwrap_or_default()
                        .to_lowercase();
                    tokens.iter().any(|t| input.contains(t.as_str()))
                })
                .cloned()
                .collect();
            if !matching.is_empty() {
                scored = matching;
            }
        }

        let results: Vec<MemoryEntry> = scored
            .into_iter()
            .take(top_k)
            .map(|(_, entry)| entry)
            .collect();

        let ids: Vec<String> = results.iter().map(|e| e.memory_id.clone()).collect();
        for collection in MemoryCollection::ALL {
            self.backend.touch(collection, &ids, 0.1).await?;
        }

        debug!(
            "retrieved {} memories for agent={} user={}",
            results.len(),
            agent_id,
            user_id
        );
        Ok(results)
    }

    /// Promote short→mid (FIFO, at least one on an explicit call) and
    /// mid→long for entries past the heat threshold, then evict the
    /// coldest mid entries beyond capacity.
    ///
    /// Idempotent on a steady state: with no new stores or retrievals in
    /// between, a second call moves nothing.
    pub async fn consolidate(&self, agent_id: &str, user_id: &str) -> AgencyResult<()> {
        let lock = self.scope_lock(agent_id, user_id).await;
        let _guard = lock.lock().await;

        self.purge_expired(agent_id, user_id).await?;
        let scope = MemoryQuery::scope(agent_id, user_id);

        // short -> mid
        let short = self
            .backend
            .list(MemoryCollection::Short, &scope, SortKey::CreatedAsc, usize::MAX)
            .await?;
        let transfer: Vec<MemoryEntry> = if short.len() >= self.config.short_term_capacity {
            short.into_iter().take(5).collect()
        } else {
            short.into_iter().take(1).collect()
        };

        let promoted_short = transfer.len();
        for entry in transfer {
            let memory_id = entry.memory_id.clone();
            self.backend
                .insert(MemoryCollection::Mid, entry.promoted_to(MemoryTier::Mid))
                .await?;
            self.backend.delete(MemoryCollection::Short, &memory_id).await?;
        }
        if promoted_short > 0 {
            info!(
                "consolidated {} short->mid for agent={} user={}",
                promoted_short, agent_id, user_id
            );
        }

        // mid -> long, heat-gated
        let hot = self
            .backend
            .list(
                MemoryCollection::Mid,
                &scope.clone().with_min_heat(self.config.mid_term_heat_threshold),
                SortKey::Unsorted,
                usize::MAX,
            )
            .await?;
        let promoted_mid = hot.len();
        for entry in hot {
            let memory_id = entry.memory_id.clone();
            self.backend
                .insert(MemoryCollection::Long, entry.promoted_to(MemoryTier::Long))
                .await?;
            self.backend.delete(MemoryCollection::Mid, &memory_id).await?;
        }
        if promoted_mid > 0 {
            info!(
                "promoted {} mid->long for agent={} user={}",
                promoted_mid, agent_id, user_id
            );
        }

        // LFU eviction beyond mid capacity
        let mid_count = self.backend.count(MemoryCollection::Mid, &scope).await?;
        if mid_count > self.config.mid_term_capacity {
            let excess = mid_count - self.config.mid_term_capacity;
            let victims = self
                .backend
                .list(MemoryCollection::Mid, &scope, SortKey::HeatAsc, excess)
                .await?;
            for victim in victims {
                self.backend
                    .delete(MemoryCollection::Mid, &victim.memory_id)
                    .await?;
            }
            info!(
                "evicted {} mid-term entries for agent={} user={}",
                excess, agent_id, user_id
            );
        }

        self.enforce_long_knowledge_cap(agent_id, user_id).await?;
        Ok(())
    }

    /// Aggregate long/persona content into a profile string.
    pub async fn get_user_profile(&self, agent_id: &str, user_id: &str) -> AgencyResult<String> {
        let scope = MemoryQuery::scope(agent_id, user_id);
        let mut docs = self
            .backend
            .list(
                MemoryCollection::Long,
                &scope.clone().with_tier(MemoryTier::Long),
                SortKey::Unsorted,
                10,
            )
            .await?;
        let persona = self
            .backend
            .list(
                MemoryCollection::Long,
                &scope.with_tier(MemoryTier::Persona),
                SortKey::Unsorted,
                10,
            )
            .await?;
        docs.extend(persona);
        docs.truncate(10);

        let lines: Vec<String> = docs
            .iter()
            .map(|doc| match doc.content.as_object() {
                Some(map) => format!(
                    "- {}: {}",
                    map.get("user_input").and_then(|v| v.as_str()).unwrap_or(""),
                    map.get("agent_response").and_then(|v| v.as_str()).unwrap_or(""),
                ),
                None => format!("- {}", doc.content),
            })
            .collect();

        Ok(lines.join("\n"))
    }

    /// Delete every tier for an agent/user pair.
    pub async fn clear_agent_memory(&self, agent_id: &str, user_id: &str) -> AgencyResult<()> {
        for collection in MemoryCollection::ALL {
            let deleted = self
                .backend
                .delete_scope(collection, agent_id, user_id)
                .await?;
            debug!("deleted {} entries from {}", deleted, collection.as_str());
        }
        info!("cleared all memory for agent={} user={}", agent_id, user_id);
        Ok(())
    }

    /// Per-collection counts and average heat for the dashboard.
    pub async fn stats(&self, agent_id: &str, user_id: &str) -> AgencyResult<MemoryStats> {
        let scope = MemoryQuery::scope(agent_id, user_id);
        let mut counts = HashMap::new();
        let mut avg_heat = HashMap::new();
        for collection in MemoryCollection::ALL {
            let entries = self
                .backend
                .list(collection, &scope, SortKey::Unsorted, usize::MAX)
                .await?;
            let name = collection.as_str().to_string();
            let avg = if entries.is_empty() {
                0.0
            } else {
                entries.iter().map(|e| e.heat_score).sum::<f64>() / entries.len() as f64
            };
            counts.insert(name.clone(), entries.len());
            avg_heat.insert(name, avg);
        }
        Ok(MemoryStats { counts, avg_heat })
    }

    async fn purge_expired(&self, agent_id: &str, user_id: &str) -> AgencyResult<()> {
        let now = Utc::now();
        let scope = MemoryQuery::scope(agent_id, user_id);
        for collection in [MemoryCollection::Short, MemoryCollection::Mid] {
            let entries = self
                .backend
                .list(collection, &scope, SortKey::Unsorted, usize::MAX)
                .await?;
            for entry in entries.iter().filter(|e| e.is_expired(now)) {
                self.backend.delete(collection, &entry.memory_id).await?;
            }
        }
        Ok(())
    }

    async fn enforce_long_knowledge_cap(&self, agent_id: &str, user_id: &str) -> AgencyResult<()> {
        let knowledge = MemoryQuery::scope(agent_id, user_id).with_tier(MemoryTier::Long);
        let count = self.backend.count(MemoryCollection::Long, &knowledge).await?;
        if count > self.config.long_term_knowledge_capacity {
            let excess = count - self.config.long_term_knowledge_capacity;
            let victims = self
                .backend
                .list(MemoryCollection::Long, &knowledge, SortKey::HeatAsc, excess)
                .await?;
            for victim in victims {
                self.backend
                    .delete(MemoryCollection::Long, &victim.memory_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn scope_lock(&self, agent_id: &str, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.consolidation_locks.lock().await;
        locks
            .entry((agent_id.to_string(), user_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backend::InProcessBackend;

    fn substrate() -> MemorySubstrate {
        MemorySubstrate::new(Arc::new(InProcessBackend::new()))
    }

    #[tokio::test]
    async fn test_short_term_fifo_eviction_at_capacity() {
        let memory = substrate();
        for i in 0..10 {
            memory
                .store_conversation("qa", "u1", &format!("question {}", i), "answer")
                .await
                .unwrap();
        }
        // Capacity reached; the next store evicts the oldest
        memory
            .store_conversation("qa", "u1", "question 10", "answer")
            .await
            .unwrap();

        let stats = memory.stats("qa", "u1").await.unwrap();
        assert_eq!(stats.counts["short_term_memory"], 10);

        let recent = memory
            .retrieve("qa", "u1", "question", None, 20)
            .await
            .unwrap();
        assert!(recent
            .iter()
            .all(|e| e.content["user_input"].as_str().unwrap() != "question 0"));
    }

    #[tokio::test]
    async fn test_retrieval_bumps_heat_and_visits() {
        let memory = substrate();
        memory
            .store_conversation("qa", "u1", "how do I reset a password", "use the portal")
            .await
            .unwrap();

        let first = memory
            .retrieve("qa", "u1", "password reset", None, 5)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = memory
            .retrieve("qa", "u1", "password reset", None, 5)
            .await
            .unwrap();
        assert!(second[0].visit_count > first[0].visit_count);
        assert!(second[0].heat_score > first[0].heat_score);
    }

    #[tokio::test]
    async fn test_consolidate_promotes_at_least_one_short() {
        let memory = substrate();
        memory
            .store_conversation("qa", "u1", "persistent question", "answer")
            .await
            .unwrap();

        memory.consolidate("qa", "u1").await.unwrap();

        let stats = memory.stats("qa", "u1").await.unwrap();
        assert_eq!(stats.counts["short_term_memory"], 0);
        assert_eq!(stats.counts["mid_term_memory"], 1);
    }

    #[tokio::test]
    async fn test_hot_mid_entry_promotes_to_long() {
        let memory = substrate();
        memory
            .store_conversation("qa", "u1", "deployment runbook", "use blue green")
            .await
            .unwrap();
        memory.consolidate("qa", "u1").await.unwrap();

        // Heat the mid entry past the 5.0 threshold: 1.0 initial + 0.1/visit
        for _ in 0..41 {
            memory
                .retrieve("qa", "u1", "deployment runbook", None, 5)
                .await
                .unwrap();
        }

        memory.consolidate("qa", "u1").await.unwrap();
        let stats = memory.stats("qa", "u1").await.unwrap();
        assert_eq!(stats.counts["mid_term_memory"], 0);
        assert_eq!(stats.counts["long_term_memory"], 1);
    }

    #[tokio::test]
    async fn test_consolidate_is_idempotent_on_steady_state() {
        let memory = substrate();
        memory
            .store_conversation("qa", "u1", "one", "a")
            .await
            .unwrap();
        memory.consolidate("qa", "u1").await.unwrap();
        let before = memory.stats("qa", "u1").await.unwrap();

        memory.consolidate("qa", "u1").await.unwrap();
        let after = memory.stats("qa", "u1").await.unwrap();
        assert_eq!(before.counts, after.counts);
    }

    #[tokio::test]
    async fn test_typed_store_lands_in_long_collection() {
        let memory = substrate();
        memory
            .store(
                "qa",
                "team",
                serde_json::json!({"procedure": "always run the linter"}),
                StoreKind::Consensus,
            )
            .await
            .unwrap();

        let found = memory
            .retrieve("qa", "team", "linter", Some(MemoryTier::Consensus), 5)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tier, MemoryTier::Consensus);
    }

    #[tokio::test]
    async fn test_user_profile_aggregates_long_and_persona() {
        let memory = substrate();
        memory
            .store(
                "support",
                "u1",
                serde_json::json!({"user_input": "preferred channel", "agent_response": "email"}),
                StoreKind::Persona,
            )
            .await
            .unwrap();

        let profile = memory.get_user_profile("support", "u1").await.unwrap();
        assert!(profile.contains("preferred channel"));
        assert!(profile.contains("email"));
    }

    #[tokio::test]
    async fn test_clear_agent_memory_wipes_all_tiers() {
        let memory = substrate();
        memory
            .store_conversation("qa", "u1", "q", "a")
            .await
            .unwrap();
        memory.consolidate("qa", "u1").await.unwrap();
        memory
            .store(
                "qa",
                "u1",
                serde_json::json!({"note": "x"}),
                StoreKind::Whiteboard,
            )
            .await
            .unwrap();

        memory.clear_agent_memory("qa", "u1").await.unwrap();
        let stats = memory.stats("qa", "u1").await.unwrap();
        assert!(stats.counts.values().all(|&c| c == 0));
    }
}
