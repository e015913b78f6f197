//! Memory persistence capability
//!
//! Four collections (short, mid, long, metadata) behind a narrow trait.
//! The bundled in-process backend keeps identical semantics with no
//! durability; the HTTP backend talks to an external memory service.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use super::entry::{MemoryEntry, MemoryTier};
use crate::error::{AgencyError, AgencyResult};

/// The collections named by the persistence contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCollection {
    Short,
    Mid,
    Long,
}

impl MemoryCollection {
    pub const ALL: [MemoryCollection; 3] = [
        MemoryCollection::Short,
        MemoryCollection::Mid,
        MemoryCollection::Long,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCollection::Short => "short_term_memory",
            MemoryCollection::Mid => "mid_term_memory",
            MemoryCollection::Long => "long_term_memory",
        }
    }
}

/// Sort applied by a backend when listing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    CreatedAsc,
    CreatedDesc,
    HeatAsc,
    HeatDesc,
    Unsorted,
}

/// Filter for listing entries within one `(agent_id, user_id)` scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub agent_id: String,
    pub user_id: String,
    /// Restrict to one tier (long collection holds several)
    pub tier: Option<MemoryTier>,
    /// Only entries at or above this heat
    pub min_heat: Option<f64>,
}

impl MemoryQuery {
    pub fn scope(agent_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            tier: None,
            min_heat: None,
        }
    }

    pub fn with_tier(mut self, tier: MemoryTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_min_heat(mut self, heat: f64) -> Self {
        self.min_heat = Some(heat);
        self
    }

    fn matches(&self, entry: &MemoryEntry) -> bool {
        entry.agent_id == self.agent_id
            && entry.user_id == self.user_id
            && self.tier.map(|t| entry.tier == t).unwrap_or(true)
            && self.min_heat.map(|h| entry.heat_score >= h).unwrap_or(true)
    }
}

/// Persistence contract for the memory substrate.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Cheap connectivity probe.
    async fn ping(&self) -> AgencyResult<()>;

    async fn insert(&self, collection: MemoryCollection, entry: MemoryEntry) -> AgencyResult<()>;

    async fn list(
        &self,
        collection: MemoryCollection,
        query: &MemoryQuery,
        sort: SortKey,
        limit: usize,
    ) -> AgencyResult<Vec<MemoryEntry>>;

    async fn delete(&self, collection: MemoryCollection, memory_id: &str) -> AgencyResult<bool>;

    async fn delete_scope(
        &self,
        collection: MemoryCollection,
        agent_id: &str,
        user_id: &str,
    ) -> AgencyResult<u64>;

    async fn count(&self, collection: MemoryCollection, query: &MemoryQuery) -> AgencyResult<usize>;

    /// Increment visit counts and heat for the given entries.
    /// Increments are commutative; concurrent touches need no ordering.
    async fn touch(
        &self,
        collection: MemoryCollection,
        memory_ids: &[String],
        heat_delta: f64,
    ) -> AgencyResult<()>;

    /// Replace an entry's content in whichever collection holds it.
    async fn update_content(
        &self,
        memory_id: &str,
        content: serde_json::Value,
    ) -> AgencyResult<bool>;
}

/// Bounded in-process backend used as the non-durable fallback.
pub struct InProcessBackend {
    collections: RwLock<HashMap<MemoryCollection, Vec<MemoryEntry>>>,
    /// Entries per collection before oldest-first eviction kicks in
    max_entries: usize,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        let mut collections = HashMap::new();
        for c in MemoryCollection::ALL {
            collections.insert(c, Vec::new());
        }
        Self {
            collections: RwLock::new(collections),
            max_entries: max_entries.max(1),
        }
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_entries(entries: &mut [MemoryEntry], sort: SortKey) {
    match sort {
        SortKey::CreatedAsc => entries.sort_by_key(|e| e.created_at),
        SortKey::CreatedDesc => {
            entries.sort_by_key(|e| e.created_at);
            entries.reverse();
        }
        SortKey::HeatAsc => entries.sort_by(|a, b| {
            a.heat_score
                .partial_cmp(&b.heat_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortKey::HeatDesc => entries.sort_by(|a, b| {
            b.heat_score
                .partial_cmp(&a.heat_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortKey::Unsorted => {}
    }
}

#[async_trait]
impl MemoryBackend for InProcessBackend {
    async fn ping(&self) -> AgencyResult<()> {
        Ok(())
    }

    async fn insert(&self, collection: MemoryCollection, entry: MemoryEntry) -> AgencyResult<()> {
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection).or_default();
        if entries.len() >= self.max_entries {
            entries.remove(0);
        }
        entries.push(entry);
        Ok(())
    }

    async fn list(
        &self,
        collection: MemoryCollection,
        query: &MemoryQuery,
        sort: SortKey,
        limit: usize,
    ) -> AgencyResult<Vec<MemoryEntry>> {
        let collections = self.collections.read().await;
        let mut matched: Vec<MemoryEntry> = collections
            .get(&collection)
            .map(|entries| entries.iter().filter(|e| query.matches(e)).cloned().collect())
            .unwrap_or_default();
        sort_entries(&mut matched, sort);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn delete(&self, collection: MemoryCollection, memory_id: &str) -> AgencyResult<bool> {
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection).or_default();
        let before = entries.len();
        entries.retain(|e| e.memory_id != memory_id);
        Ok(entries.len() < before)
    }

    async fn delete_scope(
        &self,
        collection: MemoryCollection,
        agent_id: &str,
        user_id: &str,
    ) -> AgencyResult<u64> {
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection).or_default();
        let before = entries.len();
        entries.retain(|e| !(e.agent_id == agent_id && e.user_id == user_id));
        Ok((before - entries.len()) as u64)
    }

    async fn count(&self, collection: MemoryCollection, query: &MemoryQuery) -> AgencyResult<usize> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection)
            .map(|entries| entries.iter().filter(|e| query.matches(e)).count())
            .unwrap_or(0))
    }

    async fn touch(
        &self,
        collection: MemoryCollection,
        memory_ids: &[String],
        heat_delta: f64,
    ) -> AgencyResult<()> {
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection).or_default();
        for entry in entries.iter_mut() {
            if memory_ids.iter().any(|id| id == &entry.memory_id) {
                entry.visit_count += 1;
                entry.heat_score += heat_delta;
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_content(
        &self,
        memory_id: &str,
        content: serde_json::Value,
    ) -> AgencyResult<bool> {
        let mut collections = self.collections.write().await;
        for entries in collections.values_mut() {
            if let Some(entry) = entries.iter_mut().find(|e| e.memory_id == memory_id) {
                entry.content = content;
                entry.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Client for an external memory persistence service.
pub struct HttpMemoryBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    collection: MemoryCollection,
    query: &'a MemoryQuery,
    sort: SortKey,
    limit: usize,
}

#[derive(Deserialize)]
struct ListResponse {
    entries: Vec<MemoryEntry>,
}

#[derive(Deserialize)]
struct CountResponse {
    count: usize,
}

#[derive(Deserialize)]
struct DeletedResponse {
    deleted: u64,
}

impl HttpMemoryBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> AgencyResult<R> {
        let resp = self
            .client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .map_err(|e| AgencyError::StoreUnavailable(format!("memory service: {}", e)))?;
        if !resp.status().is_success() {
            return Err(AgencyError::StoreUnavailable(format!(
                "memory service returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AgencyError::StoreUnavailable(format!("memory service body: {}", e)))
    }
}

#[async_trait]
impl MemoryBackend for HttpMemoryBackend {
    async fn ping(&self) -> AgencyResult<()> {
        let resp = self
            .client
            .get(self.url("health"))
            .send()
            .await
            .map_err(|e| AgencyError::StoreUnavailable(format!("memory service: {}", e)))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(AgencyError::StoreUnavailable(format!(
                "memory service health returned {}",
                resp.status()
            )))
        }
    }

    async fn insert(&self, collection: MemoryCollection, entry: MemoryEntry) -> AgencyResult<()> {
        let _: serde_json::Value = self
            .post_json("insert", &serde_json::json!({"collection": collection, "entry": entry}))
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        collection: MemoryCollection,
        query: &MemoryQuery,
        sort: SortKey,
        limit: usize,
    ) -> AgencyResult<Vec<MemoryEntry>> {
        let resp: ListResponse = self
            .post_json(
                "query",
                &ListRequest {
                    collection,
                    query,
                    sort,
                    limit,
                },
            )
            .await?;
        Ok(resp.entries)
    }

    async fn delete(&self, collection: MemoryCollection, memory_id: &str) -> AgencyResult<bool> {
        let resp: DeletedResponse = self
            .post_json(
                "delete",
                &serde_json::json!({"collection": collection, "memory_id": memory_id}),
            )
            .await?;
        Ok(resp.deleted > 0)
    }

    async fn delete_scope(
        &self,
        collection: MemoryCollection,
        agent_id: &str,
        user_id: &str,
    ) -> AgencyResult<u64> {
        let resp: DeletedResponse = self
            .post_json(
                "delete_scope",
                &serde_json::json!({
                    "collection": collection,
                    "agent_id": agent_id,
                    "user_id": user_id,
                }),
            )
            .await?;
        Ok(resp.deleted)
    }

    async fn count(&self, collection: MemoryCollection, query: &MemoryQuery) -> AgencyResult<usize> {
        let resp: CountResponse = self
            .post_json("count", &serde_json::json!({"collection": collection, "query": query}))
            .await?;
        Ok(resp.count)
    }

    async fn touch(
        &self,
        collection: MemoryCollection,
        memory_ids: &[String],
        heat_delta: f64,
    ) -> AgencyResult<()> {
        let _: serde_json::Value = self
            .post_json(
                "touch",
                &serde_json::json!({
                    "collection": collection,
                    "memory_ids": memory_ids,
                    "heat_delta": heat_delta,
                }),
            )
            .await?;
        Ok(())
    }

    async fn update_content(
        &self,
        memory_id: &str,
        content: serde_json::Value,
    ) -> AgencyResult<bool> {
        let resp: DeletedResponse = self
            .post_json(
                "update",
                &serde_json::json!({"memory_id": memory_id, "content": content}),
            )
            .await?;
        Ok(resp.deleted > 0)
    }
}

/// Resolve the configured backend, honouring strict mode.
///
/// With a memory service URL configured, an unreachable service either
/// surfaces (`strict_memory`) or degrades to the bounded in-process
/// backend with a warning.
pub async fn connect_backend(
    memory_url: Option<&str>,
    strict: bool,
) -> AgencyResult<Arc<dyn MemoryBackend>> {
    match memory_url {
        Some(url) => {
            let backend = HttpMemoryBackend::new(url);
            match backend.ping().await {
                Ok(()) => Ok(Arc::new(backend)),
                Err(e) if strict => Err(e),
                Err(e) => {
                    warn!("memory service unreachable ({}), falling back in-process", e);
                    Ok(Arc::new(InProcessBackend::new()))
                }
            }
        }
        None => Ok(Arc::new(InProcessBackend::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_list_roundtrip() {
        let backend = InProcessBackend::new();
        let entry = MemoryEntry::conversation("qa", "u1", "q", "a");
        let id = entry.memory_id.clone();
        backend
            .insert(MemoryCollection::Short, entry)
            .await
            .unwrap();

        let listed = backend
            .list(
                MemoryCollection::Short,
                &MemoryQuery::scope("qa", "u1"),
                SortKey::CreatedDesc,
                10,
            )
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].memory_id, id);

        // Other scopes see nothing
        let other = backend
            .list(
                MemoryCollection::Short,
                &MemoryQuery::scope("qa", "u2"),
                SortKey::CreatedDesc,
                10,
            )
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_touch_increments_commutatively() {
        let backend = InProcessBackend::new();
        let entry = MemoryEntry::conversation("qa", "u1", "q", "a");
        let id = entry.memory_id.clone();
        backend
            .insert(MemoryCollection::Mid, entry)
            .await
            .unwrap();

        backend
            .touch(MemoryCollection::Mid, &[id.clone()], 0.1)
            .await
            .unwrap();
        backend
            .touch(MemoryCollection::Mid, &[id.clone()], 0.1)
            .await
            .unwrap();

        let listed = backend
            .list(
                MemoryCollection::Mid,
                &MemoryQuery::scope("qa", "u1"),
                SortKey::Unsorted,
                10,
            )
            .await
            .unwrap();
        assert_eq!(listed[0].visit_count, 3); // initial 1 + two touches
        assert!((listed[0].heat_score - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_bounded_capacity_evicts_oldest() {
        let backend = InProcessBackend::with_capacity(2);
        for i in 0..3 {
            backend
                .insert(
                    MemoryCollection::Short,
                    MemoryEntry::conversation("qa", "u1", format!("q{}", i), "a"),
                )
                .await
                .unwrap();
        }
        let count = backend
            .count(MemoryCollection::Short, &MemoryQuery::scope("qa", "u1"))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_min_heat_filter() {
        let backend = InProcessBackend::new();
        let mut hot = MemoryEntry::conversation("qa", "u1", "hot", "a");
        hot.heat_score = 6.0;
        let cold = MemoryEntry::conversation("qa", "u1", "cold", "a");
        backend.insert(MemoryCollection::Mid, hot).await.unwrap();
        backend.insert(MemoryCollection::Mid, cold).await.unwrap();

        let hot_only = backend
            .list(
                MemoryCollection::Mid,
                &MemoryQuery::scope("qa", "u1").with_min_heat(5.0),
                SortKey::HeatDesc,
                10,
            )
            .await
            .unwrap();
        assert_eq!(hot_only.len(), 1);
        assert!(hot_only[0].heat_score >= 5.0);
    }

    #[tokio::test]
    async fn test_connect_backend_strict_mode_surfaces() {
        // Nothing listens on this port
        let err = connect_backend(Some("http://127.0.0.1:1"), true)
            .await
            .err()
            .expect("strict mode must surface");
        assert!(matches!(err, AgencyError::StoreUnavailable(_)));

        // Non-strict falls back silently
        let backend = connect_backend(Some("http://127.0.0.1:1"), false)
            .await
            .unwrap();
        assert!(backend.ping().await.is_ok());
    }
}
