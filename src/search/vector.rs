//! In-memory, tenant-partitioned vector index over node embeddings.
//!
//! A projection of the `graph_nodes.embedding` column: load it with
//! [`VectorIndex::rebuild`], drop it with [`VectorIndex::invalidate`]. Queries
//! against an unloaded index fail with `StoreUnavailable` so callers can fall
//! back to structured-only retrieval.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embeddings::cosine_similarity;
use crate::error::{FactgraphError, Result};
use crate::graph::GraphStore;
use crate::tenant::TenantId;

type Partitions = HashMap<TenantId, HashMap<String, Vec<f32>>>;

pub struct VectorIndex {
    /// None = not loaded
    inner: RwLock<Option<Partitions>>,
}

impl VectorIndex {
    /// Create an empty, unloaded index.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Partitions>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Partitions>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_loaded(&self) -> bool {
        self.read().is_some()
    }

    /// Number of indexed nodes for a tenant (0 if not loaded).
    pub fn len(&self, tenant: &TenantId) -> usize {
        self.read()
            .as_ref()
            .and_then(|p| p.get(tenant))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Insert or replace a node's embedding. Returns false (and drops the
    /// write) while the index is unloaded; the next rebuild picks it up from
    /// the store.
    pub fn upsert(&self, tenant: &TenantId, node_id: &str, embedding: Vec<f32>) -> bool {
        let mut guard = self.write();
        match guard.as_mut() {
            Some(partitions) => {
                partitions
                    .entry(tenant.clone())
                    .or_default()
                    .insert(node_id.to_string(), embedding);
                true
            }
            None => {
                log::debug!("vector index unloaded; dropping upsert for node {}", node_id);
                false
            }
        }
    }

    /// Nearest nodes within one tenant, best first. Equal scores order by
    /// node id ascending.
    pub fn top_k(&self, tenant: &TenantId, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let guard = self.read();
        let partitions = guard
            .as_ref()
            .ok_or_else(|| FactgraphError::StoreUnavailable("vector index not loaded".to_string()))?;
        let Some(partition) = partitions.get(tenant) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(String, f32)> = partition
            .iter()
            .map(|(node_id, embedding)| (node_id.clone(), cosine_similarity(query, embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    /// Reload every tenant's node embeddings from the store. Returns the
    /// number of indexed nodes.
    pub async fn rebuild(&self, store: &GraphStore) -> Result<usize> {
        let start = std::time::Instant::now();
        let mut partitions: Partitions = HashMap::new();
        for tenant in store.tenants().await? {
            let rows = store.node_embeddings(&tenant).await?;
            if !rows.is_empty() {
                partitions.insert(tenant, rows.into_iter().collect());
            }
        }
        let total = partitions.values().map(|m| m.len()).sum();
        *self.write() = Some(partitions);
        log::info!("Vector index loaded: {} embeddings in {:?}", total, start.elapsed());
        Ok(total)
    }

    /// Ensure the index is loaded; no-op if already loaded.
    pub async fn load_if_needed(&self, store: &GraphStore) -> Result<()> {
        if !self.is_loaded() {
            self.rebuild(store).await?;
        }
        Ok(())
    }

    /// Drop all entries; queries fail until the next rebuild.
    pub fn invalidate(&self) {
        *self.write() = None;
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::graph::Properties;

    fn tenant(raw: &str) -> TenantId {
        TenantId::new(raw).unwrap()
    }

    fn loaded() -> VectorIndex {
        let index = VectorIndex::new();
        *index.write() = Some(HashMap::new());
        index
    }

    #[test]
    fn test_unloaded_index_is_unavailable() {
        let index = VectorIndex::new();
        let t = tenant("a");
        assert!(!index.upsert(&t, "n1", vec![1.0, 0.0]));
        let err = index.top_k(&t, &[1.0, 0.0], 3).unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[test]
    fn test_top_k_orders_and_breaks_ties_by_id() {
        let index = loaded();
        let t = tenant("a");
        index.upsert(&t, "n3", vec![1.0, 0.0]);
        index.upsert(&t, "n1", vec![1.0, 0.0]);
        index.upsert(&t, "n2", vec![0.0, 1.0]);
        index.upsert(&t, "n4", vec![0.7, 0.7]);

        let top = index.top_k(&t, &[1.0, 0.0], 3).unwrap();
        let ids: Vec<&str> = top.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n3", "n4"]);
    }

    #[test]
    fn test_partitions_are_isolated() {
        let index = loaded();
        let (a, b) = (tenant("a"), tenant("b"));
        index.upsert(&a, "secret", vec![1.0, 0.0]);

        assert!(index.top_k(&b, &[1.0, 0.0], 5).unwrap().is_empty());
        assert_eq!(index.len(&a), 1);
        assert_eq!(index.len(&b), 0);
    }

    #[tokio::test]
    async fn test_rebuild_from_store_and_invalidate() {
        let (db, _temp) = test_db().await;
        let store = GraphStore::new(db);
        let (a, b) = (tenant("a"), tenant("b"));
        let alice = store.merge_node(&a, "Person", "Alice", &Properties::new()).await.unwrap();
        let bob = store.merge_node(&b, "Person", "Bob", &Properties::new()).await.unwrap();
        store.merge_node(&b, "Person", "NoEmbedding", &Properties::new()).await.unwrap();
        store.set_node_embedding(&a, &alice.node_id, &[1.0, 0.0]).await.unwrap();
        store.set_node_embedding(&b, &bob.node_id, &[0.0, 1.0]).await.unwrap();

        let index = VectorIndex::new();
        assert_eq!(index.rebuild(&store).await.unwrap(), 2);
        assert_eq!(index.top_k(&a, &[1.0, 0.0], 5).unwrap()[0].0, alice.node_id);
        assert_eq!(index.len(&b), 1);

        index.invalidate();
        assert!(!index.is_loaded());
        index.load_if_needed(&store).await.unwrap();
        assert!(index.is_loaded());
    }
}
