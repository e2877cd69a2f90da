use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::search::{keyword_hints, Fact, RetrievalSettings, VectorIndex};
use crate::tenant::TenantId;

/// Hybrid retrieval: vector similarity picks seed nodes, graph traversal
/// turns them into facts.
///
/// Read-only; safe to share across requests and tenants.
#[derive(Clone)]
pub struct RetrievalEngine {
    store: GraphStore,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    settings: RetrievalSettings,
}

impl RetrievalEngine {
    pub fn new(
        store: GraphStore,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Ranked fact strings for a chat message.
    pub async fn retrieve(&self, tenant: &TenantId, query_text: &str) -> Result<Vec<String>> {
        let facts = self.retrieve_facts(tenant, query_text).await?;
        Ok(facts.into_iter().map(|f| f.text).collect())
    }

    /// Embed the query, derive keyword hints, then run
    /// [`retrieve_with_embedding`](Self::retrieve_with_embedding) within one
    /// latency budget. A failed or slow embedding degrades to hints only.
    pub async fn retrieve_facts(&self, tenant: &TenantId, query_text: &str) -> Result<Vec<Fact>> {
        let deadline = Instant::now() + self.settings.latency_budget;
        let hints = keyword_hints(query_text, self.settings.max_keyword_hints);

        let embed_start = std::time::Instant::now();
        let embedding = match timeout_at(deadline, self.embedder.embed(query_text)).await {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                log::warn!("query embedding failed, using keyword hints only: {}", e);
                None
            }
            Err(_) => {
                log::warn!("query embedding exceeded latency budget, using keyword hints only");
                None
            }
        };
        log::debug!("Retrieval: query embedding took {:?}", embed_start.elapsed());

        self.retrieve_until(tenant, embedding.as_deref(), &hints, deadline).await
    }

    /// Retrieve from a precomputed query embedding plus optional keyword hints.
    ///
    /// # Arguments
    ///
    /// * `tenant` - Tenant whose graph is searched
    /// * `query_embedding` - Query vector; `None` means structured-only
    /// * `hints` - Node names to seed from directly
    ///
    /// # Returns
    ///
    /// At most `max_facts` facts ordered by seed similarity, then edge recency,
    /// then edge id. Empty when the tenant has no matching knowledge.
    pub async fn retrieve_with_embedding(
        &self,
        tenant: &TenantId,
        query_embedding: Option<&[f32]>,
        hints: &[String],
    ) -> Result<Vec<Fact>> {
        let deadline = Instant::now() + self.settings.latency_budget;
        self.retrieve_until(tenant, query_embedding, hints, deadline).await
    }

    async fn retrieve_until(
        &self,
        tenant: &TenantId,
        query_embedding: Option<&[f32]>,
        hints: &[String],
        deadline: Instant,
    ) -> Result<Vec<Fact>> {
        let total_start = std::time::Instant::now();
        let top_k = self.settings.top_k;

        let vector = async {
            match query_embedding {
                Some(query) => self.index.top_k(tenant, query, top_k),
                None => Ok(Vec::new()),
            }
        };
        let keyword = self.store.find_nodes_named(tenant, hints, top_k);

        let (vector_hits, keyword_hits) = match timeout_at(deadline, async { tokio::join!(vector, keyword) }).await {
            Ok(results) => results,
            Err(_) => {
                log::warn!("retrieval seed lookup exceeded latency budget for tenant {}", tenant);
                return Ok(Vec::new());
            }
        };

        // node_id -> best similarity
        let mut seeds: HashMap<String, f32> = HashMap::new();
        match vector_hits {
            Ok(hits) => {
                for (node_id, score) in hits {
                    seeds.insert(node_id, score);
                }
            }
            Err(e) if e.is_store_unavailable() => {
                log::warn!("vector index unavailable, structured-only retrieval: {}", e);
            }
            Err(e) => return Err(e),
        }
        match keyword_hits {
            Ok(nodes) => {
                for node in nodes {
                    seeds.entry(node.id).or_insert(0.0);
                }
            }
            Err(e) => log::warn!("keyword seed lookup failed: {}", e),
        }

        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let mut expansions = JoinSet::new();
        for (node_id, score) in seeds {
            let store = self.store.clone();
            let tenant = tenant.clone();
            let hop_limit = self.settings.hop_limit;
            expansions.spawn(async move {
                let triples = store.query_neighborhood(&tenant, &[node_id], hop_limit).await;
                (score, triples)
            });
        }

        // edge_id -> fact, keeping the best-scoring seed per edge
        let mut facts: HashMap<String, Fact> = HashMap::new();
        loop {
            match timeout_at(deadline, expansions.join_next()).await {
                Err(_) => {
                    log::warn!(
                        "retrieval exceeded latency budget for tenant {}; returning {} partial facts",
                        tenant,
                        facts.len()
                    );
                    expansions.abort_all();
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => log::warn!("neighborhood expansion task failed: {}", e),
                Ok(Some(Ok((_, Err(e))))) => log::warn!("neighborhood expansion failed: {}", e),
                Ok(Some(Ok((score, Ok(triples))))) => {
                    for triple in triples {
                        let fact = Fact {
                            text: triple.render(),
                            score,
                            started_at: triple.edge.started_at,
                            edge_id: triple.edge.id,
                        };
                        match facts.get(&fact.edge_id) {
                            Some(existing) if existing.score >= fact.score => {}
                            _ => {
                                facts.insert(fact.edge_id.clone(), fact);
                            }
                        }
                    }
                }
            }
        }

        let mut ranked: Vec<Fact> = facts.into_values().collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.started_at.cmp(&a.started_at))
                .then_with(|| a.edge_id.cmp(&b.edge_id))
        });
        ranked.truncate(self.settings.max_facts);

        log::debug!(
            "Retrieval for tenant {} took {:?} ({} facts)",
            tenant,
            total_start.elapsed(),
            ranked.len()
        );
        Ok(ranked)
    }
}
