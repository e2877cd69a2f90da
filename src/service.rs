//! Request-path facade for the chat orchestrator.
//!
//! Reads never fail the request: any retrieval error degrades to "no facts".
//! Writes are fire-and-forget into the task queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::db::Db;
use crate::dispatch::TaskDispatcher;
use crate::embeddings::{Embedder, HashEmbedder, OpenAIEmbedder};
use crate::error::FactgraphError;
use crate::graph::GraphStore;
use crate::search::{RetrievalEngine, VectorIndex};
use crate::tenant::TenantId;
use crate::update::{SqliteAuditSink, UpdateEngine};

/// Build the configured embedder, wrapping remote providers in an LRU
/// query-embedding cache when `cache_capacity > 0`.
pub fn build_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    let embeddings = &config.embeddings;
    match embeddings.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(embeddings.dimensions)?)),
        "openai" => {
            let api_key = std::env::var(&embeddings.api_key_env).with_context(|| {
                format!("Environment variable {} not set", embeddings.api_key_env)
            })?;
            let cache = (embeddings.cache_capacity > 0)
                .then(|| Arc::new(EmbeddingCache::new(embeddings.cache_capacity)));
            let embedder = OpenAIEmbedder::new(
                api_key,
                embeddings.model.clone(),
                embeddings.base_url.clone(),
                embeddings.dimensions,
            )?
            .with_cache(cache);
            Ok(Arc::new(embedder))
        }
        other => anyhow::bail!("unknown embeddings provider {}", other),
    }
}

pub struct KnowledgeService {
    db: Db,
    store: GraphStore,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    retrieval: RetrievalEngine,
    dispatcher: TaskDispatcher,
    min_confidence: f32,
    refresher: Option<JoinHandle<()>>,
}

/// Reload the index from the store every `every`. A failed reload keeps
/// serving the previous snapshot.
fn spawn_index_refresh(store: GraphStore, index: Arc<VectorIndex>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already loaded the index.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match index.rebuild(&store).await {
                Ok(count) => log::debug!("vector index refreshed: {} node embeddings", count),
                Err(e) => log::warn!("vector index refresh failed, keeping previous snapshot: {}", e),
            }
        }
    })
}

impl KnowledgeService {
    /// Open the database, apply migrations, wire every component, and load
    /// the vector index. An index that fails to load leaves retrieval in
    /// structured-only mode rather than failing startup.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db = Db::new(config.db_path());
        db.migrate()
            .await
            .with_context(|| format!("Failed to migrate {}", config.db_path().display()))?;

        let store = GraphStore::new(db.clone())
            .with_exclusive_relations(&config.store.exclusive_relations);
        let embedder = build_embedder(config)?;
        let index = Arc::new(VectorIndex::new());
        match index.rebuild(&store).await {
            Ok(count) => log::info!("vector index loaded with {} node embeddings", count),
            Err(e) => log::warn!("vector index not loaded, retrieval is structured-only: {}", e),
        }

        let retrieval = RetrievalEngine::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            config.retrieval_settings(),
        );
        let dispatcher = TaskDispatcher::new(db.clone(), config.retry_policy());
        let refresher = config
            .index_refresh_interval()
            .map(|every| spawn_index_refresh(store.clone(), index.clone(), every));

        Ok(Self {
            db,
            store,
            index,
            embedder,
            retrieval,
            dispatcher,
            min_confidence: config.novelty.min_confidence,
            refresher,
        })
    }

    /// Reload node embeddings written since startup, e.g. by `factgraph
    /// worker` running in another process. Returns the number indexed.
    pub async fn refresh_index(&self) -> crate::error::Result<usize> {
        self.index.rebuild(&self.store).await
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    /// Update engine sharing this service's store, index and embedder, with
    /// changes recorded in the `kg_changes` table.
    pub fn update_engine(&self) -> UpdateEngine {
        UpdateEngine::new(
            self.store.clone(),
            self.index.clone(),
            self.embedder.clone(),
            Arc::new(SqliteAuditSink::new(self.db.clone())),
            self.min_confidence,
        )
    }

    /// Facts for prompt augmentation. Never fails: an invalid tenant or an
    /// unavailable store yields an empty list.
    pub async fn context_for(&self, tenant: &str, text: &str) -> Vec<String> {
        let tenant = match TenantId::new(tenant) {
            Ok(tenant) => tenant,
            Err(e) => {
                log::error!("rejected retrieval without a valid tenant: {}", e);
                return Vec::new();
            }
        };
        match self.retrieval.retrieve(&tenant, text).await {
            Ok(facts) => facts,
            Err(e @ FactgraphError::TenantMismatch(_)) => {
                log::error!("tenant violation during retrieval for {}: {}", tenant, e);
                Vec::new()
            }
            Err(e) => {
                log::warn!("retrieval failed for tenant {}, continuing without facts: {}", tenant, e);
                Vec::new()
            }
        }
    }

    /// Queue a message for knowledge extraction. Returns the task id, or
    /// `None` when the task could not be queued (already logged).
    pub async fn observe(&self, tenant: &str, text: &str) -> Option<String> {
        let tenant = match TenantId::new(tenant) {
            Ok(tenant) => tenant,
            Err(e) => {
                log::error!("rejected update without a valid tenant: {}", e);
                return None;
            }
        };
        match self.dispatcher.enqueue(&tenant, text).await {
            Ok(task_id) => Some(task_id),
            Err(e) => {
                log::warn!("could not enqueue update for tenant {}: {}", tenant, e);
                None
            }
        }
    }

    /// System-prompt block listing known facts; `None` when there are none.
    pub fn augment_prompt(facts: &[String]) -> Option<String> {
        if facts.is_empty() {
            return None;
        }
        let mut block = String::from("Known facts about the user:\n");
        for fact in facts {
            block.push_str("- ");
            block.push_str(fact);
            block.push('\n');
        }
        Some(block)
    }
}

impl Drop for KnowledgeService {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
    }
}
