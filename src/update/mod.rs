//! Update Engine: the only writer of the graph store.
//!
//! Each intent is its own store transaction. A failure aborts the rest of the
//! task without rolling back what was already applied; merges are idempotent,
//! so redelivery replays the applied prefix as no-ops.

pub mod audit;

pub use audit::{AuditAction, AuditRecord, AuditSink, LogAuditSink, SqliteAuditSink};

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::dispatch::UpdateTask;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::graph::{validate_extraction, EdgeMerge, Extractor, GraphStore, Properties};
use crate::novelty::{Intent, NodeRef, NoveltyDetector};
use crate::search::VectorIndex;
use crate::tenant::TenantId;

/// What one task changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub intents: usize,
    pub nodes_created: usize,
    pub edges_created: usize,
    pub edges_versioned: usize,
    /// Intents that turned out to be no-ops against the store.
    pub unchanged: usize,
    pub nodes_embedded: usize,
}

pub struct UpdateEngine {
    store: GraphStore,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    audit: Arc<dyn AuditSink>,
    novelty: NoveltyDetector,
}

impl UpdateEngine {
    pub fn new(
        store: GraphStore,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        audit: Arc<dyn AuditSink>,
        min_confidence: f32,
    ) -> Self {
        let novelty = NoveltyDetector::new(store.clone(), min_confidence);
        Self {
            store,
            index,
            embedder,
            audit,
            novelty,
        }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    /// Extract (unless the task carries candidates), plan against the current
    /// store state, and apply the plan.
    pub async fn apply_task(&self, task: &UpdateTask, extractor: &dyn Extractor) -> Result<ApplyReport> {
        let start = std::time::Instant::now();
        let tenant = &task.tenant_id;

        let entities = match &task.candidates {
            Some(candidates) => candidates.clone(),
            None => extractor.extract(&task.raw_text).await?,
        };
        validate_extraction(&entities)?;

        let plan = self.novelty.plan(tenant, &entities).await?;
        let mut report = ApplyReport {
            intents: plan.len(),
            ..ApplyReport::default()
        };
        let provenance = format!("task:{}", task.task_id);
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for intent in &plan {
            match intent {
                Intent::CreateNode { node, properties } => {
                    let merged = self.store.merge_node(tenant, &node.label, &node.name, properties).await?;
                    if merged.created {
                        report.nodes_created += 1;
                        self.emit(task, AuditAction::CreateNode, format!("{}:{}", node.label, node.name), format!("node {}", merged.node_id))
                            .await;
                    } else {
                        report.unchanged += 1;
                    }
                    touched.insert(merged.node_id);
                }
                Intent::CreateOrVersionEdge {
                    source,
                    target,
                    relation_name,
                    properties,
                } => {
                    let source_id = self.resolve(tenant, source).await?;
                    let target_id = self.resolve(tenant, target).await?;
                    let merged = self
                        .store
                        .merge_edge(tenant, &source_id, &target_id, relation_name, properties, &provenance)
                        .await?;
                    let subject = format!("{} {} {}", source.name, relation_name, target.name);
                    match &merged {
                        EdgeMerge::Unchanged { .. } => report.unchanged += 1,
                        EdgeMerge::Created { edge_id } => {
                            report.edges_created += 1;
                            self.emit(task, AuditAction::VersionEdge, subject, format!("created edge {}", edge_id))
                                .await;
                        }
                        EdgeMerge::Versioned { edge_id, superseded } => {
                            report.edges_versioned += 1;
                            self.emit(
                                task,
                                AuditAction::VersionEdge,
                                subject,
                                format!("edge {} supersedes {}", edge_id, superseded.join(",")),
                            )
                            .await;
                        }
                    }
                    touched.insert(source_id);
                    touched.insert(target_id);
                }
            }
        }

        report.nodes_embedded = self.ensure_embedded(tenant, &touched).await;

        log::debug!(
            "task {} applied in {:?}: {:?}",
            task.task_id,
            start.elapsed(),
            report
        );
        Ok(report)
    }

    /// Node id for a planned identity. Node intents run first, so the node
    /// normally exists already.
    async fn resolve(&self, tenant: &TenantId, node: &NodeRef) -> Result<String> {
        if let Some(existing) = self.store.find_node(tenant, &node.label, &node.name).await? {
            return Ok(existing.id);
        }
        let merged = self
            .store
            .merge_node(tenant, &node.label, &node.name, &Properties::new())
            .await?;
        Ok(merged.node_id)
    }

    /// Embed touched nodes that have no embedding yet. Embedding is derived
    /// data: failures are logged and retried the next time the node is touched.
    async fn ensure_embedded(&self, tenant: &TenantId, node_ids: &BTreeSet<String>) -> usize {
        let mut embedded = 0;
        for node_id in node_ids {
            let node = match self.store.get_node(tenant, node_id).await {
                Ok(Some(node)) if node.embedding.is_none() => node,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("could not load node {} for embedding: {}", node_id, e);
                    continue;
                }
            };
            let embedding = match self.embedder.embed(&node.name).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    log::warn!("embedding node {} failed: {}", node_id, e);
                    continue;
                }
            };
            if let Err(e) = self.store.set_node_embedding(tenant, node_id, &embedding).await {
                log::warn!("storing embedding for node {} failed: {}", node_id, e);
                continue;
            }
            self.index.upsert(tenant, node_id, embedding);
            embedded += 1;
        }
        embedded
    }

    async fn emit(&self, task: &UpdateTask, action: AuditAction, subject: String, detail: String) {
        let record = AuditRecord {
            tenant_id: task.tenant_id.clone(),
            action,
            subject,
            detail,
            timestamp: Utc::now(),
            task_id: Some(task.task_id.clone()),
        };
        if let Err(e) = self.audit.record(&record).await {
            log::warn!("audit sink failed for task {}: {}", task.task_id, e);
        }
    }
}
