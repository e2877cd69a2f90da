//! Tenant-scoped graph store over SQLite.
//!
//! Per-key atomicity comes from the database, not from callers:
//! - `merge_node` is a single `INSERT .. ON CONFLICT DO UPDATE` statement,
//!   merging properties field-by-field with `json_patch`.
//! - `merge_edge` runs in an IMMEDIATE transaction (one writer at a time) and the
//!   partial unique index `idx_edges_active_key` rejects a second active edge
//!   for the same relation key even if that serialization were bypassed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::{edge_from_row, encode_ts, node_from_row, GraphEdge, GraphNode, Properties, EDGE_COLUMNS, NODE_COLUMNS};
use crate::db::Db;
use crate::embeddings::encode_embedding;
use crate::error::{FactgraphError, Result};
use crate::tenant::TenantId;

/// Result of a node upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMerge {
    pub node_id: String,
    /// False when an existing node was matched and its properties merged.
    pub created: bool,
}

/// Result of an edge upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeMerge {
    /// Active edge already carried these properties.
    Unchanged { edge_id: String },
    /// No active edge existed for the key.
    Created { edge_id: String },
    /// One or more active edges were deactivated in favour of `edge_id`.
    Versioned {
        edge_id: String,
        superseded: Vec<String>,
    },
}

impl EdgeMerge {
    pub fn edge_id(&self) -> &str {
        match self {
            EdgeMerge::Unchanged { edge_id }
            | EdgeMerge::Created { edge_id }
            | EdgeMerge::Versioned { edge_id, .. } => edge_id,
        }
    }

    /// Whether the store state changed.
    pub fn is_change(&self) -> bool {
        !matches!(self, EdgeMerge::Unchanged { .. })
    }
}

/// Tenant-scoped graph store. The Update Engine is its only writer.
#[derive(Debug, Clone)]
pub struct GraphStore {
    db: Db,
    exclusive_relations: Arc<HashSet<String>>,
}

fn require_text(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FactgraphError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Both endpoints must exist and belong to `tenant`. A node owned by another
/// tenant means the caller forged scoping.
fn ensure_endpoints(conn: &Connection, tenant: &TenantId, ids: [&str; 2]) -> Result<()> {
    for id in ids {
        let owner: Option<String> = conn
            .query_row("SELECT tenant_id FROM graph_nodes WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        match owner {
            None => return Err(FactgraphError::NodeNotFound(id.to_string())),
            Some(owner) if owner != tenant.as_str() => {
                log::error!(
                    "tenant {} referenced node {} owned by another tenant",
                    tenant,
                    id
                );
                return Err(FactgraphError::TenantMismatch(format!(
                    "node {} is outside tenant {}",
                    id, tenant
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn select_active_edges(
    conn: &Connection,
    tenant: &TenantId,
    source_id: &str,
    relation_name: &str,
    target_id: Option<&str>,
) -> Result<Vec<GraphEdge>> {
    let sql = format!(
        "SELECT {EDGE_COLUMNS} FROM graph_edges \
         WHERE tenant_id = ?1 AND source_id = ?2 AND relation_name = ?3 AND active = 1 \
         AND (?4 IS NULL OR target_id = ?4) \
         ORDER BY started_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![tenant.as_str(), source_id, relation_name, target_id],
        |row| edge_from_row(row, 0),
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn close_edges(conn: &Connection, edges: &[GraphEdge], at: &str, superseded_by: &str) -> Result<()> {
    for edge in edges {
        conn.execute(
            "UPDATE graph_edges SET active = 0, ended_at = ?1, superseded_by = ?2 \
             WHERE id = ?3 AND active = 1",
            params![at, superseded_by, edge.id],
        )?;
    }
    Ok(())
}

impl GraphStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            exclusive_relations: Arc::new(HashSet::new()),
        }
    }

    /// Relations that hold a single current value per subject.
    pub fn with_exclusive_relations<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exclusive_relations = Arc::new(
            relations
                .into_iter()
                .map(|r| r.as_ref().trim().to_uppercase())
                .filter(|r| !r.is_empty())
                .collect(),
        );
        self
    }

    pub fn is_exclusive(&self, relation_name: &str) -> bool {
        self.exclusive_relations.contains(relation_name)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Upsert a node by `(tenant, label, name)`. Supplied properties overwrite
    /// per field; unspecified fields are kept.
    pub async fn merge_node(
        &self,
        tenant: &TenantId,
        label: &str,
        name: &str,
        properties: &Properties,
    ) -> Result<NodeMerge> {
        let label = require_text("label", label)?;
        let name = require_text("name", name)?;
        let props_json = serde_json::to_string(properties)?;
        let new_id = Uuid::now_v7().to_string();
        let now = encode_ts(&Utc::now());
        let tenant_str = tenant.as_str().to_string();
        let candidate_id = new_id.clone();

        let node_id = self
            .db
            .with_connection(move |conn| {
                let id: String = conn.query_row(
                    "INSERT INTO graph_nodes (id, tenant_id, label, name, properties_json, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
                     ON CONFLICT(tenant_id, label, name) DO UPDATE SET \
                         properties_json = json_patch(graph_nodes.properties_json, excluded.properties_json), \
                         updated_at = excluded.updated_at \
                     RETURNING id",
                    params![candidate_id, tenant_str, label, name, props_json, now],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await?;

        let created = node_id == new_id;
        log::debug!("merge_node tenant={} node={} created={}", tenant, node_id, created);
        Ok(NodeMerge { node_id, created })
    }

    /// Upsert the active edge for a relation key, versioning on contradiction.
    pub async fn merge_edge(
        &self,
        tenant: &TenantId,
        source_id: &str,
        target_id: &str,
        relation_name: &str,
        properties: &Properties,
        provenance: &str,
    ) -> Result<EdgeMerge> {
        self.merge_edge_at(
            tenant,
            source_id,
            target_id,
            relation_name,
            properties,
            provenance,
            Utc::now(),
        )
        .await
    }

    /// [`merge_edge`](Self::merge_edge) with an explicit transaction time:
    /// superseded edges get `ended_at = at`, the new edge `started_at = at`.
    #[allow(clippy::too_many_arguments)]
    pub async fn merge_edge_at(
        &self,
        tenant: &TenantId,
        source_id: &str,
        target_id: &str,
        relation_name: &str,
        properties: &Properties,
        provenance: &str,
        at: DateTime<Utc>,
    ) -> Result<EdgeMerge> {
        let relation_name = require_text("relation_name", relation_name)?;
        let source_id = require_text("source_id", source_id)?;
        let target_id = require_text("target_id", target_id)?;
        let exclusive = self.is_exclusive(&relation_name);
        let props = properties.clone();
        let props_json = serde_json::to_string(properties)?;
        let provenance = provenance.to_string();
        let tenant = tenant.clone();
        let at = encode_ts(&at);

        let outcome = self
            .db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_endpoints(&tx, &tenant, [source_id.as_str(), target_id.as_str()])?;

                let key_target = if exclusive { None } else { Some(target_id.as_str()) };
                let mut active =
                    select_active_edges(&tx, &tenant, &source_id, &relation_name, key_target)?;

                let same_key = active.iter().position(|e| e.target_id == target_id);
                if let Some(pos) = same_key.filter(|&pos| active[pos].properties == props) {
                    let kept = active.remove(pos);
                    if active.is_empty() {
                        tx.commit()?;
                        return Ok(EdgeMerge::Unchanged { edge_id: kept.id });
                    }
                    // Exclusive relation with stray active targets: fold them into `kept`.
                    close_edges(&tx, &active, &at, &kept.id)?;
                    tx.commit()?;
                    return Ok(EdgeMerge::Versioned {
                        edge_id: kept.id,
                        superseded: active.into_iter().map(|e| e.id).collect(),
                    });
                }

                let edge_id = Uuid::now_v7().to_string();
                close_edges(&tx, &active, &at, &edge_id)?;
                tx.execute(
                    "INSERT INTO graph_edges (id, tenant_id, source_id, target_id, relation_name, \
                         properties_json, started_at, ended_at, active, provenance, superseded_by) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 1, ?8, NULL)",
                    params![
                        edge_id,
                        tenant.as_str(),
                        source_id,
                        target_id,
                        relation_name,
                        props_json,
                        at,
                        provenance
                    ],
                )?;
                tx.commit()?;

                if active.is_empty() {
                    Ok(EdgeMerge::Created { edge_id })
                } else {
                    Ok(EdgeMerge::Versioned {
                        edge_id,
                        superseded: active.into_iter().map(|e| e.id).collect(),
                    })
                }
            })
            .await?;

        log::debug!("merge_edge {:?}", outcome);
        Ok(outcome)
    }

    /// Look up a node by its identity key.
    pub async fn find_node(&self, tenant: &TenantId, label: &str, name: &str) -> Result<Option<GraphNode>> {
        let label = require_text("label", label)?;
        let name = require_text("name", name)?;
        let tenant = tenant.clone();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {NODE_COLUMNS} FROM graph_nodes \
                     WHERE tenant_id = ?1 AND label = ?2 AND name = ?3"
                );
                let node = conn
                    .query_row(&sql, params![tenant.as_str(), label, name], |row| node_from_row(row, 0))
                    .optional()?;
                Ok(node)
            })
            .await
    }

    /// Nodes of any label whose name matches one of `names` (case-insensitive),
    /// oldest first.
    pub async fn find_nodes_named(
        &self,
        tenant: &TenantId,
        names: &[String],
        limit: usize,
    ) -> Result<Vec<GraphNode>> {
        let names: Vec<String> = names
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let tenant = tenant.clone();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {NODE_COLUMNS} FROM graph_nodes \
                     WHERE tenant_id = ? AND name IN ({}) \
                     ORDER BY created_at, id LIMIT {}",
                    placeholders(names.len()),
                    limit
                );
                let mut values = vec![tenant.as_str().to_string()];
                values.extend(names);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), |row| node_from_row(row, 0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Fetch a node by id, only if it belongs to `tenant`.
    pub async fn get_node(&self, tenant: &TenantId, node_id: &str) -> Result<Option<GraphNode>> {
        let tenant = tenant.clone();
        let node_id = node_id.to_string();
        self.db
            .with_connection(move |conn| {
                let sql = format!("SELECT {NODE_COLUMNS} FROM graph_nodes WHERE tenant_id = ?1 AND id = ?2");
                let node = conn
                    .query_row(&sql, params![tenant.as_str(), node_id], |row| node_from_row(row, 0))
                    .optional()?;
                Ok(node)
            })
            .await
    }

    /// Active edges leaving `source_id` for one relation.
    pub async fn active_edges_from(
        &self,
        tenant: &TenantId,
        source_id: &str,
        relation_name: &str,
    ) -> Result<Vec<GraphEdge>> {
        let tenant = tenant.clone();
        let source_id = source_id.to_string();
        let relation_name = relation_name.to_string();
        self.db
            .with_connection(move |conn| {
                select_active_edges(conn, &tenant, &source_id, &relation_name, None)
            })
            .await
    }

    /// Every version (active and superseded) of a relation leaving `source_id`,
    /// oldest first.
    pub async fn edge_history(
        &self,
        tenant: &TenantId,
        source_id: &str,
        relation_name: &str,
    ) -> Result<Vec<GraphEdge>> {
        let tenant = tenant.clone();
        let source_id = source_id.to_string();
        let relation_name = relation_name.to_string();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {EDGE_COLUMNS} FROM graph_edges \
                     WHERE tenant_id = ?1 AND source_id = ?2 AND relation_name = ?3 \
                     ORDER BY started_at, id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![tenant.as_str(), source_id, relation_name],
                    |row| edge_from_row(row, 0),
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Persist a node's embedding (the vector index is rebuilt from these).
    pub async fn set_node_embedding(&self, tenant: &TenantId, node_id: &str, embedding: &[f32]) -> Result<()> {
        let bytes = encode_embedding(embedding);
        let tenant = tenant.clone();
        let node_id = node_id.to_string();
        self.db
            .with_connection(move |conn| {
                let rows = conn.execute(
                    "UPDATE graph_nodes SET embedding = ?1 WHERE tenant_id = ?2 AND id = ?3",
                    params![bytes, tenant.as_str(), node_id],
                )?;
                if rows == 0 {
                    return Err(FactgraphError::NodeNotFound(node_id));
                }
                Ok(())
            })
            .await
    }

    /// `(node_id, embedding)` for every embedded node of a tenant.
    pub async fn node_embeddings(&self, tenant: &TenantId) -> Result<Vec<(String, Vec<f32>)>> {
        let tenant = tenant.clone();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {NODE_COLUMNS} FROM graph_nodes \
                     WHERE tenant_id = ?1 AND embedding IS NOT NULL ORDER BY id"
                ))?;
                let rows = stmt.query_map([tenant.as_str()], |row| node_from_row(row, 0))?;
                let mut out = Vec::new();
                for row in rows {
                    let node = row?;
                    if let Some(embedding) = node.embedding {
                        out.push((node.id, embedding));
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Tenants that own at least one node. Used for index maintenance only.
    pub async fn tenants(&self) -> Result<Vec<TenantId>> {
        self.db
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT tenant_id FROM graph_nodes ORDER BY tenant_id")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    match TenantId::new(&row?) {
                        Ok(t) => out.push(t),
                        Err(e) => log::warn!("skipping malformed tenant id in store: {}", e),
                    }
                }
                Ok(out)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::graph::Scalar;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn setup() -> (GraphStore, TenantId, TempDir) {
        let (db, temp) = test_db().await;
        let store = GraphStore::new(db).with_exclusive_relations(["lives_in"]);
        (store, TenantId::new("tenant-a").unwrap(), temp)
    }

    fn props(pairs: &[(&str, Scalar)]) -> Properties {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_merge_node_is_idempotent() {
        let (store, tenant, _temp) = setup().await;

        let first = store
            .merge_node(&tenant, "Person", "Alice", &props(&[("age", Scalar::Integer(30))]))
            .await
            .unwrap();
        let second = store
            .merge_node(&tenant, "Person", "Alice", &props(&[("age", Scalar::Integer(31))]))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.node_id, second.node_id);

        let node = store.find_node(&tenant, "Person", "Alice").await.unwrap().unwrap();
        assert_eq!(node.properties["age"], Scalar::Integer(31));

        let count: i64 = store
            .db()
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM graph_nodes", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_merge_node_keeps_unspecified_properties() {
        let (store, tenant, _temp) = setup().await;
        store
            .merge_node(&tenant, "Person", "Alice", &props(&[("age", Scalar::Integer(30)), ("city", "Leeds".into())]))
            .await
            .unwrap();
        store
            .merge_node(&tenant, "Person", "Alice", &props(&[("age", Scalar::Integer(31))]))
            .await
            .unwrap();

        let node = store.find_node(&tenant, "Person", "Alice").await.unwrap().unwrap();
        assert_eq!(node.properties["age"], Scalar::Integer(31));
        assert_eq!(node.properties["city"], Scalar::Text("Leeds".to_string()));
    }

    #[tokio::test]
    async fn test_identity_is_case_insensitive() {
        let (store, tenant, _temp) = setup().await;
        let a = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        let b = store.merge_node(&tenant, "person", "ALICE", &Properties::new()).await.unwrap();
        assert_eq!(a.node_id, b.node_id);

        let node = store.find_node(&tenant, "PERSON", "alice").await.unwrap().unwrap();
        assert_eq!(node.name, "Alice");
    }

    #[tokio::test]
    async fn test_concurrent_merge_node_same_key() {
        let (store, tenant, _temp) = setup().await;
        let mut handles = Vec::new();
        for i in 0..8i64 {
            let store = store.clone();
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                store
                    .merge_node(&tenant, "Person", "Bob", &props(&[("n", Scalar::Integer(i))]))
                    .await
                    .unwrap()
            }));
        }
        let mut ids = HashSet::new();
        let mut created = 0;
        for h in handles {
            let merged = h.await.unwrap();
            if merged.created {
                created += 1;
            }
            ids.insert(merged.node_id);
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_merge_edge_unchanged_is_noop() {
        let (store, tenant, _temp) = setup().await;
        let a = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        let b = store.merge_node(&tenant, "Person", "Bob", &Properties::new()).await.unwrap();

        let first = store
            .merge_edge(&tenant, &a.node_id, &b.node_id, "SIBLING_OF", &Properties::new(), "test")
            .await
            .unwrap();
        let second = store
            .merge_edge(&tenant, &a.node_id, &b.node_id, "SIBLING_OF", &Properties::new(), "test")
            .await
            .unwrap();

        assert!(matches!(first, EdgeMerge::Created { .. }));
        assert_eq!(second, EdgeMerge::Unchanged { edge_id: first.edge_id().to_string() });
        assert_eq!(store.edge_history(&tenant, &a.node_id, "SIBLING_OF").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_edge_versions_changed_properties() {
        let (store, tenant, _temp) = setup().await;
        let a = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        let c = store.merge_node(&tenant, "Organization", "Acme", &Properties::new()).await.unwrap();

        let first = store
            .merge_edge(&tenant, &a.node_id, &c.node_id, "WORKS_AT", &props(&[("role", "engineer".into())]), "t1")
            .await
            .unwrap();
        let second = store
            .merge_edge(&tenant, &a.node_id, &c.node_id, "WORKS_AT", &props(&[("role", "manager".into())]), "t2")
            .await
            .unwrap();

        match &second {
            EdgeMerge::Versioned { superseded, .. } => assert_eq!(superseded, &vec![first.edge_id().to_string()]),
            other => panic!("expected Versioned, got {:?}", other),
        }

        let history = store.edge_history(&tenant, &a.node_id, "WORKS_AT").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].active);
        assert_eq!(history[0].ended_at, Some(history[1].started_at));
        assert_eq!(history[0].superseded_by.as_deref(), Some(second.edge_id()));
        assert!(history[1].active);
        assert_eq!(history[1].properties["role"], Scalar::Text("manager".to_string()));
    }

    #[tokio::test]
    async fn test_exclusive_relation_versioning_scenario() {
        let (store, tenant, _temp) = setup().await;
        let alice = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        let london = store.merge_node(&tenant, "Place", "London", &Properties::new()).await.unwrap();
        let paris = store.merge_node(&tenant, "Place", "Paris", &Properties::new()).await.unwrap();

        let t0 = Utc::now() - ChronoDuration::hours(1);
        let t1 = Utc::now();
        store
            .merge_edge_at(&tenant, &alice.node_id, &london.node_id, "LIVES_IN", &Properties::new(), "t0", t0)
            .await
            .unwrap();
        let moved = store
            .merge_edge_at(&tenant, &alice.node_id, &paris.node_id, "LIVES_IN", &Properties::new(), "t1", t1)
            .await
            .unwrap();
        assert!(matches!(moved, EdgeMerge::Versioned { .. }));

        let history = store.edge_history(&tenant, &alice.node_id, "LIVES_IN").await.unwrap();
        assert_eq!(history.len(), 2);
        let london_edge = &history[0];
        let paris_edge = &history[1];
        assert_eq!(london_edge.target_id, london.node_id);
        assert!(!london_edge.active);
        assert_eq!(london_edge.ended_at.map(|t| encode_ts(&t)), Some(encode_ts(&t1)));
        assert_eq!(paris_edge.target_id, paris.node_id);
        assert!(paris_edge.active);
        assert_eq!(encode_ts(&paris_edge.started_at), encode_ts(&t1));

        let active = store.active_edges_from(&tenant, &alice.node_id, "LIVES_IN").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].target_id, paris.node_id);
    }

    #[tokio::test]
    async fn test_non_exclusive_relation_allows_many_targets() {
        let (store, tenant, _temp) = setup().await;
        let alice = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        let tea = store.merge_node(&tenant, "Thing", "Tea", &Properties::new()).await.unwrap();
        let jazz = store.merge_node(&tenant, "Thing", "Jazz", &Properties::new()).await.unwrap();

        store.merge_edge(&tenant, &alice.node_id, &tea.node_id, "LIKES", &Properties::new(), "t").await.unwrap();
        store.merge_edge(&tenant, &alice.node_id, &jazz.node_id, "LIKES", &Properties::new(), "t").await.unwrap();

        let active = store.active_edges_from(&tenant, &alice.node_id, "LIKES").await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_versioning_single_active_edge() {
        let (store, tenant, _temp) = setup().await;
        let a = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        let c = store.merge_node(&tenant, "Organization", "Acme", &Properties::new()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..6i64 {
            let store = store.clone();
            let tenant = tenant.clone();
            let (src, dst) = (a.node_id.clone(), c.node_id.clone());
            handles.push(tokio::spawn(async move {
                store
                    .merge_edge(&tenant, &src, &dst, "WORKS_AT", &props(&[("grade", Scalar::Integer(i % 2))]), "race")
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let active = store.active_edges_from(&tenant, &a.node_id, "WORKS_AT").await.unwrap();
        assert_eq!(active.len(), 1);

        // Every inactive version points at its successor.
        let history = store.edge_history(&tenant, &a.node_id, "WORKS_AT").await.unwrap();
        for edge in history.iter().filter(|e| !e.active) {
            assert!(edge.ended_at.is_some());
            assert!(edge.superseded_by.is_some());
        }
    }

    #[tokio::test]
    async fn test_cross_tenant_edge_rejected() {
        let (store, tenant, _temp) = setup().await;
        let other = TenantId::new("tenant-b").unwrap();
        let a = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        let b = store.merge_node(&other, "Person", "Bob", &Properties::new()).await.unwrap();

        let err = store
            .merge_edge(&tenant, &a.node_id, &b.node_id, "KNOWS", &Properties::new(), "forged")
            .await
            .unwrap_err();
        assert!(matches!(err, FactgraphError::TenantMismatch(_)));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_not_found() {
        let (store, tenant, _temp) = setup().await;
        let a = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        let err = store
            .merge_edge(&tenant, &a.node_id, "no-such-node", "KNOWS", &Properties::new(), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, FactgraphError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_find_node_isolated_per_tenant() {
        let (store, tenant, _temp) = setup().await;
        let other = TenantId::new("tenant-b").unwrap();
        let b_node = store.merge_node(&other, "Person", "Alice", &Properties::new()).await.unwrap();

        assert!(store.find_node(&tenant, "Person", "Alice").await.unwrap().is_none());
        assert!(store.get_node(&tenant, &b_node.node_id).await.unwrap().is_none());
        assert!(store
            .find_nodes_named(&tenant, &["Alice".to_string()], 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_blank_key_rejected() {
        let (store, tenant, _temp) = setup().await;
        let err = store.merge_node(&tenant, "Person", "   ", &Properties::new()).await.unwrap_err();
        assert!(matches!(err, FactgraphError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_embeddings_round_trip_through_store() {
        let (store, tenant, _temp) = setup().await;
        let a = store.merge_node(&tenant, "Person", "Alice", &Properties::new()).await.unwrap();
        store.set_node_embedding(&tenant, &a.node_id, &[0.25, -1.0, 3.5]).await.unwrap();

        let embedded = store.node_embeddings(&tenant).await.unwrap();
        assert_eq!(embedded, vec![(a.node_id.clone(), vec![0.25, -1.0, 3.5])]);
        assert_eq!(store.tenants().await.unwrap(), vec![tenant.clone()]);

        let other = TenantId::new("tenant-b").unwrap();
        let err = store.set_node_embedding(&other, &a.node_id, &[1.0]).await.unwrap_err();
        assert!(matches!(err, FactgraphError::NodeNotFound(_)));
    }
}
