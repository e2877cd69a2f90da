//! Knowledge graph module: data model, tenant-scoped store, bounded traversal
//! and the extraction adapter boundary.
//!
//! Nodes are keyed by `(tenant_id, label, name)`. Edges are temporally
//! versioned: a contradicting fact deactivates the current edge and inserts a
//! new active one, so history is superseded but never deleted.

mod extraction;
mod store;
mod traversal;

pub use extraction::{
    validate_extraction, ExtractedEntity, ExtractedRelation, Extractor, PatternExtractor,
};
pub use store::{EdgeMerge, GraphStore, NodeMerge};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::embeddings::decode_embedding;
use crate::tenant::TenantId;

/// Property value. Properties are flat maps of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Integer(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Ordered so equality and serialization are deterministic.
pub type Properties = BTreeMap<String, Scalar>;

/// A node in a tenant's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub tenant_id: TenantId,
    pub label: String,
    /// First-seen casing; identity comparison is case-insensitive.
    pub name: String,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A versioned, directed relation between two nodes of the same tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub tenant_id: TenantId,
    pub source_id: String,
    pub target_id: String,
    pub relation_name: String,
    pub properties: Properties,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub provenance: String,
    /// Id of the edge that replaced this one, once inactive.
    pub superseded_by: Option<String>,
}

/// One `(node, edge, node)` fact returned by neighborhood queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Triple {
    pub source: GraphNode,
    pub edge: GraphEdge,
    pub target: GraphNode,
}

impl Triple {
    /// Render as a prompt-ready fact line.
    pub fn render(&self) -> String {
        let mut text = format!(
            "{} {} {}",
            self.source.name, self.edge.relation_name, self.target.name
        );
        if !self.edge.properties.is_empty() {
            let props: Vec<String> = self
                .edge
                .properties
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            text.push_str(&format!(" ({})", props.join(", ")));
        }
        text
    }
}

pub(crate) const NODE_COLUMNS: &str =
    "id, tenant_id, label, name, properties_json, created_at, embedding";

pub(crate) const EDGE_COLUMNS: &str = "id, tenant_id, source_id, target_id, relation_name, \
     properties_json, started_at, ended_at, active, provenance, superseded_by";

/// Fixed-width UTC timestamps so TEXT ordering matches time ordering.
pub(crate) fn encode_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn props_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Properties> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn tenant_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<TenantId> {
    let raw: String = row.get(idx)?;
    TenantId::new(&raw).map_err(|e| conversion_err(idx, e))
}

/// Map `NODE_COLUMNS` starting at `offset`.
pub(crate) fn node_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<GraphNode> {
    let blob: Option<Vec<u8>> = row.get(offset + 6)?;
    Ok(GraphNode {
        id: row.get(offset)?,
        tenant_id: tenant_column(row, offset + 1)?,
        label: row.get(offset + 2)?,
        name: row.get(offset + 3)?,
        properties: props_column(row, offset + 4)?,
        created_at: ts_column(row, offset + 5)?,
        embedding: blob.as_deref().and_then(decode_embedding),
    })
}

/// Map `EDGE_COLUMNS` starting at `offset`.
pub(crate) fn edge_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<GraphEdge> {
    Ok(GraphEdge {
        id: row.get(offset)?,
        tenant_id: tenant_column(row, offset + 1)?,
        source_id: row.get(offset + 2)?,
        target_id: row.get(offset + 3)?,
        relation_name: row.get(offset + 4)?,
        properties: props_column(row, offset + 5)?,
        started_at: ts_column(row, offset + 6)?,
        ended_at: opt_ts_column(row, offset + 7)?,
        active: row.get::<_, i64>(offset + 8)? == 1,
        provenance: row.get(offset + 9)?,
        superseded_by: row.get(offset + 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_json_shapes() {
        let props: Properties = serde_json::from_str(
            r#"{"age": 34, "height": 1.72, "verified": true, "city": "Paris"}"#,
        )
        .unwrap();
        assert_eq!(props["age"], Scalar::Integer(34));
        assert_eq!(props["height"], Scalar::Float(1.72));
        assert_eq!(props["verified"], Scalar::Bool(true));
        assert_eq!(props["city"], Scalar::Text("Paris".to_string()));
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = DateTime::parse_from_rfc3339("2026-01-01T09:00:00Z").unwrap().with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-01-01T10:00:00.5Z").unwrap().with_timezone(&Utc);
        assert!(encode_ts(&a) < encode_ts(&b));
        assert_eq!(encode_ts(&a).len(), encode_ts(&b).len());
    }

    #[test]
    fn test_triple_render() {
        let tenant = TenantId::new("t").unwrap();
        let now = Utc::now();
        let node = |id: &str, name: &str| GraphNode {
            id: id.to_string(),
            tenant_id: tenant.clone(),
            label: "Person".to_string(),
            name: name.to_string(),
            properties: Properties::new(),
            created_at: now,
            embedding: None,
        };
        let mut props = Properties::new();
        props.insert("since".to_string(), Scalar::Integer(2020));
        let triple = Triple {
            source: node("a", "Alice"),
            target: node("b", "Paris"),
            edge: GraphEdge {
                id: "e".to_string(),
                tenant_id: tenant.clone(),
                source_id: "a".to_string(),
                target_id: "b".to_string(),
                relation_name: "LIVES_IN".to_string(),
                properties: props,
                started_at: now,
                ended_at: None,
                active: true,
                provenance: "test".to_string(),
                superseded_by: None,
            },
        };
        assert_eq!(triple.render(), "Alice LIVES_IN Paris (since=2020)");
    }
}
