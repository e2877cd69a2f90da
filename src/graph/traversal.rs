//! Bounded BFS over active edges.

use std::collections::{HashSet, VecDeque};

use rusqlite::{params, Connection};

use super::{edge_from_row, node_from_row, GraphStore, Triple, EDGE_COLUMNS};
use crate::error::Result;
use crate::tenant::TenantId;

/// Active edges touching `node_id` in either direction, with both endpoints
/// resolved. Both joins re-check the tenant.
fn incident_triples(conn: &Connection, tenant: &TenantId, node_id: &str) -> Result<Vec<Triple>> {
    let edge_cols: String = EDGE_COLUMNS
        .split(',')
        .map(|c| format!("e.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let node_cols = |alias: &str| {
        ["id", "tenant_id", "label", "name", "properties_json", "created_at", "embedding"]
            .iter()
            .map(|c| format!("{alias}.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let sql = format!(
        "SELECT {edge_cols}, {src}, {dst} \
         FROM graph_edges e \
         JOIN graph_nodes s ON s.id = e.source_id AND s.tenant_id = e.tenant_id \
         JOIN graph_nodes t ON t.id = e.target_id AND t.tenant_id = e.tenant_id \
         WHERE e.tenant_id = ?1 AND e.active = 1 AND (e.source_id = ?2 OR e.target_id = ?2) \
         ORDER BY e.started_at DESC, e.id",
        src = node_cols("s"),
        dst = node_cols("t"),
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![tenant.as_str(), node_id], |row| {
        Ok(Triple {
            edge: edge_from_row(row, 0)?,
            source: node_from_row(row, 11)?,
            target: node_from_row(row, 18)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

impl GraphStore {
    /// Collect the active facts within `hop_limit` hops of the seed nodes.
    ///
    /// Edges are followed in both directions. Seeds that do not belong to
    /// `tenant` are ignored, so a leaked node id cannot pull in another
    /// tenant's facts. `hop_limit == 0` returns nothing.
    ///
    /// # Arguments
    /// * `tenant` - Tenant whose facts may be returned
    /// * `node_ids` - Seed node ids
    /// * `hop_limit` - Maximum path length from any seed
    pub async fn query_neighborhood(
        &self,
        tenant: &TenantId,
        node_ids: &[String],
        hop_limit: usize,
    ) -> Result<Vec<Triple>> {
        if hop_limit == 0 || node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let tenant = tenant.clone();
        let seeds = node_ids.to_vec();

        self.db()
            .with_connection(move |conn| {
                let mut visited: HashSet<String> = HashSet::new();
                let mut queue = VecDeque::new();
                let mut seen_edges = HashSet::new();
                let mut result = Vec::new();

                for seed in seeds {
                    let owned: bool = conn.query_row(
                        "SELECT EXISTS(SELECT 1 FROM graph_nodes WHERE id = ?1 AND tenant_id = ?2)",
                        params![seed, tenant.as_str()],
                        |row| row.get(0),
                    )?;
                    if !owned {
                        log::warn!("ignoring seed {} outside tenant {}", seed, tenant);
                        continue;
                    }
                    if visited.insert(seed.clone()) {
                        queue.push_back((seed, 0usize));
                    }
                }

                while let Some((node_id, depth)) = queue.pop_front() {
                    if depth >= hop_limit {
                        continue;
                    }
                    for triple in incident_triples(conn, &tenant, &node_id)? {
                        let other = if triple.edge.source_id == node_id {
                            &triple.edge.target_id
                        } else {
                            &triple.edge.source_id
                        };
                        if visited.insert(other.clone()) {
                            queue.push_back((other.clone(), depth + 1));
                        }
                        if seen_edges.insert(triple.edge.id.clone()) {
                            result.push(triple);
                        }
                    }
                }

                Ok(result)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::graph::Properties;
    use tempfile::TempDir;

    struct Fixture {
        store: GraphStore,
        tenant: TenantId,
        a: String,
        b: String,
        c: String,
        d: String,
        _temp: TempDir,
    }

    /// a -KNOWS-> b -KNOWS-> c, d -LIKES-> a
    async fn fixture() -> Fixture {
        let (db, temp) = test_db().await;
        let store = GraphStore::new(db);
        let tenant = TenantId::new("tenant-a").unwrap();
        let mut ids = Vec::new();
        for name in ["A", "B", "C", "D"] {
            ids.push(store.merge_node(&tenant, "Person", name, &Properties::new()).await.unwrap().node_id);
        }
        let p = Properties::new();
        store.merge_edge(&tenant, &ids[0], &ids[1], "KNOWS", &p, "t").await.unwrap();
        store.merge_edge(&tenant, &ids[1], &ids[2], "KNOWS", &p, "t").await.unwrap();
        store.merge_edge(&tenant, &ids[3], &ids[0], "LIKES", &p, "t").await.unwrap();
        Fixture {
            store,
            tenant,
            a: ids[0].clone(),
            b: ids[1].clone(),
            c: ids[2].clone(),
            d: ids[3].clone(),
            _temp: temp,
        }
    }

    fn rendered(triples: &[Triple]) -> Vec<String> {
        let mut out: Vec<String> = triples.iter().map(Triple::render).collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_single_hop_both_directions() {
        let f = fixture().await;
        let triples = f.store.query_neighborhood(&f.tenant, &[f.a.clone()], 1).await.unwrap();
        assert_eq!(rendered(&triples), vec!["A KNOWS B", "D LIKES A"]);
    }

    #[tokio::test]
    async fn test_multi_hop() {
        let f = fixture().await;
        let triples = f.store.query_neighborhood(&f.tenant, &[f.d.clone()], 3).await.unwrap();
        assert_eq!(rendered(&triples), vec!["A KNOWS B", "B KNOWS C", "D LIKES A"]);
    }

    #[tokio::test]
    async fn test_zero_hops_is_empty() {
        let f = fixture().await;
        let triples = f.store.query_neighborhood(&f.tenant, &[f.a.clone()], 0).await.unwrap();
        assert!(triples.is_empty());
    }

    #[tokio::test]
    async fn test_shared_edges_deduplicated() {
        let f = fixture().await;
        let triples = f
            .store
            .query_neighborhood(&f.tenant, &[f.a.clone(), f.b.clone(), f.c.clone()], 2)
            .await
            .unwrap();
        assert_eq!(triples.len(), 3);
    }

    #[tokio::test]
    async fn test_inactive_edges_not_traversed() {
        let f = fixture().await;
        let mut p = Properties::new();
        p.insert("since".to_string(), 2020i64.into());
        // Versioning A KNOWS B leaves exactly one active edge for the key.
        f.store.merge_edge(&f.tenant, &f.a, &f.b, "KNOWS", &p, "t2").await.unwrap();

        let triples = f.store.query_neighborhood(&f.tenant, &[f.a.clone()], 1).await.unwrap();
        assert_eq!(rendered(&triples), vec!["A KNOWS B (since=2020)", "D LIKES A"]);
    }

    #[tokio::test]
    async fn test_foreign_seed_ignored() {
        let f = fixture().await;
        let other = TenantId::new("tenant-b").unwrap();

        let leaked = f.store.query_neighborhood(&other, &[f.a.clone()], 3).await.unwrap();
        assert!(leaked.is_empty());

        let x = f.store.merge_node(&other, "Person", "X", &Properties::new()).await.unwrap();
        let mixed = f
            .store
            .query_neighborhood(&other, &[x.node_id, f.a.clone()], 3)
            .await
            .unwrap();
        assert!(mixed.is_empty());
    }
}
