//! Novelty detection: decide which extracted facts are new or changed for a
//! tenant and turn them into an ordered write plan.
//!
//! The detector only reads the store. Applying the plan is the Update
//! Engine's job.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{ExtractedEntity, GraphNode, GraphStore, Properties};
use crate::tenant::TenantId;

const DEFAULT_LABEL: &str = "Entity";

/// Identity key of a node, independent of whether it exists yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub label: String,
    pub name: String,
}

impl NodeRef {
    fn from_node(node: &GraphNode) -> Self {
        Self {
            label: node.label.clone(),
            name: node.name.clone(),
        }
    }
}

/// One planned write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    CreateNode {
        node: NodeRef,
        properties: Properties,
    },
    CreateOrVersionEdge {
        source: NodeRef,
        target: NodeRef,
        relation_name: String,
        properties: Properties,
    },
}

/// An entity mention that survived the confidence filter, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct NoveltyCandidate {
    pub mention_text: String,
    pub inferred_label: String,
    pub confidence: f32,
    /// `(relation_name, other_mention)` in extraction order.
    pub related_mentions: Vec<(String, String)>,
}

/// Trim, collapse internal whitespace and strip surrounding punctuation.
pub fn normalize_name(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

/// `"lives in"` and `"Lives-In"` both become `LIVES_IN`.
pub fn normalize_relation(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_uppercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Blank labels fall back to `Entity`.
pub fn normalize_label(raw: &str) -> String {
    let name = normalize_name(raw);
    if name.is_empty() {
        DEFAULT_LABEL.to_string()
    } else {
        name
    }
}

pub struct NoveltyDetector {
    store: GraphStore,
    min_confidence: f32,
}

impl NoveltyDetector {
    pub fn new(store: GraphStore, min_confidence: f32) -> Self {
        Self {
            store,
            min_confidence,
        }
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Normalize and filter extractor output. Mentions and relations below
    /// the confidence threshold are dropped silently; repeated mentions merge.
    pub fn candidates(&self, entities: &[ExtractedEntity]) -> Vec<NoveltyCandidate> {
        let mut out: Vec<NoveltyCandidate> = Vec::new();
        for entity in entities {
            if entity.confidence < self.min_confidence {
                log::debug!("dropping low-confidence mention {:?}", entity.mention_text);
                continue;
            }
            let name = normalize_name(&entity.mention_text);
            if name.is_empty() {
                continue;
            }
            let related: Vec<(String, String)> = entity
                .relations
                .iter()
                .filter(|r| r.confidence >= self.min_confidence)
                .map(|r| (normalize_relation(&r.relation_name), normalize_name(&r.other_mention_text)))
                .filter(|(rel, other)| !rel.is_empty() && !other.is_empty())
                .collect();

            match out.iter_mut().find(|c| c.mention_text.eq_ignore_ascii_case(&name)) {
                Some(existing) => {
                    existing.confidence = existing.confidence.max(entity.confidence);
                    for pair in related {
                        if !existing.related_mentions.contains(&pair) {
                            existing.related_mentions.push(pair);
                        }
                    }
                }
                None => out.push(NoveltyCandidate {
                    mention_text: name,
                    inferred_label: normalize_label(&entity.label_guess),
                    confidence: entity.confidence,
                    related_mentions: related,
                }),
            }
        }
        out
    }

    /// Existing node for a mention: exact identity key first, then any node
    /// of the tenant with that name (extractors disagree on labels).
    async fn resolve_existing(&self, tenant: &TenantId, label: &str, name: &str) -> Result<Option<GraphNode>> {
        if let Some(node) = self.store.find_node(tenant, label, name).await? {
            return Ok(Some(node));
        }
        let mut named = self.store.find_nodes_named(tenant, &[name.to_string()], 1).await?;
        Ok(named.pop())
    }

    /// Build the write plan for one message against the current store state.
    /// Node intents come first, then edge intents, each in extraction order.
    pub async fn plan(&self, tenant: &TenantId, entities: &[ExtractedEntity]) -> Result<Vec<Intent>> {
        let candidates = self.candidates(entities);

        // lowercased mention -> (identity, existing node id)
        let mut resolved: HashMap<String, (NodeRef, Option<String>)> = HashMap::new();
        let mut node_intents = Vec::new();

        for candidate in &candidates {
            let key = candidate.mention_text.to_lowercase();
            match self
                .resolve_existing(tenant, &candidate.inferred_label, &candidate.mention_text)
                .await?
            {
                Some(node) => {
                    resolved.insert(key, (NodeRef::from_node(&node), Some(node.id)));
                }
                None => {
                    let node = NodeRef {
                        label: candidate.inferred_label.clone(),
                        name: candidate.mention_text.clone(),
                    };
                    node_intents.push(Intent::CreateNode {
                        node: node.clone(),
                        properties: Properties::new(),
                    });
                    resolved.insert(key, (node, None));
                }
            }
        }

        let mut edge_intents = Vec::new();
        for candidate in &candidates {
            let Some((source, source_id)) = resolved.get(&candidate.mention_text.to_lowercase()).cloned() else {
                continue;
            };
            for (relation_name, other) in &candidate.related_mentions {
                let other_key = other.to_lowercase();
                if !resolved.contains_key(&other_key) {
                    // Not a candidate itself; it may still be a known node.
                    match self.resolve_existing(tenant, DEFAULT_LABEL, other).await? {
                        Some(node) => {
                            resolved.insert(other_key.clone(), (NodeRef::from_node(&node), Some(node.id)));
                        }
                        None => {
                            log::debug!("relation {} to unknown mention {:?} dropped", relation_name, other);
                            continue;
                        }
                    }
                }
                let Some((target, target_id)) = resolved.get(&other_key).cloned() else {
                    continue;
                };
                if source == target {
                    continue;
                }

                let properties = Properties::new();
                if let (Some(source_id), Some(target_id)) = (&source_id, &target_id) {
                    if self
                        .is_unchanged(tenant, source_id, target_id, relation_name, &properties)
                        .await?
                    {
                        continue;
                    }
                }

                let intent = Intent::CreateOrVersionEdge {
                    source: source.clone(),
                    target,
                    relation_name: relation_name.clone(),
                    properties,
                };
                if !edge_intents.contains(&intent) {
                    edge_intents.push(intent);
                }
            }
        }

        log::debug!(
            "novelty plan for tenant {}: {} node intents, {} edge intents",
            tenant,
            node_intents.len(),
            edge_intents.len()
        );
        node_intents.extend(edge_intents);
        Ok(node_intents)
    }

    /// The active edge already states this fact. For exclusive relations it
    /// must also be the only active value.
    async fn is_unchanged(
        &self,
        tenant: &TenantId,
        source_id: &str,
        target_id: &str,
        relation_name: &str,
        properties: &Properties,
    ) -> Result<bool> {
        let active = self.store.active_edges_from(tenant, source_id, relation_name).await?;
        let matches = active
            .iter()
            .any(|e| e.target_id == target_id && &e.properties == properties);
        if !matches {
            return Ok(false);
        }
        Ok(!self.store.is_exclusive(relation_name) || active.len() == 1)
    }
}
