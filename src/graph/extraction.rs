//! Extraction adapter boundary.
//!
//! Any model or heuristic that turns text into entity mentions with confidence
//! scores can sit behind [`Extractor`]. [`PatternExtractor`] is the built-in
//! regex implementation.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FactgraphError, Result};

/// A relation mention attached to the subject entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub relation_name: String,
    pub other_mention_text: String,
    pub confidence: f32,
}

/// An entity mention as returned by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub mention_text: String,
    pub label_guess: String,
    pub confidence: f32,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

/// Text to candidate entities/relations.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>>;
}

fn valid_confidence(c: f32) -> bool {
    c.is_finite() && (0.0..=1.0).contains(&c)
}

/// Reject malformed adapter output before it reaches novelty detection.
pub fn validate_extraction(entities: &[ExtractedEntity]) -> Result<()> {
    for entity in entities {
        if entity.mention_text.trim().is_empty() {
            return Err(FactgraphError::Extraction("entity with empty mention".to_string()));
        }
        if !valid_confidence(entity.confidence) {
            return Err(FactgraphError::Extraction(format!(
                "confidence {} out of range for {:?}",
                entity.confidence, entity.mention_text
            )));
        }
        for rel in &entity.relations {
            if rel.relation_name.trim().is_empty() || rel.other_mention_text.trim().is_empty() {
                return Err(FactgraphError::Extraction(format!(
                    "incomplete relation on {:?}",
                    entity.mention_text
                )));
            }
            if !valid_confidence(rel.confidence) {
                return Err(FactgraphError::Extraction(format!(
                    "confidence {} out of range for relation {}",
                    rel.confidence, rel.relation_name
                )));
            }
        }
    }
    Ok(())
}

const NAME: &str = r"[A-Z][\w-]*(?:\s+[A-Z][\w-]*)*";

struct Pattern {
    regex: Regex,
    relation: &'static str,
    subject_label: &'static str,
    object_label: &'static str,
    confidence: f32,
}

/// Regex extractor for a handful of personal-fact phrasings.
///
/// Patterns compile once in [`PatternExtractor::new`]; build one per worker and
/// reuse it.
pub struct PatternExtractor {
    patterns: Vec<Pattern>,
}

impl PatternExtractor {
    pub fn new() -> Result<Self> {
        let specs: [(String, &str, &str, &str, f32); 6] = [
            (
                format!(r"({NAME})\s+(?:lives|lived|is\s+living)\s+in\s+({NAME})"),
                "LIVES_IN",
                "Person",
                "Place",
                0.9,
            ),
            (
                format!(r"({NAME})\s+(?:has\s+)?(?:moved|relocated)\s+to\s+({NAME})"),
                "LIVES_IN",
                "Person",
                "Place",
                0.85,
            ),
            (
                format!(r"({NAME})\s+is\s+({NAME})(?:'|’)s\s+(?:sister|brother|sibling)"),
                "SIBLING_OF",
                "Person",
                "Person",
                0.9,
            ),
            (
                format!(r"({NAME})\s+works\s+(?:at|for)\s+({NAME})"),
                "WORKS_AT",
                "Person",
                "Organization",
                0.85,
            ),
            (
                format!(r"({NAME})\s+is\s+married\s+to\s+({NAME})"),
                "MARRIED_TO",
                "Person",
                "Person",
                0.9,
            ),
            (
                format!(r"({NAME})\s+(?:likes|loves|enjoys)\s+({NAME}|[a-z][\w-]*)"),
                "LIKES",
                "Person",
                "Thing",
                0.7,
            ),
        ];

        let mut patterns = Vec::with_capacity(specs.len());
        for (source, relation, subject_label, object_label, confidence) in specs {
            let regex = Regex::new(&source).map_err(|e| {
                FactgraphError::Extraction(format!("invalid pattern for {}: {}", relation, e))
            })?;
            patterns.push(Pattern {
                regex,
                relation,
                subject_label,
                object_label,
                confidence,
            });
        }
        Ok(Self { patterns })
    }

    fn extract_sync(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut entities: Vec<ExtractedEntity> = Vec::new();

        fn slot(
            entities: &mut Vec<ExtractedEntity>,
            mention: &str,
            label: &str,
            confidence: f32,
        ) -> usize {
            if let Some(pos) = entities
                .iter()
                .position(|e| e.mention_text.eq_ignore_ascii_case(mention))
            {
                let existing = &mut entities[pos];
                existing.confidence = existing.confidence.max(confidence);
                return pos;
            }
            entities.push(ExtractedEntity {
                mention_text: mention.to_string(),
                label_guess: label.to_string(),
                confidence,
                relations: Vec::new(),
            });
            entities.len() - 1
        }

        for pattern in &self.patterns {
            for cap in pattern.regex.captures_iter(text) {
                let (Some(subject), Some(object)) = (cap.get(1), cap.get(2)) else {
                    continue;
                };
                let (subject, object) = (subject.as_str(), object.as_str());
                let s = slot(&mut entities, subject, pattern.subject_label, pattern.confidence);
                slot(&mut entities, object, pattern.object_label, pattern.confidence);

                let relation = ExtractedRelation {
                    relation_name: pattern.relation.to_string(),
                    other_mention_text: object.to_string(),
                    confidence: pattern.confidence,
                };
                if !entities[s].relations.contains(&relation) {
                    entities[s].relations.push(relation);
                }
            }
        }
        entities
    }
}

#[async_trait]
impl Extractor for PatternExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>> {
        let entities = self.extract_sync(text);
        log::debug!("pattern extractor found {} entities", entities.len());
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn extract(text: &str) -> Vec<ExtractedEntity> {
        let extractor = PatternExtractor::new().unwrap();
        let out = extractor.extract(text).await.unwrap();
        validate_extraction(&out).unwrap();
        out
    }

    fn entity<'a>(out: &'a [ExtractedEntity], mention: &str) -> &'a ExtractedEntity {
        out.iter().find(|e| e.mention_text == mention).unwrap()
    }

    #[tokio::test]
    async fn test_sibling_possessive() {
        let out = extract("Alice is Bob's sister.").await;
        assert_eq!(out.len(), 2);
        let alice = entity(&out, "Alice");
        assert_eq!(alice.label_guess, "Person");
        assert_eq!(alice.relations.len(), 1);
        assert_eq!(alice.relations[0].relation_name, "SIBLING_OF");
        assert_eq!(alice.relations[0].other_mention_text, "Bob");
        assert!(entity(&out, "Bob").relations.is_empty());
    }

    #[tokio::test]
    async fn test_moved_to_maps_to_lives_in() {
        let out = extract("Last week Alice moved to Paris").await;
        let alice = out.iter().find(|e| e.mention_text.ends_with("Alice")).unwrap();
        assert_eq!(alice.relations[0].relation_name, "LIVES_IN");
        assert_eq!(entity(&out, "Paris").label_guess, "Place");
    }

    #[tokio::test]
    async fn test_multi_word_names_and_multiple_facts() {
        let out = extract("Mary Jane works at Acme Corp. Mary Jane likes tea.").await;
        let mary = entity(&out, "Mary Jane");
        let rels: Vec<_> = mary.relations.iter().map(|r| r.relation_name.as_str()).collect();
        assert_eq!(rels, vec!["WORKS_AT", "LIKES"]);
        assert_eq!(entity(&out, "Acme Corp").label_guess, "Organization");
        assert_eq!(entity(&out, "tea").label_guess, "Thing");
    }

    #[tokio::test]
    async fn test_repeated_fact_collapses() {
        let out = extract("Alice lives in London. Alice lives in London.").await;
        assert_eq!(out.len(), 2);
        assert_eq!(entity(&out, "Alice").relations.len(), 1);
    }

    #[tokio::test]
    async fn test_no_facts() {
        assert!(extract("what's the weather like today?").await.is_empty());
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let bad_conf = vec![ExtractedEntity {
            mention_text: "Alice".to_string(),
            label_guess: "Person".to_string(),
            confidence: 1.5,
            relations: vec![],
        }];
        assert!(matches!(validate_extraction(&bad_conf), Err(FactgraphError::Extraction(_))));

        let empty = vec![ExtractedEntity {
            mention_text: "  ".to_string(),
            label_guess: "Person".to_string(),
            confidence: 0.9,
            relations: vec![],
        }];
        assert!(validate_extraction(&empty).is_err());

        let nan_rel = vec![ExtractedEntity {
            mention_text: "Alice".to_string(),
            label_guess: "Person".to_string(),
            confidence: 0.9,
            relations: vec![ExtractedRelation {
                relation_name: "KNOWS".to_string(),
                other_mention_text: "Bob".to_string(),
                confidence: f32::NAN,
            }],
        }];
        assert!(validate_extraction(&nan_rel).is_err());
    }

    #[test]
    fn test_payload_shape_deserializes() {
        let raw = r#"[{"mention_text":"Alice","label_guess":"Person","confidence":0.9,
            "relations":[{"relation_name":"LIVES_IN","other_mention_text":"Paris","confidence":0.8}]},
            {"mention_text":"Paris","label_guess":"Place","confidence":0.8}]"#;
        let parsed: Vec<ExtractedEntity> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[1].relations.is_empty());
        validate_extraction(&parsed).unwrap();
    }
}
