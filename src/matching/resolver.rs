// src/matching/resolver.rs
use log::{debug, warn};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::gazetteer::Gazetteer;
use super::knowledge_base::{KnowledgeBase, HIGH_CONFIDENCE, LOW_CONFIDENCE};
use crate::error::Result;
use crate::models::{single_field_record, MatchResult, Record, ResolutionOutput, TenantPairKey};
use crate::storage::ModelStore;

pub const PRODUCT_FIELD: &str = "product";

// Gazetteer indexed against a specific model generation and knowledge base revision.
struct IndexedMatcher {
    model_generation: u64,
    kb_revision: u64,
    gazetteer: Arc<Gazetteer>,
}

/// Picks the trained gazetteer for a tenant pair when one exists, and the
/// knowledge base otherwise, then scores every field of a record.
pub struct ResolutionEngine {
    knowledge_base: Arc<KnowledgeBase>,
    model_store: Arc<ModelStore>,
    match_threshold: f64,
    indexed: RwLock<HashMap<TenantPairKey, IndexedMatcher>>,
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

fn pass_through(field: &str, value: &JsonValue) -> MatchResult {
    MatchResult {
        field: field.to_string(),
        matched_value: value.clone(),
        confidence: if is_truthy(value) {
            HIGH_CONFIDENCE
        } else {
            LOW_CONFIDENCE
        },
    }
}

fn product_value<'a>(field: &str, value: &'a JsonValue) -> Option<&'a str> {
    if field == PRODUCT_FIELD {
        value.as_str()
    } else {
        None
    }
}

impl ResolutionEngine {
    pub fn new(
        knowledge_base: Arc<KnowledgeBase>,
        model_store: Arc<ModelStore>,
        match_threshold: f64,
    ) -> Self {
        Self {
            knowledge_base,
            model_store,
            match_threshold,
            indexed: RwLock::new(HashMap::new()),
        }
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge_base
    }

    pub fn model_store(&self) -> &Arc<ModelStore> {
        &self.model_store
    }

    /// Resolves every field of `record`. Always produces one mapped value and
    /// one confidence per input field, in input order.
    pub async fn resolve(&self, record: &Record, key: &TenantPairKey) -> ResolutionOutput {
        let needs_matcher = record
            .iter()
            .any(|(field, value)| product_value(field, value).is_some());
        let gazetteer = if needs_matcher {
            self.matcher_for(key).await
        } else {
            None
        };
        if gazetteer.is_some() {
            debug!("Resolving record for {} with trained gazetteer", key);
        }
        self.resolve_with(record, gazetteer.as_deref())
    }

    fn resolve_with(&self, record: &Record, gazetteer: Option<&Gazetteer>) -> ResolutionOutput {
        if let Some(gazetteer) = gazetteer {
            match self.resolve_with_gazetteer(record, gazetteer) {
                Ok(output) => return output,
                Err(e) => warn!(
                    "Probabilistic matching failed: {}. Falling back to knowledge base for the whole record.",
                    e
                ),
            }
        }
        self.resolve_with_knowledge_base(record)
    }

    fn resolve_with_gazetteer(&self, record: &Record, gazetteer: &Gazetteer) -> Result<ResolutionOutput> {
        let mut output = ResolutionOutput::default();
        for (field, value) in record {
            let result = match product_value(field, value) {
                Some(product) => {
                    let query = single_field_record(PRODUCT_FIELD, product);
                    let ranked = gazetteer.search(&query, self.match_threshold)?;
                    match ranked.first() {
                        Some(best) => MatchResult {
                            field: field.clone(),
                            matched_value: best
                                .value(PRODUCT_FIELD)
                                .cloned()
                                .unwrap_or_else(|| value.clone()),
                            confidence: best.score.clamp(0.0, 1.0),
                        },
                        None => MatchResult {
                            field: field.clone(),
                            matched_value: value.clone(),
                            confidence: LOW_CONFIDENCE,
                        },
                    }
                }
                None => pass_through(field, value),
            };
            output.push(result);
        }
        Ok(output)
    }

    fn resolve_with_knowledge_base(&self, record: &Record) -> ResolutionOutput {
        let mut output = ResolutionOutput::default();
        for (field, value) in record {
            let result = match product_value(field, value) {
                Some(product) => {
                    let (canonical, confidence) = self.knowledge_base.match_value(product);
                    MatchResult {
                        field: field.clone(),
                        matched_value: JsonValue::String(canonical),
                        confidence,
                    }
                }
                None => pass_through(field, value),
            };
            output.push(result);
        }
        output
    }

    /// Trained gazetteer for `key`, indexed against the current knowledge
    /// base. Re-indexes when either the model or the knowledge base changed.
    async fn matcher_for(&self, key: &TenantPairKey) -> Option<Arc<Gazetteer>> {
        let model = self.model_store.load(key).await?;
        if !model.settings.can_discriminate() {
            debug!(
                "Model for {} was fitted on one class only; using knowledge base",
                key
            );
            return None;
        }
        let kb_revision = self.knowledge_base.revision();

        {
            let indexed = self.indexed.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = indexed.get(key) {
                if entry.model_generation == model.generation && entry.kb_revision == kb_revision {
                    return Some(entry.gazetteer.clone());
                }
            }
        }

        let canonical: Vec<Record> = self
            .knowledge_base
            .canonical_values()
            .iter()
            .map(|c| single_field_record(PRODUCT_FIELD, c))
            .collect();
        let mut gazetteer = Gazetteer::new(model.settings.clone());
        gazetteer.index(canonical);
        let gazetteer = Arc::new(gazetteer);

        self.indexed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                IndexedMatcher {
                    model_generation: model.generation,
                    kb_revision,
                    gazetteer: gazetteer.clone(),
                },
            );
        Some(gazetteer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::gazetteer::GazetteerTrainer;
    use crate::matching::knowledge_base::DEFAULT_FUZZY_THRESHOLD;
    use crate::models::LabeledPairs;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn key() -> TenantPairKey {
        TenantPairKey::new("A", "B").unwrap()
    }

    fn engine_with_threshold(dir: &std::path::Path, threshold: f64) -> ResolutionEngine {
        ResolutionEngine::new(
            Arc::new(KnowledgeBase::seeded(DEFAULT_FUZZY_THRESHOLD)),
            Arc::new(ModelStore::new(dir)),
            threshold,
        )
    }

    fn engine(dir: &std::path::Path) -> ResolutionEngine {
        engine_with_threshold(dir, 0.5)
    }

    fn trained_pairs() -> LabeledPairs {
        let mut pairs = LabeledPairs::default();
        for (messy, canonical) in [
            ("WPC 80 instant", "Whey Protein Concentrate 80%"),
            ("Skim milk pwd", "Skimmed Milk Powder"),
            ("Butter 82 unsalted", "Butter 82% Fat"),
        ] {
            pairs.matches.push((
                single_field_record("product", messy),
                single_field_record("product", canonical),
            ));
        }
        for (messy, canonical) in [
            ("WPC 80 instant", "Butter 82% Fat"),
            ("Skim milk pwd", "Whey Protein Concentrate 80%"),
        ] {
            pairs.distinct.push((
                single_field_record("product", messy),
                single_field_record("product", canonical),
            ));
        }
        pairs
    }

    #[tokio::test]
    async fn test_knowledge_base_resolution_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let output = engine
            .resolve(&record(json!({"product": "WPC 80", "supplier": "Acme"})), &key())
            .await;
        assert_eq!(
            JsonValue::Object(output.mapped_data.clone()),
            json!({"product": "Whey Protein Concentrate 80%", "supplier": "Acme"})
        );
        assert_eq!(output.confidence("product"), Some(0.98));
        assert_eq!(output.confidence("supplier"), Some(0.98));
    }

    #[tokio::test]
    async fn test_every_field_is_kept_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let input = record(json!({
            "quantity": 0,
            "supplier": "",
            "product": "Gouda 48+",
            "notes": null,
            "price": 12.5
        }));
        let output = engine.resolve(&input, &key()).await;
        let fields: Vec<&String> = output.mapped_data.keys().collect();
        assert_eq!(fields, vec!["quantity", "supplier", "product", "notes", "price"]);
        assert_eq!(output.confidence("quantity"), Some(0.5));
        assert_eq!(output.confidence("supplier"), Some(0.5));
        assert_eq!(output.confidence("product"), Some(0.5));
        assert_eq!(output.confidence("notes"), Some(0.5));
        assert_eq!(output.confidence("price"), Some(0.98));
        assert_eq!(output.mapped_data["product"], "Gouda 48+");
    }

    #[tokio::test]
    async fn test_trained_model_is_used_for_product() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_threshold(dir.path(), 0.0);
        let settings = GazetteerTrainer::new(1).train(&trained_pairs()).unwrap();
        engine.model_store().save(&key(), settings).await.unwrap();

        // Too far from every variant for the knowledge base to map it.
        let query = "Skimmed milk pwd low heat";
        assert_eq!(engine.knowledge_base().match_value(query).1, LOW_CONFIDENCE);

        let output = engine
            .resolve(&record(json!({"product": query, "supplier": "Acme"})), &key())
            .await;
        assert_eq!(output.mapped_data["product"], "Skimmed Milk Powder");
        let confidence = output.confidence("product").unwrap();
        assert!((0.0..=1.0).contains(&confidence));
        assert_eq!(output.confidence("supplier"), Some(0.98));
    }

    #[tokio::test]
    async fn test_no_gazetteer_match_passes_value_through() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_threshold(dir.path(), 1.01);
        let settings = GazetteerTrainer::new(1).train(&trained_pairs()).unwrap();
        engine.model_store().save(&key(), settings).await.unwrap();

        let output = engine.resolve(&record(json!({"product": "WPC 80"})), &key()).await;
        assert_eq!(output.mapped_data["product"], "WPC 80");
        assert_eq!(output.confidence("product"), Some(0.5));
    }

    #[tokio::test]
    async fn test_matching_error_falls_back_for_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let settings = GazetteerTrainer::new(1).train(&trained_pairs()).unwrap();
        // Never indexed, so every search fails.
        let broken = Gazetteer::new(settings);

        let output = engine.resolve_with(
            &record(json!({"product": "SMP", "supplier": "Acme"})),
            Some(&broken),
        );
        assert_eq!(output.mapped_data["product"], "Skimmed Milk Powder");
        assert_eq!(output.confidence("product"), Some(0.98));
        assert_eq!(output.confidence("supplier"), Some(0.98));
    }

    #[tokio::test]
    async fn test_one_class_model_is_not_used() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut positives_only = trained_pairs();
        positives_only.distinct.clear();
        let settings = GazetteerTrainer::new(1).train(&positives_only).unwrap();
        engine.model_store().save(&key(), settings).await.unwrap();

        assert!(engine.matcher_for(&key()).await.is_none());
        let output = engine
            .resolve(&record(json!({"product": "Mozzarella Block 2.5kg"})), &key())
            .await;
        assert_eq!(output.mapped_data["product"], "Mozzarella Block 2.5kg");
        assert_eq!(output.confidence("product"), Some(LOW_CONFIDENCE));
    }

    #[tokio::test]
    async fn test_knowledge_base_change_reindexes_matcher() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let settings = GazetteerTrainer::new(1).train(&trained_pairs()).unwrap();
        engine.model_store().save(&key(), settings).await.unwrap();

        let first = engine.matcher_for(&key()).await.unwrap();
        let again = engine.matcher_for(&key()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        engine
            .knowledge_base()
            .add_entry("Gouda 48", "Gouda 48+ Young");
        let rebuilt = engine.matcher_for(&key()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }
}
