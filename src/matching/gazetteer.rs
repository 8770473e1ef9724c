// src/matching/gazetteer.rs
//! Trainable two-field (product, supplier) record matcher.
//!
//! Each candidate pair is turned into a vector of per-field string
//! similarities, and a logistic regression over that vector estimates the
//! probability that the pair refers to the same entity. Training is plain
//! per-example gradient descent over a seeded shuffle, so the same input in
//! the same order always produces the same weights.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::similarity::{field_features, FEATURES_PER_FIELD};
use crate::error::{ResolutionError, Result, TrainingError};
use crate::models::{LabeledPairs, Record};

pub const GAZETTEER_FIELDS: [&str; 2] = ["product", "supplier"];
pub const DEFAULT_MIN_TRAINING_SAMPLES: usize = 50;
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.5;

const FEATURE_COUNT: usize = GAZETTEER_FIELDS.len() * FEATURES_PER_FIELD;
const SETTINGS_VERSION: u32 = 1;
const TRAINING_SEED: u64 = 0x6a7e_7ee5;
const DEFAULT_EPOCHS: usize = 200;
const DEFAULT_LEARNING_RATE: f64 = 0.05;
const L2_PENALTY: f64 = 1e-4;

// Logistic regression with a trailing bias weight.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogisticModel {
    weights: Vec<f64>,
    learning_rate: f64,
    l2_penalty: f64,
    trials: usize,
}

impl LogisticModel {
    fn new(feature_count: usize, learning_rate: f64) -> Self {
        Self {
            weights: vec![0.0; feature_count + 1],
            learning_rate,
            l2_penalty: L2_PENALTY,
            trials: 0,
        }
    }

    fn predict(&self, features: &[f64]) -> f64 {
        if features.len() + 1 != self.weights.len() {
            warn!(
                "Expected {} features, but got {}. Returning neutral probability.",
                self.weights.len() - 1,
                features.len()
            );
            return 0.5;
        }
        let features_with_bias = features.iter().chain(std::iter::once(&1.0));
        let logit: f64 = self
            .weights
            .iter()
            .zip(features_with_bias)
            .map(|(w, f)| w * f)
            .sum();
        1.0 / (1.0 + (-logit).exp())
    }

    fn update(&mut self, features: &[f64], label: f64) {
        if features.len() + 1 != self.weights.len() {
            warn!("Skipping model update due to feature vector length mismatch.");
            return;
        }
        let error = label - self.predict(features);
        for (i, feature_val) in features.iter().enumerate() {
            self.weights[i] +=
                self.learning_rate * (error * feature_val - self.l2_penalty * self.weights[i]);
        }
        let bias_index = self.weights.len() - 1;
        self.weights[bias_index] += self.learning_rate * error;
        self.trials += 1;
    }

    fn is_finite(&self) -> bool {
        self.weights.iter().all(|w| w.is_finite())
    }
}

/// Serializable state of a trained gazetteer. This is what the model store
/// persists as the settings blob.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GazetteerSettings {
    pub version: u32,
    pub fields: Vec<String>,
    pub model: LogisticModel,
    pub match_count: usize,
    pub distinct_count: usize,
}

impl GazetteerSettings {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let settings: Self = serde_json::from_slice(bytes)?;
        if settings.version != SETTINGS_VERSION {
            return Err(ResolutionError::Storage(format!(
                "Unsupported gazetteer settings version {}",
                settings.version
            )));
        }
        if settings.model.weights.len() != settings.fields.len() * FEATURES_PER_FIELD + 1 {
            return Err(ResolutionError::Storage(
                "Gazetteer settings weight count does not match its fields".to_string(),
            ));
        }
        Ok(settings)
    }

    /// Learned weights grouped by field, for reporting.
    pub fn field_weights(&self) -> Vec<(String, Vec<f64>)> {
        self.fields
            .iter()
            .zip(self.model.weights.chunks(FEATURES_PER_FIELD))
            .map(|(field, weights)| (field.clone(), weights.to_vec()))
            .collect()
    }

    pub fn bias(&self) -> f64 {
        self.model.weights.last().copied().unwrap_or(0.0)
    }

    pub fn training_updates(&self) -> usize {
        self.model.trials
    }

    /// Whether the model saw both matching and distinct pairs. A model fitted
    /// on one class only learns a bias and cannot rank candidates.
    pub fn can_discriminate(&self) -> bool {
        self.match_count > 0 && self.distinct_count > 0
    }

    fn score(&self, query: &Record, candidate: &Record) -> f64 {
        self.model.predict(&pair_features(&self.fields, query, candidate))
    }
}

fn field_value(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn pair_features(fields: &[String], a: &Record, b: &Record) -> Vec<f64> {
    let mut features = Vec::with_capacity(fields.len() * FEATURES_PER_FIELD);
    for field in fields {
        let left = field_value(a, field);
        let right = field_value(b, field);
        features.extend_from_slice(&field_features(left.as_deref(), right.as_deref()));
    }
    features
}

#[derive(Debug, Clone)]
pub struct GazetteerTrainer {
    min_samples: usize,
    epochs: usize,
    learning_rate: f64,
}

impl GazetteerTrainer {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples,
            epochs: DEFAULT_EPOCHS,
            learning_rate: DEFAULT_LEARNING_RATE,
        }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Fits field weights from labeled pairs. The sample gate counts feedback
    /// pairs only; synthesized negatives don't bring a model closer to it.
    pub fn train(&self, pairs: &LabeledPairs) -> std::result::Result<GazetteerSettings, TrainingError> {
        let found = pairs.samples();
        let required = self.min_samples.max(1);
        if found < required {
            return Err(TrainingError::InsufficientSamples { found, required });
        }

        let fields: Vec<String> = GAZETTEER_FIELDS.iter().map(|f| f.to_string()).collect();
        let examples: Vec<(Vec<f64>, f64)> = pairs
            .matches
            .iter()
            .map(|(messy, canonical)| (pair_features(&fields, messy, canonical), 1.0))
            .chain(
                pairs
                    .distinct
                    .iter()
                    .map(|(messy, canonical)| (pair_features(&fields, messy, canonical), 0.0)),
            )
            .collect();

        let mut model = LogisticModel::new(FEATURE_COUNT, self.learning_rate);
        let mut order: Vec<usize> = (0..examples.len()).collect();
        let mut rng = StdRng::seed_from_u64(TRAINING_SEED);
        for _ in 0..self.epochs {
            order.shuffle(&mut rng);
            for &i in &order {
                let (features, label) = &examples[i];
                model.update(features, *label);
            }
        }

        if !model.is_finite() {
            return Err(TrainingError::Fit(
                "weights diverged to non-finite values".to_string(),
            ));
        }

        debug!(
            "Gazetteer trained on {} matches / {} distinct pairs, bias {:.4}",
            pairs.matches.len(),
            pairs.distinct.len(),
            model.weights[FEATURE_COUNT]
        );

        Ok(GazetteerSettings {
            version: SETTINGS_VERSION,
            fields,
            model,
            match_count: pairs.matches.len(),
            distinct_count: pairs.distinct.len(),
        })
    }
}

impl Default for GazetteerTrainer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_TRAINING_SAMPLES)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedMatch {
    pub record: Record,
    pub score: f64,
}

impl RankedMatch {
    pub fn value(&self, field: &str) -> Option<&JsonValue> {
        self.record.get(field)
    }
}

/// A trained matcher plus the canonical records it searches.
#[derive(Debug, Clone)]
pub struct Gazetteer {
    settings: GazetteerSettings,
    canonical: Option<Vec<Record>>,
}

impl Gazetteer {
    pub fn new(settings: GazetteerSettings) -> Self {
        Self {
            settings,
            canonical: None,
        }
    }

    pub fn settings(&self) -> &GazetteerSettings {
        &self.settings
    }

    /// Replaces the searchable canonical set. Required before `search`.
    pub fn index(&mut self, records: Vec<Record>) {
        debug!("Indexing {} canonical records", records.len());
        self.canonical = Some(records);
    }

    pub fn is_indexed(&self) -> bool {
        self.canonical.is_some()
    }

    /// Canonical records scoring at least `threshold`, best first. Equal
    /// scores keep index order.
    pub fn search(&self, record: &Record, threshold: f64) -> Result<Vec<RankedMatch>> {
        let canonical = self.canonical.as_ref().ok_or_else(|| {
            ResolutionError::Matching("gazetteer searched before indexing".to_string())
        })?;

        let mut ranked = Vec::new();
        for candidate in canonical {
            let score = self.settings.score(record, candidate);
            if !score.is_finite() {
                return Err(ResolutionError::Matching(format!(
                    "non-finite score for candidate {:?}",
                    candidate
                )));
            }
            if score >= threshold {
                ranked.push(RankedMatch {
                    record: candidate.clone(),
                    score,
                });
            }
        }
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(ranked)
    }
}
