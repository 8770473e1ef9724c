// src/matching/knowledge_base.rs
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use super::similarity::{normalize_value, similarity_ratio};
use crate::error::{ResolutionError, Result};

/// Confidence reported for an exact knowledge-base hit.
pub const HIGH_CONFIDENCE: f64 = 0.98;
/// Confidence reported when no variant is similar enough.
pub const LOW_CONFIDENCE: f64 = 0.5;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.7;

const SEED_PRODUCT_MAPPINGS: [(&str, &str); 7] = [
    ("WPC 80", "Whey Protein Concentrate 80%"),
    ("WPC80", "Whey Protein Concentrate 80%"),
    ("Whey Prot. Conc. 80", "Whey Protein Concentrate 80%"),
    ("SMP", "Skimmed Milk Powder"),
    ("Skim Milk Powder", "Skimmed Milk Powder"),
    ("Butter 82%", "Butter 82% Fat"),
    ("Butter82", "Butter 82% Fat"),
];

#[derive(Default)]
struct KnowledgeBaseInner {
    // Insertion-ordered (variant, canonical); fuzzy ties go to the earliest entry.
    entries: Vec<(String, String)>,
    positions: HashMap<String, usize>,
}

/// Known noisy variants (lowercased) mapped to canonical names.
///
/// Reads run concurrently; writes are serialized by the lock. Every change
/// bumps `revision` so indexed matchers can tell when to rebuild.
pub struct KnowledgeBase {
    inner: RwLock<KnowledgeBaseInner>,
    revision: AtomicU64,
    fuzzy_threshold: f64,
}

impl KnowledgeBase {
    pub fn new(fuzzy_threshold: f64) -> Self {
        Self {
            inner: RwLock::new(KnowledgeBaseInner::default()),
            revision: AtomicU64::new(0),
            fuzzy_threshold,
        }
    }

    /// Knowledge base holding the static product seed set.
    pub fn seeded(fuzzy_threshold: f64) -> Self {
        Self::with_entries(fuzzy_threshold, SEED_PRODUCT_MAPPINGS.iter().copied())
    }

    pub fn with_entries<'a>(
        fuzzy_threshold: f64,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let kb = Self::new(fuzzy_threshold);
        for (variant, canonical) in entries {
            kb.add_entry(variant, canonical);
        }
        kb
    }

    /// Merges a JSON object of `variant -> canonical` into the knowledge base.
    pub async fn load_seed_file(&self, path: &Path) -> Result<usize> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ResolutionError::Storage(format!(
                "Failed to read knowledge base seed {}: {}",
                path.display(),
                e
            ))
        })?;
        let mappings: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;

        let mut loaded = 0;
        for (variant, canonical) in mappings {
            match canonical.as_str() {
                Some(canonical) => {
                    self.add_entry(&variant, canonical);
                    loaded += 1;
                }
                None => debug!("Skipping non-string canonical for seed variant '{}'", variant),
            }
        }
        info!(
            "Loaded {} knowledge base variants from {}",
            loaded,
            path.display()
        );
        Ok(loaded)
    }

    /// Returns `(canonical, confidence)` for `value`.
    ///
    /// Exact hits report `HIGH_CONFIDENCE`; fuzzy hits report the similarity
    /// ratio; anything below the fuzzy threshold passes through unchanged
    /// with `LOW_CONFIDENCE`.
    pub fn match_value(&self, value: &str) -> (String, f64) {
        let normalized = normalize_value(value);
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(&pos) = inner.positions.get(&normalized) {
            return (inner.entries[pos].1.clone(), HIGH_CONFIDENCE);
        }

        let mut best: Option<(usize, f64)> = None;
        for (pos, (variant, _)) in inner.entries.iter().enumerate() {
            let ratio = similarity_ratio(&normalized, variant);
            if best.map_or(true, |(_, best_ratio)| ratio > best_ratio) {
                best = Some((pos, ratio));
            }
        }

        match best {
            Some((pos, ratio)) if ratio >= self.fuzzy_threshold => {
                debug!(
                    "Fuzzy knowledge base hit: '{}' ~ '{}' ({:.3})",
                    value, inner.entries[pos].0, ratio
                );
                (inner.entries[pos].1.clone(), ratio)
            }
            _ => (value.to_string(), LOW_CONFIDENCE),
        }
    }

    /// Upserts `variant -> canonical`; the last write wins. Returns whether
    /// the stored mapping changed.
    pub fn add_entry(&self, variant: &str, canonical: &str) -> bool {
        let key = normalize_value(variant);
        let canonical = canonical.trim();
        if key.is_empty() || canonical.is_empty() {
            debug!("Ignoring empty knowledge base entry '{}' -> '{}'", variant, canonical);
            return false;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.positions.get(&key).copied() {
            Some(pos) if inner.entries[pos].1 == canonical => return false,
            Some(pos) => {
                debug!(
                    "Knowledge base: '{}' remapped '{}' -> '{}'",
                    key, inner.entries[pos].1, canonical
                );
                inner.entries[pos].1 = canonical.to_string();
            }
            None => {
                let pos = inner.entries.len();
                inner.entries.push((key.clone(), canonical.to_string()));
                inner.positions.insert(key, pos);
            }
        }
        self.revision.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Distinct canonical names in first-seen order.
    pub fn canonical_values(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        inner
            .entries
            .iter()
            .filter(|(_, canonical)| seen.insert(canonical.as_str()))
            .map(|(_, canonical)| canonical.clone())
            .collect()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn fuzzy_threshold(&self) -> f64 {
        self.fuzzy_threshold
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
