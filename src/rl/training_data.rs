// src/rl/training_data.rs
use log::debug;

use crate::matching::gazetteer::GAZETTEER_FIELDS;
use crate::matching::resolver::PRODUCT_FIELD;
use crate::matching::similarity::normalize_value;
use crate::models::{single_field_record, FeedbackEntry, LabeledPairs, TrainingPair};

/// Negatives are only synthesized once this many positives exist.
pub const MIN_POSITIVES_FOR_NEGATIVES: usize = 10;
/// Each entry is paired with at most this many later entries.
const MAX_NEGATIVES_PER_SOURCE: usize = 2;

/// Whether a feedback entry can become a training sample at all.
pub fn is_trainable(entry: &FeedbackEntry) -> bool {
    !entry.target_field.trim().is_empty()
        && !entry.source_value.trim().is_empty()
        && !entry.corrected_value.trim().is_empty()
}

fn is_modeled(entry: &FeedbackEntry) -> bool {
    GAZETTEER_FIELDS.contains(&entry.target_field.as_str())
}

fn positive_pair(entry: &FeedbackEntry) -> TrainingPair {
    TrainingPair {
        messy: single_field_record(&entry.target_field, &entry.source_value),
        canonical: single_field_record(&entry.target_field, &entry.corrected_value),
        is_match: true,
    }
}

/// Converts feedback into labeled pairs.
///
/// Every trainable entry yields one positive pair; entries for fields the
/// gazetteer has no features for go to `unmodeled`. Negatives come from
/// pairing an entry's source value with the corrected value of a later entry
/// that was corrected to something else, capped at half the positive count.
/// When that yields nothing (consistent corrections, or too few positives),
/// each product entry is paired with one of the other `known_canonicals`
/// instead.
pub fn build_training_pairs(
    entries: &[FeedbackEntry],
    known_canonicals: &[String],
) -> LabeledPairs {
    let mut pairs = LabeledPairs::default();
    let mut modeled: Vec<&FeedbackEntry> = Vec::new();
    for entry in entries.iter().filter(|e| is_trainable(e)) {
        if is_modeled(entry) {
            pairs.push(positive_pair(entry));
            modeled.push(entry);
        } else {
            let pair = positive_pair(entry);
            pairs.unmodeled.push((pair.messy, pair.canonical));
        }
    }
    let skipped = entries.len() - pairs.samples();
    if skipped > 0 {
        debug!("Skipping {} feedback entries with empty values", skipped);
    }

    let positives = pairs.matches.len();
    if positives >= MIN_POSITIVES_FOR_NEGATIVES {
        add_cross_negatives(&mut pairs, &modeled, positives / 2);
    }
    if pairs.distinct.is_empty() {
        add_canonical_negatives(&mut pairs, &modeled, known_canonicals);
    }

    debug!(
        "Built {} positive, {} negative and {} unmodeled training pairs",
        pairs.matches.len(),
        pairs.distinct.len(),
        pairs.unmodeled.len()
    );
    pairs
}

fn add_cross_negatives(pairs: &mut LabeledPairs, modeled: &[&FeedbackEntry], cap: usize) {
    'sources: for (i, source) in modeled.iter().enumerate() {
        let mut paired = 0;
        for other in &modeled[i + 1..] {
            if pairs.distinct.len() >= cap {
                break 'sources;
            }
            if paired >= MAX_NEGATIVES_PER_SOURCE {
                break;
            }
            if other.target_field != source.target_field
                || normalize_value(&other.corrected_value) == normalize_value(&source.corrected_value)
            {
                continue;
            }
            pairs.push(TrainingPair {
                messy: single_field_record(&source.target_field, &source.source_value),
                canonical: single_field_record(&other.target_field, &other.corrected_value),
                is_match: false,
            });
            paired += 1;
        }
    }
}

// One negative per product entry, rotating through the canonicals it was not
// corrected to, so the total never exceeds the product positives.
fn add_canonical_negatives(
    pairs: &mut LabeledPairs,
    modeled: &[&FeedbackEntry],
    known_canonicals: &[String],
) {
    let products = modeled
        .iter()
        .filter(|e| e.target_field == PRODUCT_FIELD)
        .enumerate();
    for (i, entry) in products {
        let corrected = normalize_value(&entry.corrected_value);
        let others: Vec<&String> = known_canonicals
            .iter()
            .filter(|c| normalize_value(c) != corrected)
            .collect();
        if others.is_empty() {
            continue;
        }
        pairs.push(TrainingPair {
            messy: single_field_record(PRODUCT_FIELD, &entry.source_value),
            canonical: single_field_record(PRODUCT_FIELD, others[i % others.len()]),
            is_match: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantPairKey;
    use serde_json::Value as JsonValue;

    fn entry(field: &str, value: &str, corrected: &str) -> FeedbackEntry {
        let key = TenantPairKey::new("A", "B").unwrap();
        FeedbackEntry::new(&key, field, value, field, corrected)
    }

    fn known() -> Vec<String> {
        ["Whey Protein Concentrate 80%", "Skimmed Milk Powder", "Butter 82% Fat"]
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    fn varied_entries(n: usize) -> Vec<FeedbackEntry> {
        let canonicals = ["Skimmed Milk Powder", "Butter 82% Fat", "Whey Protein Concentrate 80%"];
        (0..n)
            .map(|i| entry("product", &format!("variant {}", i), canonicals[i % 3]))
            .collect()
    }

    #[test]
    fn test_few_positives_skip_cross_pairing() {
        let pairs = build_training_pairs(&varied_entries(9), &[]);
        assert_eq!(pairs.matches.len(), 9);
        assert!(pairs.distinct.is_empty());
    }

    #[test]
    fn test_negatives_capped_at_half_of_positives() {
        let pairs = build_training_pairs(&varied_entries(20), &known());
        assert_eq!(pairs.matches.len(), 20);
        assert_eq!(pairs.distinct.len(), 10);
        for (messy, canonical) in &pairs.distinct {
            let source: usize = messy["product"]
                .as_str()
                .unwrap()
                .trim_start_matches("variant ")
                .parse()
                .unwrap();
            let expected_own = ["Skimmed Milk Powder", "Butter 82% Fat", "Whey Protein Concentrate 80%"][source % 3];
            assert_ne!(canonical["product"], JsonValue::String(expected_own.to_string()));
        }
    }

    #[test]
    fn test_each_source_pairs_with_at_most_two_later_entries() {
        let pairs = build_training_pairs(&varied_entries(12), &known());
        // cap is 6, reached after the first three sources pair twice each.
        assert_eq!(pairs.distinct.len(), 6);
        let first_source = pairs
            .distinct
            .iter()
            .filter(|(messy, _)| messy["product"] == "variant 0")
            .count();
        assert_eq!(first_source, 2);
    }

    #[test]
    fn test_consistent_corrections_borrow_known_canonicals() {
        let entries: Vec<FeedbackEntry> = (0..50)
            .map(|i| entry("product", &format!("WPC {}", i), "Whey Protein Concentrate 80%"))
            .collect();
        assert!(build_training_pairs(&entries, &[]).distinct.is_empty());

        let pairs = build_training_pairs(&entries, &known());
        assert_eq!(pairs.matches.len(), 50);
        assert_eq!(pairs.distinct.len(), 50);
        assert!(pairs
            .distinct
            .iter()
            .all(|(_, canonical)| canonical["product"] != "Whey Protein Concentrate 80%"));
        assert_eq!(pairs.distinct[0].1["product"], "Skimmed Milk Powder");
        assert_eq!(pairs.distinct[1].1["product"], "Butter 82% Fat");
        assert_eq!(pairs.samples(), 50);
    }

    #[test]
    fn test_few_positives_borrow_known_canonicals() {
        let entries = [entry("product", "wpc80", "Whey Protein Concentrate 80%")];
        let pairs = build_training_pairs(&entries, &known());
        assert_eq!(pairs.matches.len(), 1);
        assert_eq!(pairs.distinct.len(), 1);
        assert_eq!(pairs.samples(), 1);
    }

    #[test]
    fn test_other_fields_are_kept_as_unmodeled_samples() {
        let entries = vec![
            entry("incoterm", "fob", "FOB"),
            entry("supplier", "Acme BV", "Acme B.V."),
            entry("product", "", "Butter 82% Fat"),
        ];
        let pairs = build_training_pairs(&entries, &known());
        assert_eq!(pairs.matches.len(), 1);
        assert_eq!(pairs.matches[0].0["supplier"], "Acme BV");
        assert_eq!(pairs.unmodeled.len(), 1);
        assert_eq!(pairs.unmodeled[0].1["incoterm"], "FOB");
        // Knowledge base canonicals are products; no supplier negatives.
        assert!(pairs.distinct.is_empty());
        assert_eq!(pairs.samples(), 2);
    }
}
