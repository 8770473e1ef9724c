// src/matching/similarity.rs
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use strsim::{jaro_winkler, normalized_levenshtein, sorensen_dice};

/// Number of similarity features produced per compared field.
pub const FEATURES_PER_FIELD: usize = 4;

static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}%\s]+").unwrap());

// Trade abbreviations seen in product descriptions.
const ABBREVIATIONS: [(&str, &str); 8] = [
    ("conc", "concentrate"),
    ("prot", "protein"),
    ("pwd", "powder"),
    ("pdr", "powder"),
    ("smp", "skimmed milk powder"),
    ("wmp", "whole milk powder"),
    ("wpc", "whey protein concentrate"),
    ("amf", "anhydrous milk fat"),
];

/// Knowledge-base key normalization: lowercase and trimmed.
pub fn normalize_value(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Normalized edit similarity between two values, in [0, 1].
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b).clamp(0.0, 1.0)
}

/// Aggressive normalization used for gazetteer comparisons: punctuation
/// stripped, abbreviations expanded, whitespace collapsed.
pub fn normalize_for_comparison(value: &str) -> String {
    let lowered = normalize_value(value);
    let stripped = PUNCTUATION.replace_all(&lowered, " ");
    stripped
        .split_whitespace()
        .map(|token| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == token)
                .map(|(_, full)| *full)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn token_jaccard(a: &str, b: &str) -> f64 {
    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        return 0.0;
    }
    tokens_a.intersection(&tokens_b).count() as f64 / union as f64
}

/// Similarity features for one field of a record pair. A value missing on
/// either side contributes all-zero features.
pub fn field_features(a: Option<&str>, b: Option<&str>) -> [f64; FEATURES_PER_FIELD] {
    match (a, b) {
        (Some(a), Some(b)) => {
            let a = normalize_for_comparison(a);
            let b = normalize_for_comparison(b);
            if a.is_empty() || b.is_empty() {
                return [0.0; FEATURES_PER_FIELD];
            }
            [
                jaro_winkler(&a, &b),
                normalized_levenshtein(&a, &b),
                token_jaccard(&a, &b),
                sorensen_dice(&a, &b),
            ]
        }
        _ => [0.0; FEATURES_PER_FIELD],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_value() {
        assert_eq!(normalize_value("  WPC 80 "), "wpc 80");
        assert_eq!(normalize_value("SMP"), "smp");
    }

    #[test]
    fn test_similarity_ratio_bounds() {
        assert_eq!(similarity_ratio("wpc 80", "wpc 80"), 1.0);
        assert!(similarity_ratio("wpc-80", "wpc 80") > 0.8);
        assert!(similarity_ratio("wpc 80", "cheddar cheese block") < 0.3);
        assert_eq!(similarity_ratio("", ""), 1.0);
    }

    #[test]
    fn test_normalize_for_comparison_expands_abbreviations() {
        assert_eq!(
            normalize_for_comparison("Whey Prot. Conc. 80"),
            "whey protein concentrate 80"
        );
        assert_eq!(
            normalize_for_comparison("WPC-80%"),
            "whey protein concentrate 80%"
        );
    }

    #[test]
    fn test_field_features_missing_side_is_zero() {
        assert_eq!(field_features(Some("smp"), None), [0.0; FEATURES_PER_FIELD]);
        assert_eq!(field_features(None, None), [0.0; FEATURES_PER_FIELD]);
        let identical = field_features(Some("Butter 82%"), Some("butter 82%"));
        assert!(identical.iter().all(|f| (*f - 1.0).abs() < 1e-9));
    }
}
