// src/models/core.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::{ResolutionError, Result};

/// Separator between the two tenant codes of a pair key. Valid tenant codes
/// never contain it.
pub const TENANT_PAIR_SEPARATOR: &str = "__";

/// A record to resolve: field name -> scalar value, in input order.
pub type Record = serde_json::Map<String, JsonValue>;

/// Ordered (source, target) tenant pair. Scopes one model and one feedback log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantPairKey {
    source: String,
    target: String,
}

impl TenantPairKey {
    pub fn new(source_tenant: &str, target_tenant: &str) -> Result<Self> {
        validate_tenant_code(source_tenant)?;
        validate_tenant_code(target_tenant)?;
        Ok(Self {
            source: source_tenant.to_string(),
            target: target_tenant.to_string(),
        })
    }

    /// Inverse of `as_str`, used when scanning storage directories.
    pub fn parse(key: &str) -> Result<Self> {
        let (source, target) = key
            .split_once(TENANT_PAIR_SEPARATOR)
            .ok_or_else(|| ResolutionError::InvalidTenantCode(key.to_string()))?;
        Self::new(source, target)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn as_str(&self) -> String {
        format!("{}{}{}", self.source, TENANT_PAIR_SEPARATOR, self.target)
    }
}

impl fmt::Display for TenantPairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

fn validate_tenant_code(code: &str) -> Result<()> {
    let invalid = code.is_empty()
        || code.contains(TENANT_PAIR_SEPARATOR)
        || code
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c == '.');
    if invalid {
        return Err(ResolutionError::InvalidTenantCode(code.to_string()));
    }
    Ok(())
}

/// One user correction, stored as a single JSON line in the feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub timestamp: DateTime<Utc>,
    pub source_tenant: String,
    pub target_tenant: String,
    pub source_field: String,
    pub source_value: String,
    pub target_field: String,
    pub corrected_value: String,
}

impl FeedbackEntry {
    pub fn new(
        key: &TenantPairKey,
        source_field: &str,
        source_value: &str,
        target_field: &str,
        corrected_value: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            source_tenant: key.source().to_string(),
            target_tenant: key.target().to_string(),
            source_field: source_field.to_string(),
            source_value: source_value.to_string(),
            target_field: target_field.to_string(),
            corrected_value: corrected_value.to_string(),
        }
    }

    pub fn tenant_pair(&self) -> Result<TenantPairKey> {
        TenantPairKey::new(&self.source_tenant, &self.target_tenant)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub field: String,
    pub matched_value: JsonValue,
    pub confidence: f64,
}

/// A labeled (messy, canonical) example. Lives for one training invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPair {
    pub messy: Record,
    pub canonical: Record,
    pub is_match: bool,
}

/// Training input split by label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabeledPairs {
    pub matches: Vec<(Record, Record)>,
    pub distinct: Vec<(Record, Record)>,
    /// Positive pairs on fields the matcher has no features for. They count
    /// as feedback samples but are not fitted.
    pub unmodeled: Vec<(Record, Record)>,
}

impl LabeledPairs {
    pub fn push(&mut self, pair: TrainingPair) {
        if pair.is_match {
            self.matches.push((pair.messy, pair.canonical));
        } else {
            self.distinct.push((pair.messy, pair.canonical));
        }
    }

    pub fn len(&self) -> usize {
        self.matches.len() + self.distinct.len() + self.unmodeled.len()
    }

    /// Pairs that come straight from user feedback. Synthesized negatives
    /// are not samples.
    pub fn samples(&self) -> usize {
        self.matches.len() + self.unmodeled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds a single-field record.
pub fn single_field_record(field: &str, value: &str) -> Record {
    let mut record = Record::new();
    record.insert(field.to_string(), JsonValue::String(value.to_string()));
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_pair_key_round_trip() {
        let key = TenantPairKey::new("ACME", "GLOBEX-NL").unwrap();
        assert_eq!(key.as_str(), "ACME__GLOBEX-NL");
        assert_eq!(TenantPairKey::parse(&key.as_str()).unwrap(), key);
    }

    #[test]
    fn test_tenant_pair_key_rejects_bad_codes() {
        assert!(TenantPairKey::new("", "B").is_err());
        assert!(TenantPairKey::new("A__X", "B").is_err());
        assert!(TenantPairKey::new("A", "../B").is_err());
        assert!(TenantPairKey::new("A B", "C").is_err());
        assert!(TenantPairKey::parse("no-separator").is_err());
    }

    #[test]
    fn test_feedback_entry_serializes_camel_case() {
        let key = TenantPairKey::new("A", "B").unwrap();
        let entry = FeedbackEntry::new(&key, "prod", "WPC 80", "product", "Whey Protein Concentrate 80%");
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"sourceTenant\":\"A\""));
        assert!(line.contains("\"correctedValue\":\"Whey Protein Concentrate 80%\""));
        assert!(!line.contains('\n'));
        let parsed: FeedbackEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.tenant_pair().unwrap(), key);
    }

    #[test]
    fn test_labeled_pairs_split_by_label() {
        let mut pairs = LabeledPairs::default();
        pairs.push(TrainingPair {
            messy: single_field_record("product", "smp"),
            canonical: single_field_record("product", "Skimmed Milk Powder"),
            is_match: true,
        });
        pairs.push(TrainingPair {
            messy: single_field_record("product", "smp"),
            canonical: single_field_record("product", "Butter 82% Fat"),
            is_match: false,
        });
        assert_eq!(pairs.matches.len(), 1);
        assert_eq!(pairs.distinct.len(), 1);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs.samples(), 1);
    }
}
