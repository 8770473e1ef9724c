// src/models/stats.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::core::{MatchResult, Record};

/// Result of resolving one record: mapped values and per-field confidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutput {
    pub mapped_data: Record,
    pub confidence_scores: serde_json::Map<String, serde_json::Value>,
}

impl ResolutionOutput {
    pub fn push(&mut self, result: MatchResult) {
        self.mapped_data
            .insert(result.field.clone(), result.matched_value);
        self.confidence_scores
            .insert(result.field, serde_json::Value::from(result.confidence));
    }

    /// Confidence for `field`, if the field was part of the input.
    pub fn confidence(&self, field: &str) -> Option<f64> {
        self.confidence_scores.get(field).and_then(|v| v.as_f64())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackOutcome {
    pub success: bool,
    pub message: String,
    /// Whether this submission caused a model to be trained and persisted.
    pub retrained: bool,
}

impl FeedbackOutcome {
    pub fn accepted(retrained: bool) -> Self {
        let message = if retrained {
            "Feedback received and model retrained".to_string()
        } else {
            "Feedback received".to_string()
        };
        Self {
            success: true,
            message,
            retrained,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            message: reason.into(),
            retrained: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStats {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStats {
    pub feedback_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub ready_for_training: bool,
    pub samples_needed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_cached: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrainOutcome {
    pub success: bool,
    pub message: String,
    pub samples_used: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub components: BTreeMap<String, String>,
}

impl HealthStatus {
    pub fn from_components(components: BTreeMap<String, String>) -> Self {
        let status = if components.values().all(|s| s == "operational") {
            "healthy"
        } else {
            "degraded"
        };
        Self {
            status: status.to_string(),
            components,
        }
    }
}
